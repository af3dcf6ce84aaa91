use std::{path::PathBuf, time::Duration};

use clap::Parser;
use miette::{miette, IntoDiagnostic, WrapErr};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::LevelFilter, util::SubscriberInitExt, EnvFilter};

use tinify::{ClientPool, Pipeline, PipelineOptions};
use tinify_client::ClientOptions;
use tinify_config::FileConfig;
use tinify_finder::{ExtensionFilter, Finder};

/// Command line options available through the `tinifier` cli.
#[derive(Debug, Parser)]
#[clap(
    name = "tinifier",
    version,
    about = "CLI client for the TinyPNG image compression service",
    long_about = None
)]
struct Opt {
    /// Configuration file to merge in before the flags.
    #[clap(short = 'c', long, env = "CONFIG_FILE", value_name = "PATH")]
    config_file: Option<PathBuf>,

    /// API key(s) for the compression service.
    #[clap(short = 'k', long = "api-key", value_name = "KEY", value_delimiter = ',')]
    api_key: Vec<String>,

    /// File extensions to consider.
    #[clap(
        short = 'e',
        long = "ext",
        env = "FILE_EXTENSIONS",
        value_delimiter = ',',
        default_value = "png,PNG,jpeg,JPEG,jpg,JPG"
    )]
    ext: Vec<String>,

    /// Maximum number of files processed in parallel.
    #[clap(short = 't', long, env = "THREADS", default_value_t = 16)]
    threads: usize,

    /// Stop taking new files after this many errors (0 disables).
    #[clap(long, env = "MAX_ERRORS", default_value_t = 10)]
    max_errors: u32,

    /// Attempts per remote operation.
    #[clap(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    retry_attempts: u32,

    /// Sleep between retry attempts.
    #[clap(
        long,
        env = "DELAY_BETWEEN_RETRIES",
        default_value = "1s",
        value_parser = humantime::parse_duration,
        value_name = "DURATION"
    )]
    delay_between_retries: Duration,

    /// Descend into subdirectories.
    #[clap(short = 'r', long, env = "RECURSIVE")]
    recursive: bool,

    /// Skip files whose shrink percentage is below this.
    #[clap(
        long,
        env = "SKIP_IF_DIFF_LESS",
        default_value_t = 0.0,
        value_name = "PERCENT"
    )]
    skip_if_diff_less: f64,

    /// Restore the original modification time after replacing.
    #[clap(short = 'p', long, env = "PRESERVE_TIME")]
    preserve_time: bool,

    /// Keep a `.orig` copy of every replaced file.
    #[clap(long, env = "KEEP_ORIGINAL_FILE")]
    keep_original_file: bool,

    /// Log verbose
    #[clap(long)]
    verbose: bool,

    /// Files and directories to compress.
    #[clap(required = true, value_name = "PATH")]
    paths: Vec<PathBuf>,
}

/// Entry point of the `tinifier` cli.
fn main() -> miette::Result<()> {
    let opt = match Opt::try_parse() {
        Ok(opt) => opt,
        Err(err) => {
            // Help and version exit 0; any usage error exits 1.
            let code = i32::from(err.use_stderr());
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    runtime.block_on(async_main(opt))
}

async fn async_main(opt: Opt) -> miette::Result<()> {
    // Determine the logging level based on the verbose flag and the
    // RUST_LOG environment variable.
    let default_filter = if opt.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_filter.into())
        .from_env()
        .into_diagnostic()?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .without_time()
        .finish()
        .try_init()
        .into_diagnostic()?;

    if opt.ext.iter().all(|ext| ext.is_empty()) {
        return Err(miette!("at least one file extension must be provided"));
    }
    if opt.threads == 0 {
        return Err(miette!("the thread count must be greater than zero"));
    }

    let api_keys = resolve_api_keys(
        &opt.api_key,
        opt.config_file.as_deref(),
        std::env::var("API_KEYS").ok().as_deref(),
    )?;
    if api_keys.is_empty() {
        return Err(miette!(
            "at least one API key must be provided (via --api-key, the config file or API_KEYS)"
        ));
    }
    tracing::debug!(
        "using {} api key(s) and up to {} worker(s)",
        api_keys.len(),
        opt.threads
    );

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let pool = ClientPool::new(api_keys, ClientOptions::default());
    let filter = ExtensionFilter::new(true, opt.ext);
    let finder = Finder::new(opt.paths, opt.recursive, filter);
    let options = PipelineOptions {
        threads: opt.threads,
        max_errors: opt.max_errors,
        retry_attempts: opt.retry_attempts,
        retry_delay: opt.delay_between_retries,
        skip_if_diff_less: opt.skip_if_diff_less,
        preserve_time: opt.preserve_time,
        keep_original: opt.keep_original_file,
    };

    Pipeline::new(pool, finder, options)
        .run(&cancel)
        .await
        .into_diagnostic()
}

/// Resolves the API keys with the documented precedence, low to high:
/// built-in default, the `API_KEYS` environment variable, the config
/// file, the `--api-key` flag.
fn resolve_api_keys(
    flag: &[String],
    config_file: Option<&std::path::Path>,
    env: Option<&str>,
) -> miette::Result<Vec<String>> {
    let flag_keys = clean_keys(flag.iter().map(String::as_str));
    if !flag_keys.is_empty() {
        return Ok(flag_keys);
    }

    let config_path = config_file
        .map(PathBuf::from)
        .or_else(tinify_config::default_config_path);
    if let Some(path) = config_path {
        if path.is_file() {
            let config = FileConfig::load(&path)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to load {}", path.display()))?;
            if let Some(keys) = config.api_keys {
                let keys = clean_keys(keys.iter().map(String::as_str));
                if !keys.is_empty() {
                    return Ok(keys);
                }
            }
        }
    }

    Ok(clean_keys(env.unwrap_or_default().split(',')))
}

fn clean_keys<'a>(keys: impl Iterator<Item = &'a str>) -> Vec<String> {
    keys.map(str::trim)
        .filter(|key| !key.is_empty())
        .map(String::from)
        .collect()
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::warn!("interrupt received, stopping");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            tracing::warn!("failed to install the SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    fn write_config(keys: &[&str]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tinifier.yml");
        let body = format!(
            "apiKeys:\n{}",
            keys.iter()
                .map(|key| format!("  - {key}\n"))
                .collect::<String>()
        );
        std::fs::write(&path, body).unwrap();
        (dir, path)
    }

    #[test]
    fn the_flag_has_the_highest_precedence() {
        let (_dir, config) = write_config(&["from-config"]);
        let keys = resolve_api_keys(
            &strings(&["from-flag"]),
            Some(&config),
            Some("from-env"),
        )
        .unwrap();
        assert_eq!(keys, ["from-flag"]);
    }

    #[test]
    fn the_config_file_overrides_the_environment() {
        let (_dir, config) = write_config(&["from-config"]);
        let keys = resolve_api_keys(&[], Some(&config), Some("from-env")).unwrap();
        assert_eq!(keys, ["from-config"]);
    }

    #[test]
    fn the_environment_is_the_fallback_and_is_comma_split() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.yml");
        let keys =
            resolve_api_keys(&[], Some(&missing), Some(" k1 ,k2,, k3")).unwrap();
        assert_eq!(keys, ["k1", "k2", "k3"]);
    }

    #[test]
    fn no_source_yields_no_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let missing = dir.path().join("missing.yml");
        assert!(resolve_api_keys(&[], Some(&missing), None).unwrap().is_empty());
    }

    #[test]
    fn an_unreadable_config_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("tinifier.yml");
        std::fs::write(&path, "apiKeys: {broken\n").unwrap();
        assert!(resolve_api_keys(&[], Some(&path), None).is_err());
    }
}
