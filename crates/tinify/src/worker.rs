//! The per-file workflow: upload, download, replace.

use std::{
    io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use filetime::FileTime;
use humansize::{format_size, BINARY};
use tinify_client::{Client, ClientError, CompressionRecord, DownloadOptions};
use tokio::{fs, io::AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    pipeline::PipelineOptions,
    pool::ClientPool,
    retry::{retry, RetryError},
    stats::{Outcome, Summary},
};

/// Why a file could not be processed.
#[derive(Debug, thiserror::Error)]
pub(crate) enum WorkerError {
    #[error("failed to read file metadata")]
    Stat(#[source] io::Error),

    #[error("failed to construct an api client")]
    Client(#[source] ClientError),

    #[error("upload failed")]
    Upload(#[source] RetryError<ClientError>),

    #[error("download failed")]
    Download(#[source] RetryError<ClientError>),

    #[error("failed to replace the original file")]
    Replace(#[source] RetryError<io::Error>),

    #[error("no valid api keys left")]
    NoValidKeys,

    #[error("cancelled")]
    Cancelled,
}

impl WorkerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkerError::Cancelled)
    }
}

/// Everything a worker needs, shared across all workers of one run.
pub(crate) struct WorkerContext {
    pub pool: Arc<ClientPool>,
    pub stats: Arc<Summary>,
    pub options: PipelineOptions,
    /// The outer token: aborts in-flight work.
    pub cancel: CancellationToken,
    /// Best-effort file total published by the counting task.
    pub total_files: Arc<AtomicUsize>,
    pub started: AtomicUsize,
}

/// Runs the three-step workflow for one file and records its outcome.
pub(crate) async fn process_file(cx: &WorkerContext, path: &Path) -> Result<(), WorkerError> {
    let sequence = cx.started.fetch_add(1, Ordering::SeqCst) + 1;
    let total = cx.total_files.load(Ordering::Relaxed);
    if total > 0 {
        tracing::info!("compressing {} ({sequence} of {total})", path.display());
    } else {
        tracing::info!("compressing {}", path.display());
    }

    let metadata = fs::metadata(path).await.map_err(WorkerError::Stat)?;
    let original_size = metadata.len();

    let (client, record) = upload(cx, path).await?;

    if should_skip(
        original_size,
        record.size,
        cx.options.skip_if_diff_less,
    ) {
        tracing::info!(
            "skipping {}: compressed result is not better than the original",
            path.display()
        );
        cx.stats.add(Outcome {
            path: path.to_path_buf(),
            mime_type: record.mime_type.clone(),
            original_size,
            compressed_size: record.size,
            skipped: true,
        });
        return Ok(());
    }

    let tmp = sidecar(path, "tiny");
    let result = download_and_replace(cx, &client, &record, path, &tmp).await;
    // The sidecar must not survive any exit path.
    let _ = fs::remove_file(&tmp).await;
    result?;

    let outcome = Outcome {
        path: path.to_path_buf(),
        mime_type: record.mime_type.clone(),
        original_size,
        compressed_size: record.size,
        skipped: false,
    };
    tracing::info!(
        "compressed {}: {} -> {} ({:+.2}%)",
        path.display(),
        format_size(original_size, BINARY),
        format_size(record.size, BINARY),
        outcome.percent(),
    );
    if let Some(quota) = record.compression_count {
        tracing::debug!("api key quota used so far: {quota}");
    }
    cx.stats.add(outcome);
    Ok(())
}

/// Uploads the file, rotating to another API key whenever the service
/// rejects the current one. Transient errors are owned by the retry
/// executor; key rejections are persistent for the run and revoke the
/// key instead of burning attempts on it.
async fn upload(
    cx: &WorkerContext,
    path: &Path,
) -> Result<(Arc<Client>, CompressionRecord), WorkerError> {
    loop {
        let Some((client, revoke)) = cx.pool.get().map_err(WorkerError::Client)? else {
            return Err(WorkerError::NoValidKeys);
        };

        let result = retry(
            &cx.cancel,
            cx.options.retry_attempts,
            cx.options.retry_delay,
            ClientError::is_key_rejection,
            |attempt| {
                let client = Arc::clone(&client);
                async move {
                    if attempt > 1 {
                        tracing::debug!(
                            "reopening {} for upload attempt {attempt}",
                            path.display()
                        );
                    }
                    let source = fs::File::open(path).await?;
                    client.compress(source).await
                }
            },
        )
        .await;

        match result {
            Ok(record) => return Ok((client, record)),
            Err(RetryError::Halted(err)) if err.is_key_rejection() => {
                tracing::warn!("api key rejected by the remote service ({err}), rotating");
                revoke.revoke();
            }
            Err(RetryError::Cancelled) => return Err(WorkerError::Cancelled),
            Err(err) => return Err(WorkerError::Upload(err)),
        }
    }
}

async fn download_and_replace(
    cx: &WorkerContext,
    client: &Client,
    record: &CompressionRecord,
    path: &Path,
    tmp: &Path,
) -> Result<(), WorkerError> {
    let download_options = DownloadOptions {
        preserve_creation: cx.options.preserve_time,
        ..DownloadOptions::default()
    };

    let downloaded = retry(
        &cx.cancel,
        cx.options.retry_attempts,
        cx.options.retry_delay,
        |_: &ClientError| false,
        |_| async move {
            let mut dst = open_sidecar(tmp).await?;
            client.download(record, &mut dst, download_options).await
        },
    )
    .await;
    match downloaded {
        Ok(()) => {}
        Err(RetryError::Cancelled) => return Err(WorkerError::Cancelled),
        Err(err) => return Err(WorkerError::Download(err)),
    }

    let replaced = retry(
        &cx.cancel,
        cx.options.retry_attempts,
        cx.options.retry_delay,
        |_: &io::Error| false,
        |_| replace_original(path, tmp, &cx.options),
    )
    .await;
    match replaced {
        Ok(()) => Ok(()),
        Err(RetryError::Cancelled) => Err(WorkerError::Cancelled),
        Err(err) => Err(WorkerError::Replace(err)),
    }
}

/// Streams the sidecar over the original in place. Overwriting rather
/// than rename-swapping keeps the inode identity intact (hardlinks and
/// watchers keep working); `keep_original` is the escape hatch for the
/// non-atomic window this opens.
async fn replace_original(
    path: &Path,
    tmp: &Path,
    options: &PipelineOptions,
) -> io::Result<()> {
    let metadata = fs::metadata(path).await?;
    let modified = FileTime::from_last_modification_time(&metadata);

    if options.keep_original {
        // fs::copy carries over the permission bits of the source.
        fs::copy(path, sidecar(path, "orig")).await?;
    }

    let mut src = fs::File::open(tmp).await?;
    let mut dst = fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    tokio::io::copy(&mut src, &mut dst).await?;
    dst.flush().await?;
    drop(dst);

    if options.preserve_time {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || filetime::set_file_times(&path, modified, modified))
            .await
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;
    }

    Ok(())
}

async fn open_sidecar(path: &Path) -> io::Result<fs::File> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o644);
    options.open(path).await
}

fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// A download is pointless when the result is empty, not smaller, or the
/// relative gain stays below the configured threshold.
fn should_skip(original: u64, compressed: u64, threshold: f64) -> bool {
    if compressed == 0 || compressed >= original {
        return true;
    }
    let diff = (original - compressed) as f64 / compressed as f64 * 100.0;
    diff < threshold
}
