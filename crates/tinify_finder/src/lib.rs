//! Lazy discovery of the files a pipeline run should process.
//!
//! A [`Finder`] walks a set of root paths (files or directories) and
//! streams matching, de-duplicated absolute paths over a bounded
//! channel. The traversal runs on the blocking thread pool and stops
//! producing as soon as the cancellation token fires or the receiver is
//! dropped.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Admits files whose trailing extension (without the dot) matches one
/// of the configured extensions.
#[derive(Debug, Clone)]
pub struct ExtensionFilter {
    case_sensitive: bool,
    extensions: Vec<String>,
}

impl ExtensionFilter {
    pub fn new(
        case_sensitive: bool,
        extensions: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let extensions = extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.into();
                if case_sensitive {
                    ext
                } else {
                    ext.to_lowercase()
                }
            })
            .collect();
        Self {
            case_sensitive,
            extensions,
        }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return false;
        };
        if self.case_sensitive {
            self.extensions.iter().any(|candidate| candidate == ext)
        } else {
            let ext = ext.to_lowercase();
            self.extensions.iter().any(|candidate| *candidate == ext)
        }
    }
}

/// Lazy, finite, non-restartable file discovery over a set of roots.
#[derive(Debug, Clone)]
pub struct Finder {
    roots: Vec<PathBuf>,
    recursive: bool,
    filter: ExtensionFilter,
}

impl Finder {
    pub fn new(roots: Vec<PathBuf>, recursive: bool, filter: ExtensionFilter) -> Self {
        Self {
            roots,
            recursive,
            filter,
        }
    }

    /// Starts the traversal and returns the receiving end of the stream.
    ///
    /// The channel is nearly unbuffered so that cancellation leaves no
    /// backlog of already-yielded paths behind.
    pub fn stream(&self, cancel: CancellationToken) -> mpsc::Receiver<PathBuf> {
        let (tx, rx) = mpsc::channel(1);
        let finder = self.clone();
        tokio::task::spawn_blocking(move || finder.walk(&cancel, &tx));
        rx
    }

    fn walk(&self, cancel: &CancellationToken, tx: &mpsc::Sender<PathBuf>) {
        let mut seen = HashSet::new();

        for root in &self.roots {
            let max_depth = if self.recursive { usize::MAX } else { 1 };
            for entry in WalkDir::new(root).max_depth(max_depth).follow_links(false) {
                if cancel.is_cancelled() {
                    return;
                }
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!("skipping unreadable entry: {err}");
                        continue;
                    }
                };
                if !entry.file_type().is_file() || !self.filter.matches(entry.path()) {
                    continue;
                }

                let path = absolute(entry.path());
                if seen.insert(path.clone()) && tx.blocking_send(path).is_err() {
                    return;
                }
            }
        }
    }
}

/// Canonical form used for de-duplication; identical files reached
/// through different roots collapse into one task.
fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
