//! Error-budget enforcement, decoupled from the workers.
//!
//! Failures from every worker funnel into one bounded channel consumed
//! by a dedicated task. Counting them in a single place lets the
//! threshold trip exactly once even when many workers fail at the same
//! time.

use std::path::PathBuf;

use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::worker::WorkerError;

/// A failure attributed to one file.
#[derive(Debug)]
pub(crate) struct FileFailure {
    pub path: PathBuf,
    pub error: WorkerError,
}

/// Spawns the watcher task.
///
/// Every received failure increments the counter and is logged, except
/// for cancellations, which are not user-visible failures. When
/// `threshold` is non-zero and the counter reaches it, `stop_ingestion`
/// is cancelled exactly once. The task ends when all senders are gone
/// and resolves to the number of consumed errors.
pub(crate) fn spawn_watcher(
    threshold: u32,
    mut failures: mpsc::Receiver<FileFailure>,
    stop_ingestion: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut count: u64 = 0;
        let mut tripped = false;

        while let Some(failure) = failures.recv().await {
            count += 1;

            if !failure.error.is_cancelled() {
                tracing::error!(
                    "failed to compress {}: {:#}",
                    failure.path.display(),
                    anyhow::Error::new(failure.error)
                );
            }

            if threshold > 0 && count >= u64::from(threshold) && !tripped {
                tripped = true;
                tracing::error!("maximum errors reached, stopping");
                stop_ingestion.cancel();
            }
        }

        count
    })
}
