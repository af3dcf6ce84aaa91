//! The driver that fans files out over a bounded pool of workers.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tinify_finder::Finder;
use tokio::{
    sync::{mpsc, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

use crate::{
    budget::{self, FileFailure},
    pool::ClientPool,
    stats::Summary,
    worker::{self, WorkerContext, WorkerError},
};

/// Tunables of one pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Hard cap on in-flight workers; clamped to at least 1.
    pub threads: usize,
    /// Error budget; 0 disables it.
    pub max_errors: u32,
    /// Attempts per workflow step.
    pub retry_attempts: u32,
    /// Fixed sleep between attempts.
    pub retry_delay: Duration,
    /// Skip the replacement when the shrink percentage is below this.
    pub skip_if_diff_less: f64,
    /// Restore the original modification time after replacing.
    pub preserve_time: bool,
    /// Keep a `.orig` copy of the original next to the replaced file.
    pub keep_original: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            threads: 16,
            max_errors: 10,
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            skip_if_diff_less: 0.0,
            preserve_time: false,
            keep_original: false,
        }
    }
}

/// How a run ended when it did not fully succeed.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// The outer token fired; in-flight work was asked to abort.
    #[error("operation cancelled")]
    Cancelled,

    /// One or more files could not be compressed.
    #[error("{errors} file(s) failed to compress")]
    Failed { errors: u64 },
}

/// Pulls paths lazily from the finder, dispatches workers under a
/// concurrency cap, and aggregates their outcomes.
pub struct Pipeline {
    pool: Arc<ClientPool>,
    finder: Finder,
    options: PipelineOptions,
}

impl Pipeline {
    pub fn new(pool: ClientPool, finder: Finder, options: PipelineOptions) -> Self {
        Self {
            pool: Arc::new(pool),
            finder,
            options,
        }
    }

    /// Runs the pipeline to completion.
    ///
    /// Cancelling `cancel` stops ingestion and asks in-flight workers to
    /// abort at their next suspension point. Budget exhaustion cancels a
    /// child token instead, so running workers finish naturally and
    /// their results are still recorded.
    pub async fn run(self, cancel: &CancellationToken) -> Result<(), PipelineError> {
        let ingest = cancel.child_token();
        let worker_cap = self.options.threads.max(1);

        // Best-effort progress information: count the full file set on a
        // second, independent walk while the real one is being consumed.
        let total_files = Arc::new(AtomicUsize::new(0));
        let counter = {
            let mut stream = self.finder.stream(ingest.clone());
            let total_files = Arc::clone(&total_files);
            tokio::spawn(async move {
                let mut count = 0;
                while stream.recv().await.is_some() {
                    count += 1;
                    total_files.store(count, Ordering::Relaxed);
                }
            })
        };

        let (failures_tx, failures_rx) = mpsc::channel::<FileFailure>(worker_cap);
        let watcher = budget::spawn_watcher(self.options.max_errors, failures_rx, ingest.clone());

        let stats = Arc::new(Summary::default());
        let cx = Arc::new(WorkerContext {
            pool: Arc::clone(&self.pool),
            stats: Arc::clone(&stats),
            options: self.options.clone(),
            cancel: cancel.clone(),
            total_files,
            started: AtomicUsize::new(0),
        });

        let permits = Arc::new(Semaphore::new(worker_cap));
        let mut workers = JoinSet::new();
        let mut files = self.finder.stream(ingest.clone());

        while let Some(path) = files.recv().await {
            // The one suspension point that gates ingress: a permit
            // frees up only when a worker exits. A path already in hand
            // is dropped once ingestion is cancelled, so the error
            // budget bounds late dispatches by the worker cap.
            let permit = tokio::select! {
                biased;
                () = ingest.cancelled() => break,
                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let cx = Arc::clone(&cx);
            let failures_tx = failures_tx.clone();
            let ingest = ingest.clone();
            workers.spawn(async move {
                let _permit = permit;
                if let Err(error) = worker::process_file(&cx, &path).await {
                    if error.is_cancelled() {
                        return;
                    }
                    if matches!(error, WorkerError::NoValidKeys) {
                        // Nothing further can succeed; stop ingestion.
                        ingest.cancel();
                    }
                    let _ = failures_tx.send(FileFailure { path, error }).await;
                }
            });
        }

        while workers.join_next().await.is_some() {}

        drop(failures_tx);
        let errors = watcher.await.unwrap_or_default();
        counter.abort();

        if !stats.is_empty() {
            println!("{}", stats.render_table());
        }

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        if errors > 0 {
            return Err(PipelineError::Failed { errors });
        }
        Ok(())
    }
}
