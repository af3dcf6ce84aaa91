//! The concurrent compression pipeline behind the `tinifier` binary.
//!
//! A [`Pipeline`] pulls file paths lazily from a
//! [`tinify_finder::Finder`], caps the number of in-flight workers with a
//! semaphore, and runs each file through a three-step remote workflow:
//! upload to the compression service, download of the compressed result,
//! and an in-place replacement of the original. API keys live in a
//! [`ClientPool`] that workers draw from, permanently revoking keys the
//! service rejects. Per-file failures feed an error-budget watcher that
//! stops ingestion of new work once the configured threshold is crossed,
//! while in-flight workers are left to finish naturally.

mod budget;
mod pipeline;
pub mod pool;
pub mod retry;
mod stats;
mod worker;

pub use pipeline::{Pipeline, PipelineError, PipelineOptions};
pub use pool::{ClientPool, RevokeHandle};
pub use stats::{Outcome, Summary};
