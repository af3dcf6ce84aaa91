//! A small executor that re-runs a fallible async operation a fixed
//! number of times with a constant delay in between.
//!
//! Unlike a transport-level retry middleware, this operates on whole
//! workflow steps: the caller decides which errors abort the loop early
//! through a stop predicate, and cancellation is observed on entry,
//! while an attempt is in flight, and during the inter-attempt sleep.

use std::{fmt, future::Future, time::Duration};

use tokio_util::sync::CancellationToken;

/// Why a retried operation ultimately failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The cancellation token fired before or between attempts.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation returned an error matching the stop predicate; no
    /// further attempts were made.
    #[error(transparent)]
    Halted(E),

    /// Every attempt failed. The last underlying error is kept as the
    /// source so callers can inspect the full chain.
    #[error("retry attempts exceeded ({attempts})")]
    AttemptsExceeded {
        attempts: u32,
        #[source]
        source: E,
    },
}

impl<E> RetryError<E> {
    /// The underlying operation error, if any.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled => None,
            RetryError::Halted(err) | RetryError::AttemptsExceeded { source: err, .. } => Some(err),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

/// Runs `op` up to `attempts` times (at least once), sleeping `delay`
/// between attempts.
///
/// `op` receives the 1-based attempt number. The first success wins; an
/// error matching `stop_on` ends the loop immediately as
/// [`RetryError::Halted`]; exhausting all attempts yields
/// [`RetryError::AttemptsExceeded`] wrapping the last error.
pub async fn retry<T, E, F, Fut, S>(
    cancel: &CancellationToken,
    attempts: u32,
    delay: Duration,
    stop_on: S,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    E: fmt::Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    S: Fn(&E) -> bool,
{
    let attempts = attempts.max(1);
    if cancel.is_cancelled() {
        return Err(RetryError::Cancelled);
    }

    let mut attempt = 1;
    loop {
        // Racing the attempt against the token lets cancellation abort
        // in-flight work, not just the waits in between.
        let result = tokio::select! {
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            result = op(attempt) => result,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) if stop_on(&err) => return Err(RetryError::Halted(err)),
            Err(err) if attempt >= attempts => {
                return Err(RetryError::AttemptsExceeded {
                    attempts,
                    source: err,
                })
            }
            Err(err) => {
                tracing::debug!(attempt, "attempt failed, retrying: {err}");
                tokio::select! {
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        error::Error as _,
        sync::atomic::{AtomicU32, Ordering},
    };

    use super::*;

    #[derive(Debug, thiserror::Error, PartialEq, Eq)]
    enum StepError {
        #[error("transient failure")]
        Transient,
        #[error("fatal failure")]
        Fatal,
    }

    const NO_DELAY: Duration = Duration::from_millis(0);

    fn never(_: &StepError) -> bool {
        false
    }

    #[tokio::test]
    async fn succeeds_on_the_kth_call_after_exactly_k_calls() {
        let calls = AtomicU32::new(0);
        let result = retry(&CancellationToken::new(), 5, NO_DELAY, never, |attempt| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt == 3 {
                    Ok(attempt)
                } else {
                    Err(StepError::Transient)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhaustion_calls_exactly_n_times_and_keeps_the_chain() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> =
            retry(&CancellationToken::new(), 4, NO_DELAY, never, |_| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::Transient)
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let err = result.unwrap_err();
        assert!(
            matches!(err, RetryError::AttemptsExceeded { attempts: 4, .. }),
            "{err:?}"
        );
        // Both the sentinel and the last underlying error are reachable
        // through the chain.
        let source = err.source().expect("the last error is the source");
        assert_eq!(source.to_string(), "transient failure");
    }

    #[tokio::test]
    async fn a_stop_error_halts_without_further_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(
            &CancellationToken::new(),
            10,
            NO_DELAY,
            |err| *err == StepError::Fatal,
            |_| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(StepError::Fatal)
                }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            RetryError::Halted(StepError::Fatal)
        ));
    }

    #[tokio::test]
    async fn cancellation_on_entry_never_invokes_the_operation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry(&cancel, 3, NO_DELAY, never, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StepError::Transient)
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_interrupts_an_attempt_in_flight() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        // The attempt itself never resolves; only the token race can
        // end the loop.
        let result: Result<(), _> = retry(&cancel, 3, NO_DELAY, never, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<Result<(), StepError>>().await
            }
        })
        .await;

        canceller.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn cancellation_during_the_wait_stops_the_loop() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let result = retry(
            &cancel,
            5,
            Duration::from_secs(60),
            never,
            |_| {
                let calls = &calls;
                let cancel = &cancel;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    // Trip the token once the first attempt has failed,
                    // so the executor is parked in its sleep.
                    cancel.cancel();
                    Err::<(), _>(StepError::Transient)
                }
            },
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn a_zero_attempt_budget_still_runs_once() {
        let calls = AtomicU32::new(0);
        let result = retry(&CancellationToken::new(), 0, NO_DELAY, never, |_| {
            let calls = &calls;
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StepError>(())
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
