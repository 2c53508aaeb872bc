use std::future::Future;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sopflow_core::error::{FailureKind, Result, SopError};
use sopflow_core::sop::{Backoff, RetryPolicy};
use sopflow_core::state::AttemptRecord;

/// Final verdict of a retried operation: one success or one failure.
#[derive(Debug)]
pub enum RetryOutcome {
    Succeeded {
        value: Value,
        attempts: u32,
        /// Failed attempts that preceded the success.
        failures: Vec<AttemptRecord>,
    },
    Failed {
        kind: FailureKind,
        message: String,
        attempts: u32,
        history: Vec<AttemptRecord>,
    },
}

impl RetryOutcome {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Succeeded { attempts, .. } | Self::Failed { attempts, .. } => *attempts,
        }
    }
}

/// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
pub fn backoff_delay(backoff: &Backoff, attempt: u32) -> Duration {
    match backoff {
        Backoff::Fixed { delay_ms } => Duration::from_millis(*delay_ms),
        Backoff::Exponential {
            initial_ms,
            max_ms,
            multiplier,
            jitter,
        } => {
            let exp = attempt.saturating_sub(1).min(63) as i32;
            let ms = (*initial_ms as f64 * multiplier.powi(exp)).min(*max_ms as f64);
            let ms = if *jitter {
                // 0.8x to 1.2x
                ms * (0.8 + rand::random::<f64>() * 0.4)
            } else {
                ms
            };
            Duration::from_millis(ms.max(0.0) as u64)
        }
    }
}

/// Bounded retry with backoff. Only transient kinds listed in the policy
/// are retried; backoff sleeps and in-flight attempts stop on cancellation.
pub struct RetryController<'a> {
    policy: &'a RetryPolicy,
    cancel: &'a CancellationToken,
}

impl<'a> RetryController<'a> {
    pub fn new(policy: &'a RetryPolicy, cancel: &'a CancellationToken) -> Self {
        Self { policy, cancel }
    }

    /// Run `attempt(n)` until it succeeds, fails non-retryably, or the
    /// attempt budget is spent. `on_failure` sees every failed attempt.
    pub async fn run<F, Fut>(
        &self,
        mut attempt: F,
        mut on_failure: impl FnMut(&AttemptRecord),
    ) -> RetryOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Value>>,
    {
        let max_attempts = self.policy.effective_attempts();
        let mut history: Vec<AttemptRecord> = Vec::new();
        let mut n = 0;

        loop {
            n += 1;
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(SopError::Cancelled),
                r = attempt(n) => r,
            };

            let err = match result {
                Ok(value) => {
                    return RetryOutcome::Succeeded {
                        value,
                        attempts: n,
                        failures: history,
                    }
                }
                Err(e) => e,
            };

            let record = AttemptRecord {
                attempt: n,
                kind: err.kind(),
                message: err.to_string(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            };
            on_failure(&record);
            let kind = record.kind;
            history.push(record);

            if kind == FailureKind::Terminated || !self.policy.should_retry(kind) {
                debug!(attempt = n, kind = %kind, "Failure is not retryable");
                return self.failed(err, n, history);
            }
            if n >= max_attempts {
                warn!(attempts = n, kind = %kind, "Retry budget exhausted");
                return self.failed(err, n, history);
            }

            let delay = backoff_delay(&self.policy.backoff, n);
            debug!(
                attempt = n,
                max_attempts,
                backoff_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying"
            );
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return self.failed(SopError::Cancelled, n, history);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn failed(&self, err: SopError, attempts: u32, history: Vec<AttemptRecord>) -> RetryOutcome {
        RetryOutcome::Failed {
            kind: err.kind(),
            message: err.to_string(),
            attempts,
            history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sopflow_core::sop::Backoff;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn io_err() -> SopError {
        SopError::ToolExecution {
            tool: "t".into(),
            message: "flaky".into(),
        }
    }

    #[test]
    fn exponential_is_capped() {
        let b = Backoff::Exponential {
            initial_ms: 100,
            max_ms: 1000,
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(backoff_delay(&b, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&b, 3), Duration::from_millis(400));
        assert_eq!(backoff_delay(&b, 10), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_stays_in_band() {
        let b = Backoff::Exponential {
            initial_ms: 1000,
            max_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        };
        for _ in 0..50 {
            let d = backoff_delay(&b, 1).as_millis();
            assert!((800..=1200).contains(&d), "{d}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::attempts(3).with_backoff(Backoff::fixed(50));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let mut seen = 0;

        let outcome = RetryController::new(&policy, &cancel)
            .run(
                |n| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 3 {
                            Err(io_err())
                        } else {
                            Ok(json!("done"))
                        }
                    }
                },
                |_| seen += 1,
            )
            .await;

        match outcome {
            RetryOutcome::Succeeded {
                value,
                attempts,
                failures,
            } => {
                assert_eq!(value, json!("done"));
                assert_eq!(attempts, 3);
                assert_eq!(failures.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(seen, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_attempts() {
        let policy = RetryPolicy::attempts(4).with_backoff(Backoff::fixed(10));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let outcome = RetryController::new(&policy, &cancel)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(io_err()) }
                },
                |_| {},
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match outcome {
            RetryOutcome::Failed {
                kind,
                attempts,
                history,
                ..
            } => {
                assert_eq!(kind, FailureKind::ToolIo);
                assert_eq!(attempts, 4);
                assert_eq!(history.len(), 4);
                assert_eq!(history[3].attempt, 4);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn structural_failure_is_not_retried() {
        let policy = RetryPolicy {
            retryable: vec![FailureKind::Argument, FailureKind::ToolIo],
            ..RetryPolicy::attempts(5).with_backoff(Backoff::none())
        };
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let outcome = RetryController::new(&policy, &cancel)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err(SopError::Argument {
                            tool: "t".into(),
                            message: "bad".into(),
                        })
                    }
                },
                |_| {},
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            outcome,
            RetryOutcome::Failed {
                kind: FailureKind::Argument,
                attempts: 1,
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let policy = RetryPolicy::attempts(5).with_backoff(Backoff::fixed(60_000));
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();

        let outcome = RetryController::new(&policy, &cancel)
            .run(
                |_| async { Err(io_err()) },
                |_| canceller.cancel(),
            )
            .await;

        match outcome {
            RetryOutcome::Failed { kind, attempts, .. } => {
                assert_eq!(kind, FailureKind::Terminated);
                assert_eq!(attempts, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
