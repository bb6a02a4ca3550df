//! Durable step execution
//!
//! A workflow is a fixed list of named steps. Each step's output is recorded in
//! a `StepJournal` once it succeeds, so a re-delivered run skips straight past
//! finished steps. Steps retry in place with exponential backoff; a
//! non-retriable error ends the run immediately. Journal reads and writes
//! retry under the same policy, and a journal that stays unreachable
//! interrupts the run instead of failing it.

pub mod dispatcher;
pub mod summarize;
pub mod worker;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use crate::domain::workflow_runs;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepError {
    #[error("{0}")]
    Retriable(String),
    #[error("{0}")]
    NonRetriable(String),
}

/// A step that gave up, either immediately or after exhausting its attempts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step {step} failed after {attempts} attempt(s): {message}")]
pub struct StepFailure {
    pub step: &'static str,
    pub message: String,
    pub retriable: bool,
    pub attempts: u32,
    /// The journal gave up, not the step body; the run can be delivered again
    pub interrupted: bool,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the attempt following `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .base_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff);

        if self.jitter && !base.is_zero() {
            let factor = 1.0 + rand::rng().random_range(-0.25..0.25);
            base.mul_f64(factor)
        } else {
            base
        }
    }
}

/// Where completed step outputs are remembered for one run
#[async_trait]
pub trait StepJournal: Send + Sync {
    async fn completed(&self, step: &str) -> Result<Option<Value>, StoreError>;
    async fn record(&self, step: &str, output: &Value) -> Result<(), StoreError>;
}

/// Journal that lives as long as a single in-process run
#[derive(Default)]
pub struct MemoryJournal {
    steps: Mutex<HashMap<String, Value>>,
}

#[async_trait]
impl StepJournal for MemoryJournal {
    async fn completed(&self, step: &str) -> Result<Option<Value>, StoreError> {
        let steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        Ok(steps.get(step).cloned())
    }

    async fn record(&self, step: &str, output: &Value) -> Result<(), StoreError> {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        steps.entry(step.to_string()).or_insert_with(|| output.clone());
        Ok(())
    }
}

/// Journal backed by the workflow_steps table
pub struct PgJournal {
    pool: sqlx::PgPool,
    run_id: Uuid,
}

impl PgJournal {
    pub fn new(pool: sqlx::PgPool, run_id: Uuid) -> Self {
        Self { pool, run_id }
    }
}

#[async_trait]
impl StepJournal for PgJournal {
    async fn completed(&self, step: &str) -> Result<Option<Value>, StoreError> {
        Ok(workflow_runs::step_output(&self.pool, self.run_id, step).await?)
    }

    async fn record(&self, step: &str, output: &Value) -> Result<(), StoreError> {
        Ok(workflow_runs::record_step(&self.pool, self.run_id, step, output).await?)
    }
}

pub struct StepRunner<'a> {
    journal: &'a dyn StepJournal,
    policy: &'a RetryPolicy,
}

impl<'a> StepRunner<'a> {
    pub fn new(journal: &'a dyn StepJournal, policy: &'a RetryPolicy) -> Self {
        Self { journal, policy }
    }

    /// Run `step` unless the journal already holds its output
    pub async fn run<T, F, Fut>(&self, step: &'static str, mut body: F) -> Result<T, StepFailure>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let journal = self.journal;
        let recorded = self
            .journaled(step, || async move { journal.completed(step).await })
            .await?;
        if let Some(output) = recorded {
            match serde_json::from_value(output) {
                Ok(value) => {
                    tracing::debug!(step, "Step already completed, reusing output");
                    return Ok(value);
                }
                Err(e) => tracing::warn!(step, error = %e, "Discarding unreadable step output"),
            }
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match body().await {
                Ok(output) => {
                    let value = serde_json::to_value(&output).map_err(|e| StepFailure {
                        step,
                        message: format!("step output not serializable: {}", e),
                        retriable: false,
                        attempts: attempt,
                        interrupted: false,
                    })?;
                    let value = &value;
                    self.journaled(step, || async move { journal.record(step, value).await })
                        .await?;
                    return Ok(output);
                }
                Err(StepError::NonRetriable(message)) => {
                    return Err(StepFailure {
                        step,
                        message,
                        retriable: false,
                        attempts: attempt,
                        interrupted: false,
                    });
                }
                Err(StepError::Retriable(message)) if attempt >= self.policy.max_attempts => {
                    return Err(StepFailure {
                        step,
                        message,
                        retriable: true,
                        attempts: attempt,
                        interrupted: false,
                    });
                }
                Err(StepError::Retriable(message)) => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        step,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Step failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Retry a journal call with the step policy; exhaustion interrupts the run
    async fn journaled<T, F, Fut>(&self, step: &'static str, mut op: F) -> Result<T, StepFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.policy.max_attempts => {
                    return Err(StepFailure {
                        step,
                        message: format!("step journal unavailable: {}", e),
                        retriable: true,
                        attempts: attempt,
                        interrupted: true,
                    });
                }
                Err(e) => {
                    let delay = self.policy.backoff(attempt);
                    tracing::warn!(
                        step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Step journal error, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
        }
    }

    /// Fails the first `fail_reads` reads and `fail_writes` writes, then delegates
    #[derive(Default)]
    struct FlakyJournal {
        inner: MemoryJournal,
        fail_reads: AtomicU32,
        fail_writes: AtomicU32,
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    #[async_trait]
    impl StepJournal for FlakyJournal {
        async fn completed(&self, step: &str) -> Result<Option<Value>, StoreError> {
            if take(&self.fail_reads) {
                return Err(StoreError::Corrupt("pool timed out".into()));
            }
            self.inner.completed(step).await
        }

        async fn record(&self, step: &str, output: &Value) -> Result<(), StoreError> {
            if take(&self.fail_writes) {
                return Err(StoreError::Corrupt("connection reset".into()));
            }
            self.inner.record(step, output).await
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            jitter: false,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_retriable_errors_retry_until_success() {
        let journal = MemoryJournal::default();
        let policy = fast_policy(4);
        let calls = AtomicU32::new(0);

        let out: u32 = StepRunner::new(&journal, &policy)
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(StepError::Retriable("try again".into()))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(out, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retriable_stops_after_one_attempt() {
        let journal = MemoryJournal::default();
        let policy = fast_policy(4);
        let calls = AtomicU32::new(0);

        let failure = StepRunner::new(&journal, &policy)
            .run("doomed", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StepError::NonRetriable("no captions".into()))
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.attempts, 1);
        assert!(!failure.retriable);
        assert_eq!(failure.message, "no captions");
    }

    #[tokio::test]
    async fn test_exhausted_attempts_report_last_error() {
        let journal = MemoryJournal::default();
        let policy = fast_policy(2);

        let failure = StepRunner::new(&journal, &policy)
            .run("always", || async { Err::<(), _>(StepError::Retriable("503".into())) })
            .await
            .unwrap_err();

        assert_eq!(failure.attempts, 2);
        assert!(failure.retriable);
        assert_eq!(failure.message, "503");
    }

    #[tokio::test]
    async fn test_completed_steps_are_skipped() {
        let journal = MemoryJournal::default();
        let policy = fast_policy(1);
        let calls = AtomicU32::new(0);
        let runner = StepRunner::new(&journal, &policy);

        for _ in 0..2 {
            let out: String = runner
                .run("once", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("done".to_string())
                })
                .await
                .unwrap();
            assert_eq!(out, "done");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transient_journal_errors_are_retried() {
        let journal = FlakyJournal {
            fail_reads: AtomicU32::new(1),
            fail_writes: AtomicU32::new(2),
            ..Default::default()
        };
        let policy = fast_policy(4);
        let calls = AtomicU32::new(0);

        let out: String = StepRunner::new(&journal, &policy)
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("transcript".to_string())
            })
            .await
            .unwrap();

        assert_eq!(out, "transcript");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            journal.inner.completed("fetch").await.unwrap(),
            Some(Value::from("transcript"))
        );
    }

    #[tokio::test]
    async fn test_unreachable_journal_interrupts_without_running_step() {
        let journal = FlakyJournal {
            fail_reads: AtomicU32::new(u32::MAX),
            ..Default::default()
        };
        let policy = fast_policy(3);
        let calls = AtomicU32::new(0);

        let failure = StepRunner::new(&journal, &policy)
            .run("fetch", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(failure.interrupted);
        assert_eq!(failure.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
