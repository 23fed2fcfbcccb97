use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, warn};

use crate::sampler::Reading;
use crate::tracking::{MetricSample, TrackingClient};

/// How often a failed metric call is attempted before the error is fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per metric, including the first. 1 disables retries.
    pub max_attempts: u32,
    /// Wait before the first retry; doubles after each further failure.
    pub initial_backoff: Duration,
    /// Upper bound on the wait between attempts.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    /// Policy with the given number of attempts and default backoff.
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (1-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Forwards one tick's readings to the tracking service under a single step.
pub struct StepEmitter<C> {
    client: Arc<C>,
    retry: RetryPolicy,
}

impl<C: TrackingClient> StepEmitter<C> {
    pub fn new(client: Arc<C>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Send every reading, in order, tagged with `step`.
    ///
    /// Stops at the first metric that still fails after all attempts.
    pub async fn emit(&self, run_id: &str, readings: &[Reading], step: u64) -> Result<()> {
        for reading in readings {
            let sample = MetricSample::now(reading.name, reading.value, step);
            self.send(run_id, &sample).await?;
        }
        debug!(step, count = readings.len(), "emitted readings");
        Ok(())
    }

    async fn send(&self, run_id: &str, sample: &MetricSample) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.client.log_metric(run_id, sample).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_attempts => {
                    let wait = self.retry.backoff(attempt);
                    warn!(
                        error = %e,
                        metric = %sample.name,
                        step = sample.step,
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        "metric emission failed, retrying",
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(e.context(format!(
                        "emitting {} at step {} after {attempt} attempt(s)",
                        sample.name, sample.step
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;
    use crate::tracking::{
        DryRunClient, Experiment, Params, RunInfo, RunStatus, StartRunOptions,
    };

    /// Rejects the first `failures` metric calls, then delegates.
    struct FlakyClient {
        inner: DryRunClient,
        failures: AtomicUsize,
    }

    impl FlakyClient {
        fn new(failures: usize) -> Self {
            Self {
                inner: DryRunClient::new(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    impl TrackingClient for FlakyClient {
        async fn set_experiment(&self, name: &str) -> Result<Experiment> {
            self.inner.set_experiment(name).await
        }

        async fn start_run(&self, e: &Experiment, o: &StartRunOptions) -> Result<RunInfo> {
            self.inner.start_run(e, o).await
        }

        async fn log_params(&self, run_id: &str, params: &Params) -> Result<()> {
            self.inner.log_params(run_id, params).await
        }

        async fn log_metric(&self, run_id: &str, sample: &MetricSample) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                bail!("service unavailable");
            }
            self.inner.log_metric(run_id, sample).await
        }

        async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
            self.inner.end_run(run_id, status).await
        }
    }

    fn readings() -> Vec<Reading> {
        vec![
            Reading::new("CPU_Usage", 10.0),
            Reading::new("RAM_Usage", 20.0),
            Reading::new("Disk_Usage", 30.0),
        ]
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(700),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(4), Duration::from_millis(700));
        assert_eq!(policy.backoff(40), Duration::from_millis(700));
    }

    #[tokio::test]
    async fn test_emit_tags_every_reading_with_step() {
        let client = Arc::new(DryRunClient::new());
        let emitter = StepEmitter::new(Arc::clone(&client), RetryPolicy::default());

        emitter.emit("run", &readings(), 4).await.expect("emit");

        assert_eq!(
            client.metric_steps(),
            vec![
                ("CPU_Usage".to_string(), 4),
                ("RAM_Usage".to_string(), 4),
                ("Disk_Usage".to_string(), 4),
            ]
        );
    }

    #[tokio::test]
    async fn test_default_policy_does_not_retry() {
        let client = Arc::new(FlakyClient::new(1));
        let emitter = StepEmitter::new(Arc::clone(&client), RetryPolicy::default());

        let err = emitter
            .emit("run", &readings(), 0)
            .await
            .expect_err("first failure is fatal");
        assert!(format!("{err:#}").contains("after 1 attempt(s)"));
        assert!(client.inner.metric_steps().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_recovers_from_transient_failures() {
        let client = Arc::new(FlakyClient::new(2));
        let emitter = StepEmitter::new(Arc::clone(&client), RetryPolicy::with_attempts(3));

        emitter.emit("run", &readings(), 0).await.expect("emit");

        assert_eq!(client.inner.metric_steps().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_after_max_attempts() {
        let client = Arc::new(FlakyClient::new(5));
        let emitter = StepEmitter::new(Arc::clone(&client), RetryPolicy::with_attempts(3));

        let err = emitter
            .emit("run", &readings(), 2)
            .await
            .expect_err("exhausted attempts");
        assert!(format!("{err:#}").contains("CPU_Usage at step 2 after 3 attempt(s)"));
    }
}
