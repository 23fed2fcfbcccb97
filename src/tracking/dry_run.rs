use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use parking_lot::Mutex;
use tracing::info;

use super::{
    Experiment, MetricSample, Params, RunInfo, RunStatus, StartRunOptions, TrackingClient,
};

/// A call made against the [`DryRunClient`], in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    SetExperiment(String),
    StartRun {
        experiment_id: String,
        log_system_metrics: bool,
    },
    LogParams {
        run_id: String,
        params: Params,
    },
    LogMetric {
        run_id: String,
        name: String,
        value: f64,
        step: u64,
    },
    EndRun {
        run_id: String,
        status: RunStatus,
    },
}

/// Tracking client that talks to no server.
///
/// Every call is logged and kept in memory, which makes the daemon usable
/// without a tracking server and gives tests a recording double.
#[derive(Default)]
pub struct DryRunClient {
    calls: Mutex<Vec<Call>>,
    next_id: AtomicU64,
}

impl DryRunClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all calls so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// `(name, step)` of every accepted metric, in emission order.
    pub fn metric_steps(&self) -> Vec<(String, u64)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::LogMetric { name, step, .. } => Some((name.clone(), *step)),
                _ => None,
            })
            .collect()
    }

    /// Number of `end_run` calls received.
    pub fn end_run_count(&self) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::EndRun { .. }))
            .count()
    }
}

impl TrackingClient for DryRunClient {
    async fn set_experiment(&self, name: &str) -> Result<Experiment> {
        info!(name, "dry-run: set experiment");
        self.calls.lock().push(Call::SetExperiment(name.to_string()));
        Ok(Experiment {
            id: "0".to_string(),
            name: name.to_string(),
        })
    }

    async fn start_run(&self, experiment: &Experiment, opts: &StartRunOptions) -> Result<RunInfo> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let run_id = format!("dry-run-{n}");
        info!(
            run_id = %run_id,
            experiment = %experiment.name,
            log_system_metrics = opts.log_system_metrics,
            "dry-run: start run",
        );
        self.calls.lock().push(Call::StartRun {
            experiment_id: experiment.id.clone(),
            log_system_metrics: opts.log_system_metrics,
        });
        Ok(RunInfo {
            run_id,
            experiment_id: experiment.id.clone(),
        })
    }

    async fn log_params(&self, run_id: &str, params: &Params) -> Result<()> {
        info!(run_id, count = params.len(), "dry-run: log params");
        self.calls.lock().push(Call::LogParams {
            run_id: run_id.to_string(),
            params: params.clone(),
        });
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, sample: &MetricSample) -> Result<()> {
        info!(
            run_id,
            metric = %sample.name,
            value = sample.value,
            step = sample.step,
            "dry-run: log metric",
        );
        self.calls.lock().push(Call::LogMetric {
            run_id: run_id.to_string(),
            name: sample.name.clone(),
            value: sample.value,
            step: sample.step,
        });
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        info!(run_id, %status, "dry-run: end run");
        self.calls.lock().push(Call::EndRun {
            run_id: run_id.to_string(),
            status,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_in_order() {
        let client = DryRunClient::new();
        let exp = client.set_experiment("exp").await.expect("experiment");
        let run = client
            .start_run(&exp, &StartRunOptions::default())
            .await
            .expect("run");
        client
            .log_metric(&run.run_id, &MetricSample::now("m", 1.0, 0))
            .await
            .expect("metric");
        client
            .end_run(&run.run_id, RunStatus::Finished)
            .await
            .expect("end");

        let calls = client.calls();
        assert_eq!(calls.len(), 4);
        assert_eq!(calls[0], Call::SetExperiment("exp".to_string()));
        assert_eq!(client.metric_steps(), vec![("m".to_string(), 0)]);
        assert_eq!(client.end_run_count(), 1);
    }

    #[tokio::test]
    async fn test_run_ids_are_unique() {
        let client = DryRunClient::new();
        let exp = client.set_experiment("exp").await.expect("experiment");
        let a = client
            .start_run(&exp, &StartRunOptions::default())
            .await
            .expect("run a");
        let b = client
            .start_run(&exp, &StartRunOptions::default())
            .await
            .expect("run b");
        assert_ne!(a.run_id, b.run_id);
    }
}
