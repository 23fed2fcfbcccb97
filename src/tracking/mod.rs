pub mod dry_run;
pub mod mlflow;

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use thiserror::Error;

pub use self::dry_run::DryRunClient;
pub use self::mlflow::MlflowClient;

/// Flat key/value parameters logged once per run.
pub type Params = BTreeMap<String, String>;

/// A logical grouping of runs in the tracking service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Experiment {
    pub id: String,
    pub name: String,
}

/// Identity of an opened run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub run_id: String,
    pub experiment_id: String,
}

/// Options passed when opening a run.
#[derive(Debug, Clone, Default)]
pub struct StartRunOptions {
    /// Human-readable run name. The service picks one when unset.
    pub run_name: Option<String>,
    /// Whether host resource metrics are collected for this run.
    pub log_system_metrics: bool,
    /// Extra tags attached at creation.
    pub tags: BTreeMap<String, String>,
}

/// Terminal status written when a run is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
}

impl RunStatus {
    /// Wire name used by the MLflow API.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "FINISHED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time-series point destined for the tracking service.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub value: f64,
    pub step: u64,
    /// Wall-clock time in milliseconds since the Unix epoch.
    pub timestamp_ms: i64,
}

impl MetricSample {
    /// Create a sample stamped with the current wall-clock time.
    pub fn now(name: impl Into<String>, value: f64, step: u64) -> Self {
        Self {
            name: name.into(),
            value,
            step,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Errors reported by the tracking service.
#[derive(Error, Debug)]
pub enum TrackingError {
    #[error("{endpoint}: {status} {code}: {message}")]
    Api {
        endpoint: &'static str,
        status: u16,
        code: String,
        message: String,
    },

    #[error("{endpoint}: response missing {field}")]
    MissingField {
        endpoint: &'static str,
        field: &'static str,
    },
}

impl TrackingError {
    /// Returns true when the service reported that the resource does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { code, .. } if code == "RESOURCE_DOES_NOT_EXIST")
    }
}

/// Experiment tracking service client.
///
/// Every call is a blocking round-trip from the caller's point of view;
/// failures are returned, never retried here.
pub trait TrackingClient: Send + Sync {
    /// Look up an experiment by name, creating it if it does not exist.
    fn set_experiment(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Experiment>> + Send;

    /// Open a new run in the given experiment.
    fn start_run(
        &self,
        experiment: &Experiment,
        opts: &StartRunOptions,
    ) -> impl std::future::Future<Output = Result<RunInfo>> + Send;

    /// Log static parameters for a run.
    fn log_params(
        &self,
        run_id: &str,
        params: &Params,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Append one metric point to a run.
    fn log_metric(
        &self,
        run_id: &str,
        sample: &MetricSample,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Close a run with a terminal status.
    fn end_run(
        &self,
        run_id: &str,
        status: RunStatus,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_wire_names() {
        assert_eq!(RunStatus::Finished.as_str(), "FINISHED");
        assert_eq!(RunStatus::Failed.as_str(), "FAILED");
    }

    #[test]
    fn test_tracking_error_not_found() {
        let err = TrackingError::Api {
            endpoint: "experiments/get-by-name",
            status: 404,
            code: "RESOURCE_DOES_NOT_EXIST".to_string(),
            message: "no such experiment".to_string(),
        };
        assert!(err.is_not_found());
        assert!(err.to_string().contains("experiments/get-by-name"));

        let err = TrackingError::MissingField {
            endpoint: "runs/create",
            field: "run.info.run_id",
        };
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_metric_sample_now_is_stamped() {
        let sample = MetricSample::now("CPU_Usage", 12.5, 3);
        assert_eq!(sample.name, "CPU_Usage");
        assert_eq!(sample.step, 3);
        assert!(sample.timestamp_ms > 0);
    }
}
