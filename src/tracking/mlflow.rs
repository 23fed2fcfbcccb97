use std::time::Instant;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    Experiment, MetricSample, Params, RunInfo, RunStatus, StartRunOptions, TrackingClient,
    TrackingError,
};
use crate::config::TrackingConfig;

/// REST API prefix appended to the tracking URI.
const API_PREFIX: &str = "/api/2.0/mlflow/";

/// The server rejects `runs/log-batch` requests carrying more params than this.
pub const MAX_PARAMS_PER_BATCH: usize = 100;

/// Longest param value the server stores.
pub const MAX_PARAM_VALUE_LEN: usize = 6000;

/// Tag recording whether host resource metrics are part of the run.
pub const SYSTEM_METRICS_TAG: &str = "runwatch.system_metrics";

/// MLflow tracking server client over the REST API.
pub struct MlflowClient {
    http: reqwest::Client,
    base: String,
    username: Option<String>,
    password: Option<String>,
    token: Option<String>,
}

impl MlflowClient {
    /// Create a new client for the configured tracking server.
    pub fn new(cfg: &TrackingConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(cfg.request_timeout);
        if cfg.insecure_tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let http = builder.build().context("building HTTP client")?;

        Ok(Self {
            http,
            base: cfg.tracking_uri.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            token: cfg.token.clone(),
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}{}", self.base, API_PREFIX, endpoint)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.token {
            return req.bearer_auth(token);
        }
        match &self.username {
            Some(user) => req.basic_auth(user, self.password.as_deref()),
            None => req,
        }
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        query: &[(&str, &str)],
    ) -> Result<T> {
        let start = Instant::now();
        let req = self
            .http
            .get(self.url(endpoint))
            .header("Accept", "application/json")
            .query(query);

        let response = self
            .authorize(req)
            .send()
            .await
            .with_context(|| format!("requesting {endpoint}"))?;

        let result = decode(endpoint, response).await;
        debug!(
            endpoint,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "mlflow GET",
        );
        result
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        endpoint: &'static str,
        body: &B,
    ) -> Result<T> {
        let start = Instant::now();
        let req = self
            .http
            .post(self.url(endpoint))
            .header("Accept", "application/json")
            .json(body);

        let response = self
            .authorize(req)
            .send()
            .await
            .with_context(|| format!("requesting {endpoint}"))?;

        let result = decode(endpoint, response).await;
        debug!(
            endpoint,
            elapsed_ms = start.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "mlflow POST",
        );
        result
    }

    async fn create_experiment(&self, name: &str) -> Result<Experiment> {
        let resp: CreateExperimentResponse = self
            .post_json("experiments/create", &CreateExperimentRequest { name })
            .await
            .with_context(|| format!("creating experiment {name:?}"))?;

        Ok(Experiment {
            id: resp.experiment_id,
            name: name.to_string(),
        })
    }
}

/// Turn an HTTP response into a decoded body or a typed service error.
async fn decode<T: DeserializeOwned>(
    endpoint: &'static str,
    response: reqwest::Response,
) -> Result<T> {
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        let parsed: ErrorBody = serde_json::from_str(&body).unwrap_or_else(|_| ErrorBody {
            error_code: "UNKNOWN".to_string(),
            message: body,
        });
        return Err(TrackingError::Api {
            endpoint,
            status: status.as_u16(),
            code: parsed.error_code,
            message: parsed.message,
        }
        .into());
    }

    response
        .json()
        .await
        .with_context(|| format!("decoding response from {endpoint}"))
}

// --- Wire structures ---

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize, PartialEq)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Deserialize)]
struct GetExperimentResponse {
    experiment: ExperimentData,
}

#[derive(Deserialize)]
struct ExperimentData {
    experiment_id: String,
    name: String,
    #[serde(default)]
    lifecycle_stage: String,
}

#[derive(Serialize)]
struct CreateExperimentRequest<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct CreateExperimentResponse {
    experiment_id: String,
}

#[derive(Serialize)]
struct CreateRunRequest<'a> {
    experiment_id: &'a str,
    start_time: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_name: Option<&'a str>,
    tags: Vec<KeyValue>,
}

#[derive(Deserialize)]
struct CreateRunResponse {
    run: Option<RunData>,
}

#[derive(Deserialize)]
struct RunData {
    info: RunInfoData,
}

#[derive(Deserialize)]
struct RunInfoData {
    run_id: String,
    experiment_id: String,
}

#[derive(Serialize)]
struct LogBatchRequest<'a> {
    run_id: &'a str,
    params: Vec<KeyValue>,
}

#[derive(Serialize)]
struct LogMetricRequest<'a> {
    run_id: &'a str,
    key: &'a str,
    value: f64,
    timestamp: i64,
    step: u64,
}

#[derive(Serialize)]
struct UpdateRunRequest<'a> {
    run_id: &'a str,
    status: &'static str,
    end_time: i64,
}

/// Bodies of write endpoints are `{}` on success.
#[derive(Deserialize)]
struct Empty {}

impl TrackingClient for MlflowClient {
    async fn set_experiment(&self, name: &str) -> Result<Experiment> {
        debug!(name, "looking up experiment");

        let lookup: Result<GetExperimentResponse> = self
            .get_json("experiments/get-by-name", &[("experiment_name", name)])
            .await;

        match lookup {
            Ok(resp) => {
                if resp.experiment.lifecycle_stage == "deleted" {
                    bail!("experiment {name:?} is deleted; restore it or choose another name");
                }
                Ok(Experiment {
                    id: resp.experiment.experiment_id,
                    name: resp.experiment.name,
                })
            }
            Err(e) => {
                let missing = e
                    .downcast_ref::<TrackingError>()
                    .is_some_and(TrackingError::is_not_found);
                if !missing {
                    return Err(e.context(format!("looking up experiment {name:?}")));
                }
                debug!(name, "experiment does not exist, creating it");
                self.create_experiment(name).await
            }
        }
    }

    async fn start_run(&self, experiment: &Experiment, opts: &StartRunOptions) -> Result<RunInfo> {
        let req = CreateRunRequest {
            experiment_id: &experiment.id,
            start_time: chrono::Utc::now().timestamp_millis(),
            run_name: opts.run_name.as_deref(),
            tags: run_tags(opts),
        };

        let resp: CreateRunResponse = self
            .post_json("runs/create", &req)
            .await
            .context("creating run")?;

        let info = resp
            .run
            .map(|r| r.info)
            .ok_or(TrackingError::MissingField {
                endpoint: "runs/create",
                field: "run.info",
            })?;

        Ok(RunInfo {
            run_id: info.run_id,
            experiment_id: info.experiment_id,
        })
    }

    async fn log_params(&self, run_id: &str, params: &Params) -> Result<()> {
        for (i, batch) in param_batches(params).into_iter().enumerate() {
            let count = batch.len();
            let _: Empty = self
                .post_json(
                    "runs/log-batch",
                    &LogBatchRequest {
                        run_id,
                        params: batch,
                    },
                )
                .await
                .with_context(|| format!("logging params batch {i}"))?;
            debug!(run_id, batch = i, count, "logged params");
        }
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, sample: &MetricSample) -> Result<()> {
        let req = LogMetricRequest {
            run_id,
            key: &sample.name,
            value: sample.value,
            timestamp: sample.timestamp_ms,
            step: sample.step,
        };

        let _: Empty = self
            .post_json("runs/log-metric", &req)
            .await
            .with_context(|| format!("logging metric {} at step {}", sample.name, sample.step))?;
        Ok(())
    }

    async fn end_run(&self, run_id: &str, status: RunStatus) -> Result<()> {
        let req = UpdateRunRequest {
            run_id,
            status: status.as_str(),
            end_time: chrono::Utc::now().timestamp_millis(),
        };

        let _: Empty = self
            .post_json("runs/update", &req)
            .await
            .with_context(|| format!("closing run {run_id}"))?;
        Ok(())
    }
}

/// Tags attached to every run at creation.
fn run_tags(opts: &StartRunOptions) -> Vec<KeyValue> {
    let mut tags = vec![
        KeyValue {
            key: "mlflow.source.name".to_string(),
            value: env!("CARGO_PKG_NAME").to_string(),
        },
        KeyValue {
            key: "mlflow.source.type".to_string(),
            value: "LOCAL".to_string(),
        },
        KeyValue {
            key: SYSTEM_METRICS_TAG.to_string(),
            value: opts.log_system_metrics.to_string(),
        },
    ];

    let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME"));
    if let Ok(user) = user {
        tags.push(KeyValue {
            key: "mlflow.user".to_string(),
            value: user,
        });
    }

    if let Some(name) = &opts.run_name {
        tags.push(KeyValue {
            key: "mlflow.runName".to_string(),
            value: name.clone(),
        });
    }

    for (k, v) in &opts.tags {
        tags.push(KeyValue {
            key: k.clone(),
            value: v.clone(),
        });
    }

    tags
}

/// Split params into request-sized batches, truncating oversized values.
fn param_batches(params: &Params) -> Vec<Vec<KeyValue>> {
    let all: Vec<KeyValue> = params
        .iter()
        .map(|(k, v)| KeyValue {
            key: k.clone(),
            value: truncate_chars(v, MAX_PARAM_VALUE_LEN).to_string(),
        })
        .collect();

    let mut batches = Vec::with_capacity(all.len().div_ceil(MAX_PARAMS_PER_BATCH));
    let mut iter = all.into_iter().peekable();
    while iter.peek().is_some() {
        batches.push(iter.by_ref().take(MAX_PARAMS_PER_BATCH).collect());
    }
    batches
}

/// Longest prefix of `s` holding at most `max` characters.
fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
