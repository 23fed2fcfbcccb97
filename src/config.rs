use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_yaml::Value;

use crate::emitter::RetryPolicy;
use crate::tracking::Params;

/// Experiment that runs are grouped under unless overridden.
pub const DEFAULT_EXPERIMENT_NAME: &str = "mllam-data-prep";

/// Tracking server used when `MLFLOW_TRACKING_URI` is unset.
pub const DEFAULT_TRACKING_URI: &str = "http://localhost:5000";

/// Separator used when flattening nested parameter maps.
const KEY_SEPARATOR: char = '.';

/// Daemon settings resolved from the command line and environment.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Experiment that the run is created in.
    pub experiment_name: String,

    /// Optional human-readable name for the run.
    pub run_name: Option<String>,

    /// Tracking server connection.
    pub tracking: TrackingConfig,

    /// Retry behaviour for metric emission.
    pub retry: RetryPolicy,

    /// Record calls locally instead of contacting a tracking server.
    pub dry_run: bool,
}

/// Tracking server connection configuration.
#[derive(Debug, Clone)]
pub struct TrackingConfig {
    /// Base URI of the tracking server (e.g. "https://mlflow.example.org").
    pub tracking_uri: String,

    /// Accept self-signed or otherwise invalid TLS certificates.
    pub insecure_tls: bool,

    /// Per-request timeout. Default: 30s.
    pub request_timeout: Duration,

    /// Basic auth username.
    pub username: Option<String>,

    /// Basic auth password.
    pub password: Option<String>,

    /// Bearer token; takes precedence over basic auth.
    pub token: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            experiment_name: DEFAULT_EXPERIMENT_NAME.to_string(),
            run_name: None,
            tracking: TrackingConfig::default(),
            retry: RetryPolicy::default(),
            dry_run: false,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            tracking_uri: DEFAULT_TRACKING_URI.to_string(),
            insecure_tls: false,
            request_timeout: Duration::from_secs(30),
            username: None,
            password: None,
            token: None,
        }
    }
}

impl Settings {
    /// Validate the settings for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.experiment_name.trim().is_empty() {
            bail!("experiment name must not be empty");
        }

        if self.retry.max_attempts == 0 {
            bail!("emit attempts must be at least 1");
        }

        if self.dry_run {
            return Ok(());
        }

        let uri = &self.tracking.tracking_uri;
        if !(uri.starts_with("http://") || uri.starts_with("https://")) {
            bail!("tracking uri must be an http(s) URL, got {uri:?}");
        }

        if self.tracking.request_timeout.is_zero() {
            bail!("request timeout must be greater than zero");
        }

        if self.tracking.password.is_some() && self.tracking.username.is_none() {
            bail!("tracking password given without a username");
        }

        Ok(())
    }
}

/// Load a YAML file into a flat parameter set.
///
/// Nested mappings are flattened into dotted keys (`output.path`), while
/// sequences and scalars become their string form.
pub fn load_params(path: &Path) -> Result<Params> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;

    parse_params(&data).with_context(|| format!("parsing config file {}", path.display()))
}

/// Parse YAML text into a flat parameter set.
pub fn parse_params(data: &str) -> Result<Params> {
    if data.trim().is_empty() {
        return Ok(Params::new());
    }

    let root: Value = serde_yaml::from_str(data).context("invalid YAML")?;

    let mut params = Params::new();
    match root {
        Value::Mapping(_) => flatten_into(&mut params, None, &root)?,
        Value::Null => {}
        other => bail!("config root must be a mapping, got {}", kind_name(&other)),
    }
    Ok(params)
}

fn flatten_into(params: &mut Params, prefix: Option<&str>, value: &Value) -> Result<()> {
    match value {
        Value::Mapping(map) => {
            for (k, v) in map {
                let key = scalar_to_string(k)
                    .with_context(|| format!("non-scalar key under {:?}", prefix.unwrap_or("")))?;
                let full = match prefix {
                    Some(p) => format!("{p}{KEY_SEPARATOR}{key}"),
                    None => key,
                };
                flatten_into(params, Some(&full), v)?;
            }
        }
        Value::Tagged(tagged) => flatten_into(params, prefix, &tagged.value)?,
        leaf => {
            let key = prefix.context("scalar value without a key")?;
            params.insert(key.to_string(), leaf_to_string(leaf)?);
        }
    }
    Ok(())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Null => Some("None".to_string()),
        _ => None,
    }
}

fn leaf_to_string(value: &Value) -> Result<String> {
    if let Some(s) = scalar_to_string(value) {
        return Ok(s);
    }
    serde_json::to_string(value).context("encoding sequence value")
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Sequence(_) => "sequence",
        Value::Mapping(_) => "mapping",
        Value::Tagged(_) => "tagged value",
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_parse_params_flattens_nested_maps() {
        let yaml = r#"
schema_version: v0.5.0
output:
  variables:
    static: [grid_index, static_feature]
  chunking:
    time: 1
  splitting:
    dim: time
    enabled: true
"#;
        let params = parse_params(yaml).expect("parse");
        assert_eq!(params.get("schema_version").map(String::as_str), Some("v0.5.0"));
        assert_eq!(params.get("output.chunking.time").map(String::as_str), Some("1"));
        assert_eq!(params.get("output.splitting.enabled").map(String::as_str), Some("true"));
        assert_eq!(
            params.get("output.variables.static").map(String::as_str),
            Some(r#"["grid_index","static_feature"]"#)
        );
        assert_eq!(params.len(), 5);
    }

    #[test]
    fn test_parse_params_null_value() {
        let params = parse_params("load: null\n").expect("parse");
        assert_eq!(params.get("load").map(String::as_str), Some("None"));
    }

    #[test]
    fn test_parse_params_empty_document() {
        assert!(parse_params("").expect("parse").is_empty());
    }

    #[test]
    fn test_parse_params_rejects_scalar_root() {
        let err = parse_params("42").expect_err("should fail");
        assert!(err.to_string().contains("must be a mapping"));
    }

    #[test]
    fn test_parse_params_rejects_sequence_key() {
        let err = parse_params("? [a, b]\n: 1\n").expect_err("should fail");
        assert!(format!("{err:#}").contains("non-scalar key"));
    }

    #[test]
    fn test_load_params_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "epochs: 10\nlr: 0.001").expect("write");

        let params = load_params(file.path()).expect("load");
        assert_eq!(params.get("epochs").map(String::as_str), Some("10"));
        assert_eq!(params.get("lr").map(String::as_str), Some("0.001"));
    }

    #[test]
    fn test_load_params_missing_file() {
        let err = load_params(Path::new("/nonexistent/params.yaml")).expect_err("should fail");
        assert!(err.to_string().contains("reading config file"));
    }

    #[test]
    fn test_validate_defaults() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_uri() {
        let mut s = Settings::default();
        s.tracking.tracking_uri = "file:///tmp/mlruns".to_string();
        assert!(s.validate().is_err());

        s.dry_run = true;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut s = Settings::default();
        s.retry.max_attempts = 0;
        let err = s.validate().expect_err("should fail");
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut s = Settings::default();
        s.tracking.request_timeout = Duration::ZERO;
        let err = s.validate().expect_err("should fail");
        assert!(err.to_string().contains("request timeout"));

        s.dry_run = true;
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_validate_password_without_username() {
        let mut s = Settings::default();
        s.tracking.password = Some("secret".to_string());
        assert!(s.validate().is_err());
    }
}
