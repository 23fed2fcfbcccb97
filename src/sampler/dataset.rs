use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::debug;

use super::{Reading, Sampler};
use crate::dirsize;

/// Pause between dataset size readings. A full walk of a large output
/// store is expensive, so this is slower than the host sampler.
pub const DATASET_SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

/// Metric name for the total size of the output directory.
pub const DATASET_SIZE: &str = "dataset_size_bytes";

/// Reports the growing size of a job's output directory.
#[derive(Debug, Clone)]
pub struct DatasetSampler {
    output_path: PathBuf,
}

impl DatasetSampler {
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
        }
    }

    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

impl Sampler for DatasetSampler {
    fn name(&self) -> &'static str {
        "dataset"
    }

    fn interval(&self) -> Duration {
        DATASET_SAMPLE_INTERVAL
    }

    async fn sample(&mut self) -> Result<Vec<Reading>> {
        let path = self.output_path.clone();
        let bytes = tokio::task::spawn_blocking(move || dirsize::dir_size(&path))
            .await
            .context("directory scan task failed")?
            .with_context(|| format!("scanning {}", self.output_path.display()))?;

        debug!(path = %self.output_path.display(), bytes, "scanned output directory");

        Ok(vec![Reading::new(DATASET_SIZE, bytes as f64)])
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[tokio::test]
    async fn test_sample_reports_growth() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let out = tmp.path().join("example.zarr");
        let mut sampler = DatasetSampler::new(&out);

        let first = sampler.sample().await.expect("sample");
        assert_eq!(first, vec![Reading::new(DATASET_SIZE, 0.0)]);

        fs::create_dir_all(out.join("state/0")).expect("mkdir");
        fs::write(out.join(".zattrs"), vec![0u8; 100]).expect("write");
        fs::write(out.join("state/0/0.0"), vec![0u8; 900]).expect("write");

        let second = sampler.sample().await.expect("sample");
        assert_eq!(second, vec![Reading::new(DATASET_SIZE, 1000.0)]);
    }
}
