pub mod dataset;
pub mod system;

use std::time::Duration;

use anyhow::Result;

pub use self::dataset::DatasetSampler;
pub use self::system::SystemSampler;

/// One named numeric reading produced by a sampler tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub name: &'static str,
    pub value: f64,
}

impl Reading {
    pub const fn new(name: &'static str, value: f64) -> Self {
        Self { name, value }
    }
}

/// Produces a set of named numeric readings per tick.
pub trait Sampler: Send {
    /// Short name for logging.
    fn name(&self) -> &'static str;

    /// Fixed pause between the end of one tick and the start of the next.
    fn interval(&self) -> Duration;

    /// Take one set of readings. May block for the sampler's averaging window.
    fn sample(&mut self) -> impl std::future::Future<Output = Result<Vec<Reading>>> + Send;
}

/// The sampling strategy chosen at startup.
///
/// Enum dispatch keeps the lifecycle controller free of boxed futures.
pub enum Strategy {
    System(SystemSampler),
    Dataset(DatasetSampler),
}

impl Strategy {
    /// Whether the strategy reports host resource metrics.
    pub fn reports_system_metrics(&self) -> bool {
        matches!(self, Self::System(_))
    }
}

impl Sampler for Strategy {
    fn name(&self) -> &'static str {
        match self {
            Self::System(s) => s.name(),
            Self::Dataset(s) => s.name(),
        }
    }

    fn interval(&self) -> Duration {
        match self {
            Self::System(s) => s.interval(),
            Self::Dataset(s) => s.interval(),
        }
    }

    async fn sample(&mut self) -> Result<Vec<Reading>> {
        match self {
            Self::System(s) => s.sample().await,
            Self::Dataset(s) => s.sample().await,
        }
    }
}
