//! Engine tuning knobs. Config file parsing stays outside the core;
//! embedders construct these directly.

use std::time::Duration;

use crate::batcher::BatcherConfig;
use crate::coordinator::CoordinatorConfig;
use crate::retry::RetryConfig;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Enforce one live process per `(template_id, business_key)`.
    pub unique_business_key: bool,
    /// Cadence of the leader's timeout/reminder sweeps.
    pub sweep_interval: Duration,
    pub coordinator: CoordinatorConfig,
    pub batcher: BatcherConfig,
    /// Retry policy for persistence writes and lock acquisition.
    pub persistence_retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            unique_business_key: true,
            sweep_interval: Duration::from_secs(5),
            coordinator: CoordinatorConfig::default(),
            batcher: BatcherConfig::default(),
            persistence_retry: RetryConfig::default(),
        }
    }
}
