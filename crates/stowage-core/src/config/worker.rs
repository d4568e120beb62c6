//! Background worker configuration.

use serde::{Deserialize, Serialize};

/// Transfer worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Whether the worker is enabled.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval in seconds between worker invocations.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    /// Interval in seconds between stale multipart sweeps.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_seconds: default_poll_interval(),
            sweep_interval_seconds: default_sweep_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    30
}

fn default_sweep_interval() -> u64 {
    6 * 60 * 60
}
