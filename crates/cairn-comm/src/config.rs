//! Tunables for the dispatch layer.

use serde::{Deserialize, Serialize};

/// Dispatch and flow-control settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommConfig {
    /// How often the bus scans for expired filters, in milliseconds.
    pub sweep_interval_ms: u64,

    /// Outbound throttle refill rate, bytes per second.
    pub throttle_rate: f64,

    /// Outbound throttle burst capacity, bytes.
    pub throttle_burst: f64,
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 1_000,
            throttle_rate: 64.0 * 1024.0,
            throttle_burst: 256.0 * 1024.0,
        }
    }
}

impl CommConfig {
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sweep_interval_ms)
    }
}
