use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the BMP controller. All fields have defaults so a config
/// file only needs to name what it changes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BmpConfig {
    /// Controller tick interval, milliseconds.
    pub period_ms: u64,
    /// Worker retry sleep; also the per-worker shutdown join timeout.
    pub probe_interval_ms: u64,
    /// Hardware attempts per request before giving up.
    pub power_attempts: u32,
    /// FPGA health-check attempts inside one power-on.
    pub fpga_attempts: u32,
    /// Whether a detected FPGA reset state may trigger a bitfile reload.
    pub fpga_reload: bool,
    /// Transceiver construction attempts (pings between them).
    pub build_attempts: u32,
    /// Run against the no-hardware stub transceiver.
    pub use_dummy_bmp: bool,
    /// Identity used to file automatic board-issue reports.
    pub system_report_user: String,
}

impl Default for BmpConfig {
    fn default() -> Self {
        Self {
            period_ms: 10_000,
            probe_interval_ms: 15_000,
            power_attempts: 2,
            fpga_attempts: 3,
            fpga_reload: true,
            build_attempts: 5,
            use_dummy_bmp: false,
            system_report_user: "bmp-controller".to_string(),
        }
    }
}

impl BmpConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}
