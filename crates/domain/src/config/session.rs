use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longest timeout tick: one hour.
pub const MAX_TICK_MS: u64 = 3_600_000;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session identity & scheduling
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Stable device identifier sent with every cloud request.
    #[serde(default = "d_device_id")]
    pub device_id: String,

    /// Length of one timeout tick in milliseconds.  All `*_ticks`
    /// values in `[timeouts]` are counted in this unit.
    #[serde(default = "d_tick_ms")]
    pub tick_ms: u64,

    /// Maximum number of outstanding request tokens.
    #[serde(default = "d_correlator_capacity")]
    pub correlator_capacity: usize,

    /// Sign in with persisted credentials as soon as the network attaches,
    /// when no provisioning event is waiting.
    #[serde(default = "d_true")]
    pub auto_resume: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_id: d_device_id(),
            tick_ms: d_tick_ms(),
            correlator_capacity: d_correlator_capacity(),
            auto_resume: true,
        }
    }
}

impl SessionConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_device_id() -> String {
    "cloudlink-device".into()
}
fn d_tick_ms() -> u64 {
    1_000
}
fn d_correlator_capacity() -> usize {
    25
}
fn d_true() -> bool {
    true
}
