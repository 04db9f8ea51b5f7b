use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::credentials::MAX_TOKEN_LIFETIME_SECS;

/// Longest supervisor wake-up period: one day.
pub const MAX_CHECK_INTERVAL_SECS: u64 = 86_400;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Out-of-band token refresh & keep-alive
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshConfig {
    /// How often the refresh supervisor wakes the session.
    #[serde(default = "d_check_interval")]
    pub check_interval_secs: u64,

    /// Refresh the access token once it expires within this window.
    #[serde(default = "d_expiry_margin")]
    pub expiry_margin_secs: u64,

    /// Issue a discovery ping this often while published.  `0` disables it.
    #[serde(default = "d_keepalive")]
    pub keepalive_interval_secs: u64,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: d_check_interval(),
            expiry_margin_secs: d_expiry_margin(),
            keepalive_interval_secs: d_keepalive(),
        }
    }
}

impl RefreshConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Capped at the longest token lifetime, which chrono can always hold.
    pub fn expiry_margin(&self) -> chrono::Duration {
        let secs = i64::try_from(self.expiry_margin_secs)
            .unwrap_or(i64::MAX)
            .min(MAX_TOKEN_LIFETIME_SECS);
        chrono::Duration::seconds(secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_check_interval() -> u64 {
    60
}
fn d_expiry_margin() -> u64 {
    300
}
fn d_keepalive() -> u64 {
    600
}
