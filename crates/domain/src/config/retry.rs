use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Initial request timeouts (in ticks)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Largest initial timeout for any request kind.
pub const MAX_TIMEOUT_TICKS: u32 = 86_400;

/// Largest delay ceiling multiplier.
pub const MAX_CEILING: u32 = 100;

/// Initial deadline armed for each request kind, counted in
/// `session.tick_ms` units.  Retries grow from this value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "d_60")]
    pub sign_up_ticks: u32,
    #[serde(default = "d_60")]
    pub sign_in_ticks: u32,
    #[serde(default = "d_60")]
    pub publish_ticks: u32,
    #[serde(default = "d_60")]
    pub refresh_ticks: u32,
    #[serde(default = "d_10")]
    pub sign_out_ticks: u32,
    #[serde(default = "d_30")]
    pub discover_ticks: u32,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            sign_up_ticks: 60,
            sign_in_ticks: 60,
            publish_ticks: 60,
            refresh_ticks: 60,
            sign_out_ticks: 10,
            discover_ticks: 30,
        }
    }
}

impl TimeoutConfig {
    /// Field name / value pairs, used by validation.
    pub fn named(&self) -> [(&'static str, u32); 6] {
        [
            ("sign_up_ticks", self.sign_up_ticks),
            ("sign_in_ticks", self.sign_in_ticks),
            ("publish_ticks", self.publish_ticks),
            ("refresh_ticks", self.refresh_ticks),
            ("sign_out_ticks", self.sign_out_ticks),
            ("discover_ticks", self.discover_ticks),
        ]
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Retry limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Sign-up resends after a timeout.  Sign-up is bounded by count
    /// rather than by a delay ceiling.
    #[serde(default = "d_1")]
    pub sign_up_max_retries: u32,

    /// Delay ceiling for sign-in, as a multiple of the initial timeout.
    #[serde(default = "d_10")]
    pub sign_in_ceiling: u32,

    /// Delay ceiling for every publication request.
    #[serde(default = "d_5")]
    pub publish_ceiling: u32,

    /// Delay ceiling for token refresh.
    #[serde(default = "d_5")]
    pub refresh_ceiling: u32,

    /// Delay ceiling for keep-alive discovery.
    #[serde(default = "d_5")]
    pub discover_ceiling: u32,

    /// Immediate resends after a transport-level failure, without backoff.
    #[serde(default = "d_10")]
    pub transport_retry_limit: u32,

    /// Regenerate-and-resend attempts after a malformed-request rejection.
    #[serde(default = "d_10")]
    pub malformed_retry_limit: u32,

    /// Sign-in restarts after the cloud rejects the account.
    #[serde(default = "d_3")]
    pub auth_restart_limit: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            sign_up_max_retries: 1,
            sign_in_ceiling: 10,
            publish_ceiling: 5,
            refresh_ceiling: 5,
            discover_ceiling: 5,
            transport_retry_limit: 10,
            malformed_retry_limit: 10,
            auth_restart_limit: 3,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backoff jitter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tuning for the jittered delay growth: a sample `x` drawn from
/// `[0, jitter_span]` yields `original * (1 + x^4 / jitter_divisor)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "d_span")]
    pub jitter_span: f64,
    #[serde(default = "d_divisor")]
    pub jitter_divisor: f64,
    /// Draws attempted before falling back to `current + 1`.
    #[serde(default = "d_max_draws")]
    pub max_draws: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            jitter_span: d_span(),
            jitter_divisor: d_divisor(),
            max_draws: d_max_draws(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_1() -> u32 {
    1
}
fn d_3() -> u32 {
    3
}
fn d_5() -> u32 {
    5
}
fn d_10() -> u32 {
    10
}
fn d_30() -> u32 {
    30
}
fn d_60() -> u32 {
    60
}
fn d_span() -> f64 {
    4.0
}
fn d_divisor() -> f64 {
    16.0
}
fn d_max_draws() -> u32 {
    64
}
