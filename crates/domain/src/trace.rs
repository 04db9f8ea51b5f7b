use serde::Serialize;

/// Structured trace events emitted across all CloudLink crates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum TraceEvent {
    SessionStateChanged {
        from: String,
        to: String,
    },
    CloudStatusChanged {
        status: String,
        error: Option<String>,
    },
    RequestIssued {
        token: String,
        operation: String,
        timeout_ticks: u32,
    },
    ResponseClaimed {
        token: String,
        operation: String,
        status: u16,
    },
    ResponseDiscarded {
        token: String,
        reason: String,
    },
    TimeoutFired {
        token: String,
        operation: String,
        current_ticks: u32,
    },
    RetryScheduled {
        operation: String,
        reason: String,
        next_ticks: u32,
    },
    ProvisioningCached {
        replaced_previous: bool,
    },
    CredentialsStored {
        user_id: String,
        domain: String,
    },
    TokenRefreshed {
        user_id: String,
        expires_in: i64,
    },
}

impl TraceEvent {
    pub fn emit(&self) {
        let json = serde_json::to_string(self).unwrap_or_default();
        tracing::info!(trace_event = %json, "cl_event");
    }
}
