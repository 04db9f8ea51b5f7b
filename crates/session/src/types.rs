//! Session states, observer-facing status, and errors.

use std::fmt;

use cl_protocol::CloudErrorCode;
use serde::Serialize;

/// Stage a busy session is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SignUp,
    SignIn,
    PublishPrimary,
    PublishSecondary,
    PublishProfile,
    Refresh,
}

/// Lifecycle state of the session slot.  At most one attempt is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The network is down.
    Disconnected,
    /// Idle and able to start an attempt.
    Stopped,
    Busy(Stage),
    /// An explicit stop is tearing the session down.
    StopTrigger,
    /// Waiting for the best-effort sign-out to finish.
    SignedOut,
}

impl SessionState {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy(stage) => write!(f, "busy({stage:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Provisioning progress reported to the [`Observer`](crate::Observer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudStatus {
    SigningUp,
    SignedUp,
    SigningIn,
    SignedIn,
    Publishing,
    Published,
    RefreshingToken,
    FailedToRegister,
    FailedToPublish,
    SignedOut,
}

/// Why an attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The cloud never answered within the retry budget.
    NoResponse,
    NoInternetConnection,
    SystemError(String),
    InvalidAccessToken,
    InvalidSavedCredentials,
    Cloud(CloudErrorCode),
    Unknown,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoResponse => f.write_str("no response from cloud server"),
            Self::NoInternetConnection => f.write_str("no internet connection"),
            Self::SystemError(msg) => write!(f, "system error: {msg}"),
            Self::InvalidAccessToken => f.write_str("invalid access token"),
            Self::InvalidSavedCredentials => f.write_str("invalid saved credentials"),
            Self::Cloud(code) => write!(f, "cloud error {code}"),
            Self::Unknown => f.write_str("unknown error"),
        }
    }
}

/// Result of one attempt, handed to [`SessionHandle::await_outcome`](crate::SessionHandle::await_outcome).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOutcome {
    pub success: bool,
    pub domain: Option<String>,
    pub access_token: Option<String>,
}

/// Top-level session error.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("config: {0}")]
    Config(String),
    #[error("session event channel closed")]
    ChannelClosed,
    #[error("shutdown")]
    Shutdown,
    #[error(transparent)]
    Domain(#[from] cl_domain::Error),
}
