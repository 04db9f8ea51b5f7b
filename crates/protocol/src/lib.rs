//! Cloud protocol model: the requests a device issues, the responses it
//! receives, and the provisioning input that starts a session.
//!
//! Nothing here knows about the wire encoding.  A transport serializes
//! [`CloudRequest`] however its cloud expects and hands back a
//! [`CloudResponse`] carrying the status and the decoded payload.

pub mod error_code;

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error_code::{CloudErrorCode, CloudErrorKind, ERR_UPPER_UNIT};

/// Payload keys used by sign-up, refresh and error responses.
pub mod keys {
    pub const ACCESS_TOKEN: &str = "accesstoken";
    pub const REFRESH_TOKEN: &str = "refreshtoken";
    pub const TOKEN_TYPE: &str = "tokentype";
    pub const EXPIRES_IN: &str = "expiresin";
    pub const USER_ID: &str = "uid";
    pub const REDIRECT_URI: &str = "redirecturi";
    pub const CERTIFICATE: &str = "certificate";
    pub const SERVER_ID: &str = "sid";
    pub const ERROR_CODE: &str = "code";
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request tokens
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Opaque identifier of one in-flight request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestToken(Uuid);

impl RequestToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Provisioning
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Cloud provisioning input delivered by the onboarding layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningData {
    #[serde(default)]
    pub auth_code: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub uid: Option<String>,
    #[serde(default)]
    pub auth_provider: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub host_name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<String>,
}

/// What the device presents to sign up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthGrant {
    AuthCode {
        code: String,
    },
    AccessToken {
        access_token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh_token: Option<String>,
    },
}

impl ProvisioningData {
    /// The sign-up grant, if the event carries one.  An auth code takes
    /// precedence over a directly supplied access token.
    pub fn grant(&self) -> Option<AuthGrant> {
        if let Some(code) = non_empty(&self.auth_code) {
            return Some(AuthGrant::AuthCode { code: code.into() });
        }
        non_empty(&self.access_token).map(|token| AuthGrant::AccessToken {
            access_token: token.into(),
            refresh_token: non_empty(&self.refresh_token).map(str::to_string),
        })
    }

    pub fn has_endpoint(&self) -> bool {
        (non_empty(&self.host_name).is_some() || non_empty(&self.ip).is_some())
            && non_empty(&self.port).is_some()
    }
}

fn non_empty(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resources
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Which set of resources a publication covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishScope {
    /// The device's own resources.
    Primary,
    /// Resources of attached sub-devices, one publication per sub-device.
    Secondary,
    DeviceProfile,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub uri: String,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

/// Resources belonging to one device.  `device_id` is `None` for the
/// local device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceResources {
    #[serde(default)]
    pub device_id: Option<String>,
    pub resources: Vec<Resource>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Requests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request the session asks the transport to deliver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CloudRequest {
    SignUp {
        device_id: String,
        grant: AuthGrant,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        auth_provider: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },
    SignIn {
        device_id: String,
        user_id: String,
        access_token: String,
    },
    SignOut {
        device_id: String,
        user_id: String,
        access_token: String,
    },
    RefreshToken {
        device_id: String,
        user_id: String,
        refresh_token: String,
    },
    Publish {
        scope: PublishScope,
        device_id: String,
        resources: Vec<Resource>,
    },
    /// Look up the device's own resources; doubles as a keep-alive.
    Discover {
        device_id: String,
    },
}

impl CloudRequest {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SignUp { .. } => "sign_up",
            Self::SignIn { .. } => "sign_in",
            Self::SignOut { .. } => "sign_out",
            Self::RefreshToken { .. } => "refresh_token",
            Self::Publish { .. } => "publish",
            Self::Discover { .. } => "discover",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Response status, numbered like CoAP codes (`4.01` → `401`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Created,
    Deleted,
    Changed,
    Content,
    BadRequest,
    Unauthorized,
    BadOption,
    Forbidden,
    NotFound,
    NotAcceptable,
    Conflict,
    InternalServerError,
    /// The transport gave up delivering the request.
    CommError,
    Other(u16),
}

impl ResponseStatus {
    pub fn code(self) -> u16 {
        match self {
            Self::Created => 201,
            Self::Deleted => 202,
            Self::Changed => 204,
            Self::Content => 205,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::BadOption => 402,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::NotAcceptable => 406,
            Self::Conflict => 409,
            Self::InternalServerError => 500,
            Self::CommError => 504,
            Self::Other(c) => c,
        }
    }

    pub fn from_code(code: u16) -> Self {
        match code {
            201 => Self::Created,
            202 => Self::Deleted,
            204 => Self::Changed,
            205 => Self::Content,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            402 => Self::BadOption,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            406 => Self::NotAcceptable,
            409 => Self::Conflict,
            500 => Self::InternalServerError,
            504 => Self::CommError,
            c => Self::Other(c),
        }
    }

    pub fn is_success(self) -> bool {
        (200..300).contains(&self.code())
    }
}

/// A response delivered by the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudResponse {
    pub status: ResponseStatus,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl CloudResponse {
    pub fn new(status: ResponseStatus) -> Self {
        Self {
            status,
            payload: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.payload.insert(key.to_string(), value.into());
        self
    }

    /// An error response carrying a cloud sub-code.
    pub fn error(status: ResponseStatus, sub_code: u32) -> Self {
        Self::new(status).with(keys::ERROR_CODE, sub_code)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }

    pub fn int_field(&self, key: &str) -> Option<i64> {
        let v = self.payload.get(key)?;
        v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    }

    /// Combined error code.  The sub-code is zero when the payload has
    /// none, which classifies by status alone.
    pub fn error_code(&self) -> CloudErrorCode {
        let sub = self
            .int_field(keys::ERROR_CODE)
            .and_then(|c| u32::try_from(c).ok())
            .unwrap_or(0);
        CloudErrorCode::new(self.status.code(), sub)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Failure to hand a request to the transport.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("send failed: {0}")]
    SendFailed(String),
    #[error("transport closed")]
    Closed,
}
