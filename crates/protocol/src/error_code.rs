//! Numeric cloud error codes and their classification.
//!
//! A code combines the response status and the cloud's sub-code carried
//! in the response payload: `status * ERR_UPPER_UNIT + sub_code`.  For
//! example `4010002` is status 401 with sub-code 2 (token expired).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Multiplier separating the status from the cloud sub-code.
pub const ERR_UPPER_UNIT: u32 = 10_000;

// ── Sub-codes ───────────────────────────────────────────────────────

pub const INVALID_PARAM: u32 = 1;
pub const DUPLICATE_RESOURCE: u32 = 2;

pub const TOKEN_VALIDATION_FAILED: u32 = 1;
pub const TOKEN_EXPIRED: u32 = 2;
pub const ACCOUNT_UNAUTHORIZED_TOKEN: u32 = 3;
pub const ACCOUNT_AUTHORIZATION_FAILED: u32 = 4;

pub const USER_NOT_FOUND: u32 = 1;
pub const DEVICE_NOT_FOUND: u32 = 2;

/// Raw cloud error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CloudErrorCode(pub u32);

/// What a cloud error means for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloudErrorKind {
    /// Access token expired; refresh and retry.
    AuthExpired,
    /// Access token failed validation; refresh and retry.
    AuthInvalid,
    /// Account refused the token outright; sign in again.
    AuthRejected,
    Forbidden,
    UserNotFound,
    DeviceNotFound,
    InternalServerError,
    /// Request rejected as malformed; regenerate it.
    MalformedRequest,
    DuplicateResource,
    /// Duplicate request within the server's dedup window; resend.
    NotAcceptable,
    Unknown,
}

impl CloudErrorCode {
    pub fn new(status: u16, sub_code: u32) -> Self {
        Self(status as u32 * ERR_UPPER_UNIT + sub_code % ERR_UPPER_UNIT)
    }

    pub fn status(self) -> u16 {
        (self.0 / ERR_UPPER_UNIT) as u16
    }

    pub fn sub_code(self) -> u32 {
        self.0 % ERR_UPPER_UNIT
    }

    pub fn kind(self) -> CloudErrorKind {
        use CloudErrorKind::*;
        match (self.status(), self.sub_code()) {
            (400, INVALID_PARAM) => MalformedRequest,
            (400, DUPLICATE_RESOURCE) | (409, _) => DuplicateResource,
            (401, TOKEN_EXPIRED) => AuthExpired,
            (401, ACCOUNT_UNAUTHORIZED_TOKEN | ACCOUNT_AUTHORIZATION_FAILED) => AuthRejected,
            (401, _) => AuthInvalid,
            (403, _) => Forbidden,
            (404, USER_NOT_FOUND) => UserNotFound,
            (404, DEVICE_NOT_FOUND) => DeviceNotFound,
            (406, _) => NotAcceptable,
            (500, _) => InternalServerError,
            _ => Unknown,
        }
    }
}

impl fmt::Display for CloudErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:?})", self.0, self.kind())
    }
}
