//! Types shared by every CloudLink crate: configuration,
//! cloud credentials, the common error type, and structured trace events.

pub mod config;
pub mod credentials;
pub mod error;
pub mod trace;

pub use credentials::{CloudCredentials, CloudEndpoint, MAX_TOKEN_LIFETIME_SECS};
pub use error::{Error, Result};
