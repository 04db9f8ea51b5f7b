//! Cloud endpoint addressing and the credential set issued at sign-up.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// URI scheme of every cloud endpoint address.
pub const ENDPOINT_SCHEME: &str = "coap+tcp://";

/// Longest access-token lifetime taken at face value: ten years.
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 10 * 365 * 24 * 60 * 60;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Endpoint
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Where cloud requests are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudEndpoint {
    /// Host name or IP literal the transport connects to.
    pub host: String,
    pub port: u16,
    /// Domain name of the cloud, when it differs from `host` (e.g. when
    /// `host` is a resolved IP).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl CloudEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(Error::Endpoint("host must not be empty".into()));
        }
        if port == 0 {
            return Err(Error::Endpoint("port must be in 1..=65535".into()));
        }
        Ok(Self {
            host,
            port,
            domain: None,
        })
    }

    /// Build an endpoint from provisioning fields.  The IP literal wins
    /// as the connect address when present; the host name is kept as the
    /// domain.
    pub fn from_provisioning(
        host_name: Option<&str>,
        ip: Option<&str>,
        port: Option<&str>,
    ) -> Result<Self> {
        let host_name = host_name.map(str::trim).filter(|h| !h.is_empty());
        let ip = ip.map(str::trim).filter(|h| !h.is_empty());
        let connect = ip
            .or(host_name)
            .ok_or_else(|| Error::Endpoint("neither host name nor IP provided".into()))?;

        let port = port
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::Endpoint("port not provided".into()))?;
        let port = parse_port(port)?;

        let mut endpoint = Self::new(connect, port)?;
        endpoint.domain = host_name.map(str::to_string);
        Ok(endpoint)
    }

    /// Parse `coap+tcp://host:port` (the scheme is optional).
    pub fn parse(address: &str) -> Result<Self> {
        let rest = address.trim();
        let rest = rest.strip_prefix(ENDPOINT_SCHEME).unwrap_or(rest);
        let rest = rest.trim_end_matches('/');
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Endpoint(format!("missing port in {address:?}")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        Self::new(host, parse_port(port)?)
    }

    /// Full address handed to the transport.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("{ENDPOINT_SCHEME}[{}]:{}", self.host, self.port)
        } else {
            format!("{ENDPOINT_SCHEME}{}:{}", self.host, self.port)
        }
    }

    /// Domain if known, else the connect host.
    pub fn domain(&self) -> &str {
        self.domain.as_deref().unwrap_or(&self.host)
    }

    /// Whether a transport-level `host:port` refers to this endpoint.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.port == port && (self.host == host || self.domain.as_deref() == Some(host))
    }
}

impl fmt::Display for CloudEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address())
    }
}

fn parse_port(raw: &str) -> Result<u16> {
    let port: u32 = raw
        .parse()
        .map_err(|_| Error::Endpoint(format!("invalid port {raw:?}")))?;
    if port == 0 || port > u16::MAX as u32 {
        return Err(Error::Endpoint(format!("port {port} out of range")));
    }
    Ok(port as u16)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credentials
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Credential set returned by a successful sign-up and updated by token
/// refresh.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudCredentials {
    pub endpoint: CloudEndpoint,
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Lifetime of `access_token` in seconds.  Non-positive means the
    /// cloud did not announce an expiry.
    pub expires_in: i64,
    pub issued_at: DateTime<Utc>,
    pub user_id: String,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
}

impl CloudCredentials {
    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// `None` when no expiry was announced or the instant is out of range.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expires_in <= 0 {
            return None;
        }
        Duration::try_seconds(self.expires_in).and_then(|d| self.issued_at.checked_add_signed(d))
    }

    /// True when the access token expires before `now + margin`.
    /// Credentials without an announced expiry never report true.
    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at()
            .is_some_and(|at| now.checked_add_signed(margin).map_or(true, |limit| at <= limit))
    }

    /// Cap an announced lifetime at [`MAX_TOKEN_LIFETIME_SECS`].
    pub fn bounded_lifetime(expires_in: i64) -> i64 {
        expires_in.min(MAX_TOKEN_LIFETIME_SECS)
    }

    /// Apply the token fields of a refresh response.
    pub fn apply_refresh(
        &mut self,
        access_token: String,
        refresh_token: String,
        token_type: String,
        expires_in: i64,
        now: DateTime<Utc>,
    ) {
        self.access_token = access_token;
        self.refresh_token = refresh_token;
        self.token_type = token_type;
        self.expires_in = expires_in;
        self.issued_at = now;
    }

    /// Switch requests to the redirect URI when it parses as an endpoint.
    pub fn follow_redirect(&mut self) {
        let Some(uri) = self.redirect_uri.as_deref() else {
            return;
        };
        match CloudEndpoint::parse(uri) {
            Ok(mut redirected) => {
                redirected.domain = Some(redirected.host.clone());
                self.endpoint = redirected;
            }
            Err(e) => {
                tracing::warn!(redirect_uri = %uri, error = %e, "ignoring unusable redirect uri");
            }
        }
    }
}

impl fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("endpoint", &self.endpoint)
            .field("access_token", &redact(&self.access_token))
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("issued_at", &self.issued_at)
            .field("user_id", &self.user_id)
            .field("server_id", &self.server_id)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() {
        "<empty>"
    } else {
        "<redacted>"
    }
}
