//! Interfaces to the systems the session depends on but does not own.

use std::time::Duration;

use async_trait::async_trait;
use cl_domain::CloudCredentials;
use cl_protocol::{
    CloudRequest, CloudResponse, DeviceResources, PublishScope, RequestToken, TransportError,
};
use tokio::sync::mpsc;

use crate::machine::SessionEvent;
use crate::types::{CloudStatus, FailureReason};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A request handed to the [`Transport`].
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub token: RequestToken,
    /// Full endpoint address, e.g. `coap+tcp://10.0.0.7:5683`.
    pub endpoint: String,
    pub request: CloudRequest,
    /// How long the session will wait before it gives up on this attempt.
    pub timeout_hint: Duration,
}

/// Delivers the response of one submitted request back to the session.
///
/// `respond` consumes the responder, so a request is answered at most
/// once.  Dropping it without answering leaves recovery to the timeout.
#[derive(Debug)]
pub struct Responder {
    token: RequestToken,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Responder {
    pub(crate) fn new(token: RequestToken, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { token, events }
    }

    pub fn token(&self) -> RequestToken {
        self.token
    }

    pub fn respond(self, response: CloudResponse) {
        let event = SessionEvent::ResponseArrived {
            token: self.token,
            response,
        };
        if self.events.send(event).is_err() {
            tracing::debug!(token = %self.token, "session gone, response dropped");
        }
    }
}

/// Sends requests to the cloud.  Implementations must not block; the
/// response is delivered later through the [`Responder`], from any thread.
pub trait Transport: Send + Sync {
    fn submit(&self, request: OutboundRequest, responder: Responder) -> Result<(), TransportError>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Storage, resources, network, observer
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Durable storage for the credential set.
#[async_trait]
pub trait CredentialPersistence: Send + Sync {
    async fn load(&self) -> cl_domain::Result<Option<CloudCredentials>>;

    async fn save(&self, credentials: &CloudCredentials) -> cl_domain::Result<()>;

    /// Forget stored credentials.
    async fn clear(&self) -> cl_domain::Result<()> {
        Ok(())
    }
}

/// Source of the resources to publish.
pub trait ResourceProvider: Send + Sync {
    /// `Primary` and `DeviceProfile` yield the local device's entries;
    /// `Secondary` yields one entry per sub-device.
    fn list_resources(&self, scope: PublishScope) -> Vec<DeviceResources>;
}

/// Link-layer connectivity as seen by the host.
pub trait NetworkStatus: Send + Sync {
    fn is_attached(&self) -> bool;
}

/// Receives provisioning progress.
pub trait Observer: Send + Sync {
    fn on_state_changed(&self, status: CloudStatus, error: Option<&FailureReason>);
}

/// Network status for hosts without a connection manager.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysAttached;

impl NetworkStatus for AlwaysAttached {
    fn is_attached(&self) -> bool {
        true
    }
}

/// Observer that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl Observer for LogObserver {
    fn on_state_changed(&self, status: CloudStatus, error: Option<&FailureReason>) {
        match error {
            Some(reason) => tracing::warn!(status = ?status, reason = %reason, "cloud status"),
            None => tracing::info!(status = ?status, "cloud status"),
        }
    }
}
