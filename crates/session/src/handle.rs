//! Cloneable front door to a running session.

use std::future::Future;

use cl_protocol::ProvisioningData;
use tokio::sync::{mpsc, oneshot, watch};

use crate::machine::SessionEvent;
use crate::types::{SessionError, SessionOutcome, SessionState};

/// Sends input to the session task and observes its state.
///
/// All methods are cheap and non-blocking except the `async` ones, which
/// wait for the machine to acknowledge.
#[derive(Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub(crate) fn new(
        events: mpsc::UnboundedSender<SessionEvent>,
        state: watch::Receiver<SessionState>,
    ) -> Self {
        Self { events, state }
    }

    fn send(&self, event: SessionEvent) -> Result<(), SessionError> {
        self.events
            .send(event)
            .map_err(|_| SessionError::ChannelClosed)
    }

    /// Hand over provisioning input.  It starts right away when the session
    /// is idle; otherwise it is cached and replaces any earlier cached input.
    pub fn provision(&self, data: ProvisioningData) -> Result<(), SessionError> {
        self.send(SessionEvent::Provision(data))
    }

    pub fn network_changed(&self, attached: bool) -> Result<(), SessionError> {
        self.send(SessionEvent::NetworkChanged { attached })
    }

    /// Report that the transport lost its connection to `host:port`.
    pub fn connection_lost(&self, host: impl Into<String>, port: u16) -> Result<(), SessionError> {
        self.send(SessionEvent::ConnectionLost {
            host: host.into(),
            port,
        })
    }

    /// Stop the session, signing out first when signed in.  Resolves once
    /// the session is idle.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(SessionEvent::Stop { done })?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Stop and forget stored credentials and cached input.
    pub async fn reset(&self) -> Result<(), SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(SessionEvent::Reset { done })?;
        rx.await.map_err(|_| SessionError::Shutdown)
    }

    /// Wait for the current or next attempt to publish or fail.
    ///
    /// The waiter is registered when this is called, not when the returned
    /// future is first polled.
    pub fn await_outcome(
        &self,
    ) -> impl Future<Output = Result<SessionOutcome, SessionError>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let sent = self.send(SessionEvent::AwaitOutcome(tx));
        async move {
            sent?;
            rx.await.map_err(|_| SessionError::Shutdown)
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until the state satisfies `pred`.
    pub async fn wait_for_state<F>(&self, mut pred: F) -> Result<SessionState, SessionError>
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.state.clone();
        loop {
            let state = *rx.borrow_and_update();
            if pred(&state) {
                return Ok(state);
            }
            rx.changed().await.map_err(|_| SessionError::Shutdown)?;
        }
    }
}
