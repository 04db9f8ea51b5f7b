//! Stop, reset, network changes and the token upkeep that runs while the
//! session sits signed in.

use chrono::Utc;
use cl_protocol::CloudResponse;
use tokio::sync::oneshot;

use super::{Attempt, Job, SessionStateMachine};
use crate::types::{CloudStatus, SessionState};

impl SessionStateMachine {
    // ── Stop & reset ─────────────────────────────────────────────────

    pub(super) fn on_stop(&mut self, done: oneshot::Sender<()>) {
        self.ctx.stop_waiters.push(done);
        self.begin_stop();
    }

    /// Drop the running attempt and sign out when signed in.  Stop waiters
    /// are released once the session is idle.
    fn begin_stop(&mut self) {
        if self.stopping() {
            return;
        }

        tracing::info!(state = %self.ctx.state, "stop requested");
        self.reset_inflight();
        self.resolve_outcome(false);
        let was_signed_in = self.ctx.signed_in;
        self.ctx.signed_in = false;
        self.ctx.published = false;
        self.ctx.attempt = Attempt::default();
        self.set_state(SessionState::StopTrigger);

        if was_signed_in && self.credentials.current().is_some() {
            self.set_state(SessionState::SignedOut);
            let record = self.initial_record(&Job::SignOut);
            self.submit(Job::SignOut, record);
        } else {
            self.finish_stop();
        }
    }

    fn stopping(&self) -> bool {
        matches!(
            self.ctx.state,
            SessionState::StopTrigger | SessionState::SignedOut
        )
    }

    pub(super) fn on_sign_out_response(&mut self, response: CloudResponse) {
        if response.is_success() {
            tracing::info!("signed out");
        } else {
            tracing::warn!(status = response.status.code(), "sign-out not acknowledged");
        }
        self.finish_stop();
    }

    pub(super) fn finish_stop(&mut self) {
        self.reset_inflight();
        if self.ctx.state == SessionState::SignedOut {
            self.notify(CloudStatus::SignedOut, None);
        }
        self.credentials.clear();
        let idle = self.idle_state();
        self.set_state(idle);
        self.release_stop_waiters();
    }

    fn release_stop_waiters(&mut self) {
        for waiter in self.ctx.stop_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    /// Stop, then forget stored credentials and any cached provisioning
    /// request.  `done` fires only after storage has been cleared.
    pub(super) async fn on_reset(&mut self, done: oneshot::Sender<()>) {
        tracing::info!("reset requested");
        self.credentials.clear_pending();
        // The sign-out request is built from the in-memory set, so storage
        // can go once stopping has begun.
        self.begin_stop();
        if let Err(e) = self.credentials.clear_persisted().await {
            tracing::warn!(error = %e, "failed to clear saved credentials");
        }
        self.ctx.stop_waiters.push(done);
        if !self.stopping() {
            self.release_stop_waiters();
        }
    }

    // ── Connectivity ─────────────────────────────────────────────────

    pub(super) async fn on_network_changed(&mut self, attached: bool) {
        if attached {
            if self.ctx.state != SessionState::Disconnected {
                tracing::debug!(state = %self.ctx.state, "network attach ignored");
                return;
            }
            tracing::info!("network attached");
            self.set_state(SessionState::Stopped);
            if !self.credentials.has_pending() && self.config.session.auto_resume {
                self.auto_resume().await;
            }
            return;
        }

        if self.ctx.state == SessionState::Disconnected {
            return;
        }
        tracing::warn!(state = %self.ctx.state, "network lost");

        // An interrupted sign-up starts over once the network returns.
        let signed_in = self.ctx.signed_in;
        if self.ctx.state.is_busy() && !signed_in && !self.credentials.has_pending() {
            if let Some(data) = self
                .ctx
                .attempt
                .provisioning
                .take()
                .filter(|d| d.grant().is_some())
            {
                self.credentials.cache_pending(data);
            }
        }

        self.reset_inflight();
        self.ctx.signed_in = false;
        self.ctx.published = false;
        self.ctx.attempt = Attempt::default();
        self.resolve_outcome(false);
        self.set_state(SessionState::Disconnected);
    }

    async fn auto_resume(&mut self) {
        let creds = match self.credentials.load().await {
            Ok(creds) => creds,
            Err(e) => {
                tracing::warn!(error = %e, "saved credentials unreadable");
                None
            }
        };
        let Some(creds) = creds.filter(|c| c.has_access_token()) else {
            tracing::debug!("no saved credentials to resume with");
            return;
        };
        tracing::info!(user_id = %creds.user_id, "resuming with saved credentials");
        self.ctx.attempt = Attempt::default();
        self.ctx.endpoint = Some(creds.endpoint);
        self.begin_sign_in();
    }

    /// The transport dropped its connection to `host:port`.
    pub(super) fn on_connection_lost(&mut self, host: &str, port: u16) {
        let ours = self
            .ctx
            .endpoint
            .as_ref()
            .is_some_and(|e| e.matches(host, port));
        if !ours || !self.ctx.signed_in {
            tracing::debug!(host, port, "ignoring connection loss");
            return;
        }

        tracing::warn!(host, port, "cloud connection lost, signing in again");
        self.reset_inflight();
        self.ctx.signed_in = false;
        self.ctx.published = false;
        self.ctx.attempt = Attempt::default();
        self.begin_sign_in();
    }

    // ── Token upkeep ─────────────────────────────────────────────────

    pub(super) fn on_refresh_tick(&mut self) {
        if !self.ctx.state.is_stopped() || !self.ctx.signed_in || !self.ctx.published {
            return;
        }
        let Some(creds) = self.credentials.current() else {
            return;
        };

        if creds.expires_within(self.config.refresh.expiry_margin(), Utc::now()) {
            tracing::info!(expires_at = ?creds.expires_at(), "access token near expiry");
            self.ctx.attempt = Attempt::default();
            self.begin_refresh(Vec::new());
            return;
        }

        let Some(every) = self.config.refresh.keepalive_interval() else {
            return;
        };
        let now = tokio::time::Instant::now();
        if now.duration_since(self.ctx.last_keepalive) < every {
            return;
        }
        self.ctx.last_keepalive = now;
        let record = self.initial_record(&Job::Discover);
        self.submit(Job::Discover, record);
    }

    pub(super) fn on_discover_response(&mut self, response: CloudResponse) {
        if response.is_success() {
            tracing::debug!("keep-alive answered");
            return;
        }
        tracing::warn!(code = %response.error_code(), "keep-alive rejected");
        if self.ctx.state.is_stopped() && self.ctx.signed_in {
            self.ctx.attempt = Attempt::default();
            self.begin_refresh(Vec::new());
        }
    }

    /// Keep-alive went unanswered up to its ceiling.
    pub(super) fn on_keepalive_lost(&mut self) {
        if !self.ctx.state.is_stopped() || !self.ctx.signed_in {
            return;
        }
        tracing::warn!("keep-alive unanswered, signing in again");
        self.reset_inflight();
        self.ctx.signed_in = false;
        self.ctx.published = false;
        self.ctx.attempt = Attempt::default();
        self.begin_sign_in();
    }
}
