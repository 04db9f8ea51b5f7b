//! The session state machine.
//!
//! One task owns all session state and consumes [`SessionEvent`]s one at a
//! time.  Transport responses, timeout expiries, provisioning input and
//! network changes all arrive on the same channel, so no two transitions
//! ever run concurrently.

mod auth;
mod lifecycle;
mod publish;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cl_domain::config::Config;
use cl_domain::trace::TraceEvent;
use cl_protocol::{
    CloudRequest, CloudResponse, DeviceResources, ProvisioningData, PublishScope, RequestToken,
    ResponseStatus,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::backoff::{clamp_to_ceiling, BackoffCalculator};
use crate::collaborators::{
    NetworkStatus, Observer, OutboundRequest, ResourceProvider, Responder, Transport,
};
use crate::correlator::{Operation, PublishTarget, RequestCorrelator};
use crate::credentials::CredentialStore;
use crate::timeout::{TimeoutRecord, TimeoutSupervisor};
use crate::types::{CloudStatus, FailureReason, SessionError, SessionOutcome, SessionState};

/// Everything the machine reacts to.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    Provision(ProvisioningData),
    NetworkChanged {
        attached: bool,
    },
    ConnectionLost {
        host: String,
        port: u16,
    },
    ResponseArrived {
        token: RequestToken,
        response: CloudResponse,
    },
    TimeoutFired {
        token: RequestToken,
        record: TimeoutRecord,
    },
    RefreshTick,
    Stop {
        done: oneshot::Sender<()>,
    },
    Reset {
        done: oneshot::Sender<()>,
    },
    AwaitOutcome(oneshot::Sender<SessionOutcome>),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Jobs & context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub(crate) struct PublishJob {
    pub(crate) target: PublishTarget,
    pub(crate) snapshot: DeviceResources,
    pub(crate) malformed_retries: u32,
}

/// What to resume once a token refresh succeeds.
#[derive(Debug, Clone)]
pub(crate) enum Resume {
    SignIn,
    Publish(PublishJob),
}

#[derive(Debug, Clone)]
pub(crate) enum Job {
    SignUp,
    SignIn,
    SignOut,
    Refresh { resumes: Vec<Resume> },
    Publish(PublishJob),
    Discover,
}

impl Job {
    fn operation(&self) -> Operation {
        match self {
            Self::SignUp => Operation::SignUp,
            Self::SignIn => Operation::SignIn,
            Self::SignOut => Operation::SignOut,
            Self::Refresh { .. } => Operation::RefreshToken,
            Self::Publish(job) => Operation::Publish(job.target.clone()),
            Self::Discover => Operation::Discover,
        }
    }
}

#[derive(Debug)]
struct InFlight {
    job: Job,
    record: TimeoutRecord,
}

/// Counters scoped to one provisioning attempt.
#[derive(Debug, Default)]
pub(crate) struct Attempt {
    pub(crate) provisioning: Option<ProvisioningData>,
    pub(crate) sign_up_retries: u32,
    pub(crate) transport_retries: u32,
    pub(crate) resends: u32,
    pub(crate) auth_restarts: u32,
}

/// All mutable session state, owned by the machine task.
#[derive(Debug)]
pub(crate) struct SessionContext {
    pub(crate) state: SessionState,
    pub(crate) signed_in: bool,
    pub(crate) published: bool,
    pub(crate) endpoint: Option<cl_domain::CloudEndpoint>,
    pub(crate) attempt: Attempt,
    inflight: HashMap<RequestToken, InFlight>,
    /// Secondary and profile publications still outstanding.
    pub(crate) extras: HashSet<PublishTarget>,
    pub(crate) last_keepalive: tokio::time::Instant,
    outcome_waiters: Vec<oneshot::Sender<SessionOutcome>>,
    stop_waiters: Vec<oneshot::Sender<()>>,
}

impl SessionContext {
    fn new() -> Self {
        Self {
            state: SessionState::Disconnected,
            signed_in: false,
            published: false,
            endpoint: None,
            attempt: Attempt::default(),
            inflight: HashMap::new(),
            extras: HashSet::new(),
            last_keepalive: tokio::time::Instant::now(),
            outcome_waiters: Vec::new(),
            stop_waiters: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Machine
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct Collaborators {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) resources: Arc<dyn ResourceProvider>,
    pub(crate) network: Arc<dyn NetworkStatus>,
    pub(crate) observer: Arc<dyn Observer>,
}

pub(crate) struct SessionStateMachine {
    config: Arc<Config>,
    ctx: SessionContext,
    correlator: Arc<RequestCorrelator>,
    timeouts: TimeoutSupervisor,
    backoff: BackoffCalculator,
    credentials: Arc<CredentialStore>,
    transport: Arc<dyn Transport>,
    resources: Arc<dyn ResourceProvider>,
    network: Arc<dyn NetworkStatus>,
    observer: Arc<dyn Observer>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub(crate) fn new(
        config: Arc<Config>,
        credentials: Arc<CredentialStore>,
        collaborators: Collaborators,
        backoff: BackoffCalculator,
        events_tx: mpsc::UnboundedSender<SessionEvent>,
        events_rx: mpsc::UnboundedReceiver<SessionEvent>,
        state_tx: watch::Sender<SessionState>,
    ) -> Self {
        let correlator = Arc::new(RequestCorrelator::new(config.session.correlator_capacity));
        let timeouts = TimeoutSupervisor::new(correlator.clone(), config.session.tick());
        Self {
            config,
            ctx: SessionContext::new(),
            correlator,
            timeouts,
            backoff,
            credentials,
            transport: collaborators.transport,
            resources: collaborators.resources,
            network: collaborators.network,
            observer: collaborators.observer,
            events_tx,
            events_rx,
            state_tx,
        }
    }

    /// Consume events until `shutdown` is cancelled.
    pub(crate) async fn run(mut self, shutdown: CancellationToken) -> Result<(), SessionError> {
        tracing::info!(
            device_id = %self.config.session.device_id,
            "session machine started"
        );

        if self.network.is_attached() {
            self.on_network_changed(true).await;
            self.drain_pending().await;
        }

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    tracing::info!("session machine shutting down");
                    self.timeouts.disarm_all();
                    self.correlator.clear_all();
                    return Ok(());
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => event,
                    None => return Err(SessionError::ChannelClosed),
                },
            };

            self.handle(event).await;
            self.drain_pending().await;
        }
    }

    async fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Provision(data) => self.on_provision(data).await,
            SessionEvent::NetworkChanged { attached } => self.on_network_changed(attached).await,
            SessionEvent::ConnectionLost { host, port } => self.on_connection_lost(&host, port),
            SessionEvent::ResponseArrived { token, response } => {
                self.on_response(token, response).await
            }
            SessionEvent::TimeoutFired { token, record } => self.on_timeout(token, record),
            SessionEvent::RefreshTick => self.on_refresh_tick(),
            SessionEvent::Stop { done } => self.on_stop(done),
            SessionEvent::Reset { done } => self.on_reset(done).await,
            SessionEvent::AwaitOutcome(tx) => self.ctx.outcome_waiters.push(tx),
        }
    }

    /// Start the cached provisioning event once the slot is free.
    async fn drain_pending(&mut self) {
        while self.ctx.state.is_stopped() {
            let Some(data) = self.credentials.take_pending() else {
                break;
            };
            tracing::info!("starting cached provisioning request");
            self.start_attempt(data).await;
        }
    }

    async fn on_provision(&mut self, data: ProvisioningData) {
        if self.ctx.state.is_stopped() {
            self.start_attempt(data).await;
            return;
        }

        let replaced = self.credentials.cache_pending(data);
        tracing::info!(
            state = %self.ctx.state,
            replaced_previous = replaced,
            "session busy, provisioning request cached"
        );
        TraceEvent::ProvisioningCached {
            replaced_previous: replaced,
        }
        .emit();
    }

    // ── Responses & timeouts ─────────────────────────────────────────

    async fn on_response(&mut self, token: RequestToken, response: CloudResponse) {
        if !self.correlator.compare_and_clear(token, None) {
            tracing::debug!(token = %token, "late or superseded response discarded");
            TraceEvent::ResponseDiscarded {
                token: token.to_string(),
                reason: "not current".into(),
            }
            .emit();
            return;
        }
        self.timeouts.disarm(&token);

        let Some(inflight) = self.ctx.inflight.remove(&token) else {
            tracing::warn!(token = %token, "claimed response has no in-flight record");
            return;
        };

        TraceEvent::ResponseClaimed {
            token: token.to_string(),
            operation: format!("{:?}", inflight.job.operation()),
            status: response.status.code(),
        }
        .emit();

        // Sign-out is best effort and never resent.
        if matches!(inflight.job, Job::SignOut) {
            self.on_sign_out_response(response);
            return;
        }

        if response.status == ResponseStatus::CommError {
            tracing::warn!(
                token = %token,
                operation = ?inflight.job.operation(),
                "transport reported delivery failure"
            );
            self.resend_after_transport_failure(inflight.job, inflight.record);
            return;
        }
        self.ctx.attempt.transport_retries = 0;

        match inflight.job {
            Job::SignUp => self.on_sign_up_response(response).await,
            Job::SignIn => self.on_sign_in_response(response).await,
            Job::SignOut => {}
            Job::Refresh { resumes } => self.on_refresh_response(resumes, response).await,
            Job::Publish(job) => self.on_publish_response(job, response),
            Job::Discover => self.on_discover_response(response),
        }
    }

    fn on_timeout(&mut self, token: RequestToken, record: TimeoutRecord) {
        let Some(inflight) = self.ctx.inflight.remove(&token) else {
            tracing::debug!(token = %token, "timeout for a request no longer tracked");
            return;
        };
        let operation = inflight.job.operation();
        tracing::warn!(
            token = %token,
            operation = ?operation,
            current_ticks = record.current,
            "request timed out"
        );
        TraceEvent::TimeoutFired {
            token: token.to_string(),
            operation: format!("{operation:?}"),
            current_ticks: record.current,
        }
        .emit();

        let retry = self.config.retry.clone();
        match inflight.job {
            Job::SignUp => {
                if self.ctx.attempt.sign_up_retries < retry.sign_up_max_retries {
                    self.ctx.attempt.sign_up_retries += 1;
                    let next = self.backoff.next_delay(record.original, record.current);
                    self.schedule_retry(Job::SignUp, record.grown(next), "timeout");
                } else {
                    self.abandon(Job::SignUp, FailureReason::NoResponse);
                }
            }
            Job::SignIn => {
                let ceiling = retry.sign_in_ceiling;
                self.retry_grown(Job::SignIn, record, ceiling);
            }
            Job::Publish(job) => {
                let ceiling = retry.publish_ceiling;
                self.retry_grown(Job::Publish(job), record, ceiling);
            }
            Job::Refresh { resumes } => {
                let ceiling = retry.refresh_ceiling;
                self.retry_grown(Job::Refresh { resumes }, record, ceiling);
            }
            Job::Discover => {
                let ceiling = retry.discover_ceiling;
                if record.at_ceiling(ceiling) {
                    self.on_keepalive_lost();
                } else {
                    self.retry_grown(Job::Discover, record, ceiling);
                }
            }
            Job::SignOut => {
                tracing::info!("sign-out unanswered, continuing stop");
                self.finish_stop();
            }
        }
    }

    /// Resend with a grown deadline unless the stage reached its ceiling.
    fn retry_grown(&mut self, job: Job, record: TimeoutRecord, ceiling: u32) {
        if record.at_ceiling(ceiling) {
            self.abandon(job, FailureReason::NoResponse);
            return;
        }
        let next = self.backoff.next_delay(record.original, record.current);
        let next = clamp_to_ceiling(next, record.original, ceiling);
        self.schedule_retry(job, record.grown(next), "timeout");
    }

    fn schedule_retry(&mut self, job: Job, record: TimeoutRecord, reason: &str) {
        tracing::info!(
            operation = ?job.operation(),
            next_ticks = record.current,
            reason,
            "retrying request"
        );
        TraceEvent::RetryScheduled {
            operation: format!("{:?}", job.operation()),
            reason: reason.into(),
            next_ticks: record.current,
        }
        .emit();
        self.submit(job, record);
    }

    fn resend_after_transport_failure(&mut self, job: Job, record: TimeoutRecord) {
        self.ctx.attempt.transport_retries += 1;
        if self.ctx.attempt.transport_retries > self.config.retry.transport_retry_limit {
            self.abandon(job, FailureReason::NoInternetConnection);
            return;
        }
        self.schedule_retry(job, record.restarted(), "transport failure");
    }

    /// Immediate resend after a recoverable rejection, bounded per attempt.
    fn resend_bounded(&mut self, job: Job, reason: FailureReason) {
        self.ctx.attempt.resends += 1;
        if self.ctx.attempt.resends > self.config.retry.malformed_retry_limit {
            self.abandon(job, reason);
            return;
        }
        let record = self.initial_record(&job);
        self.schedule_retry(job, record, "rejected");
    }

    // ── Submission ───────────────────────────────────────────────────

    fn initial_record(&self, job: &Job) -> TimeoutRecord {
        let t = &self.config.timeouts;
        TimeoutRecord::new(match job {
            Job::SignUp => t.sign_up_ticks,
            Job::SignIn => t.sign_in_ticks,
            Job::SignOut => t.sign_out_ticks,
            Job::Refresh { .. } => t.refresh_ticks,
            Job::Publish(_) => t.publish_ticks,
            Job::Discover => t.discover_ticks,
        })
    }

    /// Register, send and arm one request.  On failure the job is
    /// abandoned and `false` is returned.
    fn submit(&mut self, job: Job, record: TimeoutRecord) -> bool {
        let Some(endpoint) = self.ctx.endpoint.as_ref().map(|e| e.address()) else {
            self.abandon(job, FailureReason::SystemError("no cloud endpoint".into()));
            return false;
        };
        let request = match self.build_request(&job) {
            Ok(request) => request,
            Err(reason) => {
                self.abandon(job, reason);
                return false;
            }
        };
        let operation = job.operation();

        loop {
            let token = RequestToken::new();
            if !self.correlator.acquire(operation.clone(), token) {
                self.abandon(job, FailureReason::SystemError("request registry full".into()));
                return false;
            }
            self.drop_superseded(&operation, token);

            let outbound = OutboundRequest {
                token,
                endpoint: endpoint.clone(),
                request: request.clone(),
                timeout_hint: self.timeouts.tick().saturating_mul(record.current),
            };
            let responder = Responder::new(token, self.events_tx.clone());

            match self.transport.submit(outbound, responder) {
                Ok(()) => {
                    tracing::debug!(
                        token = %token,
                        operation = ?operation,
                        timeout_ticks = record.current,
                        "request issued"
                    );
                    TraceEvent::RequestIssued {
                        token: token.to_string(),
                        operation: format!("{operation:?}"),
                        timeout_ticks: record.current,
                    }
                    .emit();

                    self.ctx.inflight.insert(token, InFlight { job, record });
                    let events = self.events_tx.clone();
                    self.timeouts.arm(token, record, move |token, record| {
                        let _ = events.send(SessionEvent::TimeoutFired { token, record });
                    });
                    return true;
                }
                Err(e) => {
                    self.correlator.compare_and_clear(token, None);
                    self.ctx.attempt.transport_retries += 1;
                    tracing::warn!(
                        operation = ?operation,
                        attempt = self.ctx.attempt.transport_retries,
                        error = %e,
                        "submit failed"
                    );
                    // Sign-out is best effort: one refusal ends it.
                    if matches!(job, Job::SignOut)
                        || self.ctx.attempt.transport_retries
                            > self.config.retry.transport_retry_limit
                    {
                        self.abandon(job, FailureReason::NoInternetConnection);
                        return false;
                    }
                }
            }
        }
    }

    /// Forget in-flight records whose token lost its operation slot.
    fn drop_superseded(&mut self, operation: &Operation, current: RequestToken) {
        let stale: Vec<RequestToken> = self
            .ctx
            .inflight
            .iter()
            .filter(|(t, f)| **t != current && &f.job.operation() == operation)
            .map(|(t, _)| *t)
            .collect();
        for token in stale {
            self.ctx.inflight.remove(&token);
            self.timeouts.disarm(&token);
        }
    }

    fn build_request(&self, job: &Job) -> Result<CloudRequest, FailureReason> {
        let device_id = self.config.session.device_id.clone();
        match job {
            Job::SignUp => {
                let data = self.ctx.attempt.provisioning.as_ref();
                let grant = data.and_then(|d| d.grant()).ok_or_else(|| {
                    FailureReason::SystemError("provisioning data has no sign-up grant".into())
                })?;
                let data = data.cloned().unwrap_or_default();
                Ok(CloudRequest::SignUp {
                    device_id,
                    grant,
                    user_id: data.uid,
                    auth_provider: data.auth_provider,
                    client_id: data.client_id,
                })
            }
            Job::SignIn | Job::SignOut => {
                let creds = self
                    .credentials
                    .current()
                    .filter(|c| c.has_access_token())
                    .ok_or(FailureReason::InvalidAccessToken)?;
                Ok(if matches!(job, Job::SignIn) {
                    CloudRequest::SignIn {
                        device_id,
                        user_id: creds.user_id,
                        access_token: creds.access_token,
                    }
                } else {
                    CloudRequest::SignOut {
                        device_id,
                        user_id: creds.user_id,
                        access_token: creds.access_token,
                    }
                })
            }
            Job::Refresh { .. } => {
                let creds = self
                    .credentials
                    .current()
                    .filter(|c| !c.refresh_token.is_empty())
                    .ok_or(FailureReason::InvalidAccessToken)?;
                Ok(CloudRequest::RefreshToken {
                    device_id,
                    user_id: creds.user_id,
                    refresh_token: creds.refresh_token,
                })
            }
            Job::Publish(publish) => {
                let (scope, device_id) = match &publish.target {
                    PublishTarget::Primary => (PublishScope::Primary, device_id),
                    PublishTarget::SubDevice(id) => (PublishScope::Secondary, id.clone()),
                    PublishTarget::DeviceProfile => (PublishScope::DeviceProfile, device_id),
                };
                Ok(CloudRequest::Publish {
                    scope,
                    device_id,
                    resources: publish.snapshot.resources.clone(),
                })
            }
            Job::Discover => Ok(CloudRequest::Discover { device_id }),
        }
    }

    // ── Failure & completion ─────────────────────────────────────────

    /// Give up on `job` for good.
    fn abandon(&mut self, job: Job, reason: FailureReason) {
        tracing::warn!(operation = ?job.operation(), reason = %reason, "giving up on request");
        match job {
            Job::SignUp | Job::SignIn | Job::Refresh { .. } => {
                self.fail_attempt(CloudStatus::FailedToRegister, reason)
            }
            Job::Publish(publish) if publish.target.is_primary() => {
                self.fail_attempt(CloudStatus::FailedToPublish, reason)
            }
            Job::Publish(publish) => self.complete_extra(&publish.target),
            Job::SignOut => self.finish_stop(),
            Job::Discover => {}
        }
    }

    /// Terminal failure: notify, drop everything in flight, go idle.
    fn fail_attempt(&mut self, status: CloudStatus, reason: FailureReason) {
        self.notify(status, Some(reason));
        self.reset_inflight();
        self.ctx.signed_in = false;
        self.ctx.published = false;
        self.ctx.attempt = Attempt::default();
        self.resolve_outcome(false);
        let idle = self.idle_state();
        self.set_state(idle);
    }

    /// All publication settled.
    fn complete_attempt(&mut self) {
        self.ctx.extras.clear();
        self.ctx.attempt = Attempt::default();
        self.set_state(SessionState::Stopped);
    }

    fn reset_inflight(&mut self) {
        self.timeouts.disarm_all();
        self.correlator.clear_all();
        self.ctx.inflight.clear();
        self.ctx.extras.clear();
    }

    fn idle_state(&self) -> SessionState {
        if self.network.is_attached() {
            SessionState::Stopped
        } else {
            SessionState::Disconnected
        }
    }

    fn resolve_outcome(&mut self, success: bool) {
        if self.ctx.outcome_waiters.is_empty() {
            return;
        }
        let creds = self.credentials.current();
        let outcome = SessionOutcome {
            success,
            domain: creds.as_ref().map(|c| c.endpoint.domain().to_string()),
            access_token: creds.map(|c| c.access_token),
        };
        for waiter in self.ctx.outcome_waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }

    // ── State & notification ─────────────────────────────────────────

    fn set_state(&mut self, next: SessionState) {
        let prev = self.ctx.state;
        if prev == next {
            return;
        }
        self.ctx.state = next;
        tracing::info!(from = %prev, to = %next, "session state changed");
        TraceEvent::SessionStateChanged {
            from: prev.to_string(),
            to: next.to_string(),
        }
        .emit();
        self.state_tx.send_replace(next);
    }

    fn notify(&self, status: CloudStatus, reason: Option<FailureReason>) {
        TraceEvent::CloudStatusChanged {
            status: format!("{status:?}"),
            error: reason.as_ref().map(|r| r.to_string()),
        }
        .emit();
        self.observer.on_state_changed(status, reason.as_ref());
    }
}
