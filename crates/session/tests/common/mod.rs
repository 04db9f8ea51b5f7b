//! Shared fakes for session integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use cl_domain::config::Config;
use cl_domain::{CloudCredentials, CloudEndpoint};
use cl_protocol::{
    keys, CloudRequest, CloudResponse, DeviceResources, ProvisioningData, PublishScope, Resource,
    ResponseStatus, TransportError,
};
use cl_session::{
    CloudStatus, CredentialPersistence, FailureReason, InMemoryCredentials, NetworkStatus,
    Observer, OutboundRequest, ResourceProvider, Responder, SessionHandle, SessionManager,
    Transport,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A submitted request together with the handle to answer it.
pub struct Submitted {
    pub request: OutboundRequest,
    pub responder: Responder,
}

impl Submitted {
    pub fn timeout_secs(&self) -> u64 {
        self.request.timeout_hint.as_secs()
    }

    pub fn ok(self) {
        self.responder.respond(CloudResponse::new(ResponseStatus::Changed));
    }

    pub fn reply(self, response: CloudResponse) {
        self.responder.respond(response);
    }
}

/// Hands every submitted request to the test.  The next `failures`
/// submissions are refused.
pub struct FakeTransport {
    tx: mpsc::UnboundedSender<Submitted>,
    failures: AtomicU32,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Submitted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                failures: AtomicU32::new(0),
            }),
            rx,
        )
    }

    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

impl Transport for FakeTransport {
    fn submit(&self, request: OutboundRequest, responder: Responder) -> Result<(), TransportError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(TransportError::SendFailed("link down".into()));
        }
        self.tx
            .send(Submitted { request, responder })
            .map_err(|_| TransportError::Closed)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Observer, resources, network
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct RecordingObserver {
    tx: mpsc::UnboundedSender<(CloudStatus, Option<FailureReason>)>,
}

impl RecordingObserver {
    pub fn new() -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<(CloudStatus, Option<FailureReason>)>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Observer for RecordingObserver {
    fn on_state_changed(&self, status: CloudStatus, error: Option<&FailureReason>) {
        let _ = self.tx.send((status, error.cloned()));
    }
}

pub struct StaticResources {
    pub primary: Vec<Resource>,
    pub sub_devices: Vec<DeviceResources>,
    pub profile: Vec<Resource>,
}

impl StaticResources {
    pub fn primary_only() -> Self {
        Self {
            primary: vec![resource("/a/light")],
            sub_devices: Vec::new(),
            profile: Vec::new(),
        }
    }

    pub fn full() -> Self {
        Self {
            primary: vec![resource("/a/light"), resource("/a/switch")],
            sub_devices: vec![DeviceResources {
                device_id: Some("sub-1".into()),
                resources: vec![resource("/b/temp")],
            }],
            profile: vec![resource("/p/profile")],
        }
    }

    pub fn two_sub_devices() -> Self {
        let mut resources = Self::full();
        resources.sub_devices.push(DeviceResources {
            device_id: Some("sub-2".into()),
            resources: vec![resource("/b/humidity")],
        });
        resources
    }
}

impl ResourceProvider for StaticResources {
    fn list_resources(&self, scope: PublishScope) -> Vec<DeviceResources> {
        let local = |resources: &Vec<Resource>| {
            vec![DeviceResources {
                device_id: None,
                resources: resources.clone(),
            }]
        };
        match scope {
            PublishScope::Primary => local(&self.primary),
            PublishScope::Secondary => self.sub_devices.clone(),
            PublishScope::DeviceProfile => local(&self.profile),
        }
    }
}

pub fn resource(uri: &str) -> Resource {
    Resource {
        uri: uri.into(),
        resource_types: vec!["oic.r.test".into()],
        interfaces: vec!["oic.if.baseline".into()],
    }
}

#[derive(Default)]
pub struct ToggleNetwork {
    attached: AtomicBool,
}

impl ToggleNetwork {
    pub fn attached() -> Arc<Self> {
        let net = Self::default();
        net.attached.store(true, Ordering::SeqCst);
        Arc::new(net)
    }

    pub fn set(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
    }
}

impl NetworkStatus for ToggleNetwork {
    fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

/// Storage whose `clear` takes a second to land.
pub struct SlowClear(pub Arc<InMemoryCredentials>);

#[async_trait]
impl CredentialPersistence for SlowClear {
    async fn load(&self) -> cl_domain::Result<Option<CloudCredentials>> {
        self.0.load().await
    }

    async fn save(&self, credentials: &CloudCredentials) -> cl_domain::Result<()> {
        self.0.save(credentials).await
    }

    async fn clear(&self) -> cl_domain::Result<()> {
        tokio::time::sleep(Duration::from_secs(1)).await;
        self.0.clear().await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Install a test log subscriber once per process.  Filter with `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short deadlines and no background keep-alive.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.session.tick_ms = 1_000;
    config.timeouts.sign_up_ticks = 2;
    config.timeouts.sign_in_ticks = 2;
    config.timeouts.sign_out_ticks = 1;
    config.timeouts.publish_ticks = 2;
    config.timeouts.refresh_ticks = 2;
    config.timeouts.discover_ticks = 2;
    config.refresh.keepalive_interval_secs = 0;
    config.refresh.check_interval_secs = 3_600;
    config
}

pub struct Harness {
    pub handle: SessionHandle,
    pub requests: mpsc::UnboundedReceiver<Submitted>,
    pub statuses: mpsc::UnboundedReceiver<(CloudStatus, Option<FailureReason>)>,
    pub transport: Arc<FakeTransport>,
    pub network: Arc<ToggleNetwork>,
    pub storage: Arc<InMemoryCredentials>,
    pub shutdown: CancellationToken,
    pub task: JoinHandle<Result<(), cl_session::SessionError>>,
}

pub struct HarnessBuilder {
    config: Config,
    resources: StaticResources,
    storage: Arc<InMemoryCredentials>,
    network: Arc<ToggleNetwork>,
    slow_clear: bool,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            config: test_config(),
            resources: StaticResources::primary_only(),
            storage: Arc::new(InMemoryCredentials::new()),
            network: ToggleNetwork::attached(),
            slow_clear: false,
        }
    }

    pub fn config(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    pub fn resources(mut self, resources: StaticResources) -> Self {
        self.resources = resources;
        self
    }

    pub fn saved(mut self, credentials: CloudCredentials) -> Self {
        self.storage = Arc::new(InMemoryCredentials::with(credentials));
        self
    }

    pub fn detached(self) -> Self {
        self.network.set(false);
        self
    }

    pub fn slow_clear(mut self) -> Self {
        self.slow_clear = true;
        self
    }

    pub fn start(self) -> Harness {
        init_tracing();
        let (transport, requests) = FakeTransport::new();
        let (observer, statuses) = RecordingObserver::new();
        let persistence: Arc<dyn CredentialPersistence> = if self.slow_clear {
            Arc::new(SlowClear(self.storage.clone()))
        } else {
            self.storage.clone()
        };
        let manager = SessionManager::builder(self.config)
            .transport(transport.clone())
            .persistence(persistence)
            .resources(Arc::new(self.resources))
            .network(self.network.clone())
            .observer(observer)
            .backoff_seed(7)
            .build()
            .expect("valid test config");
        let shutdown = CancellationToken::new();
        let (handle, task) = manager.spawn(shutdown.clone());
        Harness {
            handle,
            requests,
            statuses,
            transport,
            network: self.network,
            storage: self.storage,
            shutdown,
            task,
        }
    }
}

impl Harness {
    pub async fn next_request(&mut self) -> Submitted {
        tokio::time::timeout(Duration::from_secs(3_600), self.requests.recv())
            .await
            .expect("request within an hour")
            .expect("transport channel open")
    }

    pub fn no_pending_request(&mut self) -> bool {
        self.requests.try_recv().is_err()
    }

    pub async fn next_status(&mut self) -> (CloudStatus, Option<FailureReason>) {
        tokio::time::timeout(Duration::from_secs(3_600), self.statuses.recv())
            .await
            .expect("status within an hour")
            .expect("observer channel open")
    }

    /// Skip statuses until `wanted` arrives.
    pub async fn expect_status(&mut self, wanted: CloudStatus) -> Option<FailureReason> {
        loop {
            let (status, reason) = self.next_status().await;
            if status == wanted {
                return reason;
            }
        }
    }

    /// Statuses reported so far, without waiting.
    pub fn drain_statuses(&mut self) -> Vec<CloudStatus> {
        let mut out = Vec::new();
        while let Ok((status, _)) = self.statuses.try_recv() {
            out.push(status);
        }
        out
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let result = self.task.await.expect("session task joined");
        assert!(result.is_ok());
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Fixtures
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn provisioning(code: &str) -> ProvisioningData {
    ProvisioningData {
        auth_code: Some(code.into()),
        uid: Some("user-1".into()),
        auth_provider: Some("github".into()),
        host_name: Some("cloud.example.com".into()),
        ip: Some("10.0.0.7".into()),
        port: Some("5683".into()),
        ..Default::default()
    }
}

pub fn sign_up_ok(access_token: &str) -> CloudResponse {
    CloudResponse::new(ResponseStatus::Changed)
        .with(keys::ACCESS_TOKEN, access_token)
        .with(keys::REFRESH_TOKEN, "rt-1")
        .with(keys::TOKEN_TYPE, "bearer")
        .with(keys::EXPIRES_IN, 3_600)
        .with(keys::USER_ID, "user-1")
        .with(keys::SERVER_ID, "sid-1")
}

pub fn refresh_ok(access_token: &str) -> CloudResponse {
    CloudResponse::new(ResponseStatus::Changed)
        .with(keys::ACCESS_TOKEN, access_token)
        .with(keys::REFRESH_TOKEN, "rt-2")
        .with(keys::EXPIRES_IN, 3_600)
}

pub fn saved_credentials() -> CloudCredentials {
    CloudCredentials {
        endpoint: CloudEndpoint::new("10.0.0.7", 5683).expect("valid endpoint"),
        access_token: "at-saved".into(),
        refresh_token: "rt-saved".into(),
        token_type: "bearer".into(),
        expires_in: 3_600,
        issued_at: Utc::now(),
        user_id: "user-1".into(),
        server_id: None,
        redirect_uri: None,
        certificate: None,
    }
}

pub fn rejection(status: ResponseStatus, sub_code: u32) -> CloudResponse {
    CloudResponse::error(status, sub_code)
}

pub fn comm_error() -> CloudResponse {
    CloudResponse::new(ResponseStatus::CommError)
}

pub fn device_id(submitted: &Submitted) -> Option<&str> {
    match &submitted.request.request {
        CloudRequest::Publish { device_id, .. } => Some(device_id),
        _ => None,
    }
}

pub fn kind(submitted: &Submitted) -> &'static str {
    submitted.request.request.kind()
}

pub fn publish_scope(submitted: &Submitted) -> Option<PublishScope> {
    match &submitted.request.request {
        CloudRequest::Publish { scope, .. } => Some(*scope),
        _ => None,
    }
}
