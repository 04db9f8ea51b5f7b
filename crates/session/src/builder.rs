//! Wiring: validate config, assemble collaborators, spawn the session.

use std::sync::Arc;

use cl_domain::config::{Config, ConfigSeverity};
use cl_domain::CloudCredentials;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffCalculator;
use crate::collaborators::{
    AlwaysAttached, CredentialPersistence, LogObserver, NetworkStatus, Observer,
    ResourceProvider, Transport,
};
use crate::credentials::{CredentialStore, JsonFileCredentials};
use crate::handle::SessionHandle;
use crate::machine::{Collaborators, SessionStateMachine};
use crate::supervisor::spawn_refresh_ticker;
use crate::types::{SessionError, SessionState};

/// Collects the collaborators a session needs.
///
/// A transport and a resource provider are required.  Credentials default
/// to a JSON file at `storage.credentials_path`, the network to always
/// attached, and the observer to logging only.
pub struct SessionManagerBuilder {
    config: Config,
    transport: Option<Arc<dyn Transport>>,
    persistence: Option<Arc<dyn CredentialPersistence>>,
    resources: Option<Arc<dyn ResourceProvider>>,
    network: Option<Arc<dyn NetworkStatus>>,
    observer: Option<Arc<dyn Observer>>,
    backoff_seed: Option<u64>,
}

impl SessionManagerBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            transport: None,
            persistence: None,
            resources: None,
            network: None,
            observer: None,
            backoff_seed: None,
        }
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn CredentialPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn resources(mut self, resources: Arc<dyn ResourceProvider>) -> Self {
        self.resources = Some(resources);
        self
    }

    pub fn network(mut self, network: Arc<dyn NetworkStatus>) -> Self {
        self.network = Some(network);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Seed the retry jitter so delays are reproducible.
    pub fn backoff_seed(mut self, seed: u64) -> Self {
        self.backoff_seed = Some(seed);
        self
    }

    pub fn build(self) -> Result<SessionManager, SessionError> {
        let issues = self.config.validate();
        for issue in &issues {
            match issue.severity {
                ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
                ConfigSeverity::Error => tracing::error!("config: {issue}"),
            }
        }
        let errors = issues
            .iter()
            .filter(|i| i.severity == ConfigSeverity::Error)
            .count();
        if errors > 0 {
            return Err(SessionError::Config(format!(
                "config validation failed with {errors} error(s)"
            )));
        }

        let transport = self
            .transport
            .ok_or_else(|| SessionError::Config("no transport configured".into()))?;
        let resources = self
            .resources
            .ok_or_else(|| SessionError::Config("no resource provider configured".into()))?;
        let persistence = self.persistence.unwrap_or_else(|| {
            Arc::new(JsonFileCredentials::new(
                self.config.storage.credentials_path.clone(),
            ))
        });

        let backoff = match self.backoff_seed {
            Some(seed) => BackoffCalculator::with_seed(self.config.backoff.clone(), seed),
            None => BackoffCalculator::new(self.config.backoff.clone()),
        };

        Ok(SessionManager {
            config: Arc::new(self.config),
            credentials: Arc::new(CredentialStore::new(persistence)),
            collaborators: Collaborators {
                transport,
                resources,
                network: self.network.unwrap_or_else(|| Arc::new(AlwaysAttached)),
                observer: self.observer.unwrap_or_else(|| Arc::new(LogObserver)),
            },
            backoff,
        })
    }
}

/// A configured session, ready to run.
pub struct SessionManager {
    config: Arc<Config>,
    credentials: Arc<CredentialStore>,
    collaborators: Collaborators,
    backoff: BackoffCalculator,
}

impl SessionManager {
    pub fn builder(config: Config) -> SessionManagerBuilder {
        SessionManagerBuilder::new(config)
    }

    pub fn credentials(&self) -> Arc<CredentialStore> {
        self.credentials.clone()
    }

    /// Read saved credentials before the session starts, so an unreadable
    /// store surfaces to the host instead of only in the session log.
    pub async fn load_saved_credentials(&self) -> Result<Option<CloudCredentials>, SessionError> {
        let loaded = self.credentials.load().await?;
        match &loaded {
            Some(creds) => tracing::info!(user_id = %creds.user_id, "saved credentials found"),
            None => tracing::debug!("no saved credentials"),
        }
        Ok(loaded)
    }

    /// Start the session task and its refresh ticker.  Both stop when
    /// `shutdown` is cancelled.
    pub fn spawn(
        self,
        shutdown: CancellationToken,
    ) -> (SessionHandle, JoinHandle<Result<(), SessionError>>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Disconnected);

        spawn_refresh_ticker(
            self.config.refresh.check_interval(),
            events_tx.clone(),
            shutdown.clone(),
        );

        let machine = SessionStateMachine::new(
            self.config,
            self.credentials,
            self.collaborators,
            self.backoff,
            events_tx.clone(),
            events_rx,
            state_tx,
        );
        let task = tokio::spawn(machine.run(shutdown));
        tracing::info!("cloud session spawned");

        (SessionHandle::new(events_tx, state_rx), task)
    }
}
