//! Current credentials, the pending provisioning slot, and persistence
//! backends.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cl_domain::{CloudCredentials, Error, Result};
use cl_protocol::ProvisioningData;
use parking_lot::{Mutex, RwLock};

use crate::collaborators::CredentialPersistence;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Credential store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Single owner of the in-memory credential set and of the one-slot
/// cache of provisioning input waiting for the session to free up.
pub struct CredentialStore {
    current: RwLock<Option<CloudCredentials>>,
    pending: Mutex<Option<ProvisioningData>>,
    persistence: Arc<dyn CredentialPersistence>,
}

impl CredentialStore {
    pub fn new(persistence: Arc<dyn CredentialPersistence>) -> Self {
        Self {
            current: RwLock::new(None),
            pending: Mutex::new(None),
            persistence,
        }
    }

    pub fn current(&self) -> Option<CloudCredentials> {
        self.current.read().clone()
    }

    pub fn replace(&self, credentials: CloudCredentials) {
        *self.current.write() = Some(credentials);
    }

    /// Apply refreshed tokens.  Returns the updated set, or `None` when
    /// there is nothing to update.
    pub fn update_tokens(
        &self,
        access_token: String,
        refresh_token: String,
        token_type: String,
        expires_in: i64,
    ) -> Option<CloudCredentials> {
        let mut current = self.current.write();
        let creds = current.as_mut()?;
        creds.apply_refresh(
            access_token,
            refresh_token,
            token_type,
            expires_in,
            chrono::Utc::now(),
        );
        Some(creds.clone())
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    // ── Pending provisioning slot ────────────────────────────────────

    /// Cache `data`, replacing any earlier entry.  Returns whether an
    /// entry was replaced.
    pub fn cache_pending(&self, data: ProvisioningData) -> bool {
        self.pending.lock().replace(data).is_some()
    }

    pub fn take_pending(&self) -> Option<ProvisioningData> {
        self.pending.lock().take()
    }

    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn clear_pending(&self) {
        self.pending.lock().take();
    }

    // ── Persistence ──────────────────────────────────────────────────

    /// Persist the current credentials.
    pub async fn save(&self) -> Result<()> {
        let creds = self
            .current()
            .ok_or_else(|| Error::Persistence("no credentials to save".into()))?;
        self.persistence.save(&creds).await
    }

    /// Load persisted credentials into memory.
    pub async fn load(&self) -> Result<Option<CloudCredentials>> {
        let loaded = self.persistence.load().await?;
        if let Some(creds) = &loaded {
            self.replace(creds.clone());
        }
        Ok(loaded)
    }

    /// Forget credentials both in memory and in storage.
    pub async fn forget(&self) -> Result<()> {
        self.clear();
        self.clear_persisted().await
    }

    /// Remove stored credentials, leaving the in-memory set alone.
    pub async fn clear_persisted(&self) -> Result<()> {
        self.persistence.clear().await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// JSON file persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Credentials kept in a JSON file.  Writes go to a sibling temp file
/// that is then renamed over the target.
#[derive(Debug, Clone)]
pub struct JsonFileCredentials {
    path: PathBuf,
}

impl JsonFileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "credentials".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

#[async_trait]
impl CredentialPersistence for JsonFileCredentials {
    async fn load(&self) -> Result<Option<CloudCredentials>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let creds: CloudCredentials = serde_json::from_str(&raw)?;
        tracing::info!(
            path = %self.path.display(),
            user_id = %creds.user_id,
            "credentials loaded"
        );
        Ok(Some(creds))
    }

    async fn save(&self, credentials: &CloudCredentials) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(credentials)?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        tracing::debug!(path = %self.path.display(), "credentials saved");
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// In-memory persistence
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-local persistence, for hosts without storage and for tests.
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    slot: Mutex<Option<CloudCredentials>>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(credentials: CloudCredentials) -> Self {
        Self {
            slot: Mutex::new(Some(credentials)),
        }
    }

    pub fn stored(&self) -> Option<CloudCredentials> {
        self.slot.lock().clone()
    }
}

#[async_trait]
impl CredentialPersistence for InMemoryCredentials {
    async fn load(&self) -> Result<Option<CloudCredentials>> {
        Ok(self.stored())
    }

    async fn save(&self, credentials: &CloudCredentials) -> Result<()> {
        *self.slot.lock() = Some(credentials.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        self.slot.lock().take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cl_domain::CloudEndpoint;

    fn creds() -> CloudCredentials {
        CloudCredentials {
            endpoint: CloudEndpoint::new("cloud.example.com", 5683).unwrap(),
            access_token: "at-1".into(),
            refresh_token: "rt-1".into(),
            token_type: "bearer".into(),
            expires_in: 3600,
            issued_at: chrono::Utc::now(),
            user_id: "uid-1".into(),
            server_id: Some("sid".into()),
            redirect_uri: None,
            certificate: None,
        }
    }

    fn data(code: &str) -> ProvisioningData {
        ProvisioningData {
            auth_code: Some(code.into()),
            ..Default::default()
        }
    }

    #[test]
    fn pending_slot_is_last_write_wins() {
        let store = CredentialStore::new(Arc::new(InMemoryCredentials::new()));
        assert!(!store.cache_pending(data("a")));
        assert!(store.cache_pending(data("b")));
        assert!(store.has_pending());
        assert_eq!(store.take_pending(), Some(data("b")));
        assert_eq!(store.take_pending(), None);
    }

    #[test]
    fn update_tokens_requires_current_set() {
        let store = CredentialStore::new(Arc::new(InMemoryCredentials::new()));
        assert!(store
            .update_tokens("a".into(), "r".into(), "bearer".into(), 60)
            .is_none());

        store.replace(creds());
        let updated = store
            .update_tokens("at-2".into(), "rt-2".into(), "bearer".into(), 7200)
            .unwrap();
        assert_eq!(updated.access_token, "at-2");
        assert_eq!(store.current().unwrap().refresh_token, "rt-2");
        assert_eq!(updated.user_id, "uid-1");
    }

    #[tokio::test]
    async fn save_without_credentials_fails() {
        let store = CredentialStore::new(Arc::new(InMemoryCredentials::new()));
        assert!(store.save().await.is_err());
    }

    #[tokio::test]
    async fn load_populates_memory() {
        let backend = Arc::new(InMemoryCredentials::with(creds()));
        let store = CredentialStore::new(backend);
        assert!(store.current().is_none());
        store.load().await.unwrap();
        assert_eq!(store.current().unwrap().user_id, "uid-1");
    }

    #[tokio::test]
    async fn json_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = JsonFileCredentials::new(dir.path().join("nested").join("creds.json"));

        assert!(file.load().await.unwrap().is_none());
        file.save(&creds()).await.unwrap();
        let loaded = file.load().await.unwrap().unwrap();
        assert_eq!(loaded, creds_with_time(loaded.issued_at));
        assert!(!file.temp_path().exists());

        file.clear().await.unwrap();
        assert!(file.load().await.unwrap().is_none());
        file.clear().await.unwrap();
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        std::fs::write(&path, "{ not json").unwrap();
        let file = JsonFileCredentials::new(path);
        assert!(file.load().await.is_err());
    }

    #[tokio::test]
    async fn forget_clears_both_layers() {
        let backend = Arc::new(InMemoryCredentials::with(creds()));
        let store = CredentialStore::new(backend.clone());
        store.load().await.unwrap();
        store.forget().await.unwrap();
        assert!(store.current().is_none());
        assert!(backend.stored().is_none());
    }

    fn creds_with_time(issued_at: chrono::DateTime<chrono::Utc>) -> CloudCredentials {
        CloudCredentials {
            issued_at,
            ..creds()
        }
    }
}
