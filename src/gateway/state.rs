//! Process-wide shared state: configuration, the asset registry, and the
//! concurrent session registry keyed by both session id and credential
//! (the external HTTP order-submission lookup contract).

use std::sync::Arc;

use dashmap::DashMap;

use crate::config::AppConfig;
use crate::registry::AssetRegistry;
use crate::session::SessionHandle;

pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<AssetRegistry>,
    sessions_by_id: DashMap<String, SessionHandle>,
    sessions_by_credential: DashMap<String, SessionHandle>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(AssetRegistry::new(&config.assets));
        Self {
            config: Arc::new(config),
            registry,
            sessions_by_id: DashMap::new(),
            sessions_by_credential: DashMap::new(),
        }
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.sessions_by_id
            .insert(handle.session_id.clone(), handle.clone());
        self.sessions_by_credential
            .insert(handle.credential.clone(), handle);
    }

    /// Remove a session from both indices and ask it to tear down. Used
    /// both when a downstream channel closes and when a client
    /// re-authenticates (the prior session must be torn down first).
    pub fn evict(&self, handle: &SessionHandle) {
        self.sessions_by_id.remove(&handle.session_id);
        self.sessions_by_credential.remove(&handle.credential);
        handle.close();
    }

    pub fn by_credential(&self, credential: &str) -> Option<SessionHandle> {
        self.sessions_by_credential
            .get(credential)
            .map(|entry| entry.clone())
    }

    pub fn by_session_id(&self, session_id: &str) -> Option<SessionHandle> {
        self.sessions_by_id.get(session_id).map(|entry| entry.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions_by_id.len()
    }
}
