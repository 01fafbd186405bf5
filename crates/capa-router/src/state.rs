use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use capa_executor::Executor;
use capa_oauth::OAuthManager;
use capa_proxy::Proxy;
use capa_session::SessionManager;
use capa_store::repository::Repository;
use capa_supervisor::Supervisor;
use dashmap::DashMap;
use serde_json::Value;

/// Composition root for every component the router dispatches to, instantiated once
/// at startup and shared behind an `Arc` across every request.
#[derive(Clone)]
pub struct RouterState {
    pub store: Arc<Repository>,
    pub sessions: Arc<SessionManager<Repository>>,
    pub proxy: Arc<Proxy<Repository>>,
    pub supervisor: Arc<Supervisor<Repository>>,
    pub oauth: Arc<OAuthManager<Repository>>,
    pub executor: Arc<Executor<Repository>>,
    /// `(project_id, tool_id) → inputSchema` memoization cache ("Tool schema
    /// resolution"), kept for the lifetime of the handler.
    pub schema_cache: Arc<DashMap<(String, String), Value>>,
    pub started_at: Instant,
    pub version: &'static str,
    pub ui_redirect_base: String,
    /// This broker's own externally-reachable base URL (e.g. `http://127.0.0.1:5912`),
    /// used to build the OAuth2 `redirect_uri` the broker registers with a server.
    pub base_url: String,
    /// Broker data directory (`BrokerConfig::data_dir`); projects seen for the first
    /// time via `configure` are given a working directory under here.
    pub data_dir: PathBuf,
}

impl RouterState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<Repository>,
        sessions: Arc<SessionManager<Repository>>,
        proxy: Arc<Proxy<Repository>>,
        supervisor: Arc<Supervisor<Repository>>,
        oauth: Arc<OAuthManager<Repository>>,
        executor: Arc<Executor<Repository>>,
        ui_redirect_base: String,
        base_url: String,
        data_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            sessions,
            proxy,
            supervisor,
            oauth,
            executor,
            schema_cache: Arc::new(DashMap::new()),
            started_at: Instant::now(),
            version: env!("CARGO_PKG_VERSION"),
            ui_redirect_base,
            base_url,
            data_dir,
        }
    }

    /// The per-server OAuth2 callback URL the broker registers as `redirect_uri`.
    pub fn oauth_redirect_uri(&self, project_id: &str) -> String {
        format!("{}/api/projects/{}/oauth/callback", self.base_url, project_id)
    }
}
