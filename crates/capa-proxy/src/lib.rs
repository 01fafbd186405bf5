pub mod transport;

use std::collections::HashMap;
use std::sync::Arc;

use capa_oauth::OAuthManager;
use capa_shared::error::CommonError;
use capa_shared::types::{McpServer, McpServerTransport};
use capa_shared::variables::{config_hash, substitute_variables};
use capa_store::repository::{
    OAuth2FlowStateRepositoryLike, OAuth2TokenRepositoryLike, SubprocessRepositoryLike,
    VariableRepositoryLike,
};
use capa_supervisor::{Supervisor, spawn_spec};
use serde_json::Value;
use std::path::Path;
use tokio::sync::{Mutex, OnceCell};

pub use transport::{HttpTransport, StdioTransport, Transport};

type ConnectionKey = (String, String);

/// Owns one cached [`Transport`] per `(project_id, server_id)`. Connection
/// establishment happens under a per-key `OnceCell`, so concurrent `tools/call`
/// requests for the same server await the same in-flight handshake rather than
/// racing a second one.
pub struct Proxy<R> {
    store: Arc<R>,
    supervisor: Arc<Supervisor<R>>,
    oauth: Arc<OAuthManager<R>>,
    connections: Mutex<HashMap<ConnectionKey, Arc<OnceCell<Transport>>>>,
    http: reqwest::Client,
}

impl<R> Proxy<R>
where
    R: VariableRepositoryLike
        + SubprocessRepositoryLike
        + OAuth2TokenRepositoryLike
        + OAuth2FlowStateRepositoryLike
        + Send
        + Sync
        + 'static,
{
    pub fn new(store: Arc<R>, supervisor: Arc<Supervisor<R>>, oauth: Arc<OAuthManager<R>>) -> Self {
        Self {
            store,
            supervisor,
            oauth,
            connections: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Returns the server's tool list as a bare JSON array — the wire response is
    /// `{"tools":[...]}`, unwrapped here so every caller works with the array directly.
    pub async fn list_tools(
        &self,
        project_id: &str,
        project_path: &Path,
        server: &McpServer,
    ) -> Result<Value, CommonError> {
        let result = self
            .call(project_id, project_path, server, "tools/list", serde_json::json!({}))
            .await?;
        Ok(result.get("tools").cloned().unwrap_or(Value::Array(Vec::new())))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn call_tool(
        &self,
        project_id: &str,
        project_path: &Path,
        server: &McpServer,
        tool_name: &str,
        arguments: Value,
    ) -> Result<Value, CommonError> {
        self.call(
            project_id,
            project_path,
            server,
            "tools/call",
            serde_json::json!({ "name": tool_name, "arguments": arguments }),
        )
        .await
    }

    async fn call(
        &self,
        project_id: &str,
        project_path: &Path,
        server: &McpServer,
        method: &str,
        params: Value,
    ) -> Result<Value, CommonError> {
        let cell = self.connection_for(project_id, project_path, server).await?;
        match cell.get().expect("connection_for always initializes the cell") {
            Transport::Stdio(stdio) => stdio.send(method, params).await,
            Transport::Http(http) => self.call_http(project_id, server, http, method, params).await,
        }
    }

    /// If a server is oauth2-configured, the proxy never attempts the HTTP round trip
    /// before a token exists — it fails synchronously instead.
    async fn call_http(
        &self,
        project_id: &str,
        server: &McpServer,
        http: &HttpTransport,
        method: &str,
        params: Value,
    ) -> Result<Value, CommonError> {
        let oauth2 = server.def.oauth2.as_ref();

        let bearer_token = match oauth2 {
            Some(config) => {
                let token = self
                    .oauth
                    .get_access_token(project_id, &server.id, &config.token_endpoint)
                    .await?;
                match token {
                    Some(token) => Some(token),
                    None => {
                        return Err(CommonError::Authentication {
                                msg: format!("mcp server '{}' requires authentication", server.id),
                                source: None,
                        });
                    }
                }
            }
            None => None,
        };

        let response = http
            .send_raw(method, params.clone(), bearer_token.as_deref())
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            if let Some(config) = oauth2 {
                let refreshed = self
                    .oauth
                    .refresh_access_token(project_id, &server.id, &config.token_endpoint)
                    .await?;
                if refreshed {
                    let retry_token = self
                        .oauth
                        .get_access_token(project_id, &server.id, &config.token_endpoint)
                        .await?;
                    let retry_response = http
                        .send_raw(method, params, retry_token.as_deref())
                        .await?;
                    return HttpTransport::parse_response(retry_response).await;
                }
            }
        }

        HttpTransport::parse_response(response).await
    }

    /// Returns the cache cell for `(project_id, server.id)`, initializing it at most
    /// once. Callers read the transport back out via `cell.get()` while holding the
    /// returned `Arc` alive, rather than cloning the transport itself.
    async fn connection_for(
        &self,
        project_id: &str,
        project_path: &Path,
        server: &McpServer,
    ) -> Result<Arc<OnceCell<Transport>>, CommonError> {
        let key = (project_id.to_string(), server.id.clone());
        let cell = {
            let mut connections = self.connections.lock().await;
            connections
                .entry(key)
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        // `get_or_try_init` only runs the closure once per cell: concurrent callers
        // for the same (project, server) await the same in-flight handshake.
        cell.get_or_try_init(|| self.establish(project_id, project_path, server))
            .await?;

        Ok(cell)
    }

    async fn establish(
        &self,
        project_id: &str,
        project_path: &Path,
        server: &McpServer,
    ) -> Result<Transport, CommonError> {
        let vars = self.store.list_variables(project_id).await?;
        let def_value = serde_json::to_value(&server.def)?;
        let (substituted, unresolved) = substitute_variables(&def_value, &vars);
        if unresolved {
            return Err(CommonError::InvalidRequest {
                    msg: format!(
                        "mcp server '{}' configuration has unresolved variables",
                        server.id
                    ),
                    source: None,
            });
        }
        let def: capa_shared::types::McpServerDef = serde_json::from_value(substituted)?;

        match &def.transport {
            McpServerTransport::Subprocess { cmd, args, env, cwd } => {
                let hash = config_hash(&serde_json::to_value(&def)?);
                let spec = spawn_spec(cmd.clone(), args.clone(), env, cwd.as_deref(), project_path);
                let process = self
                    .supervisor
                    .get_or_create_subprocess(project_id, &server.id, &hash, spec)
                    .await?;

                let stdio = process.take_stdio().await.ok_or_else(|| CommonError::Subprocess {
                        msg: format!("stdio for '{}' already claimed or process not ready", server.id),
                        source: None,
                })?;

                Ok(Transport::Stdio(StdioTransport::new(process, stdio.stdin, stdio.stdout)))
            }
            McpServerTransport::Remote { url } => {
                if let Some(config) = &def.oauth2 {
                    let token = self
                        .oauth
                        .get_access_token(project_id, &server.id, &config.token_endpoint)
                        .await?;
                    if token.is_none() {
                        return Err(CommonError::Authentication {
                                msg: format!("mcp server '{}' requires authentication", server.id),
                                source: None,
                        });
                    }
                }

                let client = if def.tls_skip_verify {
                    reqwest::Client::builder()
                        .danger_accept_invalid_certs(true)
                        .build()
                        .map_err(CommonError::from)?
                } else {
                    self.http.clone()
                };

                Ok(Transport::Http(HttpTransport::new(client, url.clone(), def.headers.clone())))
            }
        }
    }
}
