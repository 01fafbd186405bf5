use std::sync::Arc;

use capa_shared::error::CommonError;
use capa_shared::types::OAuth2ServerConfig;
use capa_store::repository::{
    OAuth2FlowState, OAuth2FlowStateRepositoryLike, OAuth2Token, OAuth2TokenRepositoryLike,
    VariableRepositoryLike,
};
use chrono::Utc;
use oauth2::basic::BasicClient;
use oauth2::{AuthUrl, ClientId, CsrfToken, PkceCodeChallenge, RedirectUrl, Scope, TokenUrl};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_CLIENT_ID: &str = "capa";

pub struct AuthorizationStart {
    pub authorization_url: String,
    pub state: String,
}

/// Drives the Authorization Code + PKCE flow and token lifecycle, on top of
/// whatever repository implementation persists flow state / tokens / variables.
pub struct OAuthManager<R> {
    store: Arc<R>,
    http: reqwest::Client,
}

impl<R> OAuthManager<R>
where
    R: OAuth2FlowStateRepositoryLike + OAuth2TokenRepositoryLike + VariableRepositoryLike + Send + Sync + 'static,
{
    pub fn new(store: Arc<R>) -> Self {
        Self {
            store,
            http: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client construction cannot fail with no custom TLS config"),
        }
    }

    /// Builds the authorization-request URL, generating PKCE + CSRF state and
    /// persisting the flow ("Authorization URL").
    pub async fn start_authorization(
        &self,
        project_id: &str,
        server_id: &str,
        server_config: &OAuth2ServerConfig,
        redirect_uri: &str,
    ) -> Result<AuthorizationStart, CommonError> {
        let (client_id, client_secret) = self
            .resolve_client_id(project_id, server_id, server_config, redirect_uri)
            .await;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let csrf_state = CsrfToken::new_random();

        let auth_url = AuthUrl::new(server_config.authorization_endpoint.clone())?;
        let token_url = TokenUrl::new(server_config.token_endpoint.clone())?;
        let redirect_url = RedirectUrl::new(redirect_uri.to_string())?;

        let client = BasicClient::new(ClientId::new(client_id.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        let csrf_for_closure = csrf_state.clone();
        let mut request = client
            .authorize_url(move || csrf_for_closure.clone())
            .set_pkce_challenge(pkce_challenge);

        if let Some(scope) = &server_config.scope {
            for s in scope.split_whitespace() {
                request = request.add_scope(Scope::new(s.to_string()));
            }
        }

        // RFC 8707 `resource` is intentionally omitted: some providers reject it.
        let (url, _) = request.url();

        self.store
            .create_flow_state(&OAuth2FlowState {
                state: csrf_state.secret().to_string(),
                project_id: project_id.to_string(),
                server_id: server_id.to_string(),
                code_verifier: pkce_verifier.secret().to_string(),
                redirect_uri: redirect_uri.to_string(),
                client_id: client_id.clone(),
                created_at: Utc::now(),
            })
            .await?;

        // Persisted so refresh (which runs long after the flow state is gone) knows
        // which client_id to present to the token endpoint.
        self.store
            .set_variable(project_id, &client_id_variable(server_id), &client_id)
            .await?;
        if let Some(secret) = client_secret {
            self.store
                .set_variable(project_id, &client_secret_variable(server_id), &secret)
                .await?;
        }

        Ok(AuthorizationStart {
            authorization_url: url.to_string(),
            state: csrf_state.secret().to_string(),
        })
    }

    /// Embedded `client_id` from config if present; else RFC 7591 dynamic registration;
    /// else falls back to `"capa"`.
    async fn resolve_client_id(
        &self,
        _project_id: &str,
        _server_id: &str,
        server_config: &OAuth2ServerConfig,
        redirect_uri: &str,
    ) -> (String, Option<String>) {
        if let Some(client_id) = &server_config.client_id {
            return (client_id.clone(), None);
        }

        let Some(registration_endpoint) = &server_config.registration_endpoint else {
            return (DEFAULT_CLIENT_ID.to_string(), None);
        };

        match register_dynamic_client(&self.http, registration_endpoint, redirect_uri).await {
            Ok(registration) => (registration.client_id, registration.client_secret),
            Err(e) => {
                warn!(error = %e, "dynamic client registration failed, falling back to default client id");
                (DEFAULT_CLIENT_ID.to_string(), None)
            }
        }
    }

    /// Looks up the flow by `state`, exchanges the code, stores the resulting tokens,
    /// and deletes the flow state (single-use) ("Callback").
    pub async fn handle_callback(
        &self,
        project_id: &str,
        server_id: &str,
        code: &str,
        state: &str,
        token_endpoint: &str,
    ) -> Result<(), CommonError> {
        let flow = self
            .store
            .take_flow_state(state)
            .await?
            .ok_or_else(|| CommonError::InvalidRequest {
                msg: "Invalid or expired state parameter".to_string(),
                source: None,
        })?;

        if Utc::now().signed_duration_since(flow.created_at) > chrono::Duration::minutes(10) {
            return Err(CommonError::InvalidRequest {
                    msg: "OAuth2 authorization state has expired".to_string(),
                    source: None,
            });
        }

        let client_secret = self
            .store
            .get_variable(project_id, &client_secret_variable(server_id))
            .await?;

        let token_response = exchange_code_for_tokens(
            &self.http,
            token_endpoint,
            &flow.client_id,
            client_secret.as_deref(),
            &flow.redirect_uri,
            code,
            &flow.code_verifier,
        )
            .await?;

        self.store
            .upsert_token(&token_response_to_token(project_id, server_id, &token_response))
            .await?;

        Ok(())
    }

    /// `refreshAccessToken`: on any failure the stored token is deleted so
    /// `isServerConnected` correctly reports disconnected afterwards.
    pub async fn refresh_access_token(
        &self,
        project_id: &str,
        server_id: &str,
        token_endpoint: &str,
    ) -> Result<bool, CommonError> {
        let Some(existing) = self.store.get_token(project_id, server_id).await? else {
            return Ok(false);
        };
        let Some(refresh_token) = existing.refresh_token.clone() else {
            self.store.delete_token(project_id, server_id).await?;
            return Ok(false);
        };

        let client_secret = self
            .store
            .get_variable(project_id, &client_secret_variable(server_id))
            .await?;
        let client_id = self
            .store
            .get_variable(project_id, &client_id_variable(server_id))
            .await?
            .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", client_id),
        ];
        if let Some(secret) = &client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = match self.http.post(token_endpoint).form(&form).send().await {
            Ok(r) => r,
            Err(_) => {
                self.store.delete_token(project_id, server_id).await?;
                return Ok(false);
            }
        };

        if !response.status().is_success() {
            self.store.delete_token(project_id, server_id).await?;
            return Ok(false);
        }

        let body: TokenResponse = match response.json().await {
            Ok(body) => body,
            Err(_) => {
                self.store.delete_token(project_id, server_id).await?;
                return Ok(false);
            }
        };

        let refreshed = OAuth2Token {
            project_id: project_id.to_string(),
            server_id: server_id.to_string(),
            access_token: body.access_token,
            refresh_token: body.refresh_token.or(Some(refresh_token)),
            token_type: body.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: body
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: body.scope.or(existing.scope),
        };
        self.store.upsert_token(&refreshed).await?;
        Ok(true)
    }

    /// `getAccessToken`: refreshes once if the token expires within 5 minutes.
    pub async fn get_access_token(
        &self,
        project_id: &str,
        server_id: &str,
        token_endpoint: &str,
    ) -> Result<Option<String>, CommonError> {
        let Some(token) = self.store.get_token(project_id, server_id).await? else {
            return Ok(None);
        };

        let needs_refresh = token
            .expires_at
            .map(|expires_at| expires_at - Utc::now() < chrono::Duration::minutes(5))
            .unwrap_or(false);

        if needs_refresh {
            if !self.refresh_access_token(project_id, server_id, token_endpoint).await? {
                return Ok(None);
            }
            return Ok(self
                .store
                .get_token(project_id, server_id)
                .await?
                .map(|t| t.access_token));
        }

        Ok(Some(token.access_token))
    }
}

fn client_id_variable(server_id: &str) -> String {
    format!("oauth2_client_id_{server_id}")
}

fn client_secret_variable(server_id: &str) -> String {
    format!("oauth2_client_secret_{server_id}")
}

fn token_response_to_token(project_id: &str, server_id: &str, body: &TokenResponse) -> OAuth2Token {
    OAuth2Token {
        project_id: project_id.to_string(),
        server_id: server_id.to_string(),
        access_token: body.access_token.clone(),
        refresh_token: body.refresh_token.clone(),
        token_type: body.token_type.clone().unwrap_or_else(|| "Bearer".to_string()),
        expires_at: body
            .expires_in
            .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
        scope: body.scope.clone(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn exchange_code_for_tokens(
    http: &reqwest::Client,
    token_endpoint: &str,
    client_id: &str,
    client_secret: Option<&str>,
    redirect_uri: &str,
    code: &str,
    code_verifier: &str,
) -> Result<TokenResponse, CommonError> {
    let mut form = vec![
        ("grant_type", "authorization_code".to_string()),
        ("code", code.to_string()),
        ("redirect_uri", redirect_uri.to_string()),
        ("client_id", client_id.to_string()),
        ("code_verifier", code_verifier.to_string()),
    ];
    if let Some(secret) = client_secret {
        form.push(("client_secret", secret.to_string()));
    }

    let response = http
        .post(token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| CommonError::Upstream {
            msg: format!("token exchange request failed: {e}"),
            source: Some(e.into()),
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(CommonError::Upstream {
                msg: format!("token exchange failed: HTTP {status} - {body}"),
                source: None,
        });
    }

    response.json().await.map_err(|e| CommonError::Upstream {
            msg: format!("failed to parse token response: {e}"),
            source: Some(e.into()),
    })
}

struct DynamicRegistration {
    client_id: String,
    client_secret: Option<String>,
}

/// RFC 7591 dynamic client registration for a public client
/// (`token_endpoint_auth_method=none`).
async fn register_dynamic_client(
    http: &reqwest::Client,
    registration_endpoint: &str,
    redirect_uri: &str,
) -> Result<DynamicRegistration, CommonError> {
    let response = http
        .post(registration_endpoint)
        .json(&serde_json::json!({
                "client_name": "capa",
                "redirect_uris": [redirect_uri],
                "grant_types": ["authorization_code"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
    }))
        .send()
        .await
        .map_err(|e| CommonError::Upstream {
            msg: format!("dynamic client registration request failed: {e}"),
            source: Some(e.into()),
    })?;

    if !response.status().is_success() {
        return Err(CommonError::Upstream {
                msg: format!(
                    "dynamic client registration failed: HTTP {}",
                    response.status()
                ),
                source: None,
        });
    }

    let body: Value = response.json().await.map_err(|e| CommonError::Upstream {
            msg: format!("failed to parse registration response: {e}"),
            source: Some(e.into()),
    })?;

    let client_id = body
        .get("client_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CommonError::Upstream {
            msg: "registration response missing client_id".to_string(),
            source: None,
    })?
        .to_string();
    let client_secret = body
        .get("client_secret")
        .and_then(|v| v.as_str())
        .map(str::to_string);

    Ok(DynamicRegistration { client_id, client_secret })
}

#[cfg(test)]
mod tests {
    use super::*;
    use capa_store::connection::establish_in_memory_connection;
    use capa_store::repository::Repository;
    use url::Url;

    fn server_config() -> OAuth2ServerConfig {
        OAuth2ServerConfig {
            authorization_endpoint: "https://idp.example.com/authorize".to_string(),
            token_endpoint: "https://idp.example.com/token".to_string(),
            resource_server: "https://mcp.example.com".to_string(),
            registration_endpoint: None,
            scope: Some("read write".to_string()),
            client_id: Some("preconfigured-client".to_string()),
        }
    }

    #[tokio::test]
    async fn builds_authorization_url_with_pkce_and_state() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let manager = OAuthManager::new(Arc::new(Repository::new(conn)));

        let start = manager
            .start_authorization("p1", "fs", &server_config(), "http://127.0.0.1:5912/callback")
            .await
            .unwrap();

        let url = Url::parse(&start.authorization_url).unwrap();
        let pairs: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert_eq!(pairs.get("response_type").map(String::as_str), Some("code"));
        assert_eq!(pairs.get("client_id").map(String::as_str), Some("preconfigured-client"));
        assert_eq!(pairs.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert!(pairs.contains_key("code_challenge"));
        assert_eq!(pairs.get("state").map(String::as_str), Some(start.state.as_str()));
        assert!(!pairs.contains_key("resource"));
    }

    #[tokio::test]
    async fn get_access_token_returns_none_without_a_stored_token() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let manager = OAuthManager::new(Arc::new(Repository::new(conn)));

        let token = manager
            .get_access_token("p1", "fs", "https://idp.example.com/token")
            .await
            .unwrap();
        assert!(token.is_none());
    }

    #[tokio::test]
    async fn refresh_with_no_stored_token_returns_false() {
        let (_db, conn) = establish_in_memory_connection().await.unwrap();
        let manager = OAuthManager::new(Arc::new(Repository::new(conn)));

        let refreshed = manager
            .refresh_access_token("p1", "fs", "https://idp.example.com/token")
            .await
            .unwrap();
        assert!(!refreshed);
    }
}
