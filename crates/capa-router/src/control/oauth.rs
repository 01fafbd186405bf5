use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::Redirect;
use capa_shared::error::CommonError;
use capa_shared::response::{JsonResponse, RedirectResponse};
use capa_store::repository::{OAuth2FlowStateRepositoryLike, OAuth2TokenRepositoryLike, ProjectRepositoryLike};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::control::SERVICE_ROUTE_KEY;
use crate::state::RouterState;

pub fn create_router() -> OpenApiRouter<Arc<RouterState>> {
    OpenApiRouter::new()
        .routes(routes!(route_oauth_servers))
        .routes(routes!(route_oauth_start))
        .routes(routes!(route_oauth_callback))
        .routes(routes!(route_oauth_disconnect))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OAuth2ServerEntry {
    server_id: String,
    is_connected: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OAuth2ServersResponse {
    servers: Vec<OAuth2ServerEntry>,
}

#[utoipa::path(
        get,
        path = "/api/projects/{id}/oauth-servers",
        tags = [SERVICE_ROUTE_KEY],
        params(("id" = String, Path, description = "Project id")),
        responses(
            (status = 200, description = "Per-server OAuth2 connection state", body = OAuth2ServersResponse),
        ),
        summary = "List a project's OAuth2 servers",
        operation_id = "listOAuth2Servers",
)]
async fn route_oauth_servers(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
) -> JsonResponse<OAuth2ServersResponse, CommonError> {
    let result = async {
        let project = state.store.get_project(&id).await?.ok_or_else(|| CommonError::NotFound {
                msg: format!("project '{id}' not found"),
                lookup_id: id.clone(),
                source: None,
        })?;
        let capabilities = project.capabilities.unwrap_or_default();

        let mut servers = Vec::new();
        for server in &capabilities.servers {
            if server.def.oauth2.is_none() {
                continue;
            }
            let is_connected = state.store.get_token(&id, &server.id).await?.is_some();
            servers.push(OAuth2ServerEntry {
                    server_id: server.id.clone(),
                    is_connected,
            });
        }
        Ok(OAuth2ServersResponse { servers })
    }
        .await;
    JsonResponse::from(result)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct StartQuery {
    server: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    authorization_url: String,
    state: String,
}

#[utoipa::path(
        post,
        path = "/api/projects/{id}/oauth/start",
        tags = [SERVICE_ROUTE_KEY],
        params(("id" = String, Path, description = "Project id"), StartQuery),
        responses(
            (status = 200, description = "Authorization URL to redirect the user to", body = StartResponse),
        ),
        summary = "Start an OAuth2 authorization flow",
        operation_id = "startOAuth2",
)]
async fn route_oauth_start(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
    Query(query): Query<StartQuery>,
) -> JsonResponse<StartResponse, CommonError> {
    let result = async {
        let project = state.store.get_project(&id).await?.ok_or_else(|| CommonError::NotFound {
                msg: format!("project '{id}' not found"),
                lookup_id: id.clone(),
                source: None,
        })?;
        let capabilities = project.capabilities.unwrap_or_default();
        let server = capabilities.server(&query.server).ok_or_else(|| CommonError::InvalidRequest {
                msg: format!("server '{}' not found in capabilities", query.server),
                source: None,
        })?;
        let oauth2 = server.def.oauth2.as_ref().ok_or_else(|| CommonError::InvalidRequest {
                msg: format!("server '{}' does not require OAuth2", query.server),
                source: None,
        })?;

        let redirect_uri = state.oauth_redirect_uri(&id);
        let start = state
            .oauth
            .start_authorization(&id, &query.server, oauth2, &redirect_uri)
            .await?;
        Ok(StartResponse {
                authorization_url: start.authorization_url,
                state: start.state,
        })
    }
        .await;
    JsonResponse::from(result)
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    code: String,
    state: String,
}

/// `GET /api/projects/{id}/oauth/callback`: always redirects the
/// browser back to the UI, encoding success/failure as query parameters rather than
/// returning a JSON error, since this endpoint is only ever hit by a browser redirect.
#[utoipa::path(
        get,
        path = "/api/projects/{id}/oauth/callback",
        tags = [SERVICE_ROUTE_KEY],
        params(("id" = String, Path, description = "Project id"), CallbackQuery),
        responses(
            (status = 302, description = "Redirect back to the UI"),
        ),
        summary = "OAuth2 callback",
        operation_id = "oauth2Callback",
)]
async fn route_oauth_callback(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
    Query(query): Query<CallbackQuery>,
) -> RedirectResponse<CommonError> {
    let result: Result<Redirect, CommonError> = async {
        let project = state.store.get_project(&id).await?.ok_or_else(|| CommonError::NotFound {
                msg: format!("project '{id}' not found"),
                lookup_id: id.clone(),
                source: None,
        })?;
        let capabilities = project.capabilities.unwrap_or_default();

        // The flow state (looked up by `state`, not assumed) names the server this
        // callback actually belongs to — a project with more than one OAuth2-configured
        // server would otherwise have the wrong one's token endpoint used for exchange.
        let flow = state
            .store
            .peek_flow_state(&query.state)
            .await?
            .ok_or_else(|| CommonError::InvalidRequest {
                msg: "Invalid or expired state parameter".to_string(),
                source: None,
        })?;
        let server = capabilities
            .server(&flow.server_id)
            .ok_or_else(|| CommonError::InvalidRequest {
                msg: format!("server '{}' not found in capabilities", flow.server_id),
                source: None,
        })?;
        let oauth2 = server.def.oauth2.as_ref().ok_or_else(|| CommonError::InvalidRequest {
                msg: format!("server '{}' does not require OAuth2", flow.server_id),
                source: None,
        })?;

        match state
            .oauth
            .handle_callback(&id, &server.id, &query.code, &query.state, &oauth2.token_endpoint)
            .await
        {
            Ok(()) => Ok(Redirect::to(&format!("{}?oauth_success=true", state.ui_redirect_base))),
            Err(e) => Ok(Redirect::to(&format!(
                        "{}?oauth_error={}",
                        state.ui_redirect_base,
                        urlencode(&e.to_string())
            ))),
        }
    }
        .await;
    RedirectResponse::from(result)
}

#[utoipa::path(
        delete,
        path = "/api/projects/{id}/oauth/{serverId}",
        tags = [SERVICE_ROUTE_KEY],
        params(
            ("id" = String, Path, description = "Project id"),
            ("serverId" = String, Path, description = "Server id"),
        ),
        responses(
            (status = 200, description = "Token revoked", body = ()),
        ),
        summary = "Disconnect a server's OAuth2 token",
        operation_id = "disconnectOAuth2",
)]
async fn route_oauth_disconnect(
    State(state): State<Arc<RouterState>>,
    Path((id, server_id)): Path<(String, String)>,
) -> JsonResponse<(), CommonError> {
    let result = state.store.delete_token(&id, &server_id).await;
    JsonResponse::from(result)
}

fn urlencode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.as_bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(*byte as char);
            }
            other => out.push_str(&format!("%{:02X}", other)),
        }
    }
    out
}
