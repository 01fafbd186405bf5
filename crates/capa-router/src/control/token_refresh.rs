use std::sync::Arc;

use axum::extract::State;
use capa_shared::error::CommonError;
use capa_shared::response::JsonResponse;
use capa_store::repository::{OAuth2TokenRepositoryLike, ProjectRepositoryLike};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::control::SERVICE_ROUTE_KEY;
use crate::state::RouterState;

const REFRESH_WINDOW_SECONDS: i64 = 600;

pub fn create_router() -> OpenApiRouter<Arc<RouterState>> {
    OpenApiRouter::new()
        .routes(routes!(route_status))
        .routes(routes!(route_check))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenRefreshStatus {
    pending: usize,
}

#[utoipa::path(
        get,
        path = "/api/token-refresh/status",
        tags = [SERVICE_ROUTE_KEY],
        responses(
            (status = 200, description = "Number of tokens due for refresh soon", body = TokenRefreshStatus),
        ),
        summary = "Token refresh scheduler status",
        operation_id = "tokenRefreshStatus",
)]
async fn route_status(State(state): State<Arc<RouterState>>) -> JsonResponse<TokenRefreshStatus, CommonError> {
    let result = async {
        let pending = state.store.list_tokens_expiring_within(REFRESH_WINDOW_SECONDS).await?;
        Ok(TokenRefreshStatus { pending: pending.len() })
    }
        .await;
    JsonResponse::from(result)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TokenRefreshCheckResult {
    checked: usize,
    refreshed: usize,
    failed: usize,
}

/// `POST /api/token-refresh/check`: forces one scan of the scheduler's own tick
/// logic outside its 60s cadence, reusing [`capa_oauth::run_scheduler_tick`].
#[utoipa::path(
        post,
        path = "/api/token-refresh/check",
        tags = [SERVICE_ROUTE_KEY],
        responses(
            (status = 200, description = "Forced refresh scan result", body = TokenRefreshCheckResult),
        ),
        summary = "Force a token refresh scan",
        operation_id = "forceTokenRefreshCheck",
)]
async fn route_check(State(state): State<Arc<RouterState>>) -> JsonResponse<TokenRefreshCheckResult, CommonError> {
    let result = async {
        let candidates = state.store.list_tokens_expiring_within(REFRESH_WINDOW_SECONDS).await?;
        let checked = candidates.len();
        let mut refreshed = 0usize;
        let mut failed = 0usize;

        for token in candidates {
            let project = state.store.get_project(&token.project_id).await?;
            let server = project
                .and_then(|p| p.capabilities)
                .and_then(|c| c.server(&token.server_id).and_then(|s| s.def.oauth2.clone()));
            let Some(oauth2) = server else {
                failed += 1;
                continue;
            };

            match state
                .oauth
                .refresh_access_token(&token.project_id, &token.server_id, &oauth2.token_endpoint)
                .await
            {
                Ok(true) => refreshed += 1,
                Ok(false) | Err(_) => failed += 1,
            }
        }

        Ok(TokenRefreshCheckResult {
                checked,
                refreshed,
                failed,
        })
    }
        .await;
    JsonResponse::from(result)
}
