use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use capa_shared::error::CommonError;
use capa_shared::response::JsonResponse;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::control::SERVICE_ROUTE_KEY;
use crate::state::RouterState;

pub fn create_router() -> OpenApiRouter<Arc<RouterState>> {
    OpenApiRouter::new().routes(routes!(route_reset_subprocess))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResetSubprocessResponse {
    /// Number of cached/persisted records cleared for this server id.
    reset: usize,
}

/// `POST /api/projects/{id}/servers/{server_id}/reset`: clears the cached and
/// persisted subprocess state for `server_id`, the only way out of a `Crashed`
/// terminal state — the next request that needs this server spawns a fresh process
/// with its restart count reset to zero.
#[utoipa::path(
        post,
        path = "/api/projects/{id}/servers/{server_id}/reset",
        tags = [SERVICE_ROUTE_KEY],
        params(
            ("id" = String, Path, description = "Project id"),
            ("server_id" = String, Path, description = "MCP server id"),
        ),
        responses(
            (status = 200, description = "Subprocess state cleared", body = ResetSubprocessResponse),
        ),
        summary = "Reset a crashed or stopped subprocess",
        operation_id = "resetSubprocess",
)]
async fn route_reset_subprocess(
    State(state): State<Arc<RouterState>>,
    AxumPath((id, server_id)): AxumPath<(String, String)>,
) -> JsonResponse<ResetSubprocessResponse, CommonError> {
    let result = async {
        let reset = state.supervisor.reset_subprocess(&id, &server_id).await?;
        Ok(ResetSubprocessResponse { reset })
    }
        .await;
    JsonResponse::from(result)
}
