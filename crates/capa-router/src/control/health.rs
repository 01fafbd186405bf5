use std::sync::Arc;

use axum::extract::State;
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::control::SERVICE_ROUTE_KEY;
use crate::state::RouterState;

pub fn create_router() -> OpenApiRouter<Arc<RouterState>> {
    OpenApiRouter::new().routes(routes!(route_health))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    uptime_seconds: u64,
}

#[utoipa::path(
    get,
    path = "/health",
    tags = [SERVICE_ROUTE_KEY],
    responses(
        (status = 200, description = "Broker is up", body = HealthResponse),
    ),
    summary = "Health check",
    operation_id = "health",
)]
async fn route_health(State(state): State<Arc<RouterState>>) -> axum::Json<HealthResponse> {
    axum::Json(HealthResponse {
        status: "ok",
        version: state.version,
        uptime_seconds: state.started_at.elapsed().as_secs(),
    })
}
