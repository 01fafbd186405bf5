pub mod control;
pub mod jsonrpc;
pub mod mcp;
pub mod schema;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use capa_shared::error::CommonError;
use http::header::HeaderName;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};

pub use state::RouterState;

/// Builds the full broker router: the JSON-RPC MCP endpoint (excluded from the
/// OpenAPI document, its shape being fixed by the MCP spec rather than this API),
/// merged with the control HTTP API, plus `/api/openapi.json`. CORS exposes the two
/// MCP transport headers so browser-based clients can read them.
pub fn build_router(state: Arc<RouterState>) -> Result<Router, CommonError> {
    let control_router = control::build_control_router(state.clone())?;

    let mcp_router = Router::new()
        .route("/{projectId}/mcp", post(mcp::route_mcp))
        .with_state(state);

    let openapi_router = Router::new().route(
        "/api/openapi.json",
        get(|| async { axum::Json(control::generate_openapi_spec()) }),
    );

    let router = Router::new().merge(mcp_router).merge(control_router).merge(openapi_router);

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(AllowMethods::any())
        .allow_headers(AllowHeaders::any())
        .expose_headers(ExposeHeaders::list([
                HeaderName::from_static("mcp-session-id"),
                HeaderName::from_static("mcp-protocol-version"),
    ]));

    Ok(router.layer(cors))
}
