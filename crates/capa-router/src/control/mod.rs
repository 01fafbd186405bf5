pub mod health;
pub mod oauth;
pub mod projects;
pub mod subprocesses;
pub mod token_refresh;
pub mod variables;

use std::sync::Arc;

use axum::Router;
use capa_shared::error::CommonError;
use utoipa::openapi::tag::TagBuilder;
use utoipa::openapi::{Info, OpenApi};
use utoipa_axum::router::OpenApiRouter;

use crate::state::RouterState;

pub(crate) const SERVICE_ROUTE_KEY: &str = "control";

/// Merges every control sub-router under `/api`: each sub-router is built
/// independently, then folded into one `OpenApiRouter` sharing the same
/// `Arc<RouterState>`, and finally split into the served `Router` plus the `OpenApi`
/// document exposed at `/api/openapi.json`.
pub fn build_control_router(state: Arc<RouterState>) -> Result<Router, CommonError> {
    let router = OpenApiRouter::new()
        .merge(health::create_router())
        .merge(projects::create_router())
        .merge(subprocesses::create_router())
        .merge(variables::create_router())
        .merge(oauth::create_router())
        .merge(token_refresh::create_router());

    let (router, _) = router.split_for_parts();
    Ok(router.with_state(state))
}

pub fn generate_openapi_spec() -> OpenApi {
    let (_, mut spec) = OpenApiRouter::<Arc<RouterState>>::new()
        .merge(health::create_router())
        .merge(projects::create_router())
        .merge(subprocesses::create_router())
        .merge(variables::create_router())
        .merge(oauth::create_router())
        .merge(token_refresh::create_router())
        .split_for_parts();

    spec.info = Info::new("capa", env!("CARGO_PKG_VERSION"));
    spec.tags = Some(vec![
        TagBuilder::new()
            .name(SERVICE_ROUTE_KEY)
            .description(Some("Project, variable, and OAuth2 management for the local MCP broker"))
            .build(),
    ]);
    spec
}
