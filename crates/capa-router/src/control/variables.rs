use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Json, Path, State};
use capa_shared::error::CommonError;
use capa_shared::response::JsonResponse;
use capa_store::repository::VariableRepositoryLike;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::control::SERVICE_ROUTE_KEY;
use crate::state::RouterState;

pub fn create_router() -> OpenApiRouter<Arc<RouterState>> {
    OpenApiRouter::new()
        .routes(routes!(route_list_variables))
        .routes(routes!(route_set_variables))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct VariablesResponse {
    variables: HashMap<String, String>,
}

#[utoipa::path(
    get,
    path = "/api/projects/{id}/variables",
    tags = [SERVICE_ROUTE_KEY],
    params(("id" = String, Path, description = "Project id")),
    responses(
        (status = 200, description = "The project's variable map", body = VariablesResponse),
    ),
    summary = "Get a project's variables",
    operation_id = "listVariables",
)]
async fn route_list_variables(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
) -> JsonResponse<VariablesResponse, CommonError> {
    let result = async {
        let variables = state.store.list_variables(&id).await?;
        Ok(VariablesResponse { variables })
    }
    .await;
    JsonResponse::from(result)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetVariablesRequest {
    variables: HashMap<String, String>,
}

#[utoipa::path(
    post,
    path = "/api/projects/{id}/variables",
    tags = [SERVICE_ROUTE_KEY],
    params(("id" = String, Path, description = "Project id")),
    request_body = SetVariablesRequest,
    responses(
        (status = 200, description = "The project's updated variable map", body = VariablesResponse),
    ),
    summary = "Set a project's variables",
    operation_id = "setVariables",
)]
async fn route_set_variables(
    State(state): State<Arc<RouterState>>,
    Path(id): Path<String>,
    Json(body): Json<SetVariablesRequest>,
) -> JsonResponse<VariablesResponse, CommonError> {
    let result = async {
        for (key, value) in &body.variables {
            state.store.set_variable(&id, key, value).await?;
        }
        let variables = state.store.list_variables(&id).await?;
        Ok(VariablesResponse { variables })
    }
    .await;
    JsonResponse::from(result)
}
