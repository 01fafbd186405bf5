use std::path::Path;
use std::sync::Arc;

use axum::extract::{Json, Path as AxumPath, State};
use capa_shared::error::CommonError;
use capa_shared::response::JsonResponse;
use capa_shared::types::{Capabilities, McpServerTransport, OAuth2ServerConfig, ToolDef};
use capa_store::repository::{OAuth2TokenRepositoryLike, ProjectRepositoryLike, VariableRepositoryLike};
use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use utoipa_axum::router::OpenApiRouter;
use utoipa_axum::routes;

use crate::control::SERVICE_ROUTE_KEY;
use crate::state::RouterState;

pub fn create_router() -> OpenApiRouter<Arc<RouterState>> {
    OpenApiRouter::new()
        .routes(routes!(route_list_projects))
        .routes(routes!(route_get_project))
        .routes(routes!(route_configure_project))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProjectSummary {
    id: String,
    path: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    skills_count: usize,
    tools_count: usize,
    servers_count: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProjectListResponse {
    projects: Vec<ProjectSummary>,
}

#[utoipa::path(
        get,
        path = "/api/projects",
        tags = [SERVICE_ROUTE_KEY],
        responses(
            (status = 200, description = "All known projects", body = ProjectListResponse),
        ),
        summary = "List projects",
        operation_id = "listProjects",
)]
async fn route_list_projects(
    State(state): State<Arc<RouterState>>,
) -> JsonResponse<ProjectListResponse, CommonError> {
    let result = async {
        let projects = state.store.list_projects().await?;
        Ok(ProjectListResponse {
                projects: projects.into_iter().map(summarize).collect(),
        })
    }
        .await;
    JsonResponse::from(result)
}

fn summarize(project: capa_store::repository::Project) -> ProjectSummary {
    let caps = project.capabilities.unwrap_or_default();
    ProjectSummary {
        id: project.id,
        path: project.path,
        created_at: project.created_at,
        updated_at: project.updated_at,
        skills_count: caps.skills.len(),
        tools_count: caps.tools.len(),
        servers_count: caps.servers.len(),
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ProjectDetail {
    id: String,
    path: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    capabilities: Capabilities,
}

#[utoipa::path(
        get,
        path = "/api/projects/{id}",
        tags = [SERVICE_ROUTE_KEY],
        params(("id" = String, Path, description = "Project id")),
        responses(
            (status = 200, description = "Detailed capability summary", body = ProjectDetail),
        ),
        summary = "Get project detail",
        operation_id = "getProject",
)]
async fn route_get_project(
    State(state): State<Arc<RouterState>>,
    AxumPath(id): AxumPath<String>,
) -> JsonResponse<ProjectDetail, CommonError> {
    let result = async {
        let project = state.store.get_project(&id).await?.ok_or_else(|| CommonError::NotFound {
                msg: format!("project '{id}' not found"),
                lookup_id: id.clone(),
                source: None,
        })?;
        Ok(ProjectDetail {
                id: project.id,
                path: project.path,
                created_at: project.created_at,
                updated_at: project.updated_at,
                capabilities: project.capabilities.unwrap_or_default(),
        })
    }
        .await;
    JsonResponse::from(result)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OAuth2ServerStatus {
    server_id: String,
    is_connected: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ToolValidationEntry {
    tool_id: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ConfigureResponse {
    success: bool,
    needs_credentials: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing_variables: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    oauth2_servers: Option<Vec<OAuth2ServerStatus>>,
    tool_validation: Vec<ToolValidationEntry>,
}

/// `POST /api/projects/{id}/configure`: replaces the project's
/// `Capabilities` wholesale, runs OAuth2 discovery per remote server, then validates
/// every tool — skipping servers still waiting on OAuth2 credentials.
#[utoipa::path(
        post,
        path = "/api/projects/{id}/configure",
        tags = [SERVICE_ROUTE_KEY],
        params(("id" = String, Path, description = "Project id")),
        request_body = Capabilities,
        responses(
            (status = 200, description = "Configuration result", body = ConfigureResponse),
        ),
        summary = "Configure a project's capabilities",
        operation_id = "configureProject",
)]
async fn route_configure_project(
    State(state): State<Arc<RouterState>>,
    AxumPath(id): AxumPath<String>,
    Json(mut capabilities): Json<Capabilities>,
) -> JsonResponse<ConfigureResponse, CommonError> {
    let result = async {
        let project = state
            .store
            .get_or_create_project(&id, &project_path_for(&state.data_dir, &id)?)
            .await?;

        let http = reqwest::Client::new();
        let mut oauth2_servers = Vec::new();
        for server in &mut capabilities.servers {
            let McpServerTransport::Remote { url } = &server.def.transport else {
                continue;
            };
            if server.def.oauth2.is_some() {
                continue;
            }
            if let Some(discovered) = capa_oauth::detect_oauth2_requirement(&http, url).await.unwrap_or(None) {
                server.def.oauth2 = Some(discovered);
            }
        }

        for server in &capabilities.servers {
            if server.def.oauth2.is_some() {
                let is_connected = state.store.get_token(&id, &server.id).await?.is_some();
                oauth2_servers.push(OAuth2ServerStatus {
                        server_id: server.id.clone(),
                        is_connected,
                });
            }
        }

        state.store.set_capabilities(&project.id, &capabilities).await?;

        let variables = state.store.list_variables(&id).await?;
        let mut missing_variables = Vec::new();
        let mut tool_validation = Vec::new();

        for tool in &capabilities.tools {
            let pending_oauth = match &tool.def {
                ToolDef::Mcp(def) => capabilities
                    .server(def.server_id())
                    .map(|s| s.def.oauth2.as_ref())
                    .map(|oauth2| oauth2_pending(oauth2, &oauth2_servers, def.server_id()))
                    .unwrap_or(false),
                ToolDef::Command(_) => false,
            };
            if pending_oauth {
                continue;
            }

            match &tool.def {
                ToolDef::Command(def) => {
                    let mut refs = referenced_variables(&def.run.cmd);
                    if let Some(init) = &def.init {
                        refs.extend(referenced_variables(&init.cmd));
                    }
                    let unresolved: Vec<String> = refs.into_iter().filter(|v| !variables.contains_key(v)).collect();
                    if unresolved.is_empty() {
                        tool_validation.push(ToolValidationEntry {
                                tool_id: tool.id.clone(),
                                ok: true,
                                error: None,
                        });
                    } else {
                        missing_variables.extend(unresolved.iter().cloned());
                        tool_validation.push(ToolValidationEntry {
                                tool_id: tool.id.clone(),
                                ok: false,
                                error: Some(format!("unresolved variables: {}", unresolved.join(", "))),
                        });
                    }
                }
                ToolDef::Mcp(def) => {
                    let Some(server) = capabilities.server(def.server_id()) else {
                        tool_validation.push(ToolValidationEntry {
                                tool_id: tool.id.clone(),
                                ok: false,
                                error: Some(format!("server '{}' not declared", def.server_id())),
                        });
                        continue;
                    };
                    match state.proxy.list_tools(&id, Path::new(&project.path), server).await {
                        Ok(tools) => {
                            let found = tools
                                .as_array()
                                .map(|items| {
                                    items
                                        .iter()
                                        .any(|t| t.get("name").and_then(|n| n.as_str()) == Some(def.tool.as_str()))
                            })
                                .unwrap_or(false);
                            tool_validation.push(ToolValidationEntry {
                                    tool_id: tool.id.clone(),
                                    ok: found,
                                    error: if found {
                                        None
                                    } else {
                                        Some(format!("tool '{}' not found on server", def.tool))
                                    },
                            });
                        }
                        Err(e) => tool_validation.push(ToolValidationEntry {
                                tool_id: tool.id.clone(),
                                ok: false,
                                error: Some(e.to_string()),
                        }),
                    }
                }
            }
        }

        missing_variables.sort();
        missing_variables.dedup();

        let needs_credentials =
        !missing_variables.is_empty() || oauth2_servers.iter().any(|s| !s.is_connected);

        Ok(ConfigureResponse {
                success: tool_validation.iter().all(|t| t.ok),
                needs_credentials,
                missing_variables: (!missing_variables.is_empty()).then_some(missing_variables),
                oauth2_servers: (!oauth2_servers.is_empty()).then_some(oauth2_servers),
                tool_validation,
        })
    }
        .await;
    JsonResponse::from(result)
}

fn oauth2_pending(oauth2: Option<&OAuth2ServerConfig>, statuses: &[OAuth2ServerStatus], server_id: &str) -> bool {
    if oauth2.is_none() {
        return false;
    }
    statuses
        .iter()
        .find(|s| s.server_id == server_id)
        .map(|s| !s.is_connected)
        .unwrap_or(false)
}

/// Existing projects keep their registered path; a project seen for the first time is
/// recorded under `<data_dir>/projects/<id>`, created on disk immediately so it's a
/// valid `cwd` for any `Subprocess`-transport MCP server configured against it —
/// `configure` carries no filesystem path of its own (the broker's control API
/// addresses projects by id).
fn project_path_for(data_dir: &Path, id: &str) -> Result<String, CommonError> {
    let path = data_dir.join("projects").join(id);
    std::fs::create_dir_all(&path)?;
    Ok(path.to_string_lossy().into_owned())
}

/// Collects `${Name}` references from a command template, mirroring
/// [`capa_shared::variables::substitute_variables`]'s token grammar without actually
/// substituting, so `configure` can report which ones are missing up front.
fn referenced_variables(template: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        let after_marker = &rest[start + 2..];
        match after_marker.find('}') {
            Some(end) => {
                names.push(after_marker[..end].to_string());
                rest = &after_marker[end + 1..];
            }
            None => break,
        }
    }
    names
}
