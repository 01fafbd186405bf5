use std::path::Path;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path as AxumPath, State};
use axum::response::{IntoResponse, Response};
use capa_shared::config::PROTOCOL_VERSION;
use capa_shared::error::CommonError;
use capa_shared::types::{Capabilities, Tool, ToolDef, ToolExposure};
use http::{HeaderName, HeaderValue};
use serde_json::{Map, Value, json};

use crate::jsonrpc::{JsonRpcRequest, JsonRpcResponse, text_content, to_jsonrpc_error};
use crate::schema::resolve_schema;
use crate::state::RouterState;

const SESSION_HEADER: &str = "mcp-session-id";
const SETUP_TOOLS: &str = "setup_tools";
const CALL_TOOL: &str = "call_tool";

/// `POST /{projectId}/mcp`: one JSON-RPC request in, one JSON-RPC response
/// out. Never panics across the request boundary — every branch below returns a
/// response rather than propagating a Rust error past this function.
pub async fn route_mcp(
    State(state): State<Arc<RouterState>>,
    AxumPath(project_id): AxumPath<String>,
    headers: http::HeaderMap,
    body: Bytes,
) -> Response {
    let request: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            return axum::Json(JsonRpcResponse::parse_error(format!("invalid JSON-RPC request: {e}")))
                .into_response();
        }
    };

    let incoming_session_id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let (response, session_id) = dispatch(&state, &project_id, incoming_session_id, request).await;

    let mut http_response = axum::Json(response).into_response();
    if let Some(session_id) = session_id
    && let Ok(value) = HeaderValue::from_str(&session_id)
    {
        http_response
            .headers_mut()
            .insert(HeaderName::from_static(SESSION_HEADER), value);
    }
    http_response
}

async fn dispatch(
    state: &RouterState,
    project_id: &str,
    session_id: Option<String>,
    request: JsonRpcRequest,
) -> (JsonRpcResponse, Option<String>) {
    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => match state.sessions.create_session(project_id).await {
            Ok(session) => {
                let response = JsonRpcResponse::ok(
                    id,
                    json!({
                            "protocolVersion": PROTOCOL_VERSION,
                            "capabilities": { "tools": {} },
                            "serverInfo": { "name": "capa", "version": state.version },
                    }),
                );
                (response, Some(session.session_id))
            }
            Err(e) => (to_jsonrpc_error(id, &e), None),
        },
        "notifications/initialized" => (JsonRpcResponse::ok(id, json!({})), session_id),
        "tools/list" => {
            let response = match handle_tools_list(state, project_id, session_id.as_deref()).await {
                Ok(value) => JsonRpcResponse::ok(id, value),
                Err(e) => to_jsonrpc_error(id, &e),
            };
            (response, session_id)
        }
        "tools/call" => {
            let response = match handle_tools_call(state, project_id, session_id.as_deref(), &request.params).await
            {
                Ok(value) => JsonRpcResponse::ok(id, value),
                Err(e) => to_jsonrpc_error(id, &e),
            };
            (response, session_id)
        }
        other => (JsonRpcResponse::method_not_found(id, other), session_id),
    }
}

async fn handle_tools_list(
    state: &RouterState,
    project_id: &str,
    session_id: Option<&str>,
) -> Result<Value, CommonError> {
    let session_id = require_session(session_id)?;
    state.sessions.update_activity(session_id).await?;
    let session = require_existing_session(state, session_id).await?;

    if session.capabilities.options.tool_exposure == ToolExposure::OnDemand {
        return Ok(json!({ "tools": meta_tool_defs() }));
    }

    let tool_ids = state.sessions.all_required_tools(session_id).await?;
    let tools = describe_tools(state, project_id, &session.capabilities, &tool_ids).await?;
    Ok(json!({ "tools": tools }))
}

async fn handle_tools_call(
    state: &RouterState,
    project_id: &str,
    session_id: Option<&str>,
    params: &Value,
) -> Result<Value, CommonError> {
    let session_id = require_session(session_id)?;
    state.sessions.update_activity(session_id).await?;
    let session = require_existing_session(state, session_id).await?;

    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| CommonError::InvalidRequest {
            msg: "tools/call requires a 'name' parameter".to_string(),
            source: None,
    })?;
    let arguments = params
        .get("arguments")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    match session.capabilities.options.tool_exposure {
        ToolExposure::ExposeAll => {
            if name == SETUP_TOOLS || name == CALL_TOOL {
                return Err(CommonError::InvalidRequest {
                        msg: format!("{name} is only available in on-demand mode"),
                        source: None,
                });
            }
            let tool = session
                .capabilities
                .tool(name)
                .ok_or_else(|| CommonError::InvalidRequest {
                    msg: format!("Tool \"{name}\" not found"),
                    source: None,
            })?;
            invoke_tool(state, project_id, tool, arguments).await
        }
        ToolExposure::OnDemand => match name {
            SETUP_TOOLS => {
                let skills: Vec<String> = arguments
                    .get("skills")
                    .and_then(Value::as_array)
                    .map(|skills| {
                        skills
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                })
                    .unwrap_or_default();

                match state.sessions.setup_tools(session_id, &skills).await {
                    Ok(tool_ids) => {
                        let session = require_existing_session(state, session_id).await?;
                        let tools = describe_tools(state, project_id, &session.capabilities, &tool_ids).await?;
                        Ok(text_content(&json!({ "success": true, "tools": tools })))
                    }
                    Err(e) => Ok(text_content(&json!({ "error": e.to_string() }))),
                }
            }
            CALL_TOOL => {
                let inner_name = arguments
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CommonError::InvalidRequest {
                        msg: "call_tool requires a 'name' field".to_string(),
                        source: None,
                })?;
                let data = arguments.get("data").and_then(Value::as_object).cloned().unwrap_or_default();

                if !session.available_tools.iter().any(|id| id == inner_name) {
                    return Ok(text_content(&json!({
                                    "error": format!("Tool \"{inner_name}\" is not activated")
                    })));
                }

                let tool = session
                    .capabilities
                    .tool(inner_name)
                    .ok_or_else(|| CommonError::InvalidRequest {
                        msg: format!("Tool \"{inner_name}\" not found"),
                        source: None,
                })?;
                invoke_tool(state, project_id, tool, data).await
            }
            _ => Err(CommonError::InvalidRequest {
                    msg: "No active session. Call setup_tools first.".to_string(),
                    source: None,
            }),
        },
    }
}

async fn invoke_tool(
    state: &RouterState,
    project_id: &str,
    tool: &Tool,
    arguments: Map<String, Value>,
) -> Result<Value, CommonError> {
    match &tool.def {
        ToolDef::Command(def) => {
            let result = state
                .executor
                .run_command_tool(project_id, &tool.id, def, &arguments)
                .await?;
            Ok(text_content(&result))
        }
        ToolDef::Mcp(def) => {
            let project = project_for(state, project_id).await?;
            let project_path = Path::new(&project.path);
            let server = project
                .capabilities
                .as_ref()
                .and_then(|c| c.server(def.server_id()))
                .ok_or_else(|| CommonError::InvalidRequest {
                    msg: format!("mcp server '{}' not found in capabilities", def.server_id()),
                    source: None,
            })?;
            let result = state
                .proxy
                .call_tool(project_id, project_path, server, &def.tool, Value::Object(arguments))
                .await?;
            Ok(json!({ "content": result.get("content").cloned().unwrap_or(Value::Null) }))
        }
    }
}

async fn describe_tools(
    state: &RouterState,
    project_id: &str,
    capabilities: &Capabilities,
    tool_ids: &[String],
) -> Result<Vec<Value>, CommonError> {
    let project = project_for(state, project_id).await?;
    let project_path = Path::new(&project.path);

    let mut tools = Vec::with_capacity(tool_ids.len());
    for tool_id in tool_ids {
        let Some(tool) = capabilities.tool(tool_id) else {
            continue;
        };
        let schema = resolve_schema(state, project_id, project_path, capabilities, tool).await;
        tools.push(json!({ "name": tool.id, "inputSchema": schema }));
    }
    Ok(tools)
}

fn meta_tool_defs() -> Value {
    json!([
            {
                "name": SETUP_TOOLS,
                "description": "Activate one or more skills, making their required tools reachable",
                "inputSchema": {
                    "type": "object",
                    "properties": { "skills": { "type": "array", "items": { "type": "string" } } },
                    "required": ["skills"],
                },
            },
            {
                "name": CALL_TOOL,
                "description": "Invoke a tool that has been activated via setup_tools",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "data": { "type": "object" },
                    },
                    "required": ["name"],
                },
            },
    ])
}

fn require_session(session_id: Option<&str>) -> Result<&str, CommonError> {
    session_id.ok_or_else(|| CommonError::InvalidRequest {
            msg: "No active session. Call initialize first.".to_string(),
            source: None,
    })
}

async fn require_existing_session(
    state: &RouterState,
    session_id: &str,
) -> Result<capa_store::repository::SessionRecord, CommonError> {
    state
        .sessions
        .get_session(session_id)
        .await?
        .ok_or_else(|| CommonError::InvalidRequest {
            msg: "No active session. Call initialize first.".to_string(),
            source: None,
    })
}

async fn project_for(state: &RouterState, project_id: &str) -> Result<capa_store::repository::Project, CommonError> {
    use capa_store::repository::ProjectRepositoryLike;
    state
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| CommonError::NotFound {
            msg: format!("project '{project_id}' not found"),
            lookup_id: project_id.to_string(),
            source: None,
    })
}
