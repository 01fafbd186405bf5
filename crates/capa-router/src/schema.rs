use std::path::Path;

use capa_shared::error::CommonError;
use capa_shared::types::{Capabilities, Tool, ToolDef};
use serde_json::{Value, json};
use tracing::warn;

use crate::state::RouterState;

/// A stub `inputSchema` returned when the upstream MCP server can't be reached (/// "On upstream failure a stub schema is returned, but the tool remains listed").
fn stub_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

/// Synthesizes an `inputSchema` for a `command`-type tool from its `run.args` list.
fn command_schema(def: &capa_shared::types::CommandToolDef) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for arg in &def.run.args {
        let mut prop = serde_json::Map::new();
        prop.insert("type".to_string(), json!("string"));
        if let Some(description) = &arg.description {
            prop.insert("description".to_string(), json!(description));
        }
        properties.insert(arg.name.clone(), Value::Object(prop));
        if arg.required {
            required.push(arg.name.clone());
        }
    }
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Resolves and caches the `inputSchema` for one tool ("Tool schema resolution").
/// `mcp`-type tools are resolved via a live `tools/list` call to the backing server,
/// memoized per `(project_id, tool_id)` for the process lifetime; `command`-type tools
/// are synthesized locally and not cached (cheap, and always current).
pub async fn resolve_schema(
    state: &RouterState,
    project_id: &str,
    project_path: &Path,
    capabilities: &Capabilities,
    tool: &Tool,
) -> Value {
    match &tool.def {
        ToolDef::Command(def) => command_schema(def),
        ToolDef::Mcp(def) => {
            let cache_key = (project_id.to_string(), tool.id.clone());
            if let Some(cached) = state.schema_cache.get(&cache_key) {
                return cached.clone();
            }

            let schema = match fetch_mcp_schema(state, project_id, project_path, capabilities, def).await {
                Ok(Some(schema)) => schema,
                Ok(None) => {
                    warn!(tool_id = %tool.id, "upstream tool not found while resolving schema");
                    stub_schema()
                }
                Err(e) => {
                    warn!(tool_id = %tool.id, error = %e, "failed to resolve tool schema from upstream");
                    stub_schema()
                }
            };

            state.schema_cache.insert(cache_key, schema.clone());
            schema
        }
    }
}

async fn fetch_mcp_schema(
    state: &RouterState,
    project_id: &str,
    project_path: &Path,
    capabilities: &Capabilities,
    def: &capa_shared::types::McpToolDef,
) -> Result<Option<Value>, CommonError> {
    let server = capabilities
        .server(def.server_id())
        .ok_or_else(|| CommonError::InvalidRequest {
            msg: format!("mcp server '{}' not found in capabilities", def.server_id()),
            source: None,
    })?;

    let result = state.proxy.list_tools(project_id, project_path, server).await?;
    let tools = result.as_array().cloned().unwrap_or_default();
    Ok(tools
        .iter()
        .find(|t| t.get("name").and_then(Value::as_str) == Some(def.tool.as_str()))
        .and_then(|t| t.get("inputSchema").cloned()))
}
