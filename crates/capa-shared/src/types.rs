use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

/// A project-scoped declaration of skills, MCP servers, tools, and options.
/// Supplied wholesale by the external capabilities-file parser; the core never
/// partially mutates this value, only replaces it.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, Default)]
pub struct Capabilities {
    #[serde(default)]
    pub providers: HashSet<String>,
    #[serde(default)]
    pub skills: Vec<Skill>,
    #[serde(default)]
    pub servers: Vec<McpServer>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub options: CapabilitiesOptions,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CapabilitiesOptions {
    #[serde(default)]
    pub tool_exposure: ToolExposure,
}

impl Default for CapabilitiesOptions {
    fn default() -> Self {
        Self {
            tool_exposure: ToolExposure::ExposeAll,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ToolExposure {
    #[default]
    ExposeAll,
    OnDemand,
}

/// A named bundle of agent instructions; the core only reads `id` and `requires`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Skill {
    pub id: String,
    #[serde(default)]
    pub requires: HashSet<String>,
    /// Opaque fields the capabilities-file parser attaches (title, body, …) that the
    /// core doesn't interpret but must round-trip when capabilities are read back.
    #[serde(flatten, default)]
    pub extra: serde_json::Map<String, Value>,
}

/// `{ id, def: { url? | cmd?+args?+env?+cwd?, headers?, oauth2?, tlsSkipVerify? } }`.
/// Exactly one of `url` / `cmd` must be set on `def`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct McpServer {
    pub id: String,
    pub def: McpServerDef,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct McpServerDef {
    #[serde(flatten)]
    pub transport: McpServerTransport,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub oauth2: Option<OAuth2ServerConfig>,
    #[serde(default, rename = "tlsSkipVerify")]
    pub tls_skip_verify: bool,
}

/// Tagged variant replacing the source's dynamic dispatch on server `cmd|url`:
/// exactly one of these two shapes is present on the wire, distinguished by which of
/// `cmd`/`url` the JSON object carries.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(untagged)]
pub enum McpServerTransport {
    Subprocess {
        cmd: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    Remote {
        url: String,
    },
}

/// Populated by the OAuth2 Manager during `configure` once discovery has run.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OAuth2ServerConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub resource_server: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// `{ id, type: "command"|"mcp", def }`. For `type="mcp"`,
/// `def = { server: "@serverId", tool: remoteToolName }`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Tool {
    pub id: String,
    #[serde(flatten)]
    pub def: ToolDef,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "def", rename_all = "lowercase")]
pub enum ToolDef {
    Command(CommandToolDef),
    Mcp(McpToolDef),
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommandToolDef {
    #[serde(default)]
    pub init: Option<CommandSpec>,
    pub run: CommandSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommandSpec {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<CommandArgSpec>,
}

/// Describes one `{argName}` placeholder accepted by a command tool's `run.cmd`;
/// used to synthesize an `inputSchema` for command-type tools.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct CommandArgSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct McpToolDef {
    /// The `"@id"` presentation form; use [`McpToolDef::server_id`] to strip it.
    pub server: String,
    pub tool: String,
}

impl McpToolDef {
    /// Strips the `@` prefix once at the boundary, per the resolved design decision: downstream code compares
    /// plain ids, never the presentation form.
    pub fn server_id(&self) -> &str {
        self.server.strip_prefix('@').unwrap_or(&self.server)
    }
}

impl Capabilities {
    pub fn skill(&self, id: &str) -> Option<&Skill> {
        self.skills.iter().find(|s| s.id == id)
    }

    pub fn server(&self, id: &str) -> Option<&McpServer> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn tool(&self, id: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.id == id)
    }

    /// Tool ids that originate from an MCP server whose capability originates from a
    /// plugin, i.e. every `mcp`-type tool id. The core does not distinguish "plugin"
    /// servers from manually declared ones — every `mcp`-typed tool is always-on.
    pub fn plugin_tool_ids(&self) -> HashSet<String> {
        self.tools
            .iter()
            .filter(|t| matches!(t.def, ToolDef::Mcp(_)))
            .map(|t| t.id.clone())
            .collect()
    }

    /// Union of every skill's `requires`, used by `expose-all` mode and by
    /// `getAllRequiredToolsForProject`.
    pub fn all_required_tool_ids(&self) -> HashSet<String> {
        let mut required: HashSet<String> = self
            .skills
            .iter()
            .flat_map(|s| s.requires.iter().cloned())
            .collect();
        required.extend(self.plugin_tool_ids());
        required
    }
}
