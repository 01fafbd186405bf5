pub const INIT_MIGRATION_NAME: &str = "0001_init.up.sql";

pub const INIT_MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    path TEXT NOT NULL UNIQUE,
    capabilities_json TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS variables (
    project_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (project_id, key)
);

CREATE TABLE IF NOT EXISTS oauth2_tokens (
    project_id TEXT NOT NULL,
    server_id TEXT NOT NULL,
    access_token TEXT NOT NULL,
    refresh_token TEXT,
    token_type TEXT NOT NULL,
    expires_at TEXT,
    scope TEXT,
    PRIMARY KEY (project_id, server_id)
);

CREATE TABLE IF NOT EXISTS oauth2_flow_states (
    state TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    server_id TEXT NOT NULL,
    code_verifier TEXT NOT NULL,
    redirect_uri TEXT NOT NULL,
    client_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS managed_files (
    project_id TEXT NOT NULL,
    file_path TEXT NOT NULL,
    PRIMARY KEY (project_id, file_path)
);

CREATE TABLE IF NOT EXISTS mcp_subprocesses (
    project_id TEXT NOT NULL,
    server_id TEXT NOT NULL,
    config_hash TEXT NOT NULL,
    pid INTEGER,
    status TEXT NOT NULL,
    started_at TEXT NOT NULL,
    last_health_check TEXT,
    PRIMARY KEY (project_id, config_hash)
);

CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    capabilities_json TEXT NOT NULL,
    active_skills_json TEXT NOT NULL,
    available_tools_json TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_activity TEXT NOT NULL
);

-- Command-tool `def.init` bookkeeping: each tool gets at most one recorded
-- init attempt per project, re-run only after an explicit reset.
CREATE TABLE IF NOT EXISTS tool_init_state (
    project_id TEXT NOT NULL,
    tool_id TEXT NOT NULL,
    initialized INTEGER NOT NULL,
    error TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (project_id, tool_id)
);
"#;
