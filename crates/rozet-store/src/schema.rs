/// SQL DDL for the control-room database.
/// WAL mode + foreign keys enabled at connection time.
///
/// Identifiers are opaque strings, length-guarded by CHECK constraints;
/// alphabet validation happens in the repos before any write. Agent names
/// are unique per session case-insensitively (NOCASE index).
pub const SCHEMA_VERSION: u32 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 128),
    tenant_id TEXT CHECK (tenant_id IS NULL OR length(tenant_id) <= 128),
    working_dir TEXT NOT NULL,
    provider_config TEXT,
    status TEXT NOT NULL DEFAULT 'active',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    archived_at TEXT
);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 128),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    name TEXT NOT NULL,
    system_prompt TEXT,
    model TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'idle',
    capabilities INTEGER NOT NULL DEFAULT 0,
    max_context INTEGER,
    current_command_id TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost_cents REAL NOT NULL DEFAULT 0.0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS commands (
    id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 128),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    agent_id TEXT NOT NULL REFERENCES agents(id),
    command TEXT NOT NULL,
    arguments TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    result TEXT,
    error TEXT,
    log TEXT,
    log_ref TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 128),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    description TEXT NOT NULL,
    spec TEXT,
    status TEXT NOT NULL DEFAULT 'queued',
    result TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    started_at TEXT,
    completed_at TEXT
);

CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 128),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    type TEXT NOT NULL,
    target_id TEXT CHECK (target_id IS NULL OR length(target_id) <= 128),
    status TEXT NOT NULL DEFAULT 'queued',
    result TEXT,
    error TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    completed_at TEXT,
    expires_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY CHECK (length(id) BETWEEN 1 AND 128),
    session_id TEXT NOT NULL REFERENCES sessions(id),
    agent_id TEXT REFERENCES agents(id),
    path TEXT NOT NULL,
    storage_url TEXT,
    size_bytes INTEGER NOT NULL DEFAULT 0,
    content_type TEXT,
    tier TEXT NOT NULL DEFAULT 'hot',
    cold_since TEXT,
    force_retain INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_agents_session_name
    ON agents(session_id, name COLLATE NOCASE);
CREATE INDEX IF NOT EXISTS idx_sessions_tenant_status ON sessions(tenant_id, status);
CREATE INDEX IF NOT EXISTS idx_agents_session ON agents(session_id);
CREATE INDEX IF NOT EXISTS idx_commands_session_status ON commands(session_id, status);
CREATE INDEX IF NOT EXISTS idx_tasks_session_status ON tasks(session_id, status);
CREATE INDEX IF NOT EXISTS idx_operations_session_status ON operations(session_id, status);
CREATE INDEX IF NOT EXISTS idx_operations_expires ON operations(expires_at);
CREATE INDEX IF NOT EXISTS idx_artifacts_session ON artifacts(session_id);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER NOT NULL
);
"#;

pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;
PRAGMA busy_timeout = 5000;
PRAGMA synchronous = NORMAL;
"#;
