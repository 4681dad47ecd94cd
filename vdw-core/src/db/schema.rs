/// One schema step. Steps are applied in order inside a single transaction,
/// each recorded in the `migrations` ledger and stamped into `PRAGMA user_version`.
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const SCHEMA_VERSION: u32 = 2;

pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "MCP Box registry: tools, capabilities, dependencies, vulnerabilities, performance logs",
        sql: REGISTRY_SCHEMA,
    },
    Migration {
        version: 2,
        description: "Project contexts for the phase workflow",
        sql: PROJECT_SCHEMA,
    },
];

pub const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS migrations (
    migration_id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL UNIQUE,
    description TEXT NOT NULL,
    applied_at TEXT NOT NULL
);
"#;

const REGISTRY_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tools (
    tool_id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    version TEXT NOT NULL DEFAULT '1.0.0',
    location TEXT,
    input_schema JSON,
    output_schema JSON,
    created_by TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_used TEXT,
    usage_count INTEGER NOT NULL DEFAULT 0 CHECK (usage_count >= 0),
    success_rate REAL NOT NULL DEFAULT 1.0 CHECK (success_rate >= 0.0 AND success_rate <= 1.0),
    average_duration REAL NOT NULL DEFAULT 0.0 CHECK (average_duration >= 0.0),
    deprecated INTEGER NOT NULL DEFAULT 0,
    deprecation_reason TEXT,
    replacement_tool_id TEXT REFERENCES tools(tool_id),
    metadata JSON NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS capabilities (
    capability_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    category TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tool_capabilities (
    tool_id TEXT NOT NULL REFERENCES tools(tool_id),
    capability_id TEXT NOT NULL REFERENCES capabilities(capability_id),
    strength REAL NOT NULL DEFAULT 1.0 CHECK (strength >= 0.0 AND strength <= 1.0),
    confidence REAL NOT NULL DEFAULT 1.0 CHECK (confidence >= 0.0 AND confidence <= 1.0),
    created_at TEXT NOT NULL,
    PRIMARY KEY (tool_id, capability_id)
);

CREATE TABLE IF NOT EXISTS dependencies (
    dependent_tool_id TEXT NOT NULL REFERENCES tools(tool_id),
    dependency_tool_id TEXT NOT NULL REFERENCES tools(tool_id),
    dependency_type TEXT NOT NULL DEFAULT 'requires' CHECK (dependency_type IN ('requires', 'optional', 'conflicts')),
    created_at TEXT NOT NULL,
    PRIMARY KEY (dependent_tool_id, dependency_tool_id),
    CHECK (dependent_tool_id <> dependency_tool_id)
);

CREATE TABLE IF NOT EXISTS vulnerabilities (
    vulnerability_id TEXT PRIMARY KEY,
    tool_id TEXT NOT NULL REFERENCES tools(tool_id),
    severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high', 'critical')),
    description TEXT NOT NULL,
    cve_id TEXT,
    discovered_at TEXT NOT NULL,
    patched_at TEXT,
    patched_in_version TEXT
);

CREATE TABLE IF NOT EXISTS performance_logs (
    log_id TEXT PRIMARY KEY,
    tool_id TEXT NOT NULL REFERENCES tools(tool_id),
    project_id TEXT,
    execution_start TEXT NOT NULL,
    execution_end TEXT NOT NULL,
    duration_ms REAL NOT NULL CHECK (duration_ms >= 0.0),
    success INTEGER NOT NULL,
    error_message TEXT,
    input_size_bytes INTEGER,
    output_size_bytes INTEGER,
    memory_usage_mb REAL,
    cpu_usage_percent REAL,
    metadata JSON NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_tools_created_by ON tools(created_by);
CREATE INDEX IF NOT EXISTS idx_tools_deprecated ON tools(deprecated);
CREATE INDEX IF NOT EXISTS idx_tool_capabilities_capability ON tool_capabilities(capability_id);
CREATE INDEX IF NOT EXISTS idx_dependencies_dependency ON dependencies(dependency_tool_id);
CREATE INDEX IF NOT EXISTS idx_vulnerabilities_tool ON vulnerabilities(tool_id);
CREATE INDEX IF NOT EXISTS idx_performance_logs_tool ON performance_logs(tool_id);
CREATE INDEX IF NOT EXISTS idx_performance_logs_project ON performance_logs(project_id);
"#;

const PROJECT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    current_phase TEXT NOT NULL,
    initial_vibe TEXT NOT NULL,
    context JSON NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_projects_phase ON projects(current_phase);
"#;
