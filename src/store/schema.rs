//! Database schema definitions

use rusqlite::Connection;
use tracing::info;

use crate::error::{GripError, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version == 0 {
        info!("Creating new database schema v{}", SCHEMA_VERSION);
        conn.execute_batch(GRAPH_SCHEMA)?;
        conn.execute_batch(LEDGER_SCHEMA)?;
        set_schema_version(conn, SCHEMA_VERSION)?;
    } else if current_version > SCHEMA_VERSION {
        return Err(GripError::Config(format!(
            "database schema v{} is newer than supported v{}",
            current_version, SCHEMA_VERSION
        )));
    } else {
        info!("Database schema is up to date (v{})", current_version);
    }

    Ok(())
}

/// Get current schema version (0 if not initialized)
fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
        [],
    )?;

    let version: i32 = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
        .unwrap_or(0);

    Ok(version)
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Contexts, context files with their wraps, and the dependency edges
const GRAPH_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS contexts (
    dig BLOB PRIMARY KEY NOT NULL,
    account_id TEXT NOT NULL,
    record TEXT NOT NULL
);

-- One row per stored context file; wrap columns are local derived state
CREATE TABLE IF NOT EXISTS context_files (
    data_dep_dig BLOB PRIMARY KEY NOT NULL,
    context BLOB NOT NULL,
    dig BLOB NOT NULL,
    content BLOB NOT NULL,
    size INTEGER NOT NULL,
    is_index INTEGER NOT NULL,
    is_snapshot INTEGER NOT NULL,
    record TEXT NOT NULL,

    head INTEGER NOT NULL,
    leaf INTEGER NOT NULL,
    depth INTEGER NOT NULL,
    covered INTEGER NOT NULL,
    unconstructable INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_context_files_context ON context_files(context, head, leaf, covered);
CREATE INDEX IF NOT EXISTS idx_context_files_content ON context_files(content);

-- Dependents index: file lists dependency in depends_on
CREATE TABLE IF NOT EXISTS context_file_deps (
    file BLOB NOT NULL,
    dependency BLOB NOT NULL,
    PRIMARY KEY (file, dependency)
);

CREATE INDEX IF NOT EXISTS idx_context_file_deps_dependency ON context_file_deps(dependency);
"#;

/// Tombstones, quarantine and account quotas
const LEDGER_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS deleted_context_files (
    data_dep_dig BLOB PRIMARY KEY NOT NULL,
    context BLOB NOT NULL,
    dig BLOB NOT NULL,
    deleted_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_deleted_context ON deleted_context_files(context);

CREATE TABLE IF NOT EXISTS quarantined_context_files (
    data_dep_dig BLOB PRIMARY KEY NOT NULL,
    context BLOB NOT NULL,
    record TEXT NOT NULL,
    reason TEXT NOT NULL,
    quarantined_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS accounts (
    account_id TEXT PRIMARY KEY NOT NULL,
    max_disk_space INTEGER NOT NULL,
    disk_space_used INTEGER NOT NULL DEFAULT 0,
    message TEXT NOT NULL DEFAULT '',
    enabled INTEGER NOT NULL DEFAULT 1
);
"#;
