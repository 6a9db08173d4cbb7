// shellblocks-core/src/vault/schema.rs
/// The initial schema for the block Vault.
pub const MIGRATION_INIT: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id TEXT PRIMARY KEY,
    start_time INTEGER NOT NULL,
    end_time INTEGER
);

CREATE TABLE IF NOT EXISTS blocks (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    command TEXT NOT NULL,
    output TEXT NOT NULL DEFAULT '',
    spans TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    exit_code INTEGER,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    directory TEXT NOT NULL,
    expanded INTEGER NOT NULL DEFAULT 1,
    FOREIGN KEY(session_id) REFERENCES session(id)
);

CREATE INDEX IF NOT EXISTS idx_blocks_started_at ON blocks(started_at);
CREATE INDEX IF NOT EXISTS idx_blocks_session ON blocks(session_id);
"#;
