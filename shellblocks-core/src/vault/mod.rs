// shellblocks-core/src/vault/mod.rs

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::blocks::{BlockId, BlockOutput, BlockStatus, CommandBlock, StyleSpan};
use crate::store::{BlockStore, StoreError, StoreResult};

pub mod schema;

const BLOCK_COLUMNS: &str =
    "id, command, output, spans, status, exit_code, started_at, ended_at, directory, expanded";

// ════════════════════════════════════════════════════════════════════
// Vault
// ════════════════════════════════════════════════════════════════════

/// SQLite-backed block store. Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct Vault {
    conn: Arc<Mutex<Connection>>,
    session_id: String,
    start_time: i64,
}

impl Vault {
    /// Open the Vault at the specified path.
    /// Creates the database file and runs all migrations if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let conn = Connection::open(&path)?;

        // WAL mode for better concurrency
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    /// Throwaway database, gone when the last clone drops.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(schema::MIGRATION_INIT)?;

        let vault = Self {
            conn: Arc::new(Mutex::new(conn)),
            session_id: Uuid::new_v4().to_string(),
            start_time: Utc::now().timestamp(),
        };
        vault.start_session()?;
        Ok(vault)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    // ────────────────────────────────────────────────────────────────
    // Sessions
    // ────────────────────────────────────────────────────────────────

    fn start_session(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO session (id, start_time) VALUES (?1, ?2)",
            params![self.session_id, self.start_time],
        )?;
        Ok(())
    }

    /// Mark the current session as ended.
    pub fn close_session(&self) -> StoreResult<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE session SET end_time = ?1 WHERE id = ?2",
            params![Utc::now().timestamp(), self.session_id],
        )?;
        Ok(())
    }

    /// When this session was closed, if it has been.
    pub fn session_end_time(&self) -> StoreResult<Option<i64>> {
        let conn = self.conn.lock();
        let end = conn.query_row(
            "SELECT end_time FROM session WHERE id = ?1",
            params![self.session_id],
            |row| row.get(0),
        )?;
        Ok(end)
    }

    // ────────────────────────────────────────────────────────────────
    // Lookups
    // ────────────────────────────────────────────────────────────────

    pub fn get(&self, id: BlockId) -> StoreResult<Option<CommandBlock>> {
        let conn = self.conn.lock();
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = ?1");
        let raw = conn
            .query_row(&sql, params![id.to_string()], RawBlock::from_row)
            .optional()?;
        raw.map(RawBlock::into_block).transpose()
    }

    /// Blocks recorded by this Vault's session, oldest first.
    pub fn session_blocks(&self) -> StoreResult<Vec<CommandBlock>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE session_id = ?1 ORDER BY started_at ASC, rowid ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![self.session_id], RawBlock::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_block()?);
        }
        Ok(results)
    }
}

impl BlockStore for Vault {
    fn insert(&self, block: &CommandBlock) -> StoreResult<()> {
        let spans = serde_json::to_string(&block.output.spans)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO blocks (id, session_id, command, output, spans, status, exit_code,
                                 started_at, ended_at, directory, expanded)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                block.id.to_string(),
                self.session_id,
                block.command,
                block.output.text,
                spans,
                block.status.as_str(),
                block.exit_code,
                block.started_at.timestamp_millis(),
                block.ended_at.map(|t| t.timestamp_millis()),
                block.cwd,
                block.expanded,
            ],
        )?;
        Ok(())
    }

    fn update_output(&self, id: BlockId, output: &BlockOutput) -> StoreResult<()> {
        let spans = serde_json::to_string(&output.spans)?;
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE blocks SET output = ?1, spans = ?2 WHERE id = ?3",
            params![output.text, spans, id.to_string()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn update_status(
        &self,
        id: BlockId,
        status: BlockStatus,
        exit_code: Option<i32>,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock();
        let affected = conn.execute(
            "UPDATE blocks SET status = ?1, exit_code = ?2, ended_at = ?3 WHERE id = ?4",
            params![
                status.as_str(),
                exit_code,
                ended_at.map(|t| t.timestamp_millis()),
                id.to_string()
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }

    fn delete(&self, id: BlockId) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let affected = conn.execute("DELETE FROM blocks WHERE id = ?1", params![id.to_string()])?;
        Ok(affected > 0)
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<CommandBlock>> {
        let conn = self.conn.lock();
        let sql = format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks ORDER BY started_at DESC, rowid DESC LIMIT ?1"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit as i64], RawBlock::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_block()?);
        }
        Ok(results)
    }

    fn count(&self) -> StoreResult<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

// ════════════════════════════════════════════════════════════════════
// Row mapping
// ════════════════════════════════════════════════════════════════════

/// Column values as SQLite returns them, before validation.
struct RawBlock {
    id: String,
    command: String,
    output: String,
    spans: String,
    status: String,
    exit_code: Option<i32>,
    started_at: i64,
    ended_at: Option<i64>,
    directory: String,
    expanded: bool,
}

impl RawBlock {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            command: row.get(1)?,
            output: row.get(2)?,
            spans: row.get(3)?,
            status: row.get(4)?,
            exit_code: row.get(5)?,
            started_at: row.get(6)?,
            ended_at: row.get(7)?,
            directory: row.get(8)?,
            expanded: row.get(9)?,
        })
    }

    fn into_block(self) -> StoreResult<CommandBlock> {
        let corrupt = |reason: &str| StoreError::Corrupt {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        let id = Uuid::parse_str(&self.id).map_err(|_| corrupt("bad uuid"))?;
        let status = BlockStatus::parse(&self.status).ok_or_else(|| corrupt("bad status"))?;
        let started_at =
            DateTime::from_timestamp_millis(self.started_at).ok_or_else(|| corrupt("bad start"))?;
        let ended_at = match self.ended_at {
            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| corrupt("bad end"))?),
            None => None,
        };
        let spans: Vec<StyleSpan> = serde_json::from_str(&self.spans)?;

        Ok(CommandBlock {
            id,
            command: self.command,
            output: BlockOutput {
                text: self.output,
                spans,
            },
            status,
            exit_code: self.exit_code,
            started_at,
            ended_at,
            cwd: self.directory,
            expanded: self.expanded,
        })
    }
}
