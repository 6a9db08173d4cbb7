//! Persistence boundary.
//!
//! The lifecycle manager writes through this trait synchronously on create and
//! on every status transition; output is written once the block is final.
//! `MemoryStore` backs tests and short-lived sessions, `Vault` is the SQLite
//! implementation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;

use crate::blocks::{BlockId, BlockOutput, BlockStatus, CommandBlock};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt row for block {id}: {reason}")]
    Corrupt { id: String, reason: String },

    #[error("block {0} not found")]
    NotFound(BlockId),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub trait BlockStore: Send + Sync {
    fn insert(&self, block: &CommandBlock) -> StoreResult<()>;

    fn update_output(&self, id: BlockId, output: &BlockOutput) -> StoreResult<()>;

    fn update_status(
        &self,
        id: BlockId,
        status: BlockStatus,
        exit_code: Option<i32>,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()>;

    /// Returns whether a row was removed.
    fn delete(&self, id: BlockId) -> StoreResult<bool>;

    /// Most recent `limit` blocks, newest first.
    fn recent(&self, limit: usize) -> StoreResult<Vec<CommandBlock>>;

    fn count(&self) -> StoreResult<usize>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: Mutex<HashMap<BlockId, CommandBlock>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BlockId) -> Option<CommandBlock> {
        self.rows.lock().get(&id).cloned()
    }
}

impl BlockStore for MemoryStore {
    fn insert(&self, block: &CommandBlock) -> StoreResult<()> {
        self.rows.lock().insert(block.id, block.clone());
        Ok(())
    }

    fn update_output(&self, id: BlockId, output: &BlockOutput) -> StoreResult<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.output = output.clone();
        Ok(())
    }

    fn update_status(
        &self,
        id: BlockId,
        status: BlockStatus,
        exit_code: Option<i32>,
        ended_at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        let mut rows = self.rows.lock();
        let row = rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        row.status = status;
        row.exit_code = exit_code;
        row.ended_at = ended_at;
        Ok(())
    }

    fn delete(&self, id: BlockId) -> StoreResult<bool> {
        Ok(self.rows.lock().remove(&id).is_some())
    }

    fn recent(&self, limit: usize) -> StoreResult<Vec<CommandBlock>> {
        let rows = self.rows.lock();
        let mut all: Vec<CommandBlock> = rows.values().cloned().collect();
        all.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        all.truncate(limit);
        Ok(all)
    }

    fn count(&self) -> StoreResult<usize> {
        Ok(self.rows.lock().len())
    }
}
