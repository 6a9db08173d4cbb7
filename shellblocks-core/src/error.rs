//! Error taxonomy for the block pipeline.
//!
//! Four categories, one variant each:
//! - `Validation`: bad input the caller should never have sent (blank command, unknown id)
//! - `State`: an illegal lifecycle transition (a bug upstream, always surfaced)
//! - `Parse`: a malformed escape sequence (recovered inside the parser, never returned publicly)
//! - `BoundaryIo`: a failure delegated from the session or persistence boundary

use thiserror::Error;

use crate::blocks::{BlockId, BlockStatus};

/// Which external boundary produced a `BoundaryIo` error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Session,
    Store,
}

impl std::fmt::Display for Boundary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Boundary::Session => f.write_str("session"),
            Boundary::Store => f.write_str("store"),
        }
    }
}

/// An illegal lifecycle transition.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("block {id}: cannot {action} while {status}")]
    IllegalTransition {
        id: BlockId,
        action: &'static str,
        status: BlockStatus,
    },

    #[error("block {id}: another block ({executing}) is already executing")]
    AlreadyExecuting { id: BlockId, executing: BlockId },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BlockError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("malformed escape sequence {sequence:?}")]
    Parse { sequence: String },

    #[error("{boundary} boundary failed: {message}")]
    BoundaryIo { boundary: Boundary, message: String },
}

impl BlockError {
    pub fn unknown_block(id: BlockId) -> Self {
        BlockError::Validation(format!("unknown block id {id}"))
    }

    pub fn session(message: impl Into<String>) -> Self {
        BlockError::BoundaryIo {
            boundary: Boundary::Session,
            message: message.into(),
        }
    }

    pub fn illegal(id: BlockId, action: &'static str, status: BlockStatus) -> Self {
        BlockError::State(StateError::IllegalTransition { id, action, status })
    }

    pub fn is_state_error(&self) -> bool {
        matches!(self, BlockError::State(_))
    }
}

impl From<crate::store::StoreError> for BlockError {
    fn from(e: crate::store::StoreError) -> Self {
        BlockError::BoundaryIo {
            boundary: Boundary::Store,
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BlockError>;
