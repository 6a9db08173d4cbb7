//! Block model.
//!
//! A "block" is one issued command and everything the shell said about it:
//! - command (fixed at creation)
//! - output (escape-free text + style spans, append-only)
//! - status / exit code / timing
//! - cwd snapshot taken at creation
//!
//! The lifecycle manager owns blocks; everyone else sees cloned snapshots.

pub mod model;

pub use model::{
    BlockId, BlockOutput, BlockStatus, CommandBlock, OutputFragment, Stream, StyleSpan,
    CANCELLED_EXIT_CODE,
};
