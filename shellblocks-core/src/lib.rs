pub mod ansi;
pub mod batcher;
pub mod blocks;
pub mod boundary;
pub mod config;
pub mod cwd;
pub mod error;
pub mod lifecycle;
pub mod session;
pub mod store;
pub mod term;
pub mod vault;

// Re-export the main struct so users can just use `shellblocks_core::BlockLifecycle`
pub use lifecycle::{BlockLifecycle, BlockList, LifecycleEvent};

// Re-export the simpler types for the UI
pub use ansi::{Rgb, Style, Theme};
pub use blocks::{BlockId, BlockStatus, CommandBlock, OutputFragment, Stream, StyleSpan};
pub use config::PipelineConfig;
pub use error::{BlockError, StateError};
