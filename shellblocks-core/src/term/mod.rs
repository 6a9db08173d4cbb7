//! Terminal-side scanning that runs *before* style parsing.
//!
//! - `osc`: streaming OSC scanner (OSC 7 cwd, OSC 133 shell-integration markers)

pub mod osc;

pub use osc::{OscEvent, OscScanner};
