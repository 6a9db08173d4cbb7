//! Pipeline configuration.
//!
//! Every field has a default, so an empty JSON object (or no file at all) is a
//! valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ansi::Theme;
use crate::batcher::{DEFAULT_BINARY_THRESHOLD, DEFAULT_MAX_CHUNK_BYTES};
use crate::error::{BlockError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub flush_interval_ms: u64,
    pub max_chunk_bytes: usize,
    pub binary_threshold: f64,
    pub quiet_period_ms: u64,
    /// Finish the executing block when a boundary is detected.
    pub auto_complete: bool,
    pub theme: Theme,
    pub home_dir: String,
    pub history_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 16,
            max_chunk_bytes: DEFAULT_MAX_CHUNK_BYTES,
            binary_threshold: DEFAULT_BINARY_THRESHOLD,
            quiet_period_ms: 2000,
            auto_complete: true,
            theme: Theme::Dark,
            home_dir: default_home(),
            history_limit: 500,
        }
    }
}

impl PipelineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BlockError::Validation(format!("config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => Self::from_json_str(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(BlockError::Validation(format!(
                "config {}: {e}",
                path.display()
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.flush_interval_ms == 0 {
            return Err(BlockError::Validation(
                "flush_interval_ms must be greater than 0".into(),
            ));
        }
        if self.max_chunk_bytes == 0 {
            return Err(BlockError::Validation(
                "max_chunk_bytes must be greater than 0".into(),
            ));
        }
        if !(self.binary_threshold > 0.0 && self.binary_threshold <= 1.0) {
            return Err(BlockError::Validation(
                "binary_threshold must be in (0, 1]".into(),
            ));
        }
        if self.quiet_period_ms == 0 {
            return Err(BlockError::Validation(
                "quiet_period_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }
}

fn default_home() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| "/".to_string())
}
