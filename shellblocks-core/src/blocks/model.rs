//! Command block model.
//!
//! Status only moves forward:
//! `Pending -> Executing -> {Success | Failure | Cancelled}`.
//! `ended_at` and `exit_code` are set together, exactly when the status
//! becomes terminal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ansi::Style;
use crate::error::{BlockError, Result};

pub type BlockId = Uuid;

/// Exit code recorded for cancelled blocks (128 + SIGINT).
pub const CANCELLED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockStatus {
    Pending,
    Executing,
    Success,
    Failure,
    Cancelled,
}

impl BlockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BlockStatus::Success | BlockStatus::Failure | BlockStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockStatus::Pending => "pending",
            BlockStatus::Executing => "executing",
            BlockStatus::Success => "success",
            BlockStatus::Failure => "failure",
            BlockStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BlockStatus::Pending),
            "executing" => Some(BlockStatus::Executing),
            "success" => Some(BlockStatus::Success),
            "failure" => Some(BlockStatus::Failure),
            "cancelled" => Some(BlockStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for BlockStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which channel a fragment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Primary,
    Error,
}

impl std::fmt::Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stream::Primary => f.write_str("primary"),
            Stream::Error => f.write_str("error"),
        }
    }
}

/// A raw unit of text handed to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputFragment {
    pub block_id: BlockId,
    pub stream: Stream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl OutputFragment {
    pub fn new(block_id: BlockId, stream: Stream, text: impl Into<String>) -> Self {
        Self {
            block_id,
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn primary(block_id: BlockId, text: impl Into<String>) -> Self {
        Self::new(block_id, Stream::Primary, text)
    }

    pub fn error(block_id: BlockId, text: impl Into<String>) -> Self {
        Self::new(block_id, Stream::Error, text)
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A styled byte range of a block's plain output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleSpan {
    pub start: usize,
    pub end: usize,
    pub style: Style,
}

impl StyleSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Accumulated output: escape-free text plus spans that partition it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOutput {
    pub text: String,
    pub spans: Vec<StyleSpan>,
}

impl BlockOutput {
    /// Append a styled piece. Adjacent pieces with the same style share a span.
    pub fn push(&mut self, text: &str, style: Style) {
        if text.is_empty() {
            return;
        }
        let start = self.text.len();
        self.text.push_str(text);
        let end = self.text.len();

        match self.spans.last_mut() {
            Some(last) if last.style == style && last.end == start => last.end = end,
            _ => self.spans.push(StyleSpan { start, end, style }),
        }
    }

    /// Iterate `(slice, style)` pairs in order.
    pub fn segments(&self) -> impl Iterator<Item = (&str, Style)> + '_ {
        self.spans
            .iter()
            .map(move |s| (&self.text[s.start..s.end], s.style))
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandBlock {
    pub id: BlockId,
    pub command: String,
    pub output: BlockOutput,
    pub status: BlockStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub cwd: String,
    /// UI state only; not part of the lifecycle.
    pub expanded: bool,
}

impl CommandBlock {
    pub fn new(command: impl Into<String>, cwd: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            command: command.into(),
            output: BlockOutput::default(),
            status: BlockStatus::Pending,
            exit_code: None,
            started_at: Utc::now(),
            ended_at: None,
            cwd: cwd.into(),
            expanded: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds())
    }

    pub(crate) fn mark_executing(&mut self) -> Result<()> {
        if self.status != BlockStatus::Pending {
            return Err(BlockError::illegal(self.id, "start executing", self.status));
        }
        self.status = BlockStatus::Executing;
        Ok(())
    }

    /// Move into a terminal status. Only legal from `Executing`.
    pub(crate) fn finish(&mut self, status: BlockStatus, exit_code: i32) -> Result<()> {
        debug_assert!(status.is_terminal());
        if self.status != BlockStatus::Executing {
            let action = if status == BlockStatus::Cancelled {
                "cancel"
            } else {
                "complete"
            };
            return Err(BlockError::illegal(self.id, action, self.status));
        }
        self.status = status;
        self.exit_code = Some(exit_code);
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    /// Terminal status for a finished command's exit code.
    pub fn status_for_exit(exit_code: i32) -> BlockStatus {
        if exit_code == 0 {
            BlockStatus::Success
        } else {
            BlockStatus::Failure
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only_transitions() {
        let mut block = CommandBlock::new("make", "/src");
        assert_eq!(block.status, BlockStatus::Pending);
        assert!(block.finish(BlockStatus::Success, 0).is_err());

        block.mark_executing().unwrap();
        assert!(block.mark_executing().is_err());

        block.finish(BlockStatus::Failure, 2).unwrap();
        assert_eq!(block.exit_code, Some(2));
        assert!(block.ended_at.is_some());
        assert!(block.finish(BlockStatus::Cancelled, CANCELLED_EXIT_CODE).is_err());
        assert_eq!(block.status, BlockStatus::Failure);
    }

    #[test]
    fn test_output_spans_merge() {
        let red = Style {
            color: Some(1),
            ..Style::default()
        };
        let mut out = BlockOutput::default();
        out.push("ab", Style::default());
        out.push("cd", Style::default());
        out.push("", red);
        out.push("ef", red);

        assert_eq!(out.text, "abcdef");
        assert_eq!(out.spans.len(), 2);
        assert_eq!((out.spans[0].start, out.spans[0].end), (0, 4));
        assert_eq!((out.spans[1].start, out.spans[1].end), (4, 6));
        let pieces: Vec<&str> = out.segments().map(|(t, _)| t).collect();
        assert_eq!(pieces, vec!["abcd", "ef"]);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            BlockStatus::Pending,
            BlockStatus::Executing,
            BlockStatus::Success,
            BlockStatus::Failure,
            BlockStatus::Cancelled,
        ] {
            assert_eq!(BlockStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BlockStatus::parse("running"), None);
        assert_eq!(CommandBlock::status_for_exit(0), BlockStatus::Success);
        assert_eq!(CommandBlock::status_for_exit(-1), BlockStatus::Failure);
    }
}
