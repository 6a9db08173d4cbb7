//! Command boundary detection.
//!
//! The shell never says "done" on a plain byte stream, so two heuristics decide:
//! 1. **Prompt**: the last line of output looks like a shell prompt.
//! 2. **Quiet period**: nothing new arrived for a while (default 2 s).
//!
//! Only the *last* line is inspected. A prompt-looking line in the middle of
//! the output (`echo 'user@host:~$ '`, a `$ 5` price tag) must not end the block.

use std::sync::LazyLock;
use std::time::{Duration, Instant};

use regex::Regex;

pub const DEFAULT_QUIET_PERIOD: Duration = Duration::from_secs(2);

/// A named prompt shape.
#[derive(Debug, Clone)]
pub struct PromptPattern {
    pub name: &'static str,
    regex: Regex,
}

impl PromptPattern {
    pub fn new(name: &'static str, pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            name,
            regex: Regex::new(pattern)?,
        })
    }

    pub fn is_match(&self, line: &str) -> bool {
        self.regex.is_match(line)
    }
}

/// Built-in prompt shapes, most specific first.
static DEFAULT_PATTERNS: LazyLock<Vec<PromptPattern>> = LazyLock::new(|| {
    [
        // user@host:~/src$
        ("user_host", r"^[\w.+-]+@[\w.-]+:\S*\s?[$#%>]\s*$"),
        // [user@host src]$
        ("bracketed", r"^\[[\w.+-]+@[\w.-]+[^\]]*\][$#%]\s*$"),
        // PS C:\Users\me>
        ("powershell", r"^PS [^>]*>\s*$"),
        // ~/src $   /tmp#   C:\Windows>
        ("bare_path", r"^(~|/|[A-Za-z]:\\)\S*\s?[$#%>]\s*$"),
        // $   #   >
        ("plain", r"^[$#%>]\s*$"),
    ]
    .into_iter()
    .filter_map(|(name, re)| PromptPattern::new(name, re).ok())
    .collect()
});

/// Why a block is considered finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSignal {
    /// The last output line matched the named prompt pattern.
    Prompt { pattern: &'static str },
    /// Nothing arrived within the quiet period.
    QuietPeriod,
    /// The shell reported completion itself (OSC 133;D).
    Marker { exit_code: Option<i32> },
}

#[derive(Debug, Clone)]
pub struct BoundaryDetector {
    patterns: Vec<PromptPattern>,
    quiet_period: Duration,
    last_output: Instant,
}

impl Default for BoundaryDetector {
    fn default() -> Self {
        Self::new(DEFAULT_QUIET_PERIOD)
    }
}

impl BoundaryDetector {
    pub fn new(quiet_period: Duration) -> Self {
        Self::with_patterns(DEFAULT_PATTERNS.clone(), quiet_period)
    }

    pub fn with_patterns(patterns: Vec<PromptPattern>, quiet_period: Duration) -> Self {
        Self {
            patterns,
            quiet_period,
            last_output: Instant::now(),
        }
    }

    pub fn quiet_period(&self) -> Duration {
        self.quiet_period
    }

    /// Start tracking a new command.
    pub fn reset(&mut self) {
        self.last_output = Instant::now();
    }

    pub fn update_last_output_time(&mut self) {
        self.update_last_output_time_at(Instant::now());
    }

    pub fn update_last_output_time_at(&mut self, now: Instant) {
        self.last_output = now;
    }

    /// Test the last line of `output` against the prompt patterns in order.
    /// Returns the name of the first pattern that matched.
    pub fn detect(&self, output: &str) -> Option<&'static str> {
        let line = last_line(output);
        if line.trim().is_empty() {
            return None;
        }
        self.patterns
            .iter()
            .find(|p| p.is_match(line))
            .map(|p| p.name)
    }

    pub fn check_timeout(&self) -> bool {
        self.check_timeout_at(Instant::now())
    }

    pub fn check_timeout_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_output) >= self.quiet_period
    }
}

/// The unterminated last line of `output`, after any carriage-return
/// overwrite. Output ending in a line terminator has an empty last line: the
/// shell has not printed a prompt yet.
fn last_line(output: &str) -> &str {
    let line = match output.rfind('\n') {
        Some(pos) => &output[pos + 1..],
        None => output,
    };
    match line.rfind('\r') {
        Some(pos) => &line[pos + 1..],
        None => line,
    }
}
