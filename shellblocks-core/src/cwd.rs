//! Current Working Directory tracking.
//!
//! Two update paths:
//! 1. **Inference**: parse `cd`/`chdir`/`pushd` in the issued command text and
//!    resolve the argument lexically against the tracked directory.
//! 2. **Snapshot**: an authoritative value from the session (OSC 7, an
//!    environment report) overwrites whatever was inferred.
//!
//! Resolution is purely textual: the filesystem is never consulted, so a
//! tracked path may not exist. `is_valid_directory` asks the session and is
//! advisory only.

use crate::session::SessionBoundary;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryTracker {
    current: String,
    previous: Option<String>,
    home: String,
}

impl DirectoryTracker {
    pub fn new(initial: impl Into<String>, home: impl Into<String>) -> Self {
        let home = normalize(&home.into());
        let initial = initial.into();
        let current = if initial.trim().is_empty() {
            home.clone()
        } else {
            normalize(&initial)
        };
        Self {
            current,
            previous: None,
            home,
        }
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn home(&self) -> &str {
        &self.home
    }

    /// Inspect a command and apply every directory change it contains, in
    /// order (`cd /a && cd b` ends in `/a/b`). Returns the new directory if it
    /// changed.
    pub fn on_command(&mut self, command: &str) -> Option<String> {
        let before = self.current.clone();
        for segment in split_segments(command) {
            if let Some(target) = cd_target(segment) {
                self.change_to(target);
            }
        }
        if self.current != before {
            tracing::debug!(from = %before, to = %self.current, "cwd inferred from command");
            Some(self.current.clone())
        } else {
            None
        }
    }

    /// Authoritative directory from the session; always wins.
    pub fn apply_snapshot(&mut self, path: &str) {
        let path = path.trim();
        if path.is_empty() {
            return;
        }
        let path = normalize(path);
        if path != self.current {
            tracing::debug!(from = %self.current, to = %path, "cwd snapshot");
            self.previous = Some(std::mem::replace(&mut self.current, path));
        }
    }

    /// Resolve `target` against the tracked directory without changing it.
    pub fn resolve(&self, target: Option<&str>) -> String {
        match target {
            None => self.home.clone(),
            Some("-") => self
                .previous
                .clone()
                .unwrap_or_else(|| self.current.clone()),
            Some(t) if t == "~" => self.home.clone(),
            Some(t) if t.starts_with("~/") => normalize(&format!("{}/{}", self.home, &t[2..])),
            Some(t) if is_absolute(t) => normalize(t),
            Some(t) => normalize(&format!("{}/{}", self.current, t)),
        }
    }

    /// Ask the session whether `path` exists. Never blocks tracking.
    pub fn is_valid_directory(&self, path: &str, session: &dyn SessionBoundary) -> bool {
        session.directory_exists(path)
    }

    fn change_to(&mut self, target: Option<&str>) {
        let next = self.resolve(target);
        if next != self.current {
            self.previous = Some(std::mem::replace(&mut self.current, next));
        }
    }
}

/// Split on the shell list operators we follow (`;` and `&&`). `||` branches
/// only run on failure, so anything after one is ignored.
fn split_segments(command: &str) -> Vec<&str> {
    let head = command.split("||").next().unwrap_or("");
    head.split(';')
        .flat_map(|s| s.split("&&"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// `Some(None)` for a bare `cd`, `Some(Some(arg))` for `cd arg`, `None` if
/// the segment is not a directory change.
fn cd_target(segment: &str) -> Option<Option<&str>> {
    let mut parts = segment.splitn(2, char::is_whitespace);
    let verb = parts.next()?;
    if !matches!(verb, "cd" | "chdir" | "pushd") {
        return None;
    }
    let arg = parts
        .next()
        .map(str::trim)
        .map(|a| a.trim_matches('"').trim_matches('\''))
        .filter(|a| !a.is_empty());
    Some(arg)
}

fn is_absolute(path: &str) -> bool {
    path.starts_with('/') || path.starts_with('\\') || has_drive_prefix(path)
}

fn has_drive_prefix(path: &str) -> bool {
    let b = path.as_bytes();
    b.len() >= 2 && b[0].is_ascii_alphabetic() && b[1] == b':'
}

/// Collapse `.`, `..` and repeated separators.
fn normalize(path: &str) -> String {
    let (prefix, rest) = if has_drive_prefix(path) {
        (&path[..2], &path[2..])
    } else {
        ("", path)
    };

    let mut parts: Vec<&str> = Vec::new();
    for part in rest.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            p => parts.push(p),
        }
    }

    if prefix.is_empty() {
        format!("/{}", parts.join("/"))
    } else {
        format!("{}\\{}", prefix, parts.join("\\"))
    }
}
