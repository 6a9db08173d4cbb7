//! Session boundary.
//!
//! The pipeline never owns the shell process. It talks to it through
//! `SessionBoundary` (write a line, send a signal, ask about a directory) and
//! listens to `SessionEvent`s (output fragments, directory reports, liveness).
//!
//! `ProcessSession` is a minimal implementation over a piped `sh -s`
//! (`cmd` on Windows). It is enough for the probe binary and for tests; a
//! PTY-backed session plugs in through the same trait.

use std::path::Path;
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::blocks::Stream;
use crate::error::{BlockError, Result};

/// Interrupt signal number (SIGINT).
pub const SIGINT: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ready,
    Crashed,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Output {
        stream: Stream,
        text: String,
        timestamp: DateTime<Utc>,
    },
    /// Authoritative working directory reported by the session.
    Directory(String),
    Liveness(Liveness),
    /// A non-fatal transport failure.
    Failure(String),
}

impl SessionEvent {
    pub fn output(stream: Stream, text: impl Into<String>) -> Self {
        SessionEvent::Output {
            stream,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }
}

pub trait SessionBoundary: Send + Sync {
    /// Send `text` followed by a line terminator.
    fn write(&self, text: &str) -> Result<()>;

    fn signal(&self, process_id: u32, signal: i32) -> Result<()>;

    /// The process that should receive interrupts, if known.
    fn process_id(&self) -> Option<u32>;

    /// Advisory existence check; `false` never blocks tracking.
    fn directory_exists(&self, path: &str) -> bool;

    /// Interrupt the foreground process. Repeated calls are harmless.
    fn interrupt(&self) -> Result<()> {
        match self.process_id() {
            Some(pid) => self.signal(pid, SIGINT),
            None => Err(BlockError::session("no process to interrupt")),
        }
    }
}

/// Deliver `signal` to `pid` on the local machine.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: i32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let sig = Signal::try_from(signal)
        .map_err(|e| BlockError::session(format!("invalid signal {signal}: {e}")))?;
    let pid = i32::try_from(pid).map_err(|_| BlockError::session(format!("invalid pid {pid}")))?;
    kill(Pid::from_raw(pid), sig)
        .map_err(|e| BlockError::session(format!("kill({pid}, {sig}) failed: {e}")))
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: i32) -> Result<()> {
    Err(BlockError::session(format!(
        "signal {signal} to {pid}: not supported on this platform"
    )))
}

// ════════════════════════════════════════════════════════════════════
// ProcessSession
// ════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct ProcessSession {
    stdin_tx: mpsc::UnboundedSender<String>,
    pid: Option<u32>,
    markers: bool,
}

impl ProcessSession {
    /// Spawn the shell in `cwd`. Events go to the returned receiver.
    ///
    /// With `markers` on, every written command is followed by a line that
    /// prints OSC 7 (cwd) and OSC 133;D (exit code), which is what shell
    /// integration scripts do for an interactive prompt.
    pub fn spawn(
        cwd: &str,
        markers: bool,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let mut child = shell_command(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BlockError::session(format!("failed to spawn shell: {e}")))?;

        let pid = child.id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let _ = events_tx.send(SessionEvent::Liveness(Liveness::Ready));

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BlockError::session("shell pipes unavailable"));
        };

        // Writer: serialise lines onto stdin.
        let failures = events_tx.clone();
        tokio::spawn(async move {
            while let Some(line) = stdin_rx.recv().await {
                let res = async {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await
                }
                .await;
                if let Err(e) = res {
                    let _ = failures.send(SessionEvent::Failure(format!("stdin write: {e}")));
                    break;
                }
            }
        });

        let out_reader = tokio::spawn(pump(stdout, Stream::Primary, events_tx.clone()));
        let err_reader = tokio::spawn(pump(stderr, Stream::Error, events_tx.clone()));

        // Reaper: report how the shell went away once both pipes close.
        tokio::spawn(async move {
            let _ = out_reader.await;
            let _ = err_reader.await;
            let liveness = wait_liveness(&mut child).await;
            let _ = events_tx.send(SessionEvent::Liveness(liveness));
        });

        tracing::info!(?pid, cwd, "shell session started");

        Ok((
            Self {
                stdin_tx,
                pid,
                markers,
            },
            events_rx,
        ))
    }
}

impl SessionBoundary for ProcessSession {
    fn write(&self, text: &str) -> Result<()> {
        let line = text.trim_end_matches(['\r', '\n']);
        let mut payload = format!("{line}\n");
        if self.markers {
            payload.push_str(MARKER_LINE);
            payload.push('\n');
        }
        self.stdin_tx
            .send(payload)
            .map_err(|_| BlockError::session("shell stdin closed"))
    }

    fn signal(&self, process_id: u32, signal: i32) -> Result<()> {
        send_signal(process_id, signal)
    }

    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    fn directory_exists(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }
}

#[cfg(unix)]
const MARKER_LINE: &str = r#"__rc=$?; printf '\033]7;file://%s\007\033]133;D;%s\007' "$PWD" "$__rc""#;

#[cfg(not(unix))]
const MARKER_LINE: &str = "echo \x1b]133;D;%errorlevel%\x07";

#[cfg(unix)]
fn shell_command(cwd: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-s").current_dir(cwd);
    cmd
}

#[cfg(not(unix))]
fn shell_command(cwd: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.args(["/Q", "/K"]).current_dir(cwd);
    cmd
}

async fn pump<R>(mut reader: R, stream: Stream, tx: mpsc::UnboundedSender<SessionEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                let text = String::from_utf8_lossy(&buf[..n]).into_owned();
                if tx.send(SessionEvent::output(stream, text)).is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(SessionEvent::Failure(format!("{stream} read: {e}")));
                break;
            }
        }
    }
}

async fn wait_liveness(child: &mut Child) -> Liveness {
    match child.wait().await {
        Ok(status) if status.success() => Liveness::Terminated,
        Ok(status) => {
            tracing::warn!(%status, "shell exited abnormally");
            Liveness::Crashed
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap shell");
            Liveness::Crashed
        }
    }
}
