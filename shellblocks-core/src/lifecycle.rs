//! Block lifecycle manager.
//!
//! Owns every block and its state machine. Output flows
//!
//! ```text
//! append_output -> OutputBatcher -> (tick / flush) -> OSC scan -> SGR parse
//!               -> block output -> BoundaryDetector -> complete (optional)
//! ```
//!
//! Locking: blocks live in an arena keyed by id, one mutex per block. When
//! more than one lock is needed they are taken in the order
//! `batcher delivery -> executing -> block -> {detector, tracker, osc}`. The arena lock is only
//! held to look a block up, or while publishing a snapshot (which takes block
//! locks one at a time and never while another block lock is held).

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::ansi::{self, Style};
use crate::batcher::{OutputBatcher, OutputChunk};
use crate::blocks::{
    BlockId, BlockStatus, CommandBlock, OutputFragment, Stream, CANCELLED_EXIT_CODE,
};
use crate::boundary::{BoundaryDetector, CompletionSignal};
use crate::config::PipelineConfig;
use crate::cwd::DirectoryTracker;
use crate::error::{BlockError, Boundary, Result, StateError};
use crate::session::{Liveness, SessionBoundary, SessionEvent};
use crate::store::{BlockStore, MemoryStore};
use crate::term::{OscEvent, OscScanner};

const EVENT_CAPACITY: usize = 256;

/// Snapshot list handed to observers, in creation order. Blocks that did not
/// change since the last publish are shared with the previous list.
pub type BlockList = Arc<Vec<Arc<CommandBlock>>>;

/// Things observers may want to know that are not block state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A completion signal fired for the executing block.
    BoundaryDetected {
        id: BlockId,
        signal: CompletionSignal,
    },
    /// A session or store call failed. Non-fatal.
    BoundaryError { boundary: Boundary, message: String },
    /// The session went away; `cancelled` is the block that was force-cancelled.
    SessionLost {
        liveness: Liveness,
        cancelled: Option<BlockId>,
    },
}

#[derive(Debug)]
struct Slot {
    /// Copy-on-write: observers hold the published `Arc`, writers go through
    /// `block_mut`.
    block: Arc<CommandBlock>,
    /// SGR state at the end of the output so far.
    style: Style,
    /// Trailing partial SGR sequence waiting for the next chunk.
    pending: String,
    /// Exit code reported by an OSC 133;D marker.
    marker: Option<Option<i32>>,
    /// A completion signal was already raised for this block.
    signalled: bool,
    /// The session reported the real directory while this block ran, so
    /// `cd` inference is skipped when it completes.
    directory_reported: bool,
}

impl Slot {
    fn new(block: CommandBlock) -> Self {
        Self {
            block: Arc::new(block),
            style: Style::default(),
            pending: String::new(),
            marker: None,
            signalled: false,
            directory_reported: false,
        }
    }

    fn block_mut(&mut self) -> &mut CommandBlock {
        Arc::make_mut(&mut self.block)
    }
}

#[derive(Debug, Default)]
struct Arena {
    order: Vec<BlockId>,
    slots: HashMap<BlockId, Arc<Mutex<Slot>>>,
}

struct Inner {
    config: PipelineConfig,
    store: Arc<dyn BlockStore>,
    session: Option<Arc<dyn SessionBoundary>>,

    arena: RwLock<Arena>,
    executing: Mutex<Option<BlockId>>,

    batcher: Arc<OutputBatcher>,
    detector: Mutex<BoundaryDetector>,
    tracker: Mutex<DirectoryTracker>,
    osc: Mutex<OscScanner>,

    blocks_tx: watch::Sender<BlockList>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to the block pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BlockLifecycle {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BlockLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockLifecycle")
            .field("blocks", &self.inner.arena.read().order.len())
            .field("executing", &*self.inner.executing.lock())
            .field("session", &self.inner.session.is_some())
            .finish()
    }
}

impl BlockLifecycle {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn BlockStore>,
        session: Option<Arc<dyn SessionBoundary>>,
    ) -> Self {
        let (blocks_tx, _) = watch::channel(Arc::new(Vec::new()));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Inner {
            batcher: Arc::new(OutputBatcher::new(
                config.max_chunk_bytes,
                config.binary_threshold,
            )),
            detector: Mutex::new(BoundaryDetector::new(config.quiet_period())),
            tracker: Mutex::new(DirectoryTracker::new(
                config.home_dir.clone(),
                config.home_dir.clone(),
            )),
            osc: Mutex::new(OscScanner::new()),
            arena: RwLock::new(Arena::default()),
            executing: Mutex::new(None),
            blocks_tx,
            events_tx,
            pump: Mutex::new(None),
            config,
            store,
            session,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// In-memory store, no session, default config.
    pub fn in_memory() -> Self {
        Self::new(
            PipelineConfig::default(),
            Arc::new(MemoryStore::new()),
            None,
        )
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    // ────────────────────────────────────────────────────────────────
    // Background work
    // ────────────────────────────────────────────────────────────────

    /// Start the periodic flush. Needs a tokio runtime. Without it, appended
    /// output is applied synchronously inside `append_output`.
    pub fn start(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .batcher
            .start_periodic(self.inner.config.flush_interval(), move |chunks| {
                if let Some(this) = upgrade(&weak) {
                    this.apply_chunks(chunks);
                    this.check_boundaries_at(Instant::now());
                }
            });
        tracing::debug!(interval_ms = self.inner.config.flush_interval_ms, "flush ticker started");
    }

    /// Consume session events until the sender goes away.
    pub fn attach_session(&self, mut rx: mpsc::UnboundedReceiver<SessionEvent>) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(this) = upgrade(&weak) else {
                    break;
                };
                this.on_session_event(event);
            }
            tracing::debug!("session event pump ended");
        });
        if let Some(old) = self.inner.pump.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop background work and drop unflushed output.
    pub fn shutdown(&self) {
        self.inner.batcher.stop_buffering();
        if let Some(pump) = self.inner.pump.lock().take() {
            pump.abort();
        }
        tracing::debug!("lifecycle shut down");
    }

    // ────────────────────────────────────────────────────────────────
    // Observation
    // ────────────────────────────────────────────────────────────────

    /// Every block in creation order. New subscribers see the latest list at once.
    pub fn observe_blocks(&self) -> watch::Receiver<BlockList> {
        self.inner.blocks_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn block(&self, id: BlockId) -> Option<CommandBlock> {
        let slot = self.slot(id).ok()?;
        let guard = slot.lock();
        Some(CommandBlock::clone(&guard.block))
    }

    pub fn blocks(&self) -> Vec<CommandBlock> {
        self.snapshot()
            .iter()
            .map(|block| CommandBlock::clone(block))
            .collect()
    }

    pub fn executing(&self) -> Option<BlockId> {
        *self.inner.executing.lock()
    }

    /// Escape-free output, for copying.
    pub fn plain_text(&self, id: BlockId) -> Result<String> {
        let slot = self.slot(id)?;
        let guard = slot.lock();
        Ok(guard.block.output.text.clone())
    }

    pub fn current_dir(&self) -> String {
        self.inner.tracker.lock().current().to_string()
    }

    pub fn is_valid_directory(&self, path: &str) -> bool {
        match &self.inner.session {
            Some(session) => self.inner.tracker.lock().is_valid_directory(path, session.as_ref()),
            None => false,
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Lifecycle
    // ────────────────────────────────────────────────────────────────

    /// New PENDING block, persisted before it becomes visible. A blank
    /// `working_dir` means "the tracked directory".
    pub fn create_block(&self, command: &str, working_dir: &str) -> Result<CommandBlock> {
        if command.trim().is_empty() {
            return Err(BlockError::Validation("command text is blank".into()));
        }
        let cwd = if working_dir.trim().is_empty() {
            self.current_dir()
        } else {
            working_dir.to_string()
        };

        let block = CommandBlock::new(command, cwd);
        if let Err(e) = self.inner.store.insert(&block) {
            let err = BlockError::from(e);
            self.report(&err);
            return Err(err);
        }

        {
            let mut arena = self.inner.arena.write();
            arena.order.push(block.id);
            arena
                .slots
                .insert(block.id, Arc::new(Mutex::new(Slot::new(block.clone()))));
        }

        tracing::debug!(block_id = %block.id, command = %block.command, cwd = %block.cwd, "block created");
        self.publish();
        Ok(block)
    }

    pub fn mark_executing(&self, id: BlockId) -> Result<CommandBlock> {
        let slot = self.slot(id)?;
        let snapshot = {
            let mut executing = self.inner.executing.lock();
            if let Some(other) = *executing {
                if other != id {
                    return Err(StateError::AlreadyExecuting {
                        id,
                        executing: other,
                    }
                    .into());
                }
            }

            let mut guard = slot.lock();
            guard.block_mut().mark_executing()?;
            *executing = Some(id);

            self.inner.detector.lock().reset();
            // Anything half-parsed belongs to whatever ran before.
            let _ = self.inner.osc.lock().flush();

            self.persist_status(&guard.block);
            CommandBlock::clone(&guard.block)
        };

        tracing::debug!(block_id = %id, "block executing");
        self.publish();
        Ok(snapshot)
    }

    /// Queue output for `id`. Returns before the output is rendered.
    pub fn append_output(&self, id: BlockId, stream: Stream, text: &str) -> Result<()> {
        self.append_fragment(OutputFragment::new(id, stream, text))
    }

    pub fn append_fragment(&self, fragment: OutputFragment) -> Result<()> {
        let id = fragment.block_id;
        let slot = self.slot(id)?;
        {
            let guard = slot.lock();
            if guard.block.status != BlockStatus::Executing {
                return Err(BlockError::illegal(id, "append output", guard.block.status));
            }
        }

        tracing::trace!(block_id = %id, stream = %fragment.stream, bytes = fragment.text.len(), "fragment");
        self.inner.batcher.ingest(fragment);
        self.inner.detector.lock().update_last_output_time();

        if !self.inner.batcher.is_periodic() {
            self.flush();
        }
        Ok(())
    }

    /// Drain the batcher now, apply the chunks, and run boundary detection.
    pub fn flush(&self) {
        self.drain();
        self.check_boundaries_at(Instant::now());
    }

    /// EXECUTING -> SUCCESS (0) or FAILURE (anything else). Trailing output is
    /// flushed first.
    pub fn complete_block(&self, id: BlockId, exit_code: i32) -> Result<CommandBlock> {
        self.slot(id)?;
        self.drain();
        self.finish(id, CommandBlock::status_for_exit(exit_code), exit_code, "complete")
    }

    /// EXECUTING -> CANCELLED (130). Cancelling a finished block is a no-op
    /// that returns it unchanged; cancelling a PENDING one is an error.
    pub fn cancel_block(&self, id: BlockId) -> Result<CommandBlock> {
        let slot = self.slot(id)?;
        let status = slot.lock().block.status;
        if status == BlockStatus::Pending {
            return Err(BlockError::illegal(id, "cancel", status));
        }

        // The signal itself is not deduplicated; shells shrug off extras.
        if let Some(session) = &self.inner.session {
            if let Err(e) = session.interrupt() {
                self.report(&e);
            }
        }

        if status.is_terminal() {
            tracing::trace!(block_id = %id, %status, "cancel on finished block ignored");
            return Ok(CommandBlock::clone(&slot.lock().block));
        }
        self.cancel_executing(id)
    }

    /// Flip the UI expansion flag. Returns the new value.
    pub fn toggle_expansion(&self, id: BlockId) -> Result<bool> {
        let slot = self.slot(id)?;
        let expanded = {
            let mut guard = slot.lock();
            let block = guard.block_mut();
            block.expanded = !block.expanded;
            block.expanded
        };
        self.publish();
        Ok(expanded)
    }

    // ────────────────────────────────────────────────────────────────
    // Issuer helpers
    // ────────────────────────────────────────────────────────────────

    /// Create, start, and send a command to the session in one go.
    pub fn run_command(&self, command: &str) -> Result<CommandBlock> {
        let block = self.create_block(command, "")?;
        let block = self.mark_executing(block.id)?;

        if let Some(session) = &self.inner.session {
            if let Err(e) = session.write(command) {
                self.report(&e);
                if let Err(cancel) = self.cancel_executing(block.id) {
                    tracing::trace!(block_id = %block.id, error = %cancel, "block finished before write failure");
                }
                return Err(e);
            }
        }
        Ok(block)
    }

    /// A fresh block for the same command, in the tracked directory.
    pub fn rerun(&self, id: BlockId) -> Result<CommandBlock> {
        let command = {
            let slot = self.slot(id)?;
            let guard = slot.lock();
            guard.block.command.clone()
        };
        self.run_command(&command)
    }

    /// Remove a block from the view and the store. The executing block cannot
    /// be deleted.
    pub fn delete_block(&self, id: BlockId) -> Result<bool> {
        let slot = self.slot(id)?;
        {
            let executing = self.inner.executing.lock();
            if *executing == Some(id) {
                let status = slot.lock().block.status;
                return Err(BlockError::illegal(id, "delete", status));
            }
            let removed = self.inner.store.delete(id).map_err(BlockError::from)?;
            let mut arena = self.inner.arena.write();
            arena.slots.remove(&id);
            arena.order.retain(|b| *b != id);
            if !removed {
                tracing::debug!(block_id = %id, "block was not in the store");
            }
        }
        self.publish();
        Ok(true)
    }

    /// Most recent `limit` blocks from the store, newest first.
    pub fn recent(&self, limit: usize) -> Result<Vec<CommandBlock>> {
        Ok(self.inner.store.recent(limit)?)
    }

    pub fn history(&self) -> Result<Vec<CommandBlock>> {
        self.recent(self.inner.config.history_limit)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.inner.store.count()?)
    }

    /// Authoritative directory from the session boundary. Also stops the
    /// executing block's command from being re-applied as `cd` inference.
    pub fn apply_directory_snapshot(&self, path: &str) {
        if let Some(slot) = self.executing().and_then(|id| self.slot(id).ok()) {
            slot.lock().directory_reported = true;
        }
        self.inner.tracker.lock().apply_snapshot(path);
    }

    // ────────────────────────────────────────────────────────────────
    // Session events
    // ────────────────────────────────────────────────────────────────

    pub fn on_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Output {
                stream,
                text,
                timestamp,
            } => {
                let Some(id) = self.executing() else {
                    tracing::trace!(bytes = text.len(), "output with no executing block dropped");
                    return;
                };
                let fragment = OutputFragment::new(id, stream, text).at(timestamp);
                if let Err(e) = self.append_fragment(fragment) {
                    tracing::trace!(block_id = %id, error = %e, "late output dropped");
                }
            }
            SessionEvent::Directory(path) => self.apply_directory_snapshot(&path),
            SessionEvent::Liveness(Liveness::Ready) => tracing::info!("session ready"),
            SessionEvent::Liveness(liveness) => self.on_session_lost(liveness),
            SessionEvent::Failure(message) => self.report(&BlockError::session(message)),
        }
    }

    fn on_session_lost(&self, liveness: Liveness) {
        let cancelled = self.executing().and_then(|id| {
            // Keep whatever the shell managed to say before it went away.
            self.drain();
            match self.cancel_executing(id) {
                Ok(_) => Some(id),
                Err(e) => {
                    tracing::trace!(block_id = %id, error = %e, "block finished before session loss");
                    None
                }
            }
        });
        if let Some(id) = cancelled {
            tracing::warn!(block_id = %id, ?liveness, "session lost, executing block cancelled");
        }
        let _ = self.inner.events_tx.send(LifecycleEvent::SessionLost {
            liveness,
            cancelled,
        });
    }

    // ────────────────────────────────────────────────────────────────
    // Boundary detection
    // ────────────────────────────────────────────────────────────────

    /// Evaluate the executing block against marker, prompt and quiet-period
    /// signals as of `now`. Returns the signal that fired, if any.
    pub fn check_boundaries_at(&self, now: Instant) -> Option<CompletionSignal> {
        let id = self.executing()?;
        let slot = self.slot(id).ok()?;

        let signal = {
            let mut guard = slot.lock();
            if guard.signalled || guard.block.status != BlockStatus::Executing {
                return None;
            }
            let detector = self.inner.detector.lock();
            let signal = if let Some(exit_code) = guard.marker {
                Some(CompletionSignal::Marker { exit_code })
            } else if let Some(pattern) = detector.detect(&guard.block.output.text) {
                Some(CompletionSignal::Prompt { pattern })
            } else if detector.check_timeout_at(now) {
                Some(CompletionSignal::QuietPeriod)
            } else {
                None
            };
            if signal.is_some() {
                guard.signalled = true;
            }
            signal
        }?;

        tracing::debug!(block_id = %id, ?signal, "boundary detected");
        let _ = self.inner.events_tx.send(LifecycleEvent::BoundaryDetected {
            id,
            signal: signal.clone(),
        });

        if self.inner.config.auto_complete {
            let exit_code = match signal {
                CompletionSignal::Marker { exit_code } => exit_code.unwrap_or(0),
                _ => 0,
            };
            let status = CommandBlock::status_for_exit(exit_code);
            if let Err(e) = self.finish(id, status, exit_code, "complete") {
                tracing::trace!(block_id = %id, error = %e, "auto-complete lost a race");
            }
        }
        Some(signal)
    }

    // ────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────

    fn slot(&self, id: BlockId) -> Result<Arc<Mutex<Slot>>> {
        self.inner
            .arena
            .read()
            .slots
            .get(&id)
            .cloned()
            .ok_or_else(|| BlockError::unknown_block(id))
    }

    /// Apply everything parked so far, in order with any concurrent drain.
    fn drain(&self) {
        self.inner
            .batcher
            .flush_with(|chunks| self.apply_chunks(chunks));
    }

    fn apply_chunks(&self, chunks: Vec<OutputChunk>) {
        if chunks.is_empty() {
            return;
        }
        for chunk in chunks {
            self.apply_chunk(chunk);
        }
        self.publish();
    }

    fn apply_chunk(&self, chunk: OutputChunk) {
        let Ok(slot) = self.slot(chunk.block_id) else {
            tracing::trace!(block_id = %chunk.block_id, "chunk for deleted block dropped");
            return;
        };
        let mut guard = slot.lock();
        if guard.block.status.is_terminal() {
            tracing::trace!(block_id = %chunk.block_id, "chunk for finished block dropped");
            return;
        }

        let scanned = self.inner.osc.lock().feed(&chunk.text);
        for event in scanned.events {
            match event {
                OscEvent::Cwd(path) => {
                    guard.directory_reported = true;
                    self.inner.tracker.lock().apply_snapshot(&path);
                }
                OscEvent::CommandFinished { exit_code } => guard.marker = Some(exit_code),
                other => tracing::trace!(?other, "OSC event ignored"),
            }
        }

        let mut text = std::mem::take(&mut guard.pending);
        text.push_str(&scanned.text);
        let (complete, tail) = ansi::split_incomplete(&text);
        let (segments, style) = ansi::parse_from(guard.style, complete);
        for segment in segments {
            guard.block_mut().output.push(segment.text, segment.style);
        }
        guard.style = style;
        guard.pending = tail.to_string();
    }

    fn cancel_executing(&self, id: BlockId) -> Result<CommandBlock> {
        let dropped = self.inner.batcher.discard_block(id);
        if dropped > 0 {
            tracing::debug!(block_id = %id, dropped, "unflushed output discarded on cancel");
        }
        self.finish(id, BlockStatus::Cancelled, CANCELLED_EXIT_CODE, "cancel")
    }

    /// The single exit from EXECUTING.
    fn finish(
        &self,
        id: BlockId,
        status: BlockStatus,
        exit_code: i32,
        action: &'static str,
    ) -> Result<CommandBlock> {
        let slot = self.slot(id)?;
        let snapshot = {
            let mut executing = self.inner.executing.lock();
            let mut guard = slot.lock();
            if guard.block.status != BlockStatus::Executing {
                return Err(BlockError::illegal(id, action, guard.block.status));
            }

            // Whatever the scanners were holding back is plain text now.
            let mut held = self.inner.osc.lock().flush();
            held.insert_str(0, &std::mem::take(&mut guard.pending));
            if status != BlockStatus::Cancelled && !held.is_empty() {
                let style = guard.style;
                guard.block_mut().output.push(&held, style);
            }

            guard.block_mut().finish(status, exit_code)?;
            if *executing == Some(id) {
                *executing = None;
            }

            if status == BlockStatus::Success && !guard.directory_reported {
                self.inner.tracker.lock().on_command(&guard.block.command);
            }

            if let Err(e) = self.inner.store.update_output(id, &guard.block.output) {
                self.report(&e.into());
            }
            self.persist_status(&guard.block);
            CommandBlock::clone(&guard.block)
        };

        tracing::debug!(block_id = %id, %status, exit_code, "block finished");
        self.publish();
        Ok(snapshot)
    }

    /// Status writes are non-fatal: the in-memory state machine is the
    /// authority, a failed write becomes a `BoundaryError` event.
    fn persist_status(&self, block: &CommandBlock) {
        if let Err(e) =
            self.inner
                .store
                .update_status(block.id, block.status, block.exit_code, block.ended_at)
        {
            self.report(&e.into());
        }
    }

    fn report(&self, err: &BlockError) {
        let BlockError::BoundaryIo { boundary, message } = err else {
            tracing::debug!(error = %err, "reported non-boundary error");
            return;
        };
        tracing::warn!(%boundary, %message, "boundary failure");
        let _ = self.inner.events_tx.send(LifecycleEvent::BoundaryError {
            boundary: *boundary,
            message: message.clone(),
        });
    }

    fn snapshot(&self) -> Vec<Arc<CommandBlock>> {
        let arena = self.inner.arena.read();
        arena
            .order
            .iter()
            .filter_map(|id| arena.slots.get(id))
            .map(|slot| slot.lock().block.clone())
            .collect()
    }

    fn publish(&self) {
        let list = Arc::new(self.snapshot());
        self.inner.blocks_tx.send_replace(list);
    }
}

fn upgrade(weak: &Weak<Inner>) -> Option<BlockLifecycle> {
    weak.upgrade().map(|inner| BlockLifecycle { inner })
}
