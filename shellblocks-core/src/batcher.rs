//! Output batching.
//!
//! Fragments arrive at whatever rate the shell produces them. `ingest` parks
//! them per stream and returns at once; a periodic flush (60 Hz by default)
//! or an explicit `flush_now` drains both streams into one ordered list of
//! chunks, interleaved by arrival time.
//!
//! Two drains racing each other could hand their chunks to the consumer out of
//! order; `flush_with` holds a delivery lock across the drain and the callback
//! so that consumers apply chunks in arrival order. The periodic flush uses it.
//!
//! Chunks are capped at `max_chunk_bytes`. Within one flush, consecutive
//! fragments for the same block and stream are packed together; nothing is
//! ever packed across two flushes.
//!
//! The holding buffers are unbounded. A consumer that never drains them will
//! grow memory without limit.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::blocks::{BlockId, OutputFragment, Stream};

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(16);
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 4096;
pub const DEFAULT_BINARY_THRESHOLD: f64 = 0.30;

/// A flushed, size-capped piece of one block's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub block_id: BlockId,
    pub stream: Stream,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Parked {
    seq: u64,
    fragment: OutputFragment,
}

#[derive(Debug, Default)]
struct Holding {
    primary: VecDeque<Parked>,
    error: VecDeque<Parked>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct OutputBatcher {
    holding: Mutex<Holding>,
    delivery: Mutex<()>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    max_chunk_bytes: usize,
    binary_threshold: f64,
}

impl Default for OutputBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_BYTES, DEFAULT_BINARY_THRESHOLD)
    }
}

impl OutputBatcher {
    pub fn new(max_chunk_bytes: usize, binary_threshold: f64) -> Self {
        Self {
            holding: Mutex::new(Holding::default()),
            delivery: Mutex::new(()),
            ticker: Mutex::new(None),
            max_chunk_bytes: max_chunk_bytes.max(1),
            binary_threshold,
        }
    }

    /// Park a fragment. Never blocks on the consumer.
    pub fn ingest(&self, mut fragment: OutputFragment) {
        if fragment.text.is_empty() {
            return;
        }
        if looks_binary(&fragment.text, self.binary_threshold) {
            tracing::debug!(
                block_id = %fragment.block_id,
                bytes = fragment.text.len(),
                "binary fragment replaced"
            );
            fragment.text = binary_placeholder(fragment.text.len());
        }

        let mut holding = self.holding.lock();
        let seq = holding.next_seq;
        holding.next_seq += 1;
        let parked = Parked { seq, fragment };
        match parked.fragment.stream {
            Stream::Primary => holding.primary.push_back(parked),
            Stream::Error => holding.error.push_back(parked),
        }
    }

    pub fn pending_fragments(&self) -> usize {
        let holding = self.holding.lock();
        holding.primary.len() + holding.error.len()
    }

    /// Drain everything parked so far into ordered, capped chunks.
    pub fn flush_now(&self) -> Vec<OutputChunk> {
        let (mut primary, mut error) = {
            let mut holding = self.holding.lock();
            (
                std::mem::take(&mut holding.primary),
                std::mem::take(&mut holding.error),
            )
        };

        let mut chunks = Vec::new();
        let mut current: Option<OutputChunk> = None;

        loop {
            let take_primary = match (primary.front(), error.front()) {
                (Some(p), Some(e)) => {
                    (p.fragment.timestamp, p.seq) <= (e.fragment.timestamp, e.seq)
                }
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => break,
            };
            let next = if take_primary {
                primary.pop_front()
            } else {
                error.pop_front()
            };
            if let Some(parked) = next {
                self.pack(parked.fragment, &mut current, &mut chunks);
            }
        }

        if let Some(chunk) = current {
            chunks.push(chunk);
        }
        chunks
    }

    /// Drain and hand the chunks to `deliver` while holding the delivery
    /// lock. `deliver` must not flush this batcher again.
    pub fn flush_with<F, R>(&self, deliver: F) -> R
    where
        F: FnOnce(Vec<OutputChunk>) -> R,
    {
        let _delivery = self.delivery.lock();
        deliver(self.flush_now())
    }

    /// Drop parked fragments belonging to `block_id`. Returns how many.
    pub fn discard_block(&self, block_id: BlockId) -> usize {
        let mut holding = self.holding.lock();
        let before = holding.primary.len() + holding.error.len();
        holding.primary.retain(|p| p.fragment.block_id != block_id);
        holding.error.retain(|p| p.fragment.block_id != block_id);
        before - (holding.primary.len() + holding.error.len())
    }

    /// Run `on_tick` with the drained chunks every `interval`. Requires a
    /// tokio runtime. Replaces any previous ticker.
    pub fn start_periodic<F>(self: &Arc<Self>, interval: Duration, on_tick: F)
    where
        F: Fn(Vec<OutputChunk>) + Send + 'static,
    {
        let batcher = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(batcher) = batcher.upgrade() else {
                    break;
                };
                batcher.flush_with(&on_tick);
            }
        });

        if let Some(old) = self.ticker.lock().replace(handle) {
            old.abort();
        }
    }

    pub fn is_periodic(&self) -> bool {
        self.ticker.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Cancel the periodic flush and throw away anything not yet flushed.
    /// Callers finishing normally must `flush_now` first.
    pub fn stop_buffering(&self) {
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        let mut holding = self.holding.lock();
        let dropped = holding.primary.len() + holding.error.len();
        holding.primary.clear();
        holding.error.clear();
        if dropped > 0 {
            tracing::debug!(dropped, "unflushed fragments discarded");
        }
    }

    fn pack(
        &self,
        fragment: OutputFragment,
        current: &mut Option<OutputChunk>,
        chunks: &mut Vec<OutputChunk>,
    ) {
        let mut rest = fragment.text.as_str();
        while !rest.is_empty() {
            let fits = current.as_ref().is_some_and(|c| {
                c.block_id == fragment.block_id
                    && c.stream == fragment.stream
                    && c.text.len() < self.max_chunk_bytes
            });
            if !fits {
                if let Some(done) = current.take() {
                    chunks.push(done);
                }
                *current = Some(OutputChunk {
                    block_id: fragment.block_id,
                    stream: fragment.stream,
                    text: String::new(),
                    timestamp: fragment.timestamp,
                });
            }

            let Some(chunk) = current.as_mut() else {
                break;
            };
            let room = self.max_chunk_bytes - chunk.text.len();
            let mut cut = floor_char_boundary(rest, room);
            if cut == 0 {
                if !chunk.text.is_empty() {
                    // Next char does not fit; start a fresh chunk.
                    if let Some(done) = current.take() {
                        chunks.push(done);
                    }
                    continue;
                }
                // A single char wider than the cap still has to go somewhere.
                cut = rest.chars().next().map_or(rest.len(), char::len_utf8);
            }
            chunk.text.push_str(&rest[..cut]);
            rest = &rest[cut..];
        }
    }
}

impl Drop for OutputBatcher {
    fn drop(&mut self) {
        if let Some(handle) = self.ticker.get_mut().take() {
            handle.abort();
        }
    }
}

/// Heuristic: more than `threshold` of the chars are control codes that
/// terminals don't print (or replacement chars from a lossy decode).
pub fn looks_binary(text: &str, threshold: f64) -> bool {
    let mut total = 0usize;
    let mut odd = 0usize;
    for c in text.chars() {
        total += 1;
        let printable = match c {
            '\n' | '\r' | '\t' | '\x1b' | '\x07' | '\x08' => true,
            '\u{FFFD}' => false,
            c => !c.is_control(),
        };
        if !printable {
            odd += 1;
        }
    }
    total > 0 && (odd as f64 / total as f64) > threshold
}

pub fn binary_placeholder(bytes: usize) -> String {
    format!("[binary output: {bytes} bytes]\n")
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut i = max;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
