//! Output batching: ordering, chunk caps, binary detection and the ticker.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use shellblocks_core::batcher::{binary_placeholder, looks_binary, OutputBatcher, OutputChunk};
use shellblocks_core::blocks::{OutputFragment, Stream};

fn at(ms: i64) -> chrono::DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + ms).unwrap()
}

#[test]
fn test_flush_interleaves_streams_by_timestamp() {
    let batcher = OutputBatcher::default();
    let id = Uuid::new_v4();

    batcher.ingest(OutputFragment::primary(id, "one\n").at(at(0)));
    batcher.ingest(OutputFragment::primary(id, "three\n").at(at(20)));
    batcher.ingest(OutputFragment::error(id, "two\n").at(at(10)));

    let chunks = batcher.flush_now();
    let order: Vec<(Stream, &str)> = chunks.iter().map(|c| (c.stream, c.text.as_str())).collect();
    assert_eq!(
        order,
        vec![
            (Stream::Primary, "one\n"),
            (Stream::Error, "two\n"),
            (Stream::Primary, "three\n"),
        ]
    );
}

#[test]
fn test_equal_timestamps_keep_arrival_order() {
    let batcher = OutputBatcher::default();
    let id = Uuid::new_v4();
    let ts = at(5);

    batcher.ingest(OutputFragment::error(id, "e").at(ts));
    batcher.ingest(OutputFragment::primary(id, "p").at(ts));

    let chunks = batcher.flush_now();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].stream, Stream::Error);
    assert_eq!(chunks[1].stream, Stream::Primary);
}

#[test]
fn test_consecutive_fragments_pack_into_one_chunk() {
    let batcher = OutputBatcher::default();
    let id = Uuid::new_v4();
    for i in 0..10 {
        batcher.ingest(OutputFragment::primary(id, format!("line {i}\n")).at(at(i)));
    }

    let chunks = batcher.flush_now();
    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].text.starts_with("line 0\n"));
    assert!(chunks[0].text.ends_with("line 9\n"));
    assert_eq!(chunks[0].timestamp, at(0));
}

#[test]
fn test_different_blocks_are_never_packed_together() {
    let batcher = OutputBatcher::default();
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    batcher.ingest(OutputFragment::primary(a, "a").at(at(0)));
    batcher.ingest(OutputFragment::primary(b, "b").at(at(1)));

    let chunks = batcher.flush_now();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0].block_id, a);
    assert_eq!(chunks[1].block_id, b);
}

#[test]
fn test_large_fragment_is_split_at_the_cap() {
    let batcher = OutputBatcher::new(4096, 0.30);
    let id = Uuid::new_v4();
    let big = "x".repeat(10_000);
    batcher.ingest(OutputFragment::primary(id, big.clone()));

    let chunks = batcher.flush_now();
    let sizes: Vec<usize> = chunks.iter().map(|c| c.text.len()).collect();
    assert_eq!(sizes, vec![4096, 4096, 1808]);

    let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(joined, big);
}

#[test]
fn test_split_respects_char_boundaries() {
    let batcher = OutputBatcher::new(5, 0.30);
    let id = Uuid::new_v4();
    // Each 'é' is two bytes.
    batcher.ingest(OutputFragment::primary(id, "ééééé"));

    let chunks = batcher.flush_now();
    for chunk in &chunks {
        assert!(chunk.text.len() <= 5);
    }
    let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
    assert_eq!(joined, "ééééé");
}

#[test]
fn test_nothing_is_merged_across_flushes() {
    let batcher = OutputBatcher::default();
    let id = Uuid::new_v4();

    batcher.ingest(OutputFragment::primary(id, "first"));
    let first = batcher.flush_now();
    batcher.ingest(OutputFragment::primary(id, "second"));
    let second = batcher.flush_now();

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].text, "first");
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].text, "second");
}

#[test]
fn test_empty_flush_yields_nothing() {
    let batcher = OutputBatcher::default();
    assert!(batcher.flush_now().is_empty());

    batcher.ingest(OutputFragment::primary(Uuid::new_v4(), ""));
    assert_eq!(batcher.pending_fragments(), 0);
}

#[test]
fn test_binary_fragment_becomes_placeholder() {
    let batcher = OutputBatcher::default();
    let id = Uuid::new_v4();
    let junk: String = (0u8..32).filter(|b| !matches!(b, 7..=10 | 13 | 27)).map(char::from).collect();
    let len = junk.len();
    batcher.ingest(OutputFragment::primary(id, junk));

    let chunks = batcher.flush_now();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].text, binary_placeholder(len));
    assert_eq!(chunks[0].text, format!("[binary output: {len} bytes]\n"));
}

#[test]
fn test_escape_sequences_and_whitespace_are_not_binary() {
    assert!(!looks_binary("\x1b[31mred\x1b[0m\r\n\tok\x07", 0.30));
    assert!(!looks_binary("", 0.30));
    assert!(looks_binary("\u{FFFD}\u{FFFD}\u{FFFD}a", 0.30));
}

#[test]
fn test_discard_block_drops_only_that_block() {
    let batcher = OutputBatcher::default();
    let keep = Uuid::new_v4();
    let gone = Uuid::new_v4();
    batcher.ingest(OutputFragment::primary(keep, "k1"));
    batcher.ingest(OutputFragment::error(gone, "d1"));
    batcher.ingest(OutputFragment::primary(gone, "d2"));

    assert_eq!(batcher.discard_block(gone), 2);
    let chunks = batcher.flush_now();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].block_id, keep);
}

#[test]
fn test_stop_buffering_discards_pending() {
    let batcher = OutputBatcher::default();
    batcher.ingest(OutputFragment::primary(Uuid::new_v4(), "lost"));
    batcher.stop_buffering();

    assert_eq!(batcher.pending_fragments(), 0);
    assert!(batcher.flush_now().is_empty());
}

#[test]
fn test_flush_with_delivers_drained_chunks() {
    let batcher = OutputBatcher::default();
    let id = Uuid::new_v4();
    batcher.ingest(OutputFragment::primary(id, "a"));
    batcher.ingest(OutputFragment::primary(id, "b"));

    let texts = batcher.flush_with(|chunks| {
        chunks.into_iter().map(|c| c.text).collect::<Vec<_>>()
    });
    assert_eq!(texts, vec!["ab".to_string()]);
    assert_eq!(batcher.pending_fragments(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_periodic_flush_delivers_chunks() {
    let batcher = Arc::new(OutputBatcher::default());
    let seen: Arc<Mutex<Vec<OutputChunk>>> = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    batcher.start_periodic(Duration::from_millis(16), move |chunks| {
        sink.lock().extend(chunks);
    });
    assert!(batcher.is_periodic());

    let id = Uuid::new_v4();
    batcher.ingest(OutputFragment::primary(id, "tick"));
    tokio::time::sleep(Duration::from_millis(40)).await;

    {
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].text, "tick");
    }
    assert_eq!(batcher.pending_fragments(), 0);

    batcher.stop_buffering();
    tokio::task::yield_now().await;
    assert!(!batcher.is_periodic());
}
