//! Ring invariants with the writer and readers on separate threads.

use larva_vr::ipc::ring_buffer::{RingBuffer, RingError, RingReader, RingWriter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

const WRITES: u64 = 20_000;

fn write(writer: &mut RingWriter, value: u64) -> bool {
    let (_, slot) = writer.write_begin();
    slot[..8].copy_from_slice(&value.to_le_bytes());
    // Stamp the rest so a torn slot would not decode to the same value twice.
    for chunk in slot[8..].chunks_mut(8) {
        let n = chunk.len();
        chunk.copy_from_slice(&value.to_le_bytes()[..n]);
    }
    matches!(writer.write_commit(), Err(RingError::Overflow(_)))
}

fn read(reader: &mut RingReader) -> Option<u64> {
    let (empty, view) = reader.read_begin();
    if empty {
        return None;
    }
    let value = u64::from_le_bytes(view[..8].try_into().unwrap());
    let consistent = view[8..]
        .chunks(8)
        .all(|c| c == &value.to_le_bytes()[..c.len()]);
    match reader.read_commit() {
        Ok(()) => {
            assert!(consistent, "committed a torn slot for {value}");
            Some(value)
        }
        Err(_) => None,
    }
}

fn drain(mut reader: RingReader, done: Arc<AtomicBool>) -> Vec<u64> {
    let mut seen = Vec::new();
    loop {
        match read(&mut reader) {
            Some(v) => seen.push(v),
            None if done.load(Ordering::Acquire) && reader.empty() => return seen,
            None => std::hint::spin_loop(),
        }
    }
}

fn run(copy_on_read: bool, readers: usize) {
    let ring = RingBuffer::anonymous("threads", 32, 64, copy_on_read).unwrap();
    let capacity = ring.capacity();
    let (mut writer, reader) = ring.split();
    let done = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = (0..readers)
        .map(|_| {
            let reader = reader.clone();
            let done = done.clone();
            thread::spawn(move || drain(reader, done))
        })
        .collect();
    drop(reader);

    let mut overflows = 0u64;
    for v in 0..WRITES {
        if write(&mut writer, v) {
            overflows += 1;
            assert!(writer.ring().overflowed());
        }
        assert!(writer.size() < capacity);
    }
    done.store(true, Ordering::Release);

    let per_reader: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for seen in &per_reader {
        assert!(seen.windows(2).all(|w| w[0] < w[1]), "a reader saw items out of order");
    }
    let mut all: Vec<u64> = per_reader.concat();
    all.sort_unstable();
    let consumed = all.len();
    all.dedup();
    assert_eq!(all.len(), consumed, "an item was consumed twice");

    let counters = writer.ring().counters();
    assert_eq!(counters.written, WRITES);
    assert_eq!(counters.dequeued, consumed as u64);
    assert_eq!(counters.size, 0);
    // Every write is consumed once or dropped once.
    assert_eq!(counters.dequeued + counters.dropped, WRITES);
    assert!(counters.dropped <= overflows);
    assert_eq!(counters.overflow, overflows > 0);
}

#[test]
fn single_reader_with_borrowed_views() {
    run(false, 1);
}

#[test]
fn single_reader_with_copies() {
    run(true, 1);
}

#[test]
fn competing_readers_with_copies() {
    run(true, 3);
}

#[test]
fn overflow_is_clear_until_a_write_hits_a_full_ring() {
    let (mut writer, mut reader) = RingBuffer::anonymous("latch", 8, 8, true).unwrap().split();
    for v in 0..100 {
        assert!(!write(&mut writer, v));
        assert_eq!(read(&mut reader), Some(v));
    }
    assert!(!writer.ring().overflowed());

    for v in 0..7 {
        assert!(!write(&mut writer, v));
    }
    assert!(writer.full());
    assert!(!writer.ring().overflowed());
    assert!(write(&mut writer, 7));
    assert!(writer.ring().overflowed());
    assert_eq!(writer.size(), 7);

    writer.ring().clear_overflow();
    assert_eq!(read(&mut reader), Some(1));
    assert!(!write(&mut writer, 8));
    assert!(!writer.ring().overflowed());
}
