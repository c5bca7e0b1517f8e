// THEORY:
// A monitored queue is one edge of the DAG: a ring buffer, the codec for the
// items it carries, and an `EdgeMonitor` that anyone (the DAG controller, the
// metadata writer) can hold to read the edge's counters without touching the
// data path.
//
// Counters that both ends contribute to (writes, reads, drops, torn reads)
// live in the ring header so they stay correct when the ends sit in different
// processes. The monitor adds what only one side knows: malformed slots
// seen by readers and a smoothed throughput estimate.
//
// Drops are reported and logged, never returned as errors.

use crate::error::{Result, VrError};
use crate::ipc::codec::SlotCodec;
use crate::ipc::ring_buffer::{RingBuffer, RingCounters, RingError, RingReader, RingWriter};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Overflow warnings are emitted for the first drop and then every this many.
const DROP_LOG_INTERVAL: u64 = 1000;
/// Smoothing factor of the throughput moving average.
const THROUGHPUT_ALPHA: f64 = 0.3;
/// Minimum spacing between throughput samples.
const THROUGHPUT_MIN_INTERVAL_SEC: f64 = 0.01;
/// Consecutive lapped or malformed slots a single pop will skip over.
const MAX_POP_ATTEMPTS: usize = 16;

/// Where a queue's ring lives.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Backing {
    /// Anonymous shared mapping, visible to every thread of this process.
    #[default]
    Anonymous,
    /// File-backed mapping other processes can attach to.
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub capacity: usize,
    pub copy_on_read: bool,
    pub backing: Backing,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            capacity: 16,
            copy_on_read: true,
            backing: Backing::Anonymous,
        }
    }
}

/// Result of a non-blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Enqueued,
    /// The item was enqueued but displaced the oldest unread item.
    Overwrote,
}

/// Per-edge statistics as printed on shutdown and written to run metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStats {
    pub name: String,
    pub enqueued: u64,
    pub dequeued: u64,
    pub dropped: u64,
    pub torn: u64,
    pub malformed: u64,
    pub size: u64,
    pub capacity: u64,
    pub overflow: bool,
    pub throughput_hz: f64,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<32} enq {:>8}  deq {:>8}  drop {:>7}  torn {:>5}  bad {:>5}  size {:>3}/{:<3}  {:>7.1} Hz{}",
            self.name,
            self.enqueued,
            self.dequeued,
            self.dropped,
            self.torn,
            self.malformed,
            self.size,
            self.capacity,
            self.throughput_hz,
            if self.overflow { "  OVERFLOW" } else { "" }
        )
    }
}

impl QueueStats {
    /// Items that never reached the consumer: dropped, still queued, or
    /// undecodable.
    pub fn lost(&self) -> u64 {
        self.dropped + self.size + self.malformed
    }
}

#[derive(Debug)]
struct Meter {
    last_at: Instant,
    last_dequeued: u64,
    rate_hz: Option<f64>,
}

#[derive(Debug)]
struct EdgeState {
    ring: Arc<RingBuffer>,
    malformed: AtomicU64,
    meter: Mutex<Meter>,
}

/// Read-only handle on an edge's counters.
#[derive(Debug, Clone)]
pub struct EdgeMonitor {
    state: Arc<EdgeState>,
}

impl EdgeMonitor {
    fn new(ring: Arc<RingBuffer>) -> Self {
        Self {
            state: Arc::new(EdgeState {
                ring,
                malformed: AtomicU64::new(0),
                meter: Mutex::new(Meter {
                    last_at: Instant::now(),
                    last_dequeued: 0,
                    rate_hz: None,
                }),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.state.ring.name()
    }

    pub fn counters(&self) -> RingCounters {
        self.state.ring.counters()
    }

    pub fn dropped(&self) -> u64 {
        self.counters().dropped
    }

    pub fn malformed(&self) -> u64 {
        self.state.malformed.load(Ordering::Relaxed)
    }

    /// Current counters plus an updated throughput estimate.
    pub fn snapshot(&self) -> QueueStats {
        let counters = self.counters();
        let throughput_hz = {
            let mut meter = self.state.meter.lock();
            let now = Instant::now();
            let dt = now.duration_since(meter.last_at).as_secs_f64();
            if dt >= THROUGHPUT_MIN_INTERVAL_SEC {
                let instant = (counters.dequeued - meter.last_dequeued) as f64 / dt;
                meter.rate_hz = Some(match meter.rate_hz {
                    Some(prev) => THROUGHPUT_ALPHA * instant + (1.0 - THROUGHPUT_ALPHA) * prev,
                    None => instant,
                });
                meter.last_at = now;
                meter.last_dequeued = counters.dequeued;
            }
            meter.rate_hz.unwrap_or(0.0)
        };
        QueueStats {
            name: self.name().to_string(),
            enqueued: counters.written,
            dequeued: counters.dequeued,
            dropped: counters.dropped,
            torn: counters.torn,
            malformed: self.malformed(),
            size: counters.size,
            capacity: counters.capacity,
            overflow: counters.overflow,
            throughput_hz,
        }
    }
}

/// Creates one monitored edge.
pub fn monitored_queue<C: SlotCodec>(
    name: &str,
    codec: C,
    options: &QueueOptions,
) -> Result<(QueueWriter<C>, QueueReader<C>, EdgeMonitor)> {
    let ring = match &options.backing {
        Backing::Anonymous => {
            RingBuffer::anonymous(name, options.capacity, codec.slot_size(), options.copy_on_read)?
        }
        Backing::File(dir) => {
            let path = dir.join(format!("{}.ring", sanitize(name)));
            RingBuffer::create(
                name,
                &path,
                options.capacity,
                codec.slot_size(),
                options.copy_on_read,
            )?
        }
    };
    let (writer, reader) = ring.split();
    let monitor = EdgeMonitor::new(writer.ring().clone());
    Ok((
        QueueWriter {
            writer,
            codec: codec.clone(),
            monitor: monitor.clone(),
        },
        QueueReader {
            reader,
            codec,
            monitor: monitor.clone(),
        },
        monitor,
    ))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '-' })
        .collect()
}

/// Producer end of an edge.
pub struct QueueWriter<C: SlotCodec> {
    writer: RingWriter,
    codec: C,
    monitor: EdgeMonitor,
}

impl<C: SlotCodec> QueueWriter<C> {
    pub fn name(&self) -> &str {
        self.monitor.name()
    }

    pub fn monitor(&self) -> &EdgeMonitor {
        &self.monitor
    }

    /// Packs and commits `item` without blocking. A full ring overwrites its
    /// oldest item; that is reported through the outcome and the counters.
    pub fn push(&mut self, item: &C::Item) -> Result<PushOutcome> {
        let (_, slot) = self.writer.write_begin();
        self.codec.pack(item, slot)?;
        match self.writer.write_commit() {
            Ok(()) => Ok(PushOutcome::Enqueued),
            Err(RingError::Overflow(_)) => {
                let dropped = self.monitor.dropped();
                if dropped <= 1 || dropped % DROP_LOG_INTERVAL == 0 {
                    tracing::warn!(edge = %self.name(), dropped, "queue overflow; dropping oldest items");
                }
                Ok(PushOutcome::Overwrote)
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn size(&self) -> usize {
        self.writer.size()
    }

    pub fn full(&self) -> bool {
        self.writer.full()
    }
}

/// Consumer end of an edge. Clones compete for items.
pub struct QueueReader<C: SlotCodec> {
    reader: RingReader,
    codec: C,
    monitor: EdgeMonitor,
}

impl<C: SlotCodec> Clone for QueueReader<C> {
    fn clone(&self) -> Self {
        Self {
            reader: self.reader.clone(),
            codec: self.codec.clone(),
            monitor: self.monitor.clone(),
        }
    }
}

impl<C: SlotCodec> QueueReader<C> {
    pub fn name(&self) -> &str {
        self.monitor.name()
    }

    pub fn monitor(&self) -> &EdgeMonitor {
        &self.monitor
    }

    pub fn has_data(&self) -> bool {
        self.reader.data_available()
    }

    pub fn size(&self) -> usize {
        self.reader.size()
    }

    pub fn empty(&self) -> bool {
        self.reader.empty()
    }

    /// Takes the oldest item, if any. Malformed slots are consumed, counted
    /// and skipped; slots lost to the writer mid-read are retried.
    pub fn try_pop(&mut self) -> Result<Option<C::Item>> {
        for _ in 0..MAX_POP_ATTEMPTS {
            let (empty, view) = self.reader.read_begin();
            if empty {
                return Ok(None);
            }
            let decoded = self.codec.unpack(view);
            match self.reader.read_commit() {
                Ok(()) => match decoded {
                    Ok(item) => return Ok(Some(item)),
                    Err(err @ (VrError::MalformedSlot(_) | VrError::CodecSize { .. })) => {
                        let count = self.monitor.state.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(edge = %self.name(), count, error = %err, "skipping malformed slot");
                    }
                    Err(other) => return Err(other),
                },
                Err(RingError::Lapped) => continue,
                Err(other) => return Err(other.into()),
            }
        }
        Ok(None)
    }

    /// Drains the queue, returning the newest item and how many older ones
    /// were skipped.
    pub fn pop_latest(&mut self) -> Result<Option<(C::Item, u64)>> {
        let mut latest = None;
        let mut skipped = 0u64;
        while let Some(item) = self.try_pop()? {
            if latest.replace(item).is_some() {
                skipped += 1;
            }
        }
        Ok(latest.map(|item| (item, skipped)))
    }
}
