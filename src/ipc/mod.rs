//! Inter-worker communication: shared-memory rings, typed edges, fan-in and
//! fan-out policies, and the lossless control plane.

pub mod codec;
pub mod control;
pub mod dispatcher;
pub mod monitored_queue;
pub mod ring_buffer;

pub use codec::{AnnotatedCodec, FrameCodec, SlotCodec, SubtractedCodec, TrackingCodec};
pub use control::{ControlBus, ControlInbox, ControlMessage, ControlSender, StopEvent};
pub use dispatcher::{Collector, Dispatcher, FanIn, FanOut, Inbox, NullOutbox, Outbox, Receiver, Ticker};
pub use monitored_queue::{
    Backing, EdgeMonitor, PushOutcome, QueueOptions, QueueReader, QueueStats, QueueWriter, monitored_queue,
};
pub use ring_buffer::{RingBuffer, RingCounters, RingError, RingReader, RingWriter};
