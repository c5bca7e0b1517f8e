//! Trial sequencing: protocol items, the debouncer behind trigger items and
//! the sequencer that walks the protocol queue.

pub mod debouncer;
pub mod items;
pub mod sequencer;

pub use debouncer::{DebounceState, Debouncer, Edge};
pub use items::{
    ItemPoll, Pause, ProtocolContext, ProtocolItem, ProtocolItemSpec, SoftwareTrigger, StimulusItem,
    TrackingTrigger, TtlTrigger,
};
pub use sequencer::{CompletedItem, ProtocolSequencer, ShortTrialPolicy, build_protocol, check_trial_lengths};
