//! Lossless control plane: the stop event and the control message queues.
//!
//! Data edges drop under load; control edges never do. They are unbounded
//! crossbeam channels keyed by worker name and carry only small messages.

use crate::core_modules::frame::Polarity;
use crate::stimulus::command::StimulusCommand;
use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The single cancellation token of a DAG.
#[derive(Debug, Clone, Default)]
pub struct StopEvent {
    flag: Arc<AtomicBool>,
}

impl StopEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Runtime reconfiguration messages. A worker ignores the ones that do not
/// concern its role.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Replace the renderer's active stimulus.
    Stimulus(StimulusCommand),
    SetPolarity(Polarity),
    /// Discard the background estimate and start sampling again.
    ResetBackground,
    /// New foreground threshold for the animal localizer.
    SetIntensityThreshold(f32),
    /// Operator-issued trigger for `SoftwareTrigger` protocol items.
    SoftwareTrigger,
    /// Level of the hardware TTL line feeding `TtlTrigger` items.
    TtlLevel(bool),
    /// Pause or resume writing tracking rows and video frames.
    SetRecording(bool),
}

/// Sending half of a metadata edge, addressed to one worker.
#[derive(Debug, Clone)]
pub struct ControlSender {
    target: String,
    tx: Sender<ControlMessage>,
}

impl ControlSender {
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Returns false when the target has already shut down.
    pub fn send(&self, message: ControlMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// Receiving half: every message addressed to one worker.
#[derive(Debug)]
pub struct ControlInbox {
    rx: Receiver<ControlMessage>,
}

impl ControlInbox {
    /// Empties the inbox without blocking.
    pub fn drain(&self) -> Vec<ControlMessage> {
        let mut out = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(msg) => out.push(msg),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }
}

/// Registry of per-worker control queues.
#[derive(Debug, Clone, Default)]
pub struct ControlBus {
    routes: Arc<RwLock<HashMap<String, Sender<ControlMessage>>>>,
}

impl ControlBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or replaces) the inbox of `worker`.
    pub fn register(&self, worker: &str) -> ControlInbox {
        let (tx, rx) = channel::unbounded();
        self.routes.write().insert(worker.to_string(), tx);
        ControlInbox { rx }
    }

    pub fn sender(&self, worker: &str) -> Option<ControlSender> {
        self.routes.read().get(worker).map(|tx| ControlSender {
            target: worker.to_string(),
            tx: tx.clone(),
        })
    }

    pub fn send_to(&self, worker: &str, message: ControlMessage) -> bool {
        self.routes
            .read()
            .get(worker)
            .is_some_and(|tx| tx.send(message).is_ok())
    }

    /// Sends `message` to every registered worker; returns how many accepted it.
    pub fn broadcast(&self, message: &ControlMessage) -> usize {
        self.routes
            .read()
            .values()
            .filter(|tx| tx.send(message.clone()).is_ok())
            .count()
    }

    pub fn workers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_reach_only_their_target() {
        let bus = ControlBus::new();
        let renderer = bus.register("stimulus");
        let tracker = bus.register("tracker_0");
        assert!(bus.send_to("stimulus", ControlMessage::SoftwareTrigger));
        assert!(!bus.send_to("nobody", ControlMessage::SoftwareTrigger));
        assert_eq!(renderer.drain(), vec![ControlMessage::SoftwareTrigger]);
        assert!(tracker.drain().is_empty());
    }

    #[test]
    fn broadcast_is_lossless_and_ordered() {
        let bus = ControlBus::new();
        let inbox = bus.register("recorder");
        let sender = bus.sender("recorder").unwrap();
        for level in [true, false, true] {
            sender.send(ControlMessage::TtlLevel(level));
        }
        assert_eq!(bus.broadcast(&ControlMessage::SetRecording(false)), 1);
        assert_eq!(
            inbox.drain(),
            vec![
                ControlMessage::TtlLevel(true),
                ControlMessage::TtlLevel(false),
                ControlMessage::TtlLevel(true),
                ControlMessage::SetRecording(false),
            ]
        );
    }

    #[test]
    fn stop_event_is_shared_between_clones() {
        let stop = StopEvent::new();
        let other = stop.clone();
        assert!(!other.is_set());
        stop.set();
        assert!(other.is_set());
    }
}
