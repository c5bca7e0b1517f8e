use crate::clock::SharedClock;
use crate::core_modules::records::TrackingRecord;
use crate::error::Result;
use crate::ipc::control::{ControlMessage, ControlSender, StopEvent};
use crate::protocol::items::ProtocolContext;
use crate::protocol::sequencer::ProtocolSequencer;
use crate::worker::Worker;
use serde_json::json;

/// Drives the sequencer on every tick and forwards its commands to the
/// renderer over a control edge.
pub struct ProtocolWorker {
    sequencer: ProtocolSequencer,
    clock: SharedClock,
    renderer: ControlSender,
    tracking: Option<TrackingRecord>,
    software_trigger: bool,
    ttl_level: bool,
    emitted: u64,
    finished: StopEvent,
}

impl ProtocolWorker {
    pub fn new(sequencer: ProtocolSequencer, clock: SharedClock, renderer: ControlSender) -> Self {
        Self {
            sequencer,
            clock,
            renderer,
            tracking: None,
            software_trigger: false,
            ttl_level: false,
            emitted: 0,
            finished: StopEvent::new(),
        }
    }

    /// Set once the protocol queue has drained.
    pub fn finished(&self) -> StopEvent {
        self.finished.clone()
    }
}

impl Worker for ProtocolWorker {
    type Input = TrackingRecord;
    type Output = ();

    fn name(&self) -> &str {
        "protocol"
    }

    fn initialize(&mut self) -> Result<()> {
        self.sequencer.initialize()
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        match message {
            ControlMessage::SoftwareTrigger => self.software_trigger = true,
            ControlMessage::TtlLevel(level) => self.ttl_level = *level,
            _ => {}
        }
        Ok(())
    }

    fn work(&mut self, record: Option<TrackingRecord>) -> Result<Option<()>> {
        if let Some(record) = record {
            self.tracking = Some(record);
        }
        let ctx = ProtocolContext {
            now_ns: self.clock.now_ns(),
            tracking: self.tracking.as_ref(),
            software_trigger: self.software_trigger,
            ttl_level: self.ttl_level,
        };
        let commands = self.sequencer.tick(&ctx);
        self.software_trigger = false;

        for command in commands {
            tracing::info!(stimulus = %command, "protocol emitted stimulus");
            if !self.renderer.send(ControlMessage::Stimulus(command)) {
                tracing::warn!(target = %self.renderer.target(), "renderer control queue closed");
            }
            self.emitted += 1;
        }
        if self.sequencer.is_done() && !self.finished.is_set() {
            self.finished.set();
        }
        Ok(None)
    }

    fn cleanup(&mut self) -> Result<()> {
        self.sequencer.cleanup();
        Ok(())
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "commands_emitted": self.emitted,
            "completed": self.sequencer.completed(),
            "pauses_completed": self.sequencer.pauses_completed(),
            "remaining": self.sequencer.remaining(),
            "drained": self.sequencer.is_done(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ipc::control::ControlBus;
    use crate::protocol::items::ProtocolItemSpec;
    use crate::protocol::sequencer::{ShortTrialPolicy, build_protocol};
    use crate::stimulus::command::StimulusCommand;

    #[test]
    fn software_trigger_releases_the_next_stimulus() {
        let specs = vec![
            ProtocolItemSpec::SoftwareTrigger { debounce: 1 },
            ProtocolItemSpec::Stimulus(StimulusCommand::bright()),
        ];
        let sequencer = build_protocol(&specs, ShortTrialPolicy::Allow, 0.0, (10, 10)).unwrap();
        let clock = ManualClock::new();
        let bus = ControlBus::new();
        let inbox = bus.register("stimulus");
        let mut worker = ProtocolWorker::new(sequencer, clock.clone(), bus.sender("stimulus").unwrap());
        let finished = worker.finished();
        worker.initialize().unwrap();

        worker.work(None).unwrap();
        clock.advance_sec(0.01);
        worker.work(None).unwrap();
        assert!(inbox.drain().is_empty());
        assert!(!finished.is_set());

        worker.on_control(&ControlMessage::SoftwareTrigger).unwrap();
        worker.work(None).unwrap();
        assert_eq!(inbox.drain(), vec![ControlMessage::Stimulus(StimulusCommand::bright())]);
        assert!(finished.is_set());
        assert_eq!(worker.summary().unwrap()["commands_emitted"], 1);
    }
}
