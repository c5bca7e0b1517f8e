// THEORY:
// The stimulus worker closes the loop. It runs on vsync, not on tracking:
//
// 1.  **Fresh pose.** The inbox hands over only the newest tracking record;
//     older ones are superseded. When nothing new arrived the previous pose is
//     kept and the frame is drawn anyway.
// 2.  **Render and present.** The active command is rasterized in projector
//     space and presented; `present` blocks until the next vsync, which paces
//     the loop at the projector rate.
// 3.  **Log on change.** A command received from the protocol or an operator
//     is written to the stimulus log with the time of its first presentation.

use crate::clock::SharedClock;
use crate::core_modules::records::TrackingRecord;
use crate::error::Result;
use crate::ipc::control::ControlMessage;
use crate::stimulus::command::StimulusCommand;
use crate::stimulus::projector::Projector;
use crate::stimulus::renderer::StimulusRenderer;
use crate::stimulus::stim_log::StimLog;
use crate::worker::Worker;
use serde_json::json;
use std::path::PathBuf;

pub struct StimulusWorker {
    renderer: StimulusRenderer,
    projector: Box<dyn Projector>,
    clock: SharedClock,
    log_path: Option<PathBuf>,
    log: Option<StimLog>,
    /// Commands received but not presented yet, oldest first.
    unlogged: Vec<StimulusCommand>,
    records: u64,
    rejected: u64,
}

impl StimulusWorker {
    pub fn new(renderer: StimulusRenderer, projector: Box<dyn Projector>, clock: SharedClock) -> Self {
        Self {
            renderer,
            projector,
            clock,
            log_path: None,
            log: None,
            unlogged: Vec::new(),
            records: 0,
            rejected: 0,
        }
    }

    /// Writes the stimulus log to `path`, created at initialization.
    pub fn with_log(mut self, path: PathBuf) -> Self {
        self.log_path = Some(path);
        self
    }

    pub fn renderer(&self) -> &StimulusRenderer {
        &self.renderer
    }

    fn select(&mut self, command: StimulusCommand) {
        match self.renderer.set_command(command.clone(), self.clock.now_ns()) {
            Ok(()) => self.unlogged.push(command),
            Err(err) => {
                self.rejected += 1;
                tracing::warn!(error = %err, "stimulus command rejected");
            }
        }
    }
}

impl Worker for StimulusWorker {
    type Input = TrackingRecord;
    type Output = ();

    fn name(&self) -> &str {
        "stimulus"
    }

    fn initialize(&mut self) -> Result<()> {
        self.projector.open()?;
        if let Some(path) = &self.log_path {
            self.log = Some(StimLog::create(path)?);
        }
        Ok(())
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        if let ControlMessage::Stimulus(command) = message {
            self.select(command.clone());
        }
        Ok(())
    }

    fn work(&mut self, record: Option<TrackingRecord>) -> Result<Option<()>> {
        if let Some(record) = record {
            self.records += 1;
            self.renderer.update_pose(&record);
        }

        let now_ns = self.clock.now_ns();
        let image = self.renderer.render(now_ns);
        self.projector.present(&image)?;

        if !self.unlogged.is_empty() {
            let presented_ns = self.clock.now_ns();
            for command in self.unlogged.drain(..) {
                if let Some(log) = self.log.as_mut() {
                    log.append(presented_ns, &command)?;
                }
            }
        }
        Ok(None)
    }

    fn cleanup(&mut self) -> Result<()> {
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        self.projector.close()
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "presentations": self.projector.presented(),
            "records_used": self.records,
            "pose_updates": self.renderer.pose_updates(),
            "commands_logged": self.log.as_ref().map_or(0, StimLog::entries),
            "commands_rejected": self.rejected,
            "active": self.renderer.command().kind.name(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Calibration;
    use crate::clock::ManualClock;
    use crate::core_modules::records::{AnimalRecord, BoundingBox, Heading};
    use crate::stimulus::command::LoomingCycle;
    use crate::stimulus::patterns::AnimalPose;
    use crate::stimulus::projector::{FrameCaptureProjector, ProjectorGeometry};
    use crate::stimulus::renderer::RasterGeometry;
    use crate::stimulus::stim_log::read_stim_log;

    fn worker(clock: std::sync::Arc<ManualClock>) -> (StimulusWorker, crate::stimulus::projector::CapturedImage) {
        let geometry = ProjectorGeometry {
            width: 200,
            height: 200,
            ..Default::default()
        };
        let projector = FrameCaptureProjector::new(geometry).unpaced();
        let capture = projector.capture();
        let renderer = StimulusRenderer::new(
            &Calibration::identity(1.0),
            RasterGeometry {
                width: 200,
                height: 200,
                pixel_scale: (1.0, 1.0),
            },
            LoomingCycle::ResetToZero,
            AnimalPose::new((50.0, 50.0), (0.0, 1.0)),
        );
        (StimulusWorker::new(renderer, Box::new(projector), clock), capture)
    }

    fn record(index: u64) -> TrackingRecord {
        TrackingRecord {
            index,
            timestamp_ns: 0,
            animals: vec![AnimalRecord {
                identity: 0,
                bbox_px: BoundingBox::new(90, 90, 20, 20),
                centroid_px: (100.0, 100.0),
                heading: Heading::identity(),
                body: None,
                eyes: None,
                tail: None,
            }],
            image: None,
        }
    }

    #[test]
    fn presents_every_tick_and_follows_the_newest_pose() {
        let clock = ManualClock::new();
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stimulus.jsonl");
        let (worker, capture) = worker(clock.clone());
        let mut worker = worker.with_log(log.clone());
        worker.initialize().unwrap();

        worker.work(None).unwrap();
        assert_eq!(capture.lock().as_ref().unwrap().get_pixel(150, 150).0, [0, 0, 0]);

        worker
            .on_control(&ControlMessage::Stimulus(StimulusCommand::phototaxis(1)))
            .unwrap();
        clock.advance_sec(0.5);
        worker.work(Some(record(3))).unwrap();
        {
            let image = capture.lock();
            let image = image.as_ref().unwrap();
            assert_eq!(image.get_pixel(150, 20).0, [255, 255, 255]);
            assert_eq!(image.get_pixel(50, 20).0, [0, 0, 0]);
        }
        worker.work(None).unwrap();
        worker.cleanup().unwrap();

        let entries = read_stim_log(&log).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].timestamp_ns, 500_000_000);
        assert_eq!(entries[0].command, StimulusCommand::phototaxis(1));
        let summary = worker.summary().unwrap();
        assert_eq!(summary["presentations"], 3);
        assert_eq!(summary["pose_updates"], 1);
    }

    #[test]
    fn invalid_commands_keep_the_previous_stimulus() {
        let clock = ManualClock::new();
        let (mut worker, _capture) = worker(clock);
        worker.initialize().unwrap();
        worker
            .on_control(&ControlMessage::Stimulus(StimulusCommand::phototaxis(0)))
            .unwrap();
        assert_eq!(worker.renderer().command(), &StimulusCommand::dark());
        assert_eq!(worker.summary().unwrap()["commands_rejected"], 1);
    }
}
