use crate::core_modules::assignment::AssignmentConfig;
use crate::core_modules::frame::SubtractedFrame;
use crate::core_modules::records::TrackingRecord;
use crate::core_modules::tracker::{AnimalTracker, TrackerConfig};
use crate::error::Result;
use crate::ipc::control::ControlMessage;
use crate::worker::Worker;

/// Turns subtracted frames into tracking records. Runs M-wide behind the
/// background workers' round-robin dispatch. With distance matching the
/// records carry provisional identities that the identity stage replaces.
pub struct TrackerWorker {
    name: String,
    tracker: AnimalTracker,
}

impl TrackerWorker {
    pub fn new(
        rank: usize,
        config: &TrackerConfig,
        assignment: &AssignmentConfig,
        pix_per_mm: f32,
        frame_size: (u32, u32),
    ) -> Self {
        let mut tracker = AnimalTracker::new(config, assignment, pix_per_mm, frame_size);
        if assignment.is_stateful() {
            tracker = tracker.deferring_identity();
        }
        Self {
            name: format!("tracker_{rank}"),
            tracker,
        }
    }
}

impl Worker for TrackerWorker {
    type Input = SubtractedFrame;
    type Output = TrackingRecord;

    fn name(&self) -> &str {
        &self.name
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        match message {
            ControlMessage::SetIntensityThreshold(intensity) => {
                self.tracker.set_intensity(*intensity);
                tracing::info!(worker = %self.name, intensity, "intensity threshold changed");
            }
            ControlMessage::ResetBackground => self.tracker.reset(),
            _ => {}
        }
        Ok(())
    }

    fn work(&mut self, frame: Option<SubtractedFrame>) -> Result<Option<TrackingRecord>> {
        Ok(frame.map(|frame| self.tracker.track(&frame)))
    }

    fn summary(&self) -> Option<serde_json::Value> {
        serde_json::to_value(self.tracker.stats()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::Polarity;

    #[test]
    fn empty_frames_still_yield_records() {
        let config = TrackerConfig {
            preview_width: 0,
            ..Default::default()
        };
        let mut worker = TrackerWorker::new(1, &config, &AssignmentConfig::default(), 10.0, (32, 32));
        assert_eq!(worker.name(), "tracker_1");
        let frame = SubtractedFrame::zeros(7, 70, Polarity::DarkOnBright, 32, 32);
        let record = worker.work(Some(frame)).unwrap().unwrap();
        assert_eq!(record.index, 7);
        assert!(record.animals.is_empty());
        assert!(worker.work(None).unwrap().is_none());

        worker.on_control(&ControlMessage::SetIntensityThreshold(0.5)).unwrap();
        let stats = worker.summary().unwrap();
        assert_eq!(stats["frames"], 1);
        assert_eq!(stats["tracking_failures"], 1);
    }
}
