use crate::core_modules::background::{BackgroundConfig, BackgroundModel};
use crate::core_modules::frame::{Frame, SubtractedFrame};
use crate::error::Result;
use crate::ipc::control::ControlMessage;
use crate::worker::Worker;
use serde_json::json;

/// One of N background workers. All of them learn from every frame; worker
/// `rank` forwards only the frames with `index % N == rank`.
pub struct BackgroundWorker {
    name: String,
    rank: u64,
    workers: u64,
    model: Box<dyn BackgroundModel>,
    seen: u64,
    forwarded: u64,
    degenerate: u64,
    resets: u64,
}

impl BackgroundWorker {
    pub fn new(rank: usize, workers: usize, config: &BackgroundConfig) -> Self {
        Self {
            name: format!("background_{rank}"),
            rank: rank as u64,
            workers: workers.max(1) as u64,
            model: config.build(),
            seen: 0,
            forwarded: 0,
            degenerate: 0,
            resets: 0,
        }
    }

    pub fn owns(&self, index: u64) -> bool {
        index % self.workers == self.rank
    }

    pub fn model(&self) -> &dyn BackgroundModel {
        self.model.as_ref()
    }
}

impl Worker for BackgroundWorker {
    type Input = Frame;
    type Output = SubtractedFrame;

    fn name(&self) -> &str {
        &self.name
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        match message {
            ControlMessage::SetPolarity(polarity) => self.model.set_polarity(*polarity),
            ControlMessage::ResetBackground => {
                self.model.reset();
                self.resets += 1;
                tracing::info!(worker = %self.name, "background reset");
            }
            _ => {}
        }
        Ok(())
    }

    fn work(&mut self, frame: Option<Frame>) -> Result<Option<SubtractedFrame>> {
        let Some(frame) = frame else {
            return Ok(None);
        };
        self.seen += 1;
        self.model.add_image(&frame);
        if !self.owns(frame.index) {
            return Ok(None);
        }
        if !self.model.is_ready() {
            self.degenerate += 1;
        }
        self.forwarded += 1;
        Ok(Some(self.model.subtract(&frame)))
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "frames_seen": self.seen,
            "frames_forwarded": self.forwarded,
            "degenerate_frames": self.degenerate,
            "resets": self.resets,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::Polarity;
    use image::{GrayImage, Luma};

    fn frame(index: u64, level: u8) -> Frame {
        Frame::gray(index, index as i64 * 10_000_000, GrayImage::from_pixel(8, 8, Luma([level])))
    }

    fn config() -> BackgroundConfig {
        BackgroundConfig {
            num_samples: 2,
            sample_interval_sec: 0.0,
            ..Default::default()
        }
    }

    #[test]
    fn ranks_partition_the_frames() {
        let mut workers: Vec<BackgroundWorker> = (0..3).map(|r| BackgroundWorker::new(r, 3, &config())).collect();
        for i in 0..9 {
            let out: Vec<u64> = workers
                .iter_mut()
                .filter_map(|w| w.work(Some(frame(i, 200))).unwrap())
                .map(|s| s.index)
                .collect();
            assert_eq!(out, vec![i]);
        }
        for w in &workers {
            assert_eq!(w.summary().unwrap()["frames_seen"], 9);
            assert_eq!(w.summary().unwrap()["frames_forwarded"], 3);
        }
    }

    #[test]
    fn reset_and_polarity_messages_reach_the_model() {
        let mut worker = BackgroundWorker::new(0, 1, &config());
        worker.work(Some(frame(0, 200))).unwrap();
        worker.work(Some(frame(1, 200))).unwrap();
        assert!(worker.model().is_ready());

        worker.on_control(&ControlMessage::ResetBackground).unwrap();
        assert!(!worker.model().is_ready());

        worker
            .on_control(&ControlMessage::SetPolarity(Polarity::BrightOnDark))
            .unwrap();
        assert_eq!(worker.model().polarity(), Polarity::BrightOnDark);
        worker.on_control(&ControlMessage::SoftwareTrigger).unwrap();
    }
}
