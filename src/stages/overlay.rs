use crate::core_modules::overlay::{AnnotatedFrame, DisplayConfig, Overlay};
use crate::core_modules::records::TrackingRecord;
use crate::error::Result;
use crate::worker::Worker;
use serde_json::json;

/// Annotates the newest tracking preview at the display rate.
pub struct OverlayWorker {
    overlay: Overlay,
    without_preview: u64,
}

impl OverlayWorker {
    pub fn new(config: &DisplayConfig, camera_size: (u32, u32)) -> Self {
        Self {
            overlay: Overlay::new(config, camera_size),
            without_preview: 0,
        }
    }
}

impl Worker for OverlayWorker {
    type Input = TrackingRecord;
    type Output = AnnotatedFrame;

    fn name(&self) -> &str {
        "overlay"
    }

    fn work(&mut self, record: Option<TrackingRecord>) -> Result<Option<AnnotatedFrame>> {
        let Some(record) = record else {
            return Ok(None);
        };
        if record.image.is_none() {
            self.without_preview += 1;
            return Ok(None);
        }
        Ok(self.overlay.process(record))
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "drawn": self.overlay.drawn(),
            "rate_limited": self.overlay.skipped(),
            "without_preview": self.without_preview,
        }))
    }
}
