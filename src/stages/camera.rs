//! Acquisition source and the decimated video sink hanging off it.

use crate::camera::{Camera, CameraConfig};
use crate::core_modules::frame::{Frame, FramePixels};
use crate::error::Result;
use crate::ipc::control::ControlMessage;
use crate::video::{VideoConfig, VideoWriter};
use crate::worker::Worker;
use serde_json::json;
use std::path::PathBuf;

/// Source worker: one frame per tick, converted to 8-bit gray.
pub struct CameraWorker {
    camera: Box<dyn Camera>,
    config: CameraConfig,
    acquired: u64,
    converted: u64,
    first_index: Option<u64>,
    last_index: Option<u64>,
}

impl CameraWorker {
    pub fn new(camera: Box<dyn Camera>, config: CameraConfig) -> Self {
        Self {
            camera,
            config,
            acquired: 0,
            converted: 0,
            first_index: None,
            last_index: None,
        }
    }
}

impl Worker for CameraWorker {
    type Input = ();
    type Output = Frame;

    fn name(&self) -> &str {
        "camera"
    }

    fn initialize(&mut self) -> Result<()> {
        self.config.apply(self.camera.as_mut())?;
        self.camera.start_acquisition()
    }

    fn work(&mut self, _tick: Option<()>) -> Result<Option<Frame>> {
        let mut frame = self.camera.get_frame()?;
        if matches!(frame.pixels, FramePixels::Rgb(_)) {
            frame = frame.into_gray();
            self.converted += 1;
        }
        self.acquired += 1;
        self.first_index.get_or_insert(frame.index);
        self.last_index = Some(frame.index);
        Ok(Some(frame))
    }

    fn cleanup(&mut self) -> Result<()> {
        self.camera.stop_acquisition()
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "frames_acquired": self.acquired,
            "rgb_converted": self.converted,
            "first_index": self.first_index,
            "last_index": self.last_index,
        }))
    }
}

/// Sink worker writing every n-th camera frame.
pub struct VideoWorker {
    dir: PathBuf,
    config: VideoConfig,
    writer: Option<VideoWriter>,
    recording: bool,
    paused_frames: u64,
}

impl VideoWorker {
    pub fn new(dir: PathBuf, config: VideoConfig) -> Self {
        Self {
            dir,
            config,
            writer: None,
            recording: true,
            paused_frames: 0,
        }
    }
}

impl Worker for VideoWorker {
    type Input = Frame;
    type Output = ();

    fn name(&self) -> &str {
        "video"
    }

    fn initialize(&mut self) -> Result<()> {
        self.writer = Some(VideoWriter::create(&self.dir, &self.config)?);
        Ok(())
    }

    fn on_control(&mut self, message: &ControlMessage) -> Result<()> {
        if let ControlMessage::SetRecording(on) = message {
            self.recording = *on;
        }
        Ok(())
    }

    fn work(&mut self, frame: Option<Frame>) -> Result<Option<()>> {
        let (Some(frame), Some(writer)) = (frame, self.writer.as_mut()) else {
            return Ok(None);
        };
        if !self.recording {
            self.paused_frames += 1;
            return Ok(None);
        }
        writer.write(&frame)?;
        Ok(None)
    }

    fn cleanup(&mut self) -> Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.finish(),
            None => Ok(()),
        }
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "frames_written": self.writer.as_ref().map_or(0, VideoWriter::written),
            "paused_frames": self.paused_frames,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{SyntheticCamera, SyntheticConfig};
    use crate::clock::ManualClock;
    use crate::error::ErrorClass;

    fn config(rgb: bool) -> CameraConfig {
        CameraConfig {
            width: 64,
            height: 48,
            synthetic: SyntheticConfig {
                rgb,
                noise: 0,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn rgb_frames_leave_the_camera_as_gray() {
        let clock = ManualClock::new();
        let camera = SyntheticCamera::new(config(true), clock.clone());
        let mut worker = CameraWorker::new(Box::new(camera), config(true));
        worker.initialize().unwrap();
        let frame = worker.work(Some(())).unwrap().unwrap();
        assert_eq!(frame.pixels.channels(), 1);
        assert_eq!((frame.width(), frame.height()), (64, 48));
        let summary = worker.summary().unwrap();
        assert_eq!(summary["frames_acquired"], 1);
        assert_eq!(summary["rgb_converted"], 1);
        worker.cleanup().unwrap();
    }

    #[test]
    fn bad_settings_fail_initialize_as_hardware_errors() {
        let clock = ManualClock::new();
        let mut bad = config(false);
        bad.exposure_us = -1.0;
        let camera = SyntheticCamera::new(config(false), clock);
        let mut worker = CameraWorker::new(Box::new(camera), bad);
        assert_eq!(worker.initialize().unwrap_err().class(), ErrorClass::Hardware);
    }

    #[test]
    fn video_pauses_while_recording_is_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut worker = VideoWorker::new(
            dir.path().to_path_buf(),
            VideoConfig {
                enabled: true,
                decimation: 1,
                scale: 1.0,
                ..Default::default()
            },
        );
        worker.initialize().unwrap();
        let frame = |i| Frame::gray(i, i as i64, image::GrayImage::new(4, 4));
        worker.work(Some(frame(0))).unwrap();
        worker.on_control(&ControlMessage::SetRecording(false)).unwrap();
        worker.work(Some(frame(1))).unwrap();
        worker.on_control(&ControlMessage::SetRecording(true)).unwrap();
        worker.work(Some(frame(2))).unwrap();
        worker.cleanup().unwrap();
        let summary = worker.summary().unwrap();
        assert_eq!(summary["frames_written"], 2);
        assert_eq!(summary["paused_frames"], 1);
        assert!(dir.path().join("frames/frame_00000002.png").exists());
    }
}
