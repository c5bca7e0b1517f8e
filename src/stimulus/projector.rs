//! Projector sinks.
//!
//! The display driver itself is external; what the engine needs from it is a
//! fixed raster and a `present` call that returns once the image is on screen
//! at the next vsync. `VsyncPacer` provides that timing contract for sinks
//! that have no real vsync of their own.

use crate::error::{Result, VrError};
use image::RgbImage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Placement and timing of the projector window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorGeometry {
    pub width: u32,
    pub height: u32,
    pub offset_x: i32,
    pub offset_y: i32,
    pub fps: f64,
    pub pixel_scale_x: f32,
    pub pixel_scale_y: f32,
}

impl Default for ProjectorGeometry {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            offset_x: 0,
            offset_y: 0,
            fps: 60.0,
            pixel_scale_x: 1.0,
            pixel_scale_y: 1.0,
        }
    }
}

/// Output device for rendered stimuli.
pub trait Projector: Send {
    fn geometry(&self) -> ProjectorGeometry;

    /// Opens the display. Failure is a hardware error.
    fn open(&mut self) -> Result<()>;

    /// Shows `image` at the next vsync; returns once it is on screen.
    fn present(&mut self, image: &RgbImage) -> Result<()>;

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn presented(&self) -> u64;
}

/// Sleeps until the next vsync boundary, at most one presentation per interval.
#[derive(Debug)]
pub struct VsyncPacer {
    period: Option<Duration>,
    next: Option<Instant>,
}

impl VsyncPacer {
    pub fn new(fps: f64) -> Self {
        let period = (fps.is_finite() && fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
        Self { period, next: None }
    }

    /// No pacing; used by offline tests.
    pub fn unpaced() -> Self {
        Self {
            period: None,
            next: None,
        }
    }

    pub fn wait(&mut self) {
        let Some(period) = self.period else {
            return;
        };
        let now = Instant::now();
        let due = *self.next.get_or_insert(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        let mut next = due + period;
        let now = Instant::now();
        while next <= now {
            next += period;
        }
        self.next = Some(next);
    }
}

fn check_raster(geometry: &ProjectorGeometry, image: &RgbImage) -> Result<()> {
    if image.dimensions() != (geometry.width, geometry.height) {
        return Err(VrError::projector(format!(
            "image is {}x{}, projector raster is {}x{}",
            image.width(),
            image.height(),
            geometry.width,
            geometry.height
        )));
    }
    Ok(())
}

/// Slot shared with whoever watches a `FrameCaptureProjector`.
pub type CapturedImage = Arc<Mutex<Option<RgbImage>>>;

/// Keeps the last presented image. Used for tests and live preview.
pub struct FrameCaptureProjector {
    geometry: ProjectorGeometry,
    pacer: VsyncPacer,
    last: CapturedImage,
    presented: u64,
    opened: bool,
}

impl FrameCaptureProjector {
    pub fn new(geometry: ProjectorGeometry) -> Self {
        Self {
            pacer: VsyncPacer::new(geometry.fps),
            geometry,
            last: Arc::new(Mutex::new(None)),
            presented: 0,
            opened: false,
        }
    }

    pub fn unpaced(mut self) -> Self {
        self.pacer = VsyncPacer::unpaced();
        self
    }

    /// Shared slot holding the last presented image.
    pub fn capture(&self) -> CapturedImage {
        self.last.clone()
    }
}

impl Projector for FrameCaptureProjector {
    fn geometry(&self) -> ProjectorGeometry {
        self.geometry
    }

    fn open(&mut self) -> Result<()> {
        if self.geometry.width == 0 || self.geometry.height == 0 {
            return Err(VrError::projector("projector raster is empty"));
        }
        self.opened = true;
        Ok(())
    }

    fn present(&mut self, image: &RgbImage) -> Result<()> {
        if !self.opened {
            return Err(VrError::projector("present before open"));
        }
        check_raster(&self.geometry, image)?;
        self.pacer.wait();
        *self.last.lock() = Some(image.clone());
        self.presented += 1;
        Ok(())
    }

    fn presented(&self) -> u64 {
        self.presented
    }
}

/// Discards images but keeps vsync timing.
pub struct NullProjector {
    geometry: ProjectorGeometry,
    pacer: VsyncPacer,
    presented: u64,
}

impl NullProjector {
    pub fn new(geometry: ProjectorGeometry) -> Self {
        Self {
            pacer: VsyncPacer::new(geometry.fps),
            geometry,
            presented: 0,
        }
    }
}

impl Projector for NullProjector {
    fn geometry(&self) -> ProjectorGeometry {
        self.geometry
    }

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn present(&mut self, image: &RgbImage) -> Result<()> {
        check_raster(&self.geometry, image)?;
        self.pacer.wait();
        self.presented += 1;
        Ok(())
    }

    fn presented(&self) -> u64 {
        self.presented
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ProjectorGeometry {
        ProjectorGeometry {
            width: 8,
            height: 4,
            fps: 200.0,
            ..Default::default()
        }
    }

    #[test]
    fn presents_at_most_once_per_vsync_interval() {
        let mut projector = NullProjector::new(small());
        projector.open().unwrap();
        let image = RgbImage::new(8, 4);
        let start = Instant::now();
        for _ in 0..5 {
            projector.present(&image).unwrap();
        }
        // First present is immediate, the next four wait one 5 ms interval each.
        assert!(start.elapsed() >= Duration::from_millis(19));
        assert_eq!(projector.presented(), 5);
    }

    #[test]
    fn capture_keeps_the_last_image() {
        let mut projector = FrameCaptureProjector::new(small()).unpaced();
        let capture = projector.capture();
        assert!(projector.present(&RgbImage::new(8, 4)).is_err());
        projector.open().unwrap();
        projector
            .present(&RgbImage::from_pixel(8, 4, image::Rgb([1, 2, 3])))
            .unwrap();
        assert_eq!(capture.lock().as_ref().unwrap().get_pixel(0, 0).0, [1, 2, 3]);
    }

    #[test]
    fn wrong_raster_is_a_hardware_error() {
        let mut projector = NullProjector::new(small());
        let err = projector.present(&RgbImage::new(3, 3)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
