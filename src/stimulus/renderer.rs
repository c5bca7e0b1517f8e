// THEORY:
// The renderer turns (active command, latest pose, time) into one projector
// image. It is a CPU rasterizer organized the way a fragment shader would be:
//
// 1.  **Setup, once.** For every projector pixel the matching camera-space
//     point is precomputed through `proj_to_cam` (after the optional
//     non-uniform pixel scaling of native-mode projectors). This lookup table
//     plays the role of the per-pattern framebuffer.
// 2.  **Uniforms, per frame.** The command, the pose and the time since the
//     command started form a `PatternContext`.
// 3.  **Fragments, in parallel.** Each row is shaded independently with
//     `rayon`; every pixel asks `patterns::shade` for its color at its
//     camera-space point.
//
// The pose persists between tracking records: if no new record arrived the
// previous pose is drawn again, so tracking latency never blocks the display.

use crate::calibration::Calibration;
use crate::core_modules::records::TrackingRecord;
use crate::error::Result;
use crate::stimulus::command::{LoomingCycle, Rgba, StimulusCommand};
use crate::stimulus::patterns::{AnimalPose, PatternContext, shade};
use image::RgbImage;
use nalgebra::Point2;
use rayon::prelude::*;

/// Projector raster geometry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RasterGeometry {
    pub width: u32,
    pub height: u32,
    /// Non-uniform pixel scaling applied before the calibration map.
    pub pixel_scale: (f32, f32),
}

/// CPU stimulus rasterizer in projector space.
pub struct StimulusRenderer {
    geometry: RasterGeometry,
    pix_per_mm: f32,
    lookup: Vec<Point2<f32>>,
    looming_cycle: LoomingCycle,
    command: StimulusCommand,
    command_started_ns: i64,
    pose: AnimalPose,
    /// Animal whose pose drives the stimulus; the first one when unset.
    target_identity: Option<u32>,
    pose_updates: u64,
}

impl StimulusRenderer {
    pub fn new(
        calibration: &Calibration,
        geometry: RasterGeometry,
        looming_cycle: LoomingCycle,
        default_pose: AnimalPose,
    ) -> Self {
        let (sx, sy) = geometry.pixel_scale;
        let mut lookup = Vec::with_capacity((geometry.width * geometry.height) as usize);
        for v in 0..geometry.height {
            for u in 0..geometry.width {
                let proj = Point2::new(u as f64 * sx as f64, v as f64 * sy as f64);
                let cam = calibration.proj_to_cam(proj);
                lookup.push(Point2::new(cam.x as f32, cam.y as f32));
            }
        }
        Self {
            geometry,
            pix_per_mm: calibration.pix_per_mm(),
            lookup,
            looming_cycle,
            command: StimulusCommand::dark(),
            command_started_ns: 0,
            pose: default_pose,
            target_identity: None,
            pose_updates: 0,
        }
    }

    pub fn with_target_identity(mut self, identity: Option<u32>) -> Self {
        self.target_identity = identity;
        self
    }

    pub fn geometry(&self) -> RasterGeometry {
        self.geometry
    }

    pub fn command(&self) -> &StimulusCommand {
        &self.command
    }

    pub fn pose(&self) -> AnimalPose {
        self.pose
    }

    pub fn pose_updates(&self) -> u64 {
        self.pose_updates
    }

    /// Makes `command` active from `now_ns` on.
    pub fn set_command(&mut self, command: StimulusCommand, now_ns: i64) -> Result<()> {
        command.validate()?;
        self.command = command;
        self.command_started_ns = now_ns;
        Ok(())
    }

    /// Takes the pose of the target animal from `record`, if present.
    pub fn update_pose(&mut self, record: &TrackingRecord) -> bool {
        let animal = match self.target_identity {
            Some(id) => record.animal(id),
            None => record.animals.iter().min_by_key(|a| a.identity),
        };
        let Some(animal) = animal else {
            return false;
        };
        let h = animal.heading.principal();
        if !(animal.centroid_px.0.is_finite() && animal.centroid_px.1.is_finite() && h.x.is_finite() && h.y.is_finite()) {
            return false;
        }
        self.pose = AnimalPose::new(animal.centroid_px, (h.x, h.y));
        self.pose_updates += 1;
        true
    }

    pub fn set_pose(&mut self, pose: AnimalPose) {
        self.pose = pose;
    }

    pub fn context(&self, now_ns: i64) -> PatternContext {
        PatternContext {
            t_sec: ((now_ns - self.command_started_ns).max(0) as f64 / 1e9) as f32,
            pix_per_mm: self.pix_per_mm,
            animal: self.pose,
            looming_cycle: self.looming_cycle,
        }
    }

    /// Rasterizes the active command at `now_ns`.
    pub fn render(&self, now_ns: i64) -> RgbImage {
        let ctx = self.context(now_ns);
        let width = self.geometry.width as usize;
        let mut image = RgbImage::new(self.geometry.width, self.geometry.height);
        if width == 0 {
            return image;
        }
        let command = &self.command;
        let lookup = &self.lookup;
        image
            .par_chunks_mut(width * 3)
            .enumerate()
            .for_each(|(row, pixels)| {
                let base = row * width;
                for (col, px) in pixels.chunks_exact_mut(3).enumerate() {
                    let color = shade(command, &ctx, lookup[base + col]);
                    px.copy_from_slice(&to_rgb8(color));
                }
            });
        image
    }
}

/// Linear RGBA to 8-bit RGB, alpha composited over black.
pub fn to_rgb8(color: Rgba) -> [u8; 3] {
    let a = color[3].clamp(0.0, 1.0);
    let channel = |c: f32| ((c * a).clamp(0.0, 1.0) * 255.0).round() as u8;
    [channel(color[0]), channel(color[1]), channel(color[2])]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::records::{AnimalRecord, BoundingBox, Heading};
    use nalgebra::Matrix3;

    fn renderer(calibration: &Calibration, width: u32, height: u32) -> StimulusRenderer {
        StimulusRenderer::new(
            calibration,
            RasterGeometry {
                width,
                height,
                pixel_scale: (1.0, 1.0),
            },
            LoomingCycle::ResetToZero,
            AnimalPose::new((100.0, 100.0), (1.0, 0.0)),
        )
    }

    #[test]
    fn phototaxis_paints_the_half_ahead_of_the_animal() {
        let cal = Calibration::identity(1.0);
        let mut r = renderer(&cal, 200, 200);
        r.set_command(StimulusCommand::phototaxis(1), 0).unwrap();
        let img = r.render(0);
        assert_eq!(img.get_pixel(150, 20).0, [255, 255, 255]);
        assert_eq!(img.get_pixel(100, 150).0, [255, 255, 255]);
        assert_eq!(img.get_pixel(99, 150).0, [0, 0, 0]);

        r.set_command(StimulusCommand::phototaxis(-1), 0).unwrap();
        let img = r.render(0);
        assert_eq!(img.get_pixel(150, 20).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(20, 20).0, [255, 255, 255]);
    }

    #[test]
    fn patterns_are_evaluated_in_camera_space() {
        // Projector is shifted 50 px right of the camera.
        let shift = Matrix3::new(1.0, 0.0, 50.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0);
        let cal = Calibration::from_cam_to_proj(1.0, shift).unwrap();
        let mut r = renderer(&cal, 300, 10);
        r.set_command(StimulusCommand::phototaxis(1), 0).unwrap();
        let img = r.render(0);
        // Camera x = 100 lands on projector x = 150.
        assert_eq!(img.get_pixel(149, 5).0, [0, 0, 0]);
        assert_eq!(img.get_pixel(150, 5).0, [255, 255, 255]);
    }

    #[test]
    fn pose_persists_without_new_tracking() {
        let cal = Calibration::identity(1.0);
        let mut r = renderer(&cal, 10, 10);
        let record = TrackingRecord {
            index: 1,
            timestamp_ns: 0,
            animals: vec![AnimalRecord {
                identity: 4,
                bbox_px: BoundingBox::default(),
                centroid_px: (3.0, 4.0),
                heading: Heading::from_angle(std::f32::consts::FRAC_PI_2),
                body: None,
                eyes: None,
                tail: None,
            }],
            image: None,
        };
        assert!(r.update_pose(&record));
        assert!(!r.update_pose(&TrackingRecord::empty(2, 0)));
        assert_eq!(r.pose().centroid, Point2::new(3.0, 4.0));
        assert_eq!(r.pose_updates(), 1);
    }

    #[test]
    fn invalid_commands_are_refused() {
        let cal = Calibration::identity(1.0);
        let mut r = renderer(&cal, 4, 4);
        assert!(r.set_command(StimulusCommand::phototaxis(3), 0).is_err());
        assert_eq!(r.command(), &StimulusCommand::dark());
    }

    #[test]
    fn alpha_composites_over_black() {
        assert_eq!(to_rgb8([1.0, 0.5, 0.0, 1.0]), [255, 128, 0]);
        assert_eq!(to_rgb8([1.0, 1.0, 1.0, 0.0]), [0, 0, 0]);
    }
}
