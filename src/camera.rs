// THEORY:
// The camera is the clock of the pipeline: every frame it delivers starts one
// pass through the DAG. Real drivers live outside this crate and plug in
// through the `Camera` trait, which mirrors what scientific cameras expose
// (exposure, gain, framerate, sensor ROI, acquisition start/stop).
//
// `SyntheticCamera` is the in-tree implementation. It draws N larvae on a
// bright arena, one per cell of a grid, each swimming a circle around its
// cell center with its heading tangent to the path. The ground-truth pose of
// every animal is available through `SyntheticCamera::pose_at`, so tests can
// compare tracking output against what was drawn.
//
// Drawing happens in each animal's body frame: `u` along the heading (head
// positive), `v` along the left-hand perpendicular. A pixel's value is the
// darkest of the parts covering it:
// 1.  **Tail**: a tapering band behind the swim bladder, with a travelling
//     bend so the tail tracker has something to follow.
// 2.  **Head**: an ellipse ahead of the swim bladder.
// 3.  **Eyes**: two dark ellipses on either side of the head.
// 4.  **Swim bladder**: a dark disk at the pose position.

use crate::clock::SharedClock;
use crate::core_modules::frame::Frame;
use crate::error::{Result, VrError};
use image::{GrayImage, Luma, RgbImage};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;

/// Sensor-side operations the pipeline needs from a camera driver.
pub trait Camera: Send {
    fn set_exposure_us(&mut self, exposure_us: f32) -> Result<()>;
    fn set_gain(&mut self, gain: f32) -> Result<()>;
    fn set_framerate(&mut self, fps: f64) -> Result<()>;
    fn set_width(&mut self, width: u32) -> Result<()>;
    fn set_height(&mut self, height: u32) -> Result<()>;
    fn set_offset_x(&mut self, offset_x: u32) -> Result<()>;
    fn set_offset_y(&mut self, offset_y: u32) -> Result<()>;
    fn start_acquisition(&mut self) -> Result<()>;
    fn stop_acquisition(&mut self) -> Result<()>;

    /// Next frame. Indices increase by one per call.
    fn get_frame(&mut self) -> Result<Frame>;
}

/// Synthetic arena parameters, `[camera.synthetic]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    pub n_animals: usize,
    /// Grid of cells holding one animal each; zero picks a near-square grid.
    pub rows: u32,
    pub cols: u32,
    pub pix_per_mm: f32,
    pub swim_speed_mm_per_sec: f32,
    /// Radius of the swimming circle as a fraction of the smaller cell side.
    pub circle_fraction: f32,
    pub background_level: u8,
    /// Peak amplitude of the per-pixel noise, gray levels.
    pub noise: u8,
    pub seed: u64,
    /// Emit 8-bit RGB instead of grayscale.
    pub rgb: bool,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            n_animals: 1,
            rows: 0,
            cols: 0,
            pix_per_mm: 20.0,
            swim_speed_mm_per_sec: 2.0,
            circle_fraction: 0.2,
            background_level: 220,
            noise: 2,
            seed: 7,
            rgb: false,
        }
    }
}

impl SyntheticConfig {
    /// `(rows, cols)` actually used.
    pub fn grid(&self) -> (u32, u32) {
        match (self.rows, self.cols) {
            (0, _) | (_, 0) => {
                let n = self.n_animals.max(1) as f64;
                let cols = n.sqrt().ceil() as u32;
                let rows = (n / cols as f64).ceil() as u32;
                (rows.max(1), cols.max(1))
            }
            (r, c) => (r, c),
        }
    }

    pub fn validate(&self, errors: &mut Vec<String>) {
        let (rows, cols) = self.grid();
        if self.n_animals > (rows * cols) as usize {
            errors.push(format!(
                "camera.synthetic: {} animals do not fit a {rows}x{cols} grid",
                self.n_animals
            ));
        }
        if !(self.pix_per_mm > 0.0) {
            errors.push("camera.synthetic.pix_per_mm must be positive".into());
        }
        if !(0.0..0.5).contains(&self.circle_fraction) {
            errors.push("camera.synthetic.circle_fraction must lie in [0, 0.5)".into());
        }
    }
}

/// `[camera]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub exposure_us: f32,
    pub gain: f32,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    pub offset_x: u32,
    pub offset_y: u32,
    pub synthetic: SyntheticConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            exposure_us: 3000.0,
            gain: 0.0,
            fps: 100.0,
            width: 640,
            height: 480,
            offset_x: 0,
            offset_y: 0,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl CameraConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            errors.push("camera.fps must be positive".into());
        }
        if self.width == 0 || self.height == 0 {
            errors.push("camera.width and camera.height must be positive".into());
        }
        if !(self.exposure_us > 0.0) {
            errors.push("camera.exposure_us must be positive".into());
        }
        if self.gain < 0.0 {
            errors.push("camera.gain must be >= 0".into());
        }
        self.synthetic.validate(errors);
    }

    /// Pushes every setting to `camera`, in the order drivers expect (ROI
    /// size before offsets).
    pub fn apply(&self, camera: &mut dyn Camera) -> Result<()> {
        camera.set_width(self.width)?;
        camera.set_height(self.height)?;
        camera.set_offset_x(self.offset_x)?;
        camera.set_offset_y(self.offset_y)?;
        camera.set_exposure_us(self.exposure_us)?;
        camera.set_gain(self.gain)?;
        camera.set_framerate(self.fps)
    }
}

/// Body dimensions, millimeters.
const HEAD_OFFSET_MM: f32 = 0.3;
const HEAD_SEMI_AXES_MM: (f32, f32) = (0.55, 0.32);
const EYE_OFFSET_MM: (f32, f32) = (0.5, 0.24);
const EYE_SEMI_AXES_MM: (f32, f32) = (0.17, 0.1);
const BLADDER_RADIUS_MM: f32 = 0.14;
const TAIL_LENGTH_MM: f32 = 3.0;
const TAIL_HALF_WIDTH_MM: (f32, f32) = (0.2, 0.05);
const TAIL_BEND_MM: f32 = 0.25;
const TAIL_BEAT_HZ: f32 = 2.0;

/// Gray levels of the body parts.
const HEAD_LEVEL: u8 = 110;
const EYE_LEVEL: u8 = 25;
const BLADDER_LEVEL: u8 = 50;
const TAIL_LEVEL: u8 = 140;

/// Ground-truth pose of a synthetic animal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticPose {
    /// Swim bladder position, camera pixels.
    pub position: Point2<f32>,
    /// Heading angle in image coordinates, radians.
    pub heading_rad: f32,
}

impl SyntheticPose {
    pub fn forward(&self) -> Vector2<f32> {
        Vector2::new(self.heading_rad.cos(), self.heading_rad.sin())
    }
}

pub struct SyntheticCamera {
    config: CameraConfig,
    clock: SharedClock,
    acquiring: bool,
    next_index: u64,
}

impl SyntheticCamera {
    pub fn new(config: CameraConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            acquiring: false,
            next_index: 0,
        }
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    fn cell(&self, animal: usize) -> (Point2<f32>, f32) {
        let (rows, cols) = self.config.synthetic.grid();
        let cell_w = self.config.width as f32 / cols as f32;
        let cell_h = self.config.height as f32 / rows as f32;
        let (row, col) = (animal as u32 / cols, animal as u32 % cols);
        let center = Point2::new((col as f32 + 0.5) * cell_w, (row as f32 + 0.5) * cell_h);
        (center, cell_w.min(cell_h))
    }

    /// Where animal `animal` is at `t_sec`.
    pub fn pose_at(&self, animal: usize, t_sec: f64) -> SyntheticPose {
        let s = &self.config.synthetic;
        let (center, side) = self.cell(animal);
        let radius_px = side * s.circle_fraction;
        if radius_px < 1.0 || s.swim_speed_mm_per_sec <= 0.0 {
            return SyntheticPose {
                position: center,
                heading_rad: 0.0,
            };
        }
        let omega = s.swim_speed_mm_per_sec * s.pix_per_mm / radius_px;
        // Alternate directions and phases so neighbours do not move in lockstep.
        let sign = if animal % 2 == 0 { 1.0 } else { -1.0 };
        let phase = animal as f32 * 1.3 + sign * ((omega as f64 * t_sec) % TAU as f64) as f32;
        let position = center + Vector2::new(phase.cos(), phase.sin()) * radius_px;
        let heading_rad = phase + sign * TAU / 4.0;
        SyntheticPose { position, heading_rad }
    }

    /// Renders the arena at `t_sec`.
    pub fn render(&self, index: u64, t_sec: f64) -> GrayImage {
        let s = &self.config.synthetic;
        let (w, h) = (self.config.width, self.config.height);
        let mut image = GrayImage::from_pixel(w, h, Luma([s.background_level]));
        for animal in 0..s.n_animals {
            draw_larva(&mut image, self.pose_at(animal, t_sec), s.pix_per_mm, t_sec as f32);
        }
        if s.noise > 0 {
            let amplitude = s.noise as i32;
            let mut state = s.seed ^ index.wrapping_mul(0x9E37_79B9_7F4A_7C15);
            for p in image.pixels_mut() {
                state = xorshift(state);
                let n = (state % (2 * amplitude as u64 + 1)) as i32 - amplitude;
                p[0] = (p[0] as i32 + n).clamp(0, 255) as u8;
            }
        }
        image
    }

    fn check_idle(&self, what: &str) -> Result<()> {
        if self.acquiring {
            return Err(VrError::camera(format!("cannot change {what} while acquiring")));
        }
        Ok(())
    }
}

fn xorshift(mut x: u64) -> u64 {
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x
}

fn draw_larva(image: &mut GrayImage, pose: SyntheticPose, ppm: f32, t_sec: f32) {
    let forward = pose.forward();
    let left = Vector2::new(-forward.y, forward.x);
    let reach = ((TAIL_LENGTH_MM + 1.0) * ppm).ceil() as i64;
    let (cx, cy) = (pose.position.x as i64, pose.position.y as i64);
    let (w, h) = (image.width() as i64, image.height() as i64);

    let inside = |u: f32, v: f32, c: (f32, f32), axes: (f32, f32)| {
        let du = (u - c.0) / axes.0;
        let dv = (v - c.1) / axes.1;
        du * du + dv * dv <= 1.0
    };

    for y in (cy - reach).max(0)..(cy + reach).min(h) {
        for x in (cx - reach).max(0)..(cx + reach).min(w) {
            let d = Vector2::new(x as f32 + 0.5, y as f32 + 0.5) - pose.position.coords;
            let (u, v) = (d.dot(&forward) / ppm, d.dot(&left) / ppm);

            let mut level = u8::MAX;
            if u < 0.0 && u > -TAIL_LENGTH_MM {
                let s = -u / TAIL_LENGTH_MM;
                let bend = TAIL_BEND_MM * s * s * (TAU * (TAIL_BEAT_HZ * t_sec - s)).sin();
                let half = TAIL_HALF_WIDTH_MM.0 + (TAIL_HALF_WIDTH_MM.1 - TAIL_HALF_WIDTH_MM.0) * s;
                if (v - bend).abs() <= half {
                    level = level.min(TAIL_LEVEL);
                }
            }
            if inside(u, v, (HEAD_OFFSET_MM, 0.0), HEAD_SEMI_AXES_MM) {
                level = level.min(HEAD_LEVEL);
            }
            for side in [1.0, -1.0] {
                if inside(u, v, (EYE_OFFSET_MM.0, side * EYE_OFFSET_MM.1), EYE_SEMI_AXES_MM) {
                    level = level.min(EYE_LEVEL);
                }
            }
            if u * u + v * v <= BLADDER_RADIUS_MM * BLADDER_RADIUS_MM {
                level = level.min(BLADDER_LEVEL);
            }

            if level < u8::MAX {
                let p = image.get_pixel_mut(x as u32, y as u32);
                p[0] = p[0].min(level);
            }
        }
    }
}

impl Camera for SyntheticCamera {
    fn set_exposure_us(&mut self, exposure_us: f32) -> Result<()> {
        if !(exposure_us > 0.0) {
            return Err(VrError::camera(format!("exposure {exposure_us} us out of range")));
        }
        self.config.exposure_us = exposure_us;
        Ok(())
    }

    fn set_gain(&mut self, gain: f32) -> Result<()> {
        if gain < 0.0 {
            return Err(VrError::camera(format!("gain {gain} out of range")));
        }
        self.config.gain = gain;
        Ok(())
    }

    fn set_framerate(&mut self, fps: f64) -> Result<()> {
        if !(fps > 0.0 && fps.is_finite()) {
            return Err(VrError::camera(format!("framerate {fps} out of range")));
        }
        self.config.fps = fps;
        Ok(())
    }

    fn set_width(&mut self, width: u32) -> Result<()> {
        self.check_idle("width")?;
        if width == 0 {
            return Err(VrError::camera("width must be positive"));
        }
        self.config.width = width;
        Ok(())
    }

    fn set_height(&mut self, height: u32) -> Result<()> {
        self.check_idle("height")?;
        if height == 0 {
            return Err(VrError::camera("height must be positive"));
        }
        self.config.height = height;
        Ok(())
    }

    fn set_offset_x(&mut self, offset_x: u32) -> Result<()> {
        self.check_idle("offset_x")?;
        self.config.offset_x = offset_x;
        Ok(())
    }

    fn set_offset_y(&mut self, offset_y: u32) -> Result<()> {
        self.check_idle("offset_y")?;
        self.config.offset_y = offset_y;
        Ok(())
    }

    fn start_acquisition(&mut self) -> Result<()> {
        self.acquiring = true;
        tracing::info!(
            width = self.config.width,
            height = self.config.height,
            fps = self.config.fps,
            animals = self.config.synthetic.n_animals,
            "synthetic acquisition started"
        );
        Ok(())
    }

    fn stop_acquisition(&mut self) -> Result<()> {
        self.acquiring = false;
        Ok(())
    }

    fn get_frame(&mut self) -> Result<Frame> {
        if !self.acquiring {
            return Err(VrError::camera("get_frame called before start_acquisition"));
        }
        let timestamp_ns = self.clock.now_ns();
        let index = self.next_index;
        self.next_index += 1;
        let image = self.render(index, crate::clock::ns_to_sec(timestamp_ns));
        if self.config.synthetic.rgb {
            let rgb: RgbImage = image::DynamicImage::ImageLuma8(image).to_rgb8();
            Ok(Frame::rgb(index, timestamp_ns, rgb))
        } else {
            Ok(Frame::gray(index, timestamp_ns, image))
        }
    }
}
