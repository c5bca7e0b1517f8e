// THEORY:
// The overlay draws what the tracker believes on top of the tracker's preview
// image, for a human watching the run. It never feeds back into tracking.
//
// 1.  **Rate.** Previews arrive at camera rate; people watch at a few tens of
//     hertz. `Overlay::accept` lets one record through per display interval
//     and drops the rest.
// 2.  **Scale.** Records are in camera pixels and the preview is smaller, so
//     every coordinate goes through the preview/camera ratio.
// 3.  **Glyphs.** Bounding box, heading arrow, swim bladder, eye axes and tail
//     polyline, each in its own color; the identity is encoded by the box
//     color so neighbouring animals stay distinguishable without text.

use crate::core_modules::records::{AnimalRecord, TrackingRecord};
use image::{Rgb, RgbImage, imageops};
use imageproc::drawing::{draw_cross_mut, draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};

const HEADING_COLOR: Rgb<u8> = Rgb([255, 64, 64]);
const BLADDER_COLOR: Rgb<u8> = Rgb([255, 200, 0]);
const EYE_COLOR: Rgb<u8> = Rgb([0, 200, 255]);
const TAIL_COLOR: Rgb<u8> = Rgb([64, 255, 64]);
const IDENTITY_PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 0, 255]),
    Rgb([0, 128, 255]),
    Rgb([255, 128, 0]),
    Rgb([0, 255, 128]),
    Rgb([128, 0, 255]),
    Rgb([255, 255, 0]),
];

/// `[display]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    pub enabled: bool,
    /// Annotated frames per second reaching the display.
    pub fps: f64,
    pub jpeg_quality: u8,
    /// Heading arrow length in camera pixels.
    pub arrow_length_px: f32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            fps: 30.0,
            jpeg_quality: 80,
            arrow_length_px: 40.0,
        }
    }
}

impl DisplayConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if !(self.fps > 0.0 && self.fps.is_finite()) {
            errors.push("display.fps must be positive".into());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            errors.push("display.jpeg_quality must lie in [1, 100]".into());
        }
    }
}

/// A tracking record and its annotated preview.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedFrame {
    /// The record, without its preview image.
    pub record: TrackingRecord,
    pub image: RgbImage,
}

pub struct Overlay {
    interval_ns: i64,
    camera_size: (u32, u32),
    arrow_length_px: f32,
    last_ns: Option<i64>,
    drawn: u64,
    skipped: u64,
}

impl Overlay {
    pub fn new(config: &DisplayConfig, camera_size: (u32, u32)) -> Self {
        let interval_ns = if config.fps > 0.0 { (1e9 / config.fps) as i64 } else { 0 };
        Self {
            interval_ns,
            camera_size,
            arrow_length_px: config.arrow_length_px,
            last_ns: None,
            drawn: 0,
            skipped: 0,
        }
    }

    pub fn drawn(&self) -> u64 {
        self.drawn
    }

    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Whether a record stamped `timestamp_ns` is due for display.
    pub fn accept(&mut self, timestamp_ns: i64) -> bool {
        match self.last_ns {
            Some(last) if timestamp_ns >= last && timestamp_ns - last < self.interval_ns => {
                self.skipped += 1;
                false
            }
            _ => {
                self.last_ns = Some(timestamp_ns);
                true
            }
        }
    }

    /// Rate-limited annotation; `None` when the record is skipped or has no
    /// preview.
    pub fn process(&mut self, mut record: TrackingRecord) -> Option<AnnotatedFrame> {
        if !self.accept(record.timestamp_ns) {
            return None;
        }
        let preview = record.image.take()?;
        let image = self.annotate(&preview, &record);
        self.drawn += 1;
        Some(AnnotatedFrame { record, image })
    }

    /// Draws every animal of `record` onto an RGB copy of `preview`.
    pub fn annotate(&self, preview: &image::GrayImage, record: &TrackingRecord) -> RgbImage {
        let mut canvas: RgbImage = image::DynamicImage::ImageLuma8(preview.clone()).to_rgb8();
        let scale = (
            preview.width() as f32 / self.camera_size.0.max(1) as f32,
            preview.height() as f32 / self.camera_size.1.max(1) as f32,
        );
        for animal in &record.animals {
            self.draw_animal(&mut canvas, animal, scale);
        }
        canvas
    }

    fn draw_animal(&self, canvas: &mut RgbImage, animal: &AnimalRecord, (sx, sy): (f32, f32)) {
        let to_px = |p: (f32, f32)| (p.0 * sx, p.1 * sy);

        let b = animal.bbox_px;
        let w = ((b.width as f32 * sx).round() as u32).max(1);
        let h = ((b.height as f32 * sy).round() as u32).max(1);
        let rect = Rect::at((b.x as f32 * sx) as i32, (b.y as f32 * sy) as i32).of_size(w, h);
        let color = IDENTITY_PALETTE[animal.identity as usize % IDENTITY_PALETTE.len()];
        draw_hollow_rect_mut(canvas, rect, color);

        let origin = animal
            .body
            .as_ref()
            .and_then(|body| body.swim_bladder_px)
            .unwrap_or(animal.centroid_px);
        let forward = animal.heading.principal();
        let tip = (
            origin.0 + forward.x * self.arrow_length_px,
            origin.1 + forward.y * self.arrow_length_px,
        );
        draw_line_segment_mut(canvas, to_px(origin), to_px(tip), HEADING_COLOR);

        if let Some(bladder) = animal.body.as_ref().and_then(|b| b.swim_bladder_px) {
            let (x, y) = to_px(bladder);
            draw_filled_circle_mut(canvas, (x.round() as i32, y.round() as i32), 1, BLADDER_COLOR);
        }

        if let Some(eyes) = &animal.eyes {
            let half = self.arrow_length_px / 8.0;
            for eye in [&eyes.left, &eyes.right] {
                // Eye angles are relative to the heading.
                let a = animal.heading.angle() + eye.angle_rad;
                let (dx, dy) = (a.cos() * half, a.sin() * half);
                let c = eye.centroid_px;
                draw_line_segment_mut(canvas, to_px((c.0 - dx, c.1 - dy)), to_px((c.0 + dx, c.1 + dy)), EYE_COLOR);
            }
        }

        if let Some(tail) = &animal.tail {
            for pair in tail.points_px.windows(2) {
                draw_line_segment_mut(canvas, to_px(pair[0]), to_px(pair[1]), TAIL_COLOR);
            }
        }

        let (cx, cy) = to_px(animal.centroid_px);
        draw_cross_mut(canvas, color, cx.round() as i32, cy.round() as i32);
    }
}

/// Fits `image` into `width` x `height`, keeping its aspect ratio.
pub fn fit(image: &RgbImage, width: u32, height: u32) -> RgbImage {
    if image.width() <= width && image.height() <= height {
        return image.clone();
    }
    let scale = (width as f32 / image.width() as f32).min(height as f32 / image.height() as f32);
    let w = ((image.width() as f32 * scale).round() as u32).max(1);
    let h = ((image.height() as f32 * scale).round() as u32).max(1);
    imageops::resize(image, w, h, imageops::FilterType::Triangle)
}
