// THEORY:
// The body tracker turns a detection into a pose. It works on a crop around
// the detection's centroid and answers two questions:
//
// 1.  **Which way is the body axis?** The principal axes of the thresholded
//     body mask give the axis up to sign.
// 2.  **Which end is the head?** The darkest part of a larva (eyes and swim
//     bladder) sits toward the head, while the long thin tail drags the mask
//     centroid backwards. The centroid of the most intense `bladder_fraction`
//     of body pixels is therefore ahead of the mask centroid, and the axis is
//     flipped to point that way.
//
// The result is an orthonormal heading with determinant +1 and a `BodyPose`
// carrying the body and swim bladder centroids in camera pixels.

use crate::core_modules::geometry::{Moments, Rescale, extents, label_pixels, threshold};
use crate::core_modules::records::{BodyPose, Heading};
use image::{GrayImage, Luma, imageops};
use imageproc::region_labelling::{Connectivity, connected_components};
use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

/// `[tracker.body]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    pub enabled: bool,
    pub target_pix_per_mm: f32,
    /// Threshold on the subtracted image, as a fraction of 255.
    pub intensity: f32,
    pub min_size_mm2: f32,
    pub max_size_mm2: f32,
    pub min_length_mm: f32,
    pub max_length_mm: f32,
    pub min_width_mm: f32,
    pub max_width_mm: f32,
    /// Share of the most intense body pixels taken as the swim bladder region.
    pub bladder_fraction: f32,
    pub crop_dimension_mm: [f32; 2],
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_pix_per_mm: 10.0,
            intensity: 0.1,
            min_size_mm2: 0.2,
            max_size_mm2: 12.0,
            min_length_mm: 0.6,
            max_length_mm: 7.0,
            min_width_mm: 0.1,
            max_width_mm: 3.0,
            bladder_fraction: 0.15,
            crop_dimension_mm: [6.0, 6.0],
        }
    }
}

impl BodyConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        let p = "tracker.body";
        if !(self.target_pix_per_mm > 0.0) {
            errors.push(format!("{p}.target_pix_per_mm must be positive"));
        }
        if !(self.intensity > 0.0 && self.intensity <= 1.0) {
            errors.push(format!("{p}.intensity must lie in (0, 1]"));
        }
        if !(self.bladder_fraction > 0.0 && self.bladder_fraction < 1.0) {
            errors.push(format!("{p}.bladder_fraction must lie in (0, 1)"));
        }
        if !(self.min_size_mm2 <= self.max_size_mm2
            && self.min_length_mm <= self.max_length_mm
            && self.min_width_mm <= self.max_width_mm)
        {
            errors.push(format!("{p}: every min_* must be <= its max_*"));
        }
        if self.crop_dimension_mm.iter().any(|d| !(*d > 0.0)) {
            errors.push(format!("{p}.crop_dimension_mm must be positive"));
        }
    }
}

/// Output of the body tracker for one animal.
#[derive(Debug, Clone, PartialEq)]
pub struct BodyEstimate {
    pub pose: BodyPose,
    pub heading: Heading,
}

/// Axis-aligned crop of the foreground image, clamped to the frame.
#[derive(Debug, Clone)]
pub struct Crop {
    pub image: GrayImage,
    pub x0: u32,
    pub y0: u32,
}

impl Crop {
    pub fn around(image: &GrayImage, center: (f32, f32), width: u32, height: u32) -> Option<Self> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 || !(center.0.is_finite() && center.1.is_finite()) {
            return None;
        }
        let x0 = (center.0 - width as f32 / 2.0).round().clamp(0.0, (w - 1) as f32) as u32;
        let y0 = (center.1 - height as f32 / 2.0).round().clamp(0.0, (h - 1) as f32) as u32;
        let cw = width.min(w - x0).max(1);
        let ch = height.min(h - y0).max(1);
        Some(Self {
            image: imageops::crop_imm(image, x0, y0, cw, ch).to_image(),
            x0,
            y0,
        })
    }
}

pub struct BodyTracker {
    config: BodyConfig,
    pix_per_mm: f32,
    rescale: Rescale,
}

impl BodyTracker {
    pub fn new(config: BodyConfig, pix_per_mm: f32) -> Self {
        let rescale = Rescale::new(pix_per_mm, config.target_pix_per_mm);
        Self {
            config,
            pix_per_mm,
            rescale,
        }
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        if intensity > 0.0 && intensity <= 1.0 {
            self.config.intensity = intensity;
        }
    }

    /// Estimates the pose of the animal nearest to `centroid_px` in the
    /// positive-difference image `foreground`.
    pub fn track(&self, foreground: &GrayImage, centroid_px: (f32, f32)) -> Option<BodyEstimate> {
        let c = &self.config;
        let crop_w = (c.crop_dimension_mm[0] * self.pix_per_mm).round().max(1.0) as u32;
        let crop_h = (c.crop_dimension_mm[1] * self.pix_per_mm).round().max(1.0) as u32;
        let crop = Crop::around(foreground, centroid_px, crop_w, crop_h)?;
        let small = self.rescale.apply(&crop.image);
        let level = (c.intensity * 255.0).round().clamp(1.0, 255.0) as u8;
        let mask = threshold(&small, level);

        // The component nearest to the detection centroid is the body.
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
        let target = {
            let (tx, ty) = (
                (centroid_px.0 - crop.x0 as f32) * self.rescale.factor,
                (centroid_px.1 - crop.y0 as f32) * self.rescale.factor,
            );
            labels
                .enumerate_pixels()
                .filter(|(_, _, p)| p[0] > 0)
                .min_by(|a, b| {
                    let da = (a.0 as f32 - tx).powi(2) + (a.1 as f32 - ty).powi(2);
                    let db = (b.0 as f32 - tx).powi(2) + (b.1 as f32 - ty).powi(2);
                    da.total_cmp(&db)
                })
                .map(|(_, _, p)| p[0])?
        };
        let points = label_pixels(&labels, target);
        let mut moments = Moments::default();
        for &(x, y) in &points {
            moments.add(x, y);
        }
        let center = moments.centroid()?;
        let axes = moments.principal_axes()?;

        let ppm = (self.pix_per_mm * self.rescale.factor) as f64;
        let (length, width) = extents(points.iter().copied(), center, axes.major);
        let area_mm2 = (moments.area as f64 / (ppm * ppm)) as f32;
        let (length_mm, width_mm) = ((length / ppm) as f32, (width / ppm) as f32);
        if !((c.min_size_mm2..=c.max_size_mm2).contains(&area_mm2)
            && (c.min_length_mm..=c.max_length_mm).contains(&length_mm)
            && (c.min_width_mm..=c.max_width_mm).contains(&width_mm))
        {
            return None;
        }

        let bladder = self.bladder_centroid(&small, &points)?;
        let mut axis = axes.major;
        let offset = Vector2::new(bladder.x - center.x, bladder.y - center.y);
        if offset.dot(&axis) < 0.0 {
            axis = -axis;
        }
        let heading = Heading::from_principal(Vector2::new(axis.x as f32, axis.y as f32))?;

        let to_camera = |p: Point2<f64>| {
            let (x, y) = self.rescale.to_camera(p.x, p.y);
            ((x + crop.x0 as f64) as f32, (y + crop.y0 as f64) as f32)
        };
        Some(BodyEstimate {
            pose: BodyPose {
                centroid_px: to_camera(center),
                swim_bladder_px: Some(to_camera(bladder)),
                length_px: self.rescale.length_to_camera(length) as f32,
                width_px: self.rescale.length_to_camera(width) as f32,
            },
            heading,
        })
    }

    /// Centroid of the most intense `bladder_fraction` of `points`.
    fn bladder_centroid(&self, image: &GrayImage, points: &[(f64, f64)]) -> Option<Point2<f64>> {
        let mut ranked: Vec<(u8, f64, f64)> = points
            .iter()
            .map(|&(x, y)| (image.get_pixel(x as u32, y as u32)[0], x, y))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        let keep = ((ranked.len() as f32 * self.config.bladder_fraction).ceil() as usize).clamp(1, ranked.len());
        let mut m = Moments::default();
        for &(_, x, y) in ranked.iter().take(keep) {
            m.add(x, y);
        }
        m.centroid()
    }
}
