// THEORY:
// The localizer is the full-frame stage of tracking. It finds every animal in
// a background-subtracted frame and reports a centroid, a bounding box and a
// rough shape for each, nothing more. Pose estimation happens later on crops.
//
// The algorithm runs at a reduced resolution (`target_pix_per_mm`) because a
// larva only needs a handful of pixels to be found:
//
// 1.  **Rescale** the positive part of the difference image.
// 2.  **Clean** with an optional Gaussian blur, median filter and
//     morphological opening, all sized in millimeters.
// 3.  **Threshold** at `intensity` (a fraction of full scale).
// 4.  **Label** 8-connected components.
// 5.  **Filter** each component by area, length and width in millimeters;
//     length and width are extents along the principal axes.
// 6.  **Upsample** centroids and boxes back to camera pixels.
//
// Detections come out sorted by decreasing area, so callers that expect a
// fixed number of animals can keep the largest ones.

use crate::core_modules::frame::SubtractedFrame;
use crate::core_modules::geometry::{Moments, Rescale, extents, threshold};
use crate::core_modules::records::BoundingBox;
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::{gaussian_blur_f32, median_filter};
use imageproc::morphology::open;
use imageproc::region_labelling::{Connectivity, connected_components};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Smallest blur worth running, working pixels.
const MIN_BLUR_SIGMA_PX: f32 = 0.3;

/// `[tracker.animal]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizerConfig {
    pub target_pix_per_mm: f32,
    /// Threshold on the subtracted image, as a fraction of 255.
    pub intensity: f32,
    pub min_size_mm2: f32,
    pub max_size_mm2: f32,
    pub min_length_mm: f32,
    pub max_length_mm: f32,
    pub min_width_mm: f32,
    pub max_width_mm: f32,
    pub blur_sd_mm: f32,
    pub median_filter_mm: f32,
    pub opening_mm: f32,
    /// Width and height of the crop handed to the per-animal trackers.
    pub crop_dimension_mm: [f32; 2],
}

impl Default for LocalizerConfig {
    fn default() -> Self {
        Self {
            target_pix_per_mm: 5.0,
            intensity: 0.07,
            min_size_mm2: 0.3,
            max_size_mm2: 12.0,
            min_length_mm: 0.8,
            max_length_mm: 7.0,
            min_width_mm: 0.1,
            max_width_mm: 3.0,
            blur_sd_mm: 0.1,
            median_filter_mm: 0.0,
            opening_mm: 0.0,
            crop_dimension_mm: [6.0, 6.0],
        }
    }
}

impl LocalizerConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        let p = "tracker.animal";
        if !(self.target_pix_per_mm > 0.0) {
            errors.push(format!("{p}.target_pix_per_mm must be positive"));
        }
        if !(self.intensity > 0.0 && self.intensity <= 1.0) {
            errors.push(format!("{p}.intensity must lie in (0, 1]"));
        }
        for (name, lo, hi) in [
            ("size_mm2", self.min_size_mm2, self.max_size_mm2),
            ("length_mm", self.min_length_mm, self.max_length_mm),
            ("width_mm", self.min_width_mm, self.max_width_mm),
        ] {
            if !(lo >= 0.0 && hi >= lo) {
                errors.push(format!("{p}: min_{name} must be >= 0 and <= max_{name}"));
            }
        }
        if self.blur_sd_mm < 0.0 || self.median_filter_mm < 0.0 || self.opening_mm < 0.0 {
            errors.push(format!("{p}: filter sizes must be >= 0"));
        }
        if self.crop_dimension_mm.iter().any(|d| !(*d > 0.0)) {
            errors.push(format!("{p}.crop_dimension_mm must be positive"));
        }
    }
}

/// One animal found in a full frame, in camera pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub centroid_px: (f32, f32),
    pub bbox_px: BoundingBox,
    pub area_mm2: f32,
    pub length_mm: f32,
    pub width_mm: f32,
    /// Major axis, sign arbitrary.
    pub axis: Vector2<f32>,
}

pub struct Localizer {
    config: LocalizerConfig,
    pix_per_mm: f32,
    rescale: Rescale,
}

impl Localizer {
    pub fn new(config: LocalizerConfig, pix_per_mm: f32) -> Self {
        let rescale = Rescale::new(pix_per_mm, config.target_pix_per_mm);
        Self {
            config,
            pix_per_mm,
            rescale,
        }
    }

    pub fn config(&self) -> &LocalizerConfig {
        &self.config
    }

    /// Runtime threshold change from the control plane.
    pub fn set_intensity(&mut self, intensity: f32) {
        if intensity > 0.0 && intensity <= 1.0 {
            self.config.intensity = intensity;
        } else {
            tracing::warn!(intensity, "ignoring out-of-range intensity threshold");
        }
    }

    /// Pixels per millimeter at the working resolution.
    pub fn working_pix_per_mm(&self) -> f32 {
        self.pix_per_mm * self.rescale.factor
    }

    /// Thresholded, cleaned mask at the working resolution.
    pub fn mask(&self, frame: &SubtractedFrame) -> GrayImage {
        let ppm = self.working_pix_per_mm();
        let mut image = self.rescale.apply(&frame.foreground());

        let sigma = self.config.blur_sd_mm * ppm;
        if sigma >= MIN_BLUR_SIGMA_PX {
            image = gaussian_blur_f32(&image, sigma);
        }
        let median_radius = (self.config.median_filter_mm * ppm / 2.0).round() as u32;
        if median_radius > 0 {
            image = median_filter(&image, median_radius, median_radius);
        }

        let level = (self.config.intensity * 255.0).round().clamp(1.0, 255.0) as u8;
        let mut mask = threshold(&image, level);

        let opening = (self.config.opening_mm * ppm).round().clamp(0.0, 255.0) as u8;
        if opening > 0 {
            mask = open(&mask, Norm::LInf, opening);
        }
        mask
    }

    /// Every component passing the millimeter filters, largest first.
    pub fn locate(&self, frame: &SubtractedFrame) -> Vec<Detection> {
        let mask = self.mask(frame);
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
        let n_labels = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
        if n_labels == 0 {
            return Vec::new();
        }

        let mut components: Vec<Vec<(f64, f64)>> = vec![Vec::new(); n_labels + 1];
        for (x, y, p) in labels.enumerate_pixels() {
            if p[0] > 0 {
                components[p[0] as usize].push((x as f64, y as f64));
            }
        }

        let ppm = self.working_pix_per_mm() as f64;
        let c = &self.config;
        let mut detections: Vec<Detection> = components
            .iter()
            .skip(1)
            .filter_map(|points| {
                let mut moments = Moments::default();
                for &(x, y) in points {
                    moments.add(x, y);
                }
                let centroid = moments.centroid()?;
                let axes = moments.principal_axes()?;
                let (length_px, width_px) = extents(points.iter().copied(), centroid, axes.major);

                let area_mm2 = (moments.area as f64 / (ppm * ppm)) as f32;
                let length_mm = (length_px / ppm) as f32;
                let width_mm = (width_px / ppm) as f32;
                let passes = (c.min_size_mm2..=c.max_size_mm2).contains(&area_mm2)
                    && (c.min_length_mm..=c.max_length_mm).contains(&length_mm)
                    && (c.min_width_mm..=c.max_width_mm).contains(&width_mm);
                if !passes {
                    tracing::trace!(area_mm2, length_mm, width_mm, "component rejected");
                    return None;
                }

                let (min_x, max_x, min_y, max_y) = points.iter().fold(
                    (f64::MAX, f64::MIN, f64::MAX, f64::MIN),
                    |(a, b, c, d), &(x, y)| (a.min(x), b.max(x), c.min(y), d.max(y)),
                );
                let bbox = BoundingBox::new(
                    min_x as u32,
                    min_y as u32,
                    (max_x - min_x) as u32 + 1,
                    (max_y - min_y) as u32 + 1,
                )
                .scaled(1.0 / self.rescale.factor);
                let (cx, cy) = self.rescale.to_camera(centroid.x, centroid.y);

                Some(Detection {
                    centroid_px: (cx as f32, cy as f32),
                    bbox_px: bbox,
                    area_mm2,
                    length_mm,
                    width_mm,
                    axis: Vector2::new(axes.major.x as f32, axes.major.y as f32),
                })
            })
            .collect();

        detections.sort_by(|a, b| b.area_mm2.total_cmp(&a.area_mm2));
        detections
    }
}
