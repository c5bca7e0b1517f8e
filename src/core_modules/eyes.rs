// THEORY:
// Eyes are the two darkest blobs just ahead of the swim bladder. Their
// contrast varies with pigmentation and illumination, so no single threshold
// works for every animal. The tracker therefore searches:
//
// 1.  Resample a window aligned with the heading, `crop_offset_mm` ahead of
//     the swim bladder, so "forward" and "left" are the window axes.
// 2.  Sweep the threshold from `thresh_hi` down to `thresh_lo`. At each level
//     label the mask and keep components whose area lies in the eye window.
// 3.  Stop at the first level that yields exactly two such components. The
//     one further along the window's left axis is the left eye.
// 4.  Each eye's orientation is the principal axis of its own mask, measured
//     from the heading and folded into (-pi/2, pi/2].

use crate::core_modules::geometry::{Moments, fold_half_turn, sample_aligned, threshold};
use crate::core_modules::records::{EyePose, EyeState, Heading};
use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};
use nalgebra::Point2;
use serde::{Deserialize, Serialize};

/// `[tracker.eyes]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EyesConfig {
    pub enabled: bool,
    /// Threshold sweep bounds, as fractions of 255.
    pub thresh_lo: f32,
    pub thresh_hi: f32,
    pub thresh_step: f32,
    pub min_area_mm2: f32,
    pub max_area_mm2: f32,
    /// Window size, forward then lateral.
    pub crop_dimension_mm: [f32; 2],
    /// Window center ahead of the swim bladder.
    pub crop_offset_mm: f32,
}

impl Default for EyesConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            thresh_lo: 0.2,
            thresh_hi: 0.95,
            thresh_step: 0.05,
            min_area_mm2: 0.01,
            max_area_mm2: 0.3,
            crop_dimension_mm: [1.2, 1.6],
            crop_offset_mm: 0.35,
        }
    }
}

impl EyesConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        let p = "tracker.eyes";
        if !(0.0 < self.thresh_lo && self.thresh_lo <= self.thresh_hi && self.thresh_hi <= 1.0) {
            errors.push(format!("{p}: need 0 < thresh_lo <= thresh_hi <= 1"));
        }
        if !(self.thresh_step > 0.0) {
            errors.push(format!("{p}.thresh_step must be positive"));
        }
        if !(0.0 <= self.min_area_mm2 && self.min_area_mm2 <= self.max_area_mm2) {
            errors.push(format!("{p}: need 0 <= min_area_mm2 <= max_area_mm2"));
        }
        if self.crop_dimension_mm.iter().any(|d| !(*d > 0.0)) {
            errors.push(format!("{p}.crop_dimension_mm must be positive"));
        }
    }
}

struct Blob {
    moments: Moments,
}

pub struct EyesTracker {
    config: EyesConfig,
    pix_per_mm: f32,
}

impl EyesTracker {
    pub fn new(config: EyesConfig, pix_per_mm: f32) -> Self {
        Self { config, pix_per_mm }
    }

    /// Finds both eyes ahead of `swim_bladder_px` along `heading`.
    pub fn track(&self, foreground: &GrayImage, swim_bladder_px: (f32, f32), heading: &Heading) -> Option<EyePose> {
        let c = &self.config;
        let forward = heading.principal();
        let center = Point2::new(swim_bladder_px.0, swim_bladder_px.1) + forward * (c.crop_offset_mm * self.pix_per_mm);
        let width = (c.crop_dimension_mm[0] * self.pix_per_mm).round().max(3.0) as u32;
        let height = (c.crop_dimension_mm[1] * self.pix_per_mm).round().max(3.0) as u32;
        let window = sample_aligned(foreground, center, forward, width, height);

        let ppm2 = (self.pix_per_mm * self.pix_per_mm) as f64;
        let min_area = (c.min_area_mm2 as f64 * ppm2).floor() as u32;
        let max_area = (c.max_area_mm2 as f64 * ppm2).ceil() as u32;

        let mut level = c.thresh_hi;
        while level >= c.thresh_lo - f32::EPSILON {
            let blobs = eye_candidates(&window.image, (level * 255.0).round() as u8, min_area, max_area);
            if blobs.len() == 2 {
                let state = |b: &Blob| -> Option<(f64, EyeState)> {
                    let local = b.moments.centroid()?;
                    let angle = b.moments.principal_axes().map(|a| a.angle()).unwrap_or(0.0);
                    let cam = window.to_camera(local.x as f32, local.y as f32);
                    Some((
                        local.y,
                        EyeState {
                            centroid_px: (cam.x, cam.y),
                            angle_rad: fold_half_turn(angle) as f32,
                            area_px: b.moments.area,
                        },
                    ))
                };
                let (a, b) = (state(&blobs[0])?, state(&blobs[1])?);
                // Window rows grow along the left axis.
                let (left, right) = if a.0 >= b.0 { (a.1, b.1) } else { (b.1, a.1) };
                return Some(EyePose { left, right });
            }
            level -= c.thresh_step;
        }
        None
    }
}

fn eye_candidates(window: &GrayImage, level: u8, min_area: u32, max_area: u32) -> Vec<Blob> {
    let mask = threshold(window, level.max(1));
    let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));
    let n = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut moments = vec![Moments::default(); n + 1];
    for (x, y, p) in labels.enumerate_pixels() {
        if p[0] > 0 {
            moments[p[0] as usize].add(x as f64, y as f64);
        }
    }
    moments
        .into_iter()
        .skip(1)
        .filter(|m| (min_area..=max_area).contains(&m.area))
        .map(|moments| Blob { moments })
        .collect()
}
