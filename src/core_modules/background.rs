// THEORY:
// The background model answers one question per pixel: what would this pixel
// look like if no animal were there? Subtracting that estimate from a frame
// leaves the animals as positive values, whichever way the arena is lit.
//
// Two interchangeable models sit behind the `BackgroundModel` trait:
//
// 1.  **Static.** Collects `num_samples` frames at `sample_interval_sec` and
//     reduces them per pixel (median or mode). Animals move between samples,
//     so the reduction sees mostly background at every location. Once the
//     last sample is in, the background is frozen.
// 2.  **Inpaint.** Keeps a running estimate. On each frame, pixels that look
//     like animals are masked (with a safety margin of `inpaint_radius_px`),
//     the holes are filled from their surroundings, and the filled frame is
//     blended into the estimate with `learning_rate`. The animals therefore
//     never leak into their own background.
//
// Until a model has seen enough frames its background is degenerate. The
// `DegeneratePolicy` decides what `subtract` returns meanwhile: all zeros (no
// animals anywhere) or the raw frame.

use crate::core_modules::frame::{Frame, Polarity, SubtractedFrame};
use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use ndarray::Array2;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Jacobi sweeps used by the diffusion inpainting.
const DIFFUSION_ITERATIONS: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundKind {
    #[default]
    Static,
    Inpaint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reduction {
    #[default]
    Median,
    Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InpaintAlgorithm {
    /// Iterative diffusion from the hole boundary.
    NavierStokes,
    /// Distance-weighted fill, boundary inward.
    #[default]
    Telea,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegeneratePolicy {
    /// Subtracting from a degenerate background yields zeros.
    #[default]
    Zeros,
    /// Subtracting from a degenerate background yields the raw frame.
    Raw,
}

/// `[background]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub kind: BackgroundKind,
    pub polarity: Polarity,
    /// Frames reduced by the static model; warm-up length of the inpaint model.
    pub num_samples: usize,
    pub sample_interval_sec: f64,
    pub reduction: Reduction,
    pub inpaint_radius_px: u8,
    pub inpaint_algorithm: InpaintAlgorithm,
    /// Weight of the newest frame in the running estimate.
    pub learning_rate: f32,
    /// Difference, in gray levels, above which a pixel is treated as animal.
    pub foreground_threshold: f32,
    pub degenerate_policy: DegeneratePolicy,
    /// Request the GPU implementation. Only the CPU reference is built in.
    pub use_gpu: bool,
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            kind: BackgroundKind::Static,
            polarity: Polarity::DarkOnBright,
            num_samples: 10,
            sample_interval_sec: 0.5,
            reduction: Reduction::Median,
            inpaint_radius_px: 3,
            inpaint_algorithm: InpaintAlgorithm::Telea,
            learning_rate: 0.05,
            foreground_threshold: 20.0,
            degenerate_policy: DegeneratePolicy::Zeros,
            use_gpu: false,
        }
    }
}

impl BackgroundConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.num_samples == 0 {
            errors.push("background.num_samples must be at least 1".into());
        }
        if !(self.sample_interval_sec.is_finite() && self.sample_interval_sec >= 0.0) {
            errors.push("background.sample_interval_sec must be >= 0".into());
        }
        if !(self.learning_rate > 0.0 && self.learning_rate <= 1.0) {
            errors.push("background.learning_rate must lie in (0, 1]".into());
        }
        if !(self.foreground_threshold.is_finite() && self.foreground_threshold >= 0.0) {
            errors.push("background.foreground_threshold must be >= 0".into());
        }
    }

    /// Builds the configured model.
    pub fn build(&self) -> Box<dyn BackgroundModel> {
        if self.use_gpu {
            tracing::warn!("GPU background requested; using the CPU implementation");
        }
        match self.kind {
            BackgroundKind::Static => Box::new(StaticBackground::new(self)),
            BackgroundKind::Inpaint => Box::new(InpaintBackground::new(self)),
        }
    }
}

/// Per-pixel background estimate with subtraction.
pub trait BackgroundModel: Send {
    /// Feeds one frame to the estimate.
    fn add_image(&mut self, frame: &Frame);

    /// Current estimate, or `None` while degenerate.
    fn background(&self) -> Option<&GrayImage>;

    /// Discards the estimate and starts over.
    fn reset(&mut self);

    fn polarity(&self) -> Polarity;

    fn set_polarity(&mut self, polarity: Polarity);

    fn degenerate_policy(&self) -> DegeneratePolicy;

    fn is_ready(&self) -> bool {
        self.background().is_some()
    }

    /// Signed difference of `frame` from the background, animals positive.
    /// Pure: the same frame against the same background always yields the
    /// same result.
    fn subtract(&self, frame: &Frame) -> SubtractedFrame {
        subtract_from(self.background(), frame, self.polarity(), self.degenerate_policy())
    }
}

/// Subtraction shared by all models.
pub fn subtract_from(
    background: Option<&GrayImage>,
    frame: &Frame,
    polarity: Polarity,
    policy: DegeneratePolicy,
) -> SubtractedFrame {
    let gray = frame.to_gray();
    let (w, h) = gray.dimensions();
    let usable = background.filter(|bg| bg.dimensions() == (w, h));
    if background.is_some() && usable.is_none() {
        tracing::debug!(index = frame.index, "frame and background sizes differ; treating background as degenerate");
    }

    let data = match (usable, policy) {
        (Some(bg), _) => Array2::from_shape_fn((h as usize, w as usize), |(y, x)| {
            let p = gray.get_pixel(x as u32, y as u32)[0] as f32;
            let b = bg.get_pixel(x as u32, y as u32)[0] as f32;
            polarity.apply(p, b) as i16
        }),
        (None, DegeneratePolicy::Zeros) => Array2::zeros((h as usize, w as usize)),
        (None, DegeneratePolicy::Raw) => {
            Array2::from_shape_fn((h as usize, w as usize), |(y, x)| gray.get_pixel(x as u32, y as u32)[0] as i16)
        }
    };
    SubtractedFrame {
        index: frame.index,
        timestamp_ns: frame.timestamp_ns,
        polarity,
        data,
    }
}

// --- Static model ---

pub struct StaticBackground {
    num_samples: usize,
    interval_ns: i64,
    reduction: Reduction,
    polarity: Polarity,
    policy: DegeneratePolicy,
    samples: VecDeque<GrayImage>,
    last_sample_ns: Option<i64>,
    frozen: Option<GrayImage>,
}

impl StaticBackground {
    pub fn new(config: &BackgroundConfig) -> Self {
        Self {
            num_samples: config.num_samples.max(1),
            interval_ns: crate::clock::sec_to_ns(config.sample_interval_sec),
            reduction: config.reduction,
            polarity: config.polarity,
            policy: config.degenerate_policy,
            samples: VecDeque::new(),
            last_sample_ns: None,
            frozen: None,
        }
    }

    pub fn samples_collected(&self) -> usize {
        self.samples.len()
    }
}

impl BackgroundModel for StaticBackground {
    fn add_image(&mut self, frame: &Frame) {
        if self.frozen.is_some() {
            return;
        }
        if let Some(last) = self.last_sample_ns {
            if frame.timestamp_ns - last < self.interval_ns {
                return;
            }
        }
        let gray = frame.to_gray().into_owned();
        if let Some(first) = self.samples.front() {
            if first.dimensions() != gray.dimensions() {
                tracing::warn!(index = frame.index, "frame size changed while sampling; restarting background");
                self.samples.clear();
            }
        }
        self.samples.push_back(gray);
        self.last_sample_ns = Some(frame.timestamp_ns);

        if self.samples.len() >= self.num_samples {
            let samples: Vec<GrayImage> = self.samples.drain(..).collect();
            self.frozen = Some(reduce(&samples, self.reduction));
            tracing::info!(samples = samples.len(), reduction = ?self.reduction, "static background frozen");
        }
    }

    fn background(&self) -> Option<&GrayImage> {
        self.frozen.as_ref()
    }

    fn reset(&mut self) {
        self.samples.clear();
        self.last_sample_ns = None;
        self.frozen = None;
    }

    fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn set_polarity(&mut self, polarity: Polarity) {
        self.polarity = polarity;
    }

    fn degenerate_policy(&self) -> DegeneratePolicy {
        self.policy
    }
}

/// Per-pixel reduction of equally sized images.
pub fn reduce(samples: &[GrayImage], reduction: Reduction) -> GrayImage {
    let Some(first) = samples.first() else {
        return GrayImage::new(0, 0);
    };
    let (w, h) = first.dimensions();
    let mut out = GrayImage::new(w, h);
    if w == 0 {
        return out;
    }
    out.par_chunks_mut(w as usize).enumerate().for_each(|(y, row)| {
        let mut values = Vec::with_capacity(samples.len());
        for (x, px) in row.iter_mut().enumerate() {
            values.clear();
            values.extend(samples.iter().map(|s| s.get_pixel(x as u32, y as u32)[0]));
            *px = match reduction {
                Reduction::Median => {
                    values.sort_unstable();
                    values[values.len() / 2]
                }
                Reduction::Mode => {
                    let mut histogram = [0u32; 256];
                    for &v in &values {
                        histogram[v as usize] += 1;
                    }
                    // Ties go to the darker value.
                    let mut best = 0usize;
                    for (v, &count) in histogram.iter().enumerate() {
                        if count > histogram[best] {
                            best = v;
                        }
                    }
                    best as u8
                }
            };
        }
    });
    out
}

// --- Inpaint model ---

pub struct InpaintBackground {
    warmup: usize,
    radius: u8,
    algorithm: InpaintAlgorithm,
    learning_rate: f32,
    threshold: f32,
    polarity: Polarity,
    policy: DegeneratePolicy,
    estimate: Option<Array2<f32>>,
    rendered: Option<GrayImage>,
    frames_seen: usize,
}

impl InpaintBackground {
    pub fn new(config: &BackgroundConfig) -> Self {
        Self {
            warmup: config.num_samples.max(1),
            radius: config.inpaint_radius_px,
            algorithm: config.inpaint_algorithm,
            learning_rate: config.learning_rate,
            threshold: config.foreground_threshold,
            polarity: config.polarity,
            policy: config.degenerate_policy,
            estimate: None,
            rendered: None,
            frames_seen: 0,
        }
    }

    fn render(&mut self) {
        let Some(estimate) = &self.estimate else {
            self.rendered = None;
            return;
        };
        let (h, w) = estimate.dim();
        let image = GrayImage::from_fn(w as u32, h as u32, |x, y| {
            Luma([estimate[[y as usize, x as usize]].round().clamp(0.0, 255.0) as u8])
        });
        self.rendered = Some(image);
    }
}

impl BackgroundModel for InpaintBackground {
    fn add_image(&mut self, frame: &Frame) {
        let gray = frame.to_gray();
        let (w, h) = gray.dimensions();
        let shape = (h as usize, w as usize);

        let estimate = match self.estimate.take() {
            Some(e) if e.dim() == shape => e,
            _ => {
                self.frames_seen = 0;
                Array2::from_shape_fn(shape, |(y, x)| gray.get_pixel(x as u32, y as u32)[0] as f32)
            }
        };

        // Animal pixels, grown by the inpainting radius.
        let mut mask = GrayImage::new(w, h);
        for (x, y, p) in mask.enumerate_pixels_mut() {
            let diff = self
                .polarity
                .apply(gray.get_pixel(x, y)[0] as f32, estimate[[y as usize, x as usize]]);
            p[0] = if diff > self.threshold { 255 } else { 0 };
        }
        if self.radius > 0 {
            mask = dilate(&mask, Norm::LInf, self.radius);
        }

        let filled = inpaint(&gray, &mask, self.radius.max(1) as u32, self.algorithm);
        let a = self.learning_rate;
        let mut estimate = estimate;
        if let Some(filled) = filled {
            estimate.indexed_iter_mut().for_each(|((y, x), v)| {
                let f = filled.get_pixel(x as u32, y as u32)[0] as f32;
                *v += a * (f - *v);
            });
        }
        self.estimate = Some(estimate);
        self.frames_seen += 1;
        self.render();
    }

    fn background(&self) -> Option<&GrayImage> {
        if self.frames_seen >= self.warmup {
            self.rendered.as_ref()
        } else {
            None
        }
    }

    fn reset(&mut self) {
        self.estimate = None;
        self.rendered = None;
        self.frames_seen = 0;
    }

    fn polarity(&self) -> Polarity {
        self.polarity
    }

    fn set_polarity(&mut self, polarity: Polarity) {
        self.polarity = polarity;
    }

    fn degenerate_policy(&self) -> DegeneratePolicy {
        self.policy
    }
}

/// Fills the non-zero pixels of `mask` from the unmasked surroundings.
/// Returns `None` when nothing is known to fill from.
pub fn inpaint(image: &GrayImage, mask: &GrayImage, radius: u32, algorithm: InpaintAlgorithm) -> Option<GrayImage> {
    let (w, h) = image.dimensions();
    let masked = |x: u32, y: u32| mask.get_pixel(x, y)[0] > 0;
    if !image.enumerate_pixels().any(|(x, y, _)| !masked(x, y)) {
        return None;
    }
    let mut out = image.clone();
    let mut known: Vec<bool> = (0..h).flat_map(|y| (0..w).map(move |x| (x, y))).map(|(x, y)| !masked(x, y)).collect();
    let idx = |x: u32, y: u32| (y * w + x) as usize;

    // Boundary-inward order: breadth-first from the known region.
    let mut order = Vec::new();
    let mut queued = known.clone();
    let mut frontier: VecDeque<(u32, u32)> = VecDeque::new();
    for y in 0..h {
        for x in 0..w {
            if known[idx(x, y)] {
                continue;
            }
            if neighbors4(x, y, w, h).any(|(nx, ny)| known[idx(nx, ny)]) {
                queued[idx(x, y)] = true;
                frontier.push_back((x, y));
            }
        }
    }
    while let Some((x, y)) = frontier.pop_front() {
        order.push((x, y));
        for (nx, ny) in neighbors4(x, y, w, h) {
            if !queued[idx(nx, ny)] {
                queued[idx(nx, ny)] = true;
                frontier.push_back((nx, ny));
            }
        }
    }

    match algorithm {
        InpaintAlgorithm::Telea => {
            let r = radius as i64;
            for &(x, y) in &order {
                let (mut sum, mut weight) = (0.0f64, 0.0f64);
                for dy in -r..=r {
                    for dx in -r..=r {
                        let (nx, ny) = (x as i64 + dx, y as i64 + dy);
                        if nx < 0 || ny < 0 || nx >= w as i64 || ny >= h as i64 || (dx == 0 && dy == 0) {
                            continue;
                        }
                        let d2 = (dx * dx + dy * dy) as f64;
                        if d2 > (r * r) as f64 || !known[idx(nx as u32, ny as u32)] {
                            continue;
                        }
                        let wgt = 1.0 / d2;
                        sum += wgt * out.get_pixel(nx as u32, ny as u32)[0] as f64;
                        weight += wgt;
                    }
                }
                if weight > 0.0 {
                    out.put_pixel(x, y, Luma([(sum / weight).round() as u8]));
                }
                known[idx(x, y)] = true;
            }
        }
        InpaintAlgorithm::NavierStokes => {
            let mut values: Vec<f32> = out.pixels().map(|p| p[0] as f32).collect();
            // Seed holes with their nearest filled neighbor, then diffuse.
            for &(x, y) in &order {
                if let Some((nx, ny)) = neighbors4(x, y, w, h).find(|&(nx, ny)| known[idx(nx, ny)]) {
                    values[idx(x, y)] = values[idx(nx, ny)];
                }
                known[idx(x, y)] = true;
            }
            for _ in 0..DIFFUSION_ITERATIONS {
                let previous = values.clone();
                for &(x, y) in &order {
                    let (sum, n) = neighbors4(x, y, w, h)
                        .fold((0.0f32, 0u32), |(s, n), (nx, ny)| (s + previous[idx(nx, ny)], n + 1));
                    if n > 0 {
                        values[idx(x, y)] = sum / n as f32;
                    }
                }
            }
            for &(x, y) in &order {
                out.put_pixel(x, y, Luma([values[idx(x, y)].round().clamp(0.0, 255.0) as u8]));
            }
        }
    }
    Some(out)
}

fn neighbors4(x: u32, y: u32, w: u32, h: u32) -> impl Iterator<Item = (u32, u32)> {
    let (x, y) = (x as i64, y as i64);
    [(1, 0), (-1, 0), (0, 1), (0, -1)]
        .into_iter()
        .map(move |(dx, dy)| (x + dx, y + dy))
        .filter(move |&(nx, ny)| nx >= 0 && ny >= 0 && nx < w as i64 && ny < h as i64)
        .map(|(nx, ny)| (nx as u32, ny as u32))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::sec_to_ns;

    fn arena(w: u32, h: u32, level: u8, animal_at: Option<(u32, u32)>) -> GrayImage {
        let mut img = GrayImage::from_pixel(w, h, Luma([level]));
        if let Some((ax, ay)) = animal_at {
            for y in ay..ay + 3 {
                for x in ax..ax + 3 {
                    img.put_pixel(x, y, Luma([30]));
                }
            }
        }
        img
    }

    fn static_config(samples: usize) -> BackgroundConfig {
        BackgroundConfig {
            num_samples: samples,
            sample_interval_sec: 1.0,
            ..Default::default()
        }
    }

    #[test]
    fn static_median_removes_a_moving_animal() {
        let mut model = StaticBackground::new(&static_config(3));
        for (i, x) in [2u32, 8, 14].into_iter().enumerate() {
            let frame = Frame::gray(i as u64, sec_to_ns(i as f64), arena(20, 10, 200, Some((x, 3))));
            assert!(!model.is_ready());
            model.add_image(&frame);
        }
        let bg = model.background().unwrap();
        assert!(bg.pixels().all(|p| p[0] == 200));
    }

    #[test]
    fn static_model_respects_the_sample_interval() {
        let mut model = StaticBackground::new(&static_config(2));
        model.add_image(&Frame::gray(0, 0, arena(4, 4, 100, None)));
        model.add_image(&Frame::gray(1, sec_to_ns(0.5), arena(4, 4, 100, None)));
        assert_eq!(model.samples_collected(), 1);
        model.add_image(&Frame::gray(2, sec_to_ns(1.0), arena(4, 4, 100, None)));
        assert!(model.is_ready());
    }

    #[test]
    fn mode_picks_the_most_frequent_level() {
        let samples = vec![
            arena(2, 2, 10, None),
            arena(2, 2, 50, None),
            arena(2, 2, 50, None),
            arena(2, 2, 90, None),
        ];
        assert!(reduce(&samples, Reduction::Mode).pixels().all(|p| p[0] == 50));
    }

    #[test]
    fn degenerate_background_follows_the_policy() {
        let frame = Frame::gray(5, 0, arena(3, 2, 77, None));
        let zeros = subtract_from(None, &frame, Polarity::DarkOnBright, DegeneratePolicy::Zeros);
        assert!(zeros.data.iter().all(|&v| v == 0));
        assert_eq!(zeros.index, 5);
        let raw = subtract_from(None, &frame, Polarity::DarkOnBright, DegeneratePolicy::Raw);
        assert!(raw.data.iter().all(|&v| v == 77));
    }

    #[test]
    fn subtraction_against_a_frozen_background_is_idempotent() {
        let mut model = StaticBackground::new(&static_config(1));
        model.add_image(&Frame::gray(0, 0, arena(10, 10, 200, None)));
        let frame = Frame::gray(1, 10, arena(10, 10, 200, Some((4, 4))));
        let a = model.subtract(&frame);
        let b = model.subtract(&frame);
        assert_eq!(a, b);
        assert_eq!(a.get(5, 5), 170);
        assert_eq!(a.get(0, 0), 0);
        assert_eq!(a.index, frame.index);
    }

    #[test]
    fn inpaint_model_keeps_animals_out_of_the_background() {
        let config = BackgroundConfig {
            kind: BackgroundKind::Inpaint,
            num_samples: 2,
            learning_rate: 0.5,
            ..Default::default()
        };
        let mut model = InpaintBackground::new(&config);
        model.add_image(&Frame::gray(0, 0, arena(16, 16, 200, None)));
        assert!(model.background().is_none());
        for i in 1..6 {
            model.add_image(&Frame::gray(i, 0, arena(16, 16, 200, Some((6, 6)))));
        }
        let bg = model.background().unwrap();
        assert!(bg.get_pixel(7, 7)[0] >= 195);
        let sub = model.subtract(&Frame::gray(9, 0, arena(16, 16, 200, Some((6, 6)))));
        assert!(sub.get(7, 7) > 150);
    }

    #[test]
    fn both_inpainting_algorithms_fill_from_the_boundary() {
        let image = arena(12, 12, 120, Some((4, 4)));
        let mut mask = GrayImage::new(12, 12);
        for y in 4..7 {
            for x in 4..7 {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
        for algorithm in [InpaintAlgorithm::Telea, InpaintAlgorithm::NavierStokes] {
            let filled = inpaint(&image, &mask, 3, algorithm).unwrap();
            assert!(filled.pixels().all(|p| p[0] == 120), "{algorithm:?}");
        }
        let everything = GrayImage::from_pixel(12, 12, Luma([255]));
        assert!(inpaint(&image, &everything, 3, InpaintAlgorithm::Telea).is_none());
    }
}
