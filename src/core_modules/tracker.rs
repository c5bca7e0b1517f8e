// THEORY:
// The `tracker` module is the per-frame pipeline of the tracking layer. It
// takes one background-subtracted frame and produces one `TrackingRecord`,
// calling the specialised layers in order:
//
// 1.  **Localize**: full-frame segmentation into detections.
// 2.  **Select**: with distance matching, keep the `n_animals` largest
//     detections; the ROI grid does its own selection.
// 3.  **Assign**: give every kept detection its identity.
// 4.  **Pose**: per animal, body (heading and swim bladder), then eyes and
//     tail, which both start from the swim bladder along the heading.
// 5.  **Preview**: a downsampled image of the foreground for the overlay.
//
// A failing sub-tracker never fails the frame. Its substructure is left out
// of the record and a counter is bumped. If the body tracker fails the
// heading falls back to the localizer's axis, whose sign is arbitrary.
//
// The module also carries the heading unwrapper used by the recorder. Raw
// headings jump by 2*pi when an animal turns through the image's -x axis;
// the unwrapper removes those jumps per identity.

use crate::core_modules::assignment::{Assigner, AssignmentConfig, DetectionOrder};
use crate::core_modules::body::{BodyConfig, BodyTracker};
use crate::core_modules::eyes::{EyesConfig, EyesTracker};
use crate::core_modules::frame::SubtractedFrame;
use crate::core_modules::localizer::{Localizer, LocalizerConfig};
use crate::core_modules::records::{AnimalRecord, Heading, TrackingRecord};
use crate::core_modules::tail::{TailConfig, TailTracker};
use image::{GrayImage, imageops};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f32::consts::{PI, TAU};

/// What the heading unwrapper does across frames with no valid heading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadingNanPolicy {
    /// Keep the accumulated turns; the next valid heading is unwrapped
    /// against the last valid one.
    #[default]
    HoldLast,
    /// Forget the history; the next valid heading starts a new unwrap.
    Reset,
}

/// `[tracker]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Animals kept per frame with distance matching.
    pub n_animals: usize,
    pub heading_nan_policy: HeadingNanPolicy,
    /// Preview box; the preview keeps the frame's aspect ratio. Zero disables.
    pub preview_width: u32,
    pub preview_height: u32,
    pub animal: LocalizerConfig,
    pub body: BodyConfig,
    pub eyes: EyesConfig,
    pub tail: TailConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            n_animals: 1,
            heading_nan_policy: HeadingNanPolicy::HoldLast,
            preview_width: 320,
            preview_height: 240,
            animal: LocalizerConfig::default(),
            body: BodyConfig::default(),
            eyes: EyesConfig::default(),
            tail: TailConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.n_animals == 0 {
            errors.push("tracker.n_animals must be at least 1".into());
        }
        if (self.eyes.enabled || self.tail.enabled) && !self.body.enabled {
            errors.push("tracker: eyes and tail tracking need tracker.body.enabled".into());
        }
        self.animal.validate(errors);
        self.body.validate(errors);
        self.eyes.validate(errors);
        self.tail.validate(errors);
    }

    /// Tail points per record, zero when tail tracking is off.
    pub fn tail_points(&self) -> usize {
        if self.tail.enabled { self.tail.n_pts_interp } else { 0 }
    }

    /// Preview dimensions for a `width` x `height` frame.
    pub fn preview_size(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        if self.preview_width == 0 || self.preview_height == 0 || width == 0 || height == 0 {
            return None;
        }
        let scale = (self.preview_width as f32 / width as f32)
            .min(self.preview_height as f32 / height as f32)
            .min(1.0);
        Some((
            ((width as f32 * scale).floor() as u32).clamp(1, self.preview_width),
            ((height as f32 * scale).floor() as u32).clamp(1, self.preview_height),
        ))
    }
}

/// Per-frame failure counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub frames: u64,
    pub animals: u64,
    /// Frames with fewer animals than expected.
    pub tracking_failures: u64,
    pub body_failures: u64,
    pub eyes_failures: u64,
    pub tail_failures: u64,
}

pub struct AnimalTracker {
    config: TrackerConfig,
    localizer: Localizer,
    body: Option<BodyTracker>,
    eyes: Option<EyesTracker>,
    tail: Option<TailTracker>,
    assigner: Box<dyn Assigner>,
    /// Detections kept before assignment; `None` when the assigner selects.
    keep: Option<usize>,
    expected: usize,
    stats: TrackerStats,
}

impl AnimalTracker {
    pub fn new(config: &TrackerConfig, assignment: &AssignmentConfig, pix_per_mm: f32, frame_size: (u32, u32)) -> Self {
        let capacity = assignment.capacity();
        Self {
            localizer: Localizer::new(config.animal.clone(), pix_per_mm),
            body: config.body.enabled.then(|| BodyTracker::new(config.body.clone(), pix_per_mm)),
            eyes: (config.body.enabled && config.eyes.enabled)
                .then(|| EyesTracker::new(config.eyes.clone(), pix_per_mm)),
            tail: (config.body.enabled && config.tail.enabled)
                .then(|| TailTracker::new(config.tail.clone(), pix_per_mm)),
            assigner: assignment.build(frame_size, pix_per_mm),
            keep: capacity.is_none().then_some(config.n_animals),
            expected: capacity.unwrap_or(config.n_animals).min(config.n_animals.max(1)),
            config: config.clone(),
            stats: TrackerStats::default(),
        }
    }

    /// Numbers detections in order and leaves identities to a later stage.
    pub fn deferring_identity(mut self) -> Self {
        self.assigner = Box::new(DetectionOrder);
        self
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    pub fn set_intensity(&mut self, intensity: f32) {
        self.localizer.set_intensity(intensity);
    }

    /// Forgets identities, e.g. after the background was reset.
    pub fn reset(&mut self) {
        self.assigner.reset();
    }

    pub fn track(&mut self, frame: &SubtractedFrame) -> TrackingRecord {
        self.stats.frames += 1;

        // --- 1. Localize and select ---
        let mut detections = self.localizer.locate(frame);
        if let Some(keep) = self.keep {
            detections.truncate(keep);
        }

        // --- 2. Assign ---
        let assignments = self.assigner.assign(&detections);

        // --- 3. Pose ---
        let needs_pose = self.body.is_some() && !assignments.is_empty();
        let foreground = needs_pose.then(|| frame.foreground());
        let mut animals = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let detection = &detections[assignment.detection];
            let mut record = AnimalRecord {
                identity: assignment.identity,
                bbox_px: detection.bbox_px,
                centroid_px: detection.centroid_px,
                heading: Heading::from_principal(detection.axis).unwrap_or_else(Heading::identity),
                body: None,
                eyes: None,
                tail: None,
            };
            if let (Some(body), Some(fg)) = (&self.body, &foreground) {
                let trackers = (body, self.eyes.as_ref(), self.tail.as_ref());
                estimate_pose(trackers, fg, &mut record, &mut self.stats);
            }
            animals.push(record);
        }

        if animals.len() < self.expected {
            self.stats.tracking_failures += 1;
            tracing::trace!(index = frame.index, found = animals.len(), expected = self.expected, "animals missing");
        }
        self.stats.animals += animals.len() as u64;

        // --- 4. Preview ---
        let image = self
            .config
            .preview_size(frame.width(), frame.height())
            .map(|(w, h)| preview(&foreground.unwrap_or_else(|| frame.foreground()), w, h));

        TrackingRecord {
            index: frame.index,
            timestamp_ns: frame.timestamp_ns,
            animals,
            image,
        }
    }
}

/// Body, then eyes and tail from the swim bladder.
fn estimate_pose(
    (body, eyes, tail): (&BodyTracker, Option<&EyesTracker>, Option<&TailTracker>),
    foreground: &GrayImage,
    record: &mut AnimalRecord,
    stats: &mut TrackerStats,
) {
    let Some(estimate) = body.track(foreground, record.centroid_px) else {
        stats.body_failures += 1;
        return;
    };
    record.heading = estimate.heading;
    let bladder = estimate.pose.swim_bladder_px;
    record.body = Some(estimate.pose);
    let Some(bladder) = bladder else {
        return;
    };

    if let Some(eyes) = eyes {
        record.eyes = eyes.track(foreground, bladder, &record.heading);
        if record.eyes.is_none() {
            stats.eyes_failures += 1;
        }
    }
    if let Some(tail) = tail {
        record.tail = tail.track(foreground, bladder, &record.heading);
        if record.tail.is_none() {
            stats.tail_failures += 1;
        }
    }
}

/// Foreground rendered dark-on-white at preview size.
fn preview(foreground: &GrayImage, width: u32, height: u32) -> GrayImage {
    let mut small = if foreground.dimensions() == (width, height) {
        foreground.clone()
    } else {
        imageops::resize(foreground, width, height, imageops::FilterType::Triangle)
    };
    imageops::invert(&mut small);
    small
}

/// Removes 2*pi jumps from each identity's heading angle.
#[derive(Debug, Clone, Default)]
pub struct HeadingUnwrapper {
    policy: HeadingNanPolicy,
    /// Last valid raw angle and accumulated turn offset, per identity.
    state: HashMap<u32, (f32, f32)>,
}

impl HeadingUnwrapper {
    pub fn new(policy: HeadingNanPolicy) -> Self {
        Self {
            policy,
            state: HashMap::new(),
        }
    }

    /// Unwrapped angle for `identity`; `None` when `angle` is missing or not
    /// finite.
    pub fn update(&mut self, identity: u32, angle: Option<f32>) -> Option<f32> {
        let Some(angle) = angle.filter(|a| a.is_finite()) else {
            if self.policy == HeadingNanPolicy::Reset {
                self.state.remove(&identity);
            }
            return None;
        };
        let (last, offset) = self.state.get(&identity).copied().unwrap_or((angle, 0.0));
        let mut delta = angle - last;
        let mut turns = offset;
        while delta > PI {
            delta -= TAU;
            turns -= TAU;
        }
        while delta < -PI {
            delta += TAU;
            turns += TAU;
        }
        self.state.insert(identity, (angle, turns));
        Some(angle + turns)
    }

    /// Marks every identity not seen in a record as missing.
    pub fn missing_except(&mut self, seen: &[u32]) {
        if self.policy == HeadingNanPolicy::Reset {
            self.state.retain(|id, _| seen.contains(id));
        }
    }
}
