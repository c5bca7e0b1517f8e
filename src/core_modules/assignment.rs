// THEORY:
// Assignment gives each detection of the current frame an identity that stays
// stable across frames. It is the "object permanence" layer of the tracker.
//
// Two policies, fixed for a run:
// 1.  **ROI grid.** The arena is cut into `rows x cols` rectangles, one animal
//     per rectangle. A detection takes the identity `row * cols + col` of the
//     rectangle holding its centroid. If a rectangle holds several detections
//     only the first (the largest, as the localizer sorts them) is kept.
//     Nothing is remembered between frames; identity is stable as long as the
//     animals stay in their wells.
// 2.  **Hungarian.** Tracks remember the last centroid of each identity. Each
//     frame solves the minimum-cost bipartite matching between tracks and
//     detections, with Euclidean distance as cost:
//     - **Match**: a pair closer than `max_distance_mm` updates the track.
//     - **Miss**: an unmatched track ages and dies after `max_missed_frames`.
//     - **Birth**: an unmatched detection starts a track with a fresh identity.
//     Tracks are state that must see every frame in turn, so with several
//     trackers the matching runs once, downstream of all of them, and each
//     tracker only numbers its detections in order (`DetectionOrder`).

use crate::core_modules::localizer::Detection;
use pathfinding::kuhn_munkres::kuhn_munkres_min;
use pathfinding::matrix::Matrix;
use serde::{Deserialize, Serialize};

/// Distances are matched in integer thousandths of a pixel.
const COST_SCALE: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentMethod {
    #[default]
    RoiGrid,
    Hungarian,
}

/// `[assignment]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentConfig {
    pub method: AssignmentMethod,
    pub roi_rows: u32,
    pub roi_cols: u32,
    pub max_distance_mm: f32,
    pub max_missed_frames: u32,
}

impl Default for AssignmentConfig {
    fn default() -> Self {
        Self {
            method: AssignmentMethod::RoiGrid,
            roi_rows: 1,
            roi_cols: 1,
            max_distance_mm: 2.0,
            max_missed_frames: 10,
        }
    }
}

impl AssignmentConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.roi_rows == 0 || self.roi_cols == 0 {
            errors.push("assignment: roi_rows and roi_cols must be >= 1".into());
        }
        if !(self.max_distance_mm > 0.0) {
            errors.push("assignment.max_distance_mm must be positive".into());
        }
    }

    /// Most animals a frame can carry under this policy, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        match self.method {
            AssignmentMethod::RoiGrid => Some((self.roi_rows * self.roi_cols) as usize),
            AssignmentMethod::Hungarian => None,
        }
    }

    /// Whether identities depend on earlier frames and so must be given by a
    /// single stage that sees all records.
    pub fn is_stateful(&self) -> bool {
        self.method == AssignmentMethod::Hungarian
    }

    pub fn hungarian(&self, pix_per_mm: f32) -> Hungarian {
        Hungarian::new(self.max_distance_mm * pix_per_mm, self.max_missed_frames)
    }

    pub fn build(&self, frame_size: (u32, u32), pix_per_mm: f32) -> Box<dyn Assigner> {
        match self.method {
            AssignmentMethod::RoiGrid => Box::new(RoiGrid::new(self.roi_rows, self.roi_cols, frame_size.0, frame_size.1)),
            AssignmentMethod::Hungarian => Box::new(self.hungarian(pix_per_mm)),
        }
    }
}

/// One identity given to one detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub identity: u32,
    /// Index into the detection slice.
    pub detection: usize,
}

pub trait Assigner: Send {
    /// Identities for this frame's detections, sorted by identity.
    fn assign(&mut self, detections: &[Detection]) -> Vec<Assignment>;

    /// Forgets all tracks.
    fn reset(&mut self) {}
}

/// Fixed grid of wells.
#[derive(Debug, Clone)]
pub struct RoiGrid {
    rows: u32,
    cols: u32,
    width: u32,
    height: u32,
}

impl RoiGrid {
    pub fn new(rows: u32, cols: u32, width: u32, height: u32) -> Self {
        Self {
            rows: rows.max(1),
            cols: cols.max(1),
            width: width.max(1),
            height: height.max(1),
        }
    }

    /// Identity of the cell holding `(x, y)`; `None` outside the arena.
    pub fn cell(&self, x: f32, y: f32) -> Option<u32> {
        if !(x >= 0.0 && y >= 0.0 && x < self.width as f32 && y < self.height as f32) {
            return None;
        }
        let col = ((x * self.cols as f32 / self.width as f32) as u32).min(self.cols - 1);
        let row = ((y * self.rows as f32 / self.height as f32) as u32).min(self.rows - 1);
        Some(row * self.cols + col)
    }
}

impl Assigner for RoiGrid {
    fn assign(&mut self, detections: &[Detection]) -> Vec<Assignment> {
        let mut taken = vec![false; (self.rows * self.cols) as usize];
        let mut out = Vec::new();
        for (index, detection) in detections.iter().enumerate() {
            let Some(identity) = self.cell(detection.centroid_px.0, detection.centroid_px.1) else {
                continue;
            };
            if !std::mem::replace(&mut taken[identity as usize], true) {
                out.push(Assignment {
                    identity,
                    detection: index,
                });
            }
        }
        out.sort_by_key(|a| a.identity);
        out
    }
}

/// Provisional identities: the detection's rank in the frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetectionOrder;

impl Assigner for DetectionOrder {
    fn assign(&mut self, detections: &[Detection]) -> Vec<Assignment> {
        (0..detections.len())
            .map(|d| Assignment {
                identity: d as u32,
                detection: d,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
struct Track {
    identity: u32,
    position: (f32, f32),
    missed: u32,
}

/// Distance-matched tracks with ageing.
#[derive(Debug, Clone)]
pub struct Hungarian {
    max_distance_px: f32,
    max_missed_frames: u32,
    tracks: Vec<Track>,
    next_identity: u32,
}

impl Hungarian {
    pub fn new(max_distance_px: f32, max_missed_frames: u32) -> Self {
        Self {
            max_distance_px,
            max_missed_frames,
            tracks: Vec::new(),
            next_identity: 0,
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// `(track, detection)` pairs of the minimum total distance matching,
    /// keeping only pairs within `max_distance_px`.
    fn solve(&self, points: &[(f32, f32)]) -> Vec<(usize, usize)> {
        let (n_tracks, n_detections) = (self.tracks.len(), points.len());
        if n_tracks == 0 || n_detections == 0 {
            return Vec::new();
        }
        let limit = (self.max_distance_px as f64 * COST_SCALE).round() as i64;
        let padding = limit.saturating_mul(4).max(1) + 1;
        let size = n_tracks.max(n_detections);
        let mut costs = Matrix::new(size, size, padding);
        for (t, track) in self.tracks.iter().enumerate() {
            for (d, point) in points.iter().enumerate() {
                let dx = (track.position.0 - point.0) as f64;
                let dy = (track.position.1 - point.1) as f64;
                let cost = ((dx * dx + dy * dy).sqrt() * COST_SCALE).round() as i64;
                costs[(t, d)] = cost.min(padding);
            }
        }
        let (_, columns) = kuhn_munkres_min(&costs);
        columns
            .into_iter()
            .enumerate()
            .filter(|&(t, d)| t < n_tracks && d < n_detections && costs[(t, d)] <= limit)
            .collect()
    }

    /// Identities for one frame's centroids, sorted by identity.
    pub fn assign_points(&mut self, points: &[(f32, f32)]) -> Vec<Assignment> {
        let pairs = self.solve(points);
        let mut track_matched = vec![false; self.tracks.len()];
        let mut detection_matched = vec![false; points.len()];
        let mut out = Vec::with_capacity(points.len());

        // --- 1. Matches ---
        for (t, d) in pairs {
            let track = &mut self.tracks[t];
            track.position = points[d];
            track.missed = 0;
            track_matched[t] = true;
            detection_matched[d] = true;
            out.push(Assignment {
                identity: track.identity,
                detection: d,
            });
        }

        // --- 2. Misses ---
        let max_missed = self.max_missed_frames;
        let mut t = 0;
        self.tracks.retain_mut(|track| {
            let matched = track_matched[t];
            t += 1;
            if !matched {
                track.missed += 1;
            }
            let alive = track.missed <= max_missed;
            if !alive {
                tracing::debug!(identity = track.identity, "track lost");
            }
            alive
        });

        // --- 3. Births ---
        for (d, point) in points.iter().enumerate() {
            if detection_matched[d] {
                continue;
            }
            let identity = self.next_identity;
            self.next_identity = self.next_identity.wrapping_add(1);
            self.tracks.push(Track {
                identity,
                position: *point,
                missed: 0,
            });
            out.push(Assignment { identity, detection: d });
        }

        out.sort_by_key(|a| a.identity);
        out
    }
}

impl Assigner for Hungarian {
    fn assign(&mut self, detections: &[Detection]) -> Vec<Assignment> {
        let points: Vec<(f32, f32)> = detections.iter().map(|d| d.centroid_px).collect();
        self.assign_points(&points)
    }

    fn reset(&mut self) {
        self.tracks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::records::BoundingBox;
    use nalgebra::Vector2;

    fn at(x: f32, y: f32) -> Detection {
        Detection {
            centroid_px: (x, y),
            bbox_px: BoundingBox::new(x as u32, y as u32, 1, 1),
            area_mm2: 1.0,
            length_mm: 3.0,
            width_mm: 0.5,
            axis: Vector2::x(),
        }
    }

    #[test]
    fn roi_identity_is_the_cell_index() {
        let mut grid = RoiGrid::new(2, 3, 300, 200);
        let out = grid.assign(&[at(250.0, 150.0), at(10.0, 10.0), at(20.0, 20.0), at(-1.0, 5.0)]);
        assert_eq!(
            out,
            vec![
                Assignment { identity: 0, detection: 1 },
                Assignment { identity: 5, detection: 0 },
            ]
        );
    }

    #[test]
    fn detection_order_numbers_in_place() {
        let out = DetectionOrder.assign(&[at(50.0, 5.0), at(1.0, 1.0)]);
        assert_eq!(
            out,
            vec![
                Assignment { identity: 0, detection: 0 },
                Assignment { identity: 1, detection: 1 },
            ]
        );
    }

    #[test]
    fn hungarian_keeps_identities_while_animals_move() {
        let mut h = Hungarian::new(20.0, 2);
        let first = h.assign(&[at(10.0, 10.0), at(100.0, 100.0)]);
        assert_eq!(first.len(), 2);
        // Same animals, listed in the opposite order and slightly moved.
        let second = h.assign(&[at(104.0, 98.0), at(12.0, 11.0)]);
        assert_eq!(second[0], Assignment { identity: 0, detection: 1 });
        assert_eq!(second[1], Assignment { identity: 1, detection: 0 });
    }

    #[test]
    fn matching_minimizes_the_total_distance() {
        let mut h = Hungarian::new(50.0, 2);
        h.assign(&[at(0.0, 0.0), at(10.0, 0.0)]);
        // Closest pair first would give detection 0 to track 1 (1 px) and
        // leave track 0 a 20 px jump; the optimum totals 19 px instead of 21.
        let out = h.assign(&[at(9.0, 0.0), at(20.0, 0.0)]);
        assert_eq!(out[0], Assignment { identity: 0, detection: 0 });
        assert_eq!(out[1], Assignment { identity: 1, detection: 1 });
    }

    #[test]
    fn far_jumps_spawn_new_tracks_and_old_ones_age_out() {
        let mut h = Hungarian::new(5.0, 1);
        h.assign(&[at(0.0, 0.0)]);
        let out = h.assign(&[at(50.0, 50.0)]);
        assert_eq!(out, vec![Assignment { identity: 1, detection: 0 }]);
        assert_eq!(h.live_tracks(), 2);
        h.assign(&[at(50.0, 51.0)]);
        assert_eq!(h.live_tracks(), 1);
        h.reset();
        assert_eq!(h.live_tracks(), 0);
    }
}
