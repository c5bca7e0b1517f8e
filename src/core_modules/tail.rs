// THEORY:
// The tail is traced, not segmented. It is too thin and too faint at its tip
// for a threshold to hold it together, so the tracker walks along it:
//
// 1.  Start at the swim bladder and face backwards (against the heading).
// 2.  Look one step ahead along an arc of `arc_angle_deg` centered on the
//     current direction, at `n_pts_arc` candidate points. A step is
//     `tail_length_mm / n_tail_points` long.
// 3.  Score each candidate by the mean intensity of a small ball around it and
//     move to the best one. The walk bends with the tail because the arc is
//     re-centered on every step's direction.
// 4.  Stop after `n_tail_points` steps or as soon as the best score falls
//     below `min_intensity`: the walk has left the animal.
// 5.  Resample the polyline at `n_pts_interp` points equally spaced by arc
//     length, so every record carries the same number of tail points.

use crate::core_modules::geometry::bilinear;
use crate::core_modules::records::{Heading, TailPose};
use image::GrayImage;
use nalgebra::{Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

/// `[tracker.tail]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    pub enabled: bool,
    pub arc_angle_deg: f32,
    pub n_tail_points: usize,
    pub n_pts_arc: usize,
    pub tail_length_mm: f32,
    pub ball_radius_mm: f32,
    pub n_pts_interp: usize,
    /// Weakest ball mean, as a fraction of 255, still counted as tail.
    pub min_intensity: f32,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            arc_angle_deg: 120.0,
            n_tail_points: 6,
            n_pts_arc: 20,
            tail_length_mm: 2.6,
            ball_radius_mm: 0.1,
            n_pts_interp: 20,
            min_intensity: 0.02,
        }
    }
}

impl TailConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        let p = "tracker.tail";
        if !(self.arc_angle_deg > 0.0 && self.arc_angle_deg <= 360.0) {
            errors.push(format!("{p}.arc_angle_deg must lie in (0, 360]"));
        }
        if self.n_tail_points == 0 || self.n_pts_arc < 2 || self.n_pts_interp < 2 {
            errors.push(format!("{p}: need n_tail_points >= 1, n_pts_arc >= 2 and n_pts_interp >= 2"));
        }
        if !(self.tail_length_mm > 0.0) {
            errors.push(format!("{p}.tail_length_mm must be positive"));
        }
        if self.ball_radius_mm < 0.0 {
            errors.push(format!("{p}.ball_radius_mm must be >= 0"));
        }
        if !(0.0..=1.0).contains(&self.min_intensity) {
            errors.push(format!("{p}.min_intensity must lie in [0, 1]"));
        }
    }
}

pub struct TailTracker {
    config: TailConfig,
    step_px: f32,
    ball: Vec<Vector2<f32>>,
    arc: Vec<Rotation2<f32>>,
}

impl TailTracker {
    pub fn new(config: TailConfig, pix_per_mm: f32) -> Self {
        let step_px = config.tail_length_mm * pix_per_mm / config.n_tail_points.max(1) as f32;

        let r = config.ball_radius_mm * pix_per_mm;
        let reach = r.floor() as i32;
        let mut ball = Vec::new();
        for dy in -reach..=reach {
            for dx in -reach..=reach {
                if ((dx * dx + dy * dy) as f32) <= r * r {
                    ball.push(Vector2::new(dx as f32, dy as f32));
                }
            }
        }
        if ball.is_empty() {
            ball.push(Vector2::zeros());
        }

        let half = config.arc_angle_deg.to_radians() / 2.0;
        let n = config.n_pts_arc.max(2);
        // Straightest candidates first, so ties keep the current direction.
        let mut angles: Vec<f32> = (0..n).map(|k| -half + 2.0 * half * k as f32 / (n - 1) as f32).collect();
        angles.sort_by(|a, b| a.abs().total_cmp(&b.abs()));
        let arc = angles.into_iter().map(Rotation2::new).collect();

        Self {
            config,
            step_px,
            ball,
            arc,
        }
    }

    pub fn n_points(&self) -> usize {
        self.config.n_pts_interp
    }

    /// Traces the tail backwards from `swim_bladder_px`.
    pub fn track(&self, foreground: &GrayImage, swim_bladder_px: (f32, f32), heading: &Heading) -> Option<TailPose> {
        let skeleton = self.walk(foreground, swim_bladder_px, heading);
        if skeleton.len() < 2 {
            return None;
        }
        let points_px = resample(&skeleton, self.config.n_pts_interp)?;
        Some(TailPose { points_px })
    }

    /// Raw skeleton, bladder first.
    pub fn walk(&self, foreground: &GrayImage, swim_bladder_px: (f32, f32), heading: &Heading) -> Vec<Point2<f32>> {
        let mut position = Point2::new(swim_bladder_px.0, swim_bladder_px.1);
        let mut direction = -heading.principal();
        let mut skeleton = vec![position];
        if !(position.x.is_finite() && position.y.is_finite() && direction.norm() > 0.0) {
            return skeleton;
        }
        let min_score = self.config.min_intensity * 255.0;

        for _ in 0..self.config.n_tail_points {
            let best = self
                .arc
                .iter()
                .map(|rotation| {
                    let d = rotation * direction;
                    let candidate = position + d * self.step_px;
                    (self.ball_mean(foreground, candidate), candidate, d)
                })
                .fold(None, |best: Option<(f32, Point2<f32>, Vector2<f32>)>, c| match best {
                    Some(b) if b.0 >= c.0 => Some(b),
                    _ => Some(c),
                });
            let Some((score, candidate, d)) = best else {
                break;
            };
            if score < min_score || score <= 0.0 {
                break;
            }
            position = candidate;
            direction = d;
            skeleton.push(position);
        }
        skeleton
    }

    fn ball_mean(&self, image: &GrayImage, center: Point2<f32>) -> f32 {
        let sum: f32 = self
            .ball
            .iter()
            .map(|o| bilinear(image, center.x + o.x, center.y + o.y))
            .sum();
        sum / self.ball.len() as f32
    }
}

/// `n` points equally spaced by arc length along `polyline`.
fn resample(polyline: &[Point2<f32>], n: usize) -> Option<Vec<(f32, f32)>> {
    let mut cumulative = Vec::with_capacity(polyline.len());
    let mut total = 0.0f32;
    cumulative.push(0.0);
    for pair in polyline.windows(2) {
        total += (pair[1] - pair[0]).norm();
        cumulative.push(total);
    }
    if !(total > 0.0) || n < 2 {
        return None;
    }

    let mut out = Vec::with_capacity(n);
    let mut segment = 0;
    for k in 0..n {
        let s = total * k as f32 / (n - 1) as f32;
        while segment + 2 < polyline.len() && cumulative[segment + 1] < s {
            segment += 1;
        }
        let (s0, s1) = (cumulative[segment], cumulative[segment + 1]);
        let t = if s1 > s0 { ((s - s0) / (s1 - s0)).clamp(0.0, 1.0) } else { 0.0 };
        let p = polyline[segment] + (polyline[segment + 1] - polyline[segment]) * t;
        out.push((p.x, p.y));
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use image::Luma;

    fn tail_image(from_x: u32, to_x: u32) -> GrayImage {
        let mut img = GrayImage::new(100, 80);
        for x in from_x..=to_x {
            for y in 39..=41 {
                img.put_pixel(x, y, Luma([180]));
            }
        }
        img
    }

    fn tracker() -> TailTracker {
        TailTracker::new(
            TailConfig {
                tail_length_mm: 3.0,
                n_tail_points: 6,
                n_pts_interp: 7,
                ..Default::default()
            },
            10.0,
        )
    }

    #[test]
    fn straight_tail_is_traced_behind_the_bladder() {
        let tail = tracker()
            .track(&tail_image(15, 50), (50.0, 40.0), &Heading::identity())
            .unwrap();
        assert_eq!(tail.len(), 7);
        assert_abs_diff_eq!(tail.points_px[0].0, 50.0, epsilon = 1e-4);
        for pair in tail.points_px.windows(2) {
            assert!(pair[1].0 < pair[0].0);
            assert_abs_diff_eq!(pair[1].1, 40.0, epsilon = 0.5);
        }
        assert_abs_diff_eq!(tail.points_px[6].0, 20.0, epsilon = 0.5);
    }

    #[test]
    fn walk_stops_where_the_tail_ends() {
        let skeleton = tracker().walk(&tail_image(35, 50), (50.0, 40.0), &Heading::identity());
        assert_eq!(skeleton.len(), 4);
        assert_abs_diff_eq!(skeleton[3].x, 35.0, epsilon = 0.5);
    }

    #[test]
    fn no_tail_no_pose() {
        assert!(tracker().track(&GrayImage::new(60, 60), (30.0, 30.0), &Heading::identity()).is_none());
    }

    #[test]
    fn resampling_spaces_points_evenly() {
        let line = [Point2::new(0.0, 0.0), Point2::new(3.0, 0.0), Point2::new(3.0, 3.0)];
        let points = resample(&line, 3).unwrap();
        assert_eq!(points, vec![(0.0, 0.0), (3.0, 0.0), (3.0, 3.0)]);
    }
}
