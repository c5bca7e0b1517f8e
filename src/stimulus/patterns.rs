// THEORY:
// Every stimulus is a pure function from a point in camera pixels (and time)
// to "foreground" or "background". Keeping patterns in camera space means the
// geometry of a stimulus is specified in the same frame the animal is tracked
// in, in millimeters through `pix_per_mm`, and the projector only enters the
// picture when the renderer maps its own pixels back through the calibration.
//
// Time is measured from the moment the command became active.

use crate::stimulus::command::{LoomingCycle, LoomingGrowth, Rgba, StimulusCommand, StimulusKind};
use nalgebra::{Point2, Vector2};

/// Smallest looming radius used as the origin of exponential growth, mm.
const LOOMING_MIN_RADIUS_MM: f32 = 0.1;

/// Pose the renderer draws relative to, in camera pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimalPose {
    pub centroid: Point2<f32>,
    /// Unit vector from swim bladder toward the head.
    pub heading: Vector2<f32>,
}

impl AnimalPose {
    pub fn new(centroid: (f32, f32), heading: (f32, f32)) -> Self {
        let heading = Vector2::new(heading.0, heading.1);
        let norm = heading.norm();
        Self {
            centroid: Point2::new(centroid.0, centroid.1),
            heading: if norm > f32::EPSILON { heading / norm } else { Vector2::x() },
        }
    }

    /// Rotates an offset given in the animal frame (x forward, y left) into
    /// camera coordinates.
    fn to_camera(&self, offset: Vector2<f32>) -> Vector2<f32> {
        let left = Vector2::new(-self.heading.y, self.heading.x);
        self.heading * offset.x + left * offset.y
    }
}

/// Everything a pattern needs besides the command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PatternContext {
    /// Seconds since the command became active.
    pub t_sec: f32,
    pub pix_per_mm: f32,
    /// Pose of the tracked animal, or the arena center facing +x.
    pub animal: AnimalPose,
    pub looming_cycle: LoomingCycle,
}

/// Grating period in camera pixels.
pub fn omr_period_px(period_mm: f32, pix_per_mm: f32) -> f32 {
    period_mm * pix_per_mm
}

/// Looming radius in camera pixels at `t_sec` after the command started.
pub fn looming_radius_px(
    t_sec: f32,
    period_sec: f32,
    expansion_time_sec: f32,
    speed_mm_per_sec: f32,
    growth: LoomingGrowth,
    cycle: LoomingCycle,
    pix_per_mm: f32,
) -> f32 {
    let t_cycle = t_sec.rem_euclid(period_sec);
    let max_radius_mm = speed_mm_per_sec * expansion_time_sec;
    let radius_mm = if t_cycle <= expansion_time_sec {
        match growth {
            LoomingGrowth::Linear => speed_mm_per_sec * t_cycle,
            LoomingGrowth::Exponential => {
                if max_radius_mm <= LOOMING_MIN_RADIUS_MM || expansion_time_sec <= 0.0 {
                    max_radius_mm
                } else {
                    let rate = (max_radius_mm / LOOMING_MIN_RADIUS_MM).ln() / expansion_time_sec;
                    LOOMING_MIN_RADIUS_MM * (rate * t_cycle).exp()
                }
            }
        }
    } else {
        match cycle {
            LoomingCycle::ResetToZero => 0.0,
            LoomingCycle::HoldMax => max_radius_mm,
        }
    };
    radius_mm * pix_per_mm
}

/// Angle of the prey dot relative to the heading, degrees. The dot sweeps the
/// arc back and forth at constant angular speed.
pub fn prey_angle_deg(t_sec: f32, speed_deg_per_sec: f32, start_deg: f32, stop_deg: f32) -> f32 {
    let span = stop_deg - start_deg;
    if span <= 0.0 {
        return start_deg;
    }
    let travel = (speed_deg_per_sec.abs() * t_sec).rem_euclid(2.0 * span);
    if travel <= span {
        start_deg + travel
    } else {
        start_deg + 2.0 * span - travel
    }
}

fn square_wave(phase: f32) -> bool {
    phase.rem_euclid(1.0) < 0.5
}

/// Whether the camera-space point `p` is painted in the foreground color.
pub fn is_foreground(kind: &StimulusKind, ctx: &PatternContext, p: Point2<f32>) -> bool {
    let animal = &ctx.animal;
    match kind {
        StimulusKind::Dark | StimulusKind::Bright => true,
        StimulusKind::Phototaxis { phototaxis_polarity } => {
            let ahead = (p - animal.centroid).dot(&animal.heading) >= 0.0;
            if *phototaxis_polarity >= 0 { ahead } else { !ahead }
        }
        StimulusKind::Omr {
            omr_angle_deg,
            omr_speed_mm_per_sec,
            omr_spatial_period_mm,
        } => {
            let theta = omr_angle_deg.to_radians();
            let direction = Vector2::new(theta.cos(), theta.sin());
            let along_mm = p.coords.dot(&direction) / ctx.pix_per_mm;
            square_wave((along_mm - omr_speed_mm_per_sec * ctx.t_sec) / omr_spatial_period_mm)
        }
        StimulusKind::Okr {
            okr_spatial_frequency_deg,
            okr_speed_deg_per_sec,
        } => {
            let d = p - animal.centroid;
            let angle_deg = d.y.atan2(d.x).to_degrees();
            square_wave((angle_deg - okr_speed_deg_per_sec * ctx.t_sec) / okr_spatial_frequency_deg)
        }
        StimulusKind::Looming {
            looming_center_mm,
            looming_period_sec,
            looming_expansion_time_sec,
            looming_expansion_speed_mm_per_sec,
            looming_growth,
            looming_relative_to_animal,
        } => {
            let offset = Vector2::new(looming_center_mm[0], looming_center_mm[1]) * ctx.pix_per_mm;
            let center = if *looming_relative_to_animal {
                animal.centroid + animal.to_camera(offset)
            } else {
                Point2::from(offset)
            };
            let radius = looming_radius_px(
                ctx.t_sec,
                *looming_period_sec,
                *looming_expansion_time_sec,
                *looming_expansion_speed_mm_per_sec,
                *looming_growth,
                ctx.looming_cycle,
                ctx.pix_per_mm,
            );
            (p - center).norm() < radius
        }
        StimulusKind::PreyCapture {
            prey_capture_speed_deg_per_sec,
            prey_capture_arc_start_deg,
            prey_capture_arc_stop_deg,
            prey_capture_arc_radius_mm,
            prey_capture_dot_radius_mm,
        } => {
            let angle = prey_angle_deg(
                ctx.t_sec,
                *prey_capture_speed_deg_per_sec,
                *prey_capture_arc_start_deg,
                *prey_capture_arc_stop_deg,
            )
            .to_radians();
            let arc = prey_capture_arc_radius_mm * ctx.pix_per_mm;
            let dot = animal.centroid + animal.to_camera(Vector2::new(angle.cos(), angle.sin()) * arc);
            (p - dot).norm() < prey_capture_dot_radius_mm * ctx.pix_per_mm
        }
    }
}

/// Color of the camera-space point `p`.
pub fn shade(command: &StimulusCommand, ctx: &PatternContext, p: Point2<f32>) -> Rgba {
    if is_foreground(&command.kind, ctx, p) {
        command.foreground_color
    } else {
        command.background_color
    }
}
