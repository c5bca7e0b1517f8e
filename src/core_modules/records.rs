// THEORY:
// The `records` module defines what the tracking layer says about a frame. A
// `TrackingRecord` is produced once per accepted frame and is the only thing
// the stimulus renderer, overlay and recorder ever see of the camera.
//
// Each animal is an `AnimalRecord` with an always-present identity, centroid
// and heading, plus optional substructures (`BodyPose`, `EyePose`,
// `TailPose`). A substructure is `None` when its tracker was disabled or
// failed on this frame; consumers must treat absence as normal.
//
// The heading is a 2x2 matrix whose first column points from the swim bladder
// toward the head and whose second column is the left-hand perpendicular of
// the first. Built that way it is orthonormal with determinant +1.

use image::GrayImage;
use nalgebra::{Matrix2, Vector2};

/// Axis-aligned box in camera pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundingBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl BoundingBox {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, px: f32, py: f32) -> bool {
        px >= self.x as f32
            && py >= self.y as f32
            && px < (self.x + self.width) as f32
            && py < (self.y + self.height) as f32
    }

    pub fn center(&self) -> (f32, f32) {
        (
            self.x as f32 + self.width as f32 / 2.0,
            self.y as f32 + self.height as f32 / 2.0,
        )
    }

    /// Scales a box found on a downsampled image back to full resolution.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            x: (self.x as f32 * factor).floor() as u32,
            y: (self.y as f32 * factor).floor() as u32,
            width: (self.width as f32 * factor).ceil() as u32,
            height: (self.height as f32 * factor).ceil() as u32,
        }
    }
}

/// Orthonormal 2x2 matrix of principal axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Heading(pub Matrix2<f32>);

impl Heading {
    /// Builds the matrix from the forward axis; the second column is its
    /// left-hand perpendicular.
    pub fn from_principal(forward: Vector2<f32>) -> Option<Self> {
        let norm = forward.norm();
        if !norm.is_finite() || norm < f32::EPSILON {
            return None;
        }
        let pc1 = forward / norm;
        let pc2 = Vector2::new(-pc1.y, pc1.x);
        Some(Self(Matrix2::from_columns(&[pc1, pc2])))
    }

    pub fn from_angle(angle_rad: f32) -> Self {
        let (s, c) = angle_rad.sin_cos();
        Self(Matrix2::new(c, -s, s, c))
    }

    pub fn identity() -> Self {
        Self(Matrix2::identity())
    }

    /// First column: swim bladder toward head.
    pub fn principal(&self) -> Vector2<f32> {
        self.0.column(0).into_owned()
    }

    pub fn secondary(&self) -> Vector2<f32> {
        self.0.column(1).into_owned()
    }

    /// Angle of the principal axis in image coordinates, radians.
    pub fn angle(&self) -> f32 {
        let p = self.principal();
        p.y.atan2(p.x)
    }

    pub fn flipped(&self) -> Self {
        Self(-self.0)
    }

    pub fn determinant(&self) -> f32 {
        self.0.determinant()
    }

    /// Both columns have unit norm and |det| is one, within `tolerance`.
    pub fn is_orthonormal(&self, tolerance: f32) -> bool {
        let c1 = self.principal().norm();
        let c2 = self.secondary().norm();
        (c1 - 1.0).abs() <= tolerance
            && (c2 - 1.0).abs() <= tolerance
            && (self.determinant().abs() - 1.0).abs() <= tolerance
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BodyPose {
    /// Centroid of the thresholded body mask, camera pixels.
    pub centroid_px: (f32, f32),
    /// Swim bladder centroid used for front/back disambiguation, if found.
    pub swim_bladder_px: Option<(f32, f32)>,
    /// Extent of the body mask along the principal axis, pixels.
    pub length_px: f32,
    /// Extent across the principal axis, pixels.
    pub width_px: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EyeState {
    pub centroid_px: (f32, f32),
    /// Eye long-axis angle relative to the heading, radians in (-pi/2, pi/2].
    pub angle_rad: f32,
    pub area_px: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EyePose {
    pub left: EyeState,
    pub right: EyeState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TailPose {
    /// Interpolated skeleton points from the swim bladder to the tail tip.
    pub points_px: Vec<(f32, f32)>,
}

impl TailPose {
    pub fn len(&self) -> usize {
        self.points_px.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points_px.is_empty()
    }
}

/// Per-animal tracking result for one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AnimalRecord {
    pub identity: u32,
    pub bbox_px: BoundingBox,
    pub centroid_px: (f32, f32),
    pub heading: Heading,
    pub body: Option<BodyPose>,
    pub eyes: Option<EyePose>,
    pub tail: Option<TailPose>,
}

/// Everything the tracker produced for one accepted frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingRecord {
    pub index: u64,
    pub timestamp_ns: i64,
    pub animals: Vec<AnimalRecord>,
    /// Downsampled preview of the source frame, for the overlay.
    pub image: Option<GrayImage>,
}

impl TrackingRecord {
    pub fn empty(index: u64, timestamp_ns: i64) -> Self {
        Self {
            index,
            timestamp_ns,
            animals: Vec::new(),
            image: None,
        }
    }

    pub fn animal(&self, identity: u32) -> Option<&AnimalRecord> {
        self.animals.iter().find(|a| a.identity == identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn heading_from_principal_is_orthonormal_with_positive_determinant() {
        let h = Heading::from_principal(Vector2::new(3.0, 4.0)).unwrap();
        assert!(h.is_orthonormal(1e-4));
        assert_abs_diff_eq!(h.determinant(), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(h.principal().x, 0.6, epsilon = 1e-6);
        assert_abs_diff_eq!(h.secondary().x, -0.8, epsilon = 1e-6);
    }

    #[test]
    fn degenerate_axes_are_rejected() {
        assert!(Heading::from_principal(Vector2::new(0.0, 0.0)).is_none());
        assert!(Heading::from_principal(Vector2::new(f32::NAN, 1.0)).is_none());
    }

    #[test]
    fn flipping_keeps_orthonormality() {
        let h = Heading::from_angle(0.7).flipped();
        assert!(h.is_orthonormal(1e-4));
        assert_abs_diff_eq!(h.angle(), 0.7 - std::f32::consts::PI, epsilon = 1e-5);
    }

    #[test]
    fn bounding_box_scaling_and_containment() {
        let b = BoundingBox::new(10, 20, 5, 5).scaled(2.0);
        assert_eq!(b, BoundingBox::new(20, 40, 10, 10));
        assert!(b.contains(20.0, 40.0));
        assert!(!b.contains(30.0, 40.0));
    }
}
