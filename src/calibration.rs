// THEORY:
// The `calibration` module is the single place where physical and display
// geometry is defined. Two products of the (offline) calibration procedures
// are consumed here:
//
// 1.  **Pixels per millimeter**: a scalar obtained from a checkerboard in the
//     arena plane. Every size expressed in millimeters in the configuration
//     (animal length, crop size, grating period, looming speed) is converted
//     to camera pixels through this value.
// 2.  **Registration**: a pair of 3x3 homogeneous affine matrices mapping
//     camera pixels to projector pixels and back. The renderer evaluates every
//     pattern in camera coordinates and reaches projector space only through
//     these matrices.
//
// A `Calibration` is loaded once at startup, validated, and then injected by
// value into the workers that need it. It is never mutated during a run.

use crate::error::{Result, VrError};
use nalgebra::{Matrix3, Point2, Vector2};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Element-wise tolerance for `cam_to_proj * proj_to_cam == I`.
pub const INVERSE_TOLERANCE: f64 = 1e-6;

/// On-disk representation of the calibration JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationFile {
    pub pix_per_mm: f32,
    pub cam_to_proj: [[f64; 3]; 3],
    pub proj_to_cam: [[f64; 3]; 3],
}

/// Immutable camera/projector geometry for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pix_per_mm: f32,
    cam_to_proj: Matrix3<f64>,
    proj_to_cam: Matrix3<f64>,
}

impl Calibration {
    /// Builds a calibration from both matrices, checking they are inverses.
    pub fn new(pix_per_mm: f32, cam_to_proj: Matrix3<f64>, proj_to_cam: Matrix3<f64>) -> Result<Self> {
        if !(pix_per_mm.is_finite() && pix_per_mm > 0.0) {
            return Err(VrError::calibration(format!(
                "pix_per_mm must be a positive number, got {pix_per_mm}"
            )));
        }
        for (name, m) in [("cam_to_proj", &cam_to_proj), ("proj_to_cam", &proj_to_cam)] {
            if m.iter().any(|v| !v.is_finite()) {
                return Err(VrError::calibration(format!("{name} contains non-finite values")));
            }
            if (m[(2, 0)].abs() > INVERSE_TOLERANCE)
                || (m[(2, 1)].abs() > INVERSE_TOLERANCE)
                || ((m[(2, 2)] - 1.0).abs() > INVERSE_TOLERANCE)
            {
                return Err(VrError::calibration(format!(
                    "{name} is not affine: last row must be [0, 0, 1]"
                )));
            }
        }

        let product = cam_to_proj * proj_to_cam;
        let deviation = (product - Matrix3::identity()).abs().max();
        if deviation > INVERSE_TOLERANCE {
            return Err(VrError::calibration(format!(
                "cam_to_proj and proj_to_cam are not inverses (max deviation {deviation:.3e})"
            )));
        }

        Ok(Self {
            pix_per_mm,
            cam_to_proj,
            proj_to_cam,
        })
    }

    /// Builds a calibration from the forward map, deriving the inverse.
    pub fn from_cam_to_proj(pix_per_mm: f32, cam_to_proj: Matrix3<f64>) -> Result<Self> {
        let proj_to_cam = cam_to_proj
            .try_inverse()
            .ok_or_else(|| VrError::calibration("cam_to_proj is singular"))?;
        Self::new(pix_per_mm, cam_to_proj, proj_to_cam)
    }

    /// Camera and projector share pixel coordinates.
    pub fn identity(pix_per_mm: f32) -> Self {
        Self {
            pix_per_mm,
            cam_to_proj: Matrix3::identity(),
            proj_to_cam: Matrix3::identity(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            VrError::calibration(format!("cannot read calibration file {}: {e}", path.display()))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: CalibrationFile = serde_json::from_str(text)
            .map_err(|e| VrError::calibration(format!("invalid calibration JSON: {e}")))?;
        Self::new(
            file.pix_per_mm,
            matrix_from_rows(&file.cam_to_proj),
            matrix_from_rows(&file.proj_to_cam),
        )
    }

    pub fn to_file(&self) -> CalibrationFile {
        CalibrationFile {
            pix_per_mm: self.pix_per_mm,
            cam_to_proj: rows_from_matrix(&self.cam_to_proj),
            proj_to_cam: rows_from_matrix(&self.proj_to_cam),
        }
    }

    pub fn pix_per_mm(&self) -> f32 {
        self.pix_per_mm
    }

    pub fn cam_to_proj_matrix(&self) -> &Matrix3<f64> {
        &self.cam_to_proj
    }

    pub fn proj_to_cam_matrix(&self) -> &Matrix3<f64> {
        &self.proj_to_cam
    }

    pub fn cam_to_proj(&self, point: Point2<f64>) -> Point2<f64> {
        transform_point(&self.cam_to_proj, point)
    }

    pub fn proj_to_cam(&self, point: Point2<f64>) -> Point2<f64> {
        transform_point(&self.proj_to_cam, point)
    }

    /// Converts a direction (no translation) from camera to projector space.
    pub fn cam_to_proj_vector(&self, v: Vector2<f64>) -> Vector2<f64> {
        self.cam_to_proj.fixed_view::<2, 2>(0, 0) * v
    }

    pub fn mm_to_px(&self, mm: f32) -> f32 {
        mm * self.pix_per_mm
    }

    pub fn px_to_mm(&self, px: f32) -> f32 {
        px / self.pix_per_mm
    }
}

fn transform_point(m: &Matrix3<f64>, point: Point2<f64>) -> Point2<f64> {
    let h = m * point.to_homogeneous();
    Point2::new(h.x / h.z, h.y / h.z)
}

fn matrix_from_rows(rows: &[[f64; 3]; 3]) -> Matrix3<f64> {
    Matrix3::from_fn(|r, c| rows[r][c])
}

fn rows_from_matrix(m: &Matrix3<f64>) -> [[f64; 3]; 3] {
    let mut rows = [[0.0; 3]; 3];
    for (r, row) in rows.iter_mut().enumerate() {
        for (c, value) in row.iter_mut().enumerate() {
            *value = m[(r, c)];
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn registration() -> Matrix3<f64> {
        // Scale, slight rotation and offset, as produced by dot-grid registration.
        let angle: f64 = 0.03;
        Matrix3::new(
            1.2 * angle.cos(),
            -1.2 * angle.sin(),
            35.0,
            1.2 * angle.sin(),
            1.2 * angle.cos(),
            -12.5,
            0.0,
            0.0,
            1.0,
        )
    }

    #[test]
    fn camera_projector_round_trip_is_within_a_thousandth_of_a_pixel() {
        let cal = Calibration::from_cam_to_proj(40.0, registration()).unwrap();
        for &(u, v) in &[(0.0, 0.0), (100.0, 100.0), (1023.0, 767.0), (512.3, 17.9)] {
            let back = cal.proj_to_cam(cal.cam_to_proj(Point2::new(u, v)));
            assert_abs_diff_eq!(back.x, u, epsilon = 1e-3);
            assert_abs_diff_eq!(back.y, v, epsilon = 1e-3);
        }
    }

    #[test]
    fn loads_json_and_rejects_mismatched_inverse() {
        let good = Calibration::from_cam_to_proj(25.0, registration()).unwrap();
        let json = serde_json::to_string(&good.to_file()).unwrap();
        let loaded = Calibration::from_json(&json).unwrap();
        assert_eq!(loaded.pix_per_mm(), 25.0);

        let mut file = good.to_file();
        file.proj_to_cam[0][2] += 0.5;
        let json = serde_json::to_string(&file).unwrap();
        assert!(matches!(
            Calibration::from_json(&json),
            Err(VrError::Calibration(_))
        ));
    }

    #[test]
    fn rejects_non_positive_scale_and_missing_file() {
        assert!(Calibration::new(0.0, Matrix3::identity(), Matrix3::identity()).is_err());
        let err = Calibration::load(Path::new("/nonexistent/calibration.json")).unwrap_err();
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn millimeter_conversions_use_the_scalar() {
        let cal = Calibration::identity(40.0);
        assert_eq!(cal.mm_to_px(20.0), 800.0);
        assert_eq!(cal.px_to_mm(400.0), 10.0);
    }
}
