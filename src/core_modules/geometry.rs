// THEORY:
// Shared image geometry for the trackers. Every tracker stage reduces a binary
// mask to the same few numbers: area, centroid, second moments and the
// principal axes of those moments. The stages also share two resampling
// operations:
//
// 1.  **Rescaling to a target resolution.** Trackers work at a configured
//     pixels-per-millimeter that is usually coarser than the camera's. A
//     `Rescale` keeps the factor so results can be mapped back.
// 2.  **Sampling in the animal frame.** Eye and tail searches look at a window
//     aligned with the heading. `sample_aligned` builds that window with
//     bilinear interpolation so the trackers can reason in "forward/left"
//     coordinates.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use nalgebra::{Matrix2, Point2, SymmetricEigen, Vector2};

/// First and second order moments of a set of pixels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Moments {
    pub area: u32,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
}

impl Moments {
    pub fn add(&mut self, x: f64, y: f64) {
        self.area += 1;
        self.sum_x += x;
        self.sum_y += y;
        self.sum_xx += x * x;
        self.sum_yy += y * y;
        self.sum_xy += x * y;
    }

    /// Moments of every non-zero pixel of `mask`.
    pub fn of_mask(mask: &GrayImage) -> Self {
        let mut m = Self::default();
        for (x, y, p) in mask.enumerate_pixels() {
            if p[0] > 0 {
                m.add(x as f64, y as f64);
            }
        }
        m
    }

    pub fn centroid(&self) -> Option<Point2<f64>> {
        (self.area > 0).then(|| {
            let n = self.area as f64;
            Point2::new(self.sum_x / n, self.sum_y / n)
        })
    }

    /// Population covariance of pixel coordinates.
    pub fn covariance(&self) -> Option<Matrix2<f64>> {
        let c = self.centroid()?;
        let n = self.area as f64;
        let cxx = self.sum_xx / n - c.x * c.x;
        let cyy = self.sum_yy / n - c.y * c.y;
        let cxy = self.sum_xy / n - c.x * c.y;
        Some(Matrix2::new(cxx, cxy, cxy, cyy))
    }

    /// Principal axes, major first, with their variances.
    pub fn principal_axes(&self) -> Option<PrincipalAxes> {
        if self.area < 2 {
            return None;
        }
        let eigen = SymmetricEigen::new(self.covariance()?);
        let (major, minor) = if eigen.eigenvalues[0] >= eigen.eigenvalues[1] {
            (0, 1)
        } else {
            (1, 0)
        };
        let axis: Vector2<f64> = eigen.eigenvectors.column(major).into_owned();
        if !axis.iter().all(|v| v.is_finite()) {
            return None;
        }
        Some(PrincipalAxes {
            major: axis.normalize(),
            major_variance: eigen.eigenvalues[major].max(0.0),
            minor_variance: eigen.eigenvalues[minor].max(0.0),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrincipalAxes {
    /// Unit vector; its sign is arbitrary.
    pub major: Vector2<f64>,
    pub major_variance: f64,
    pub minor_variance: f64,
}

impl PrincipalAxes {
    pub fn minor(&self) -> Vector2<f64> {
        Vector2::new(-self.major.y, self.major.x)
    }

    /// Angle of the major axis folded into (-pi/2, pi/2].
    pub fn angle(&self) -> f64 {
        fold_half_turn(self.major.y.atan2(self.major.x))
    }
}

/// Folds an axis angle (defined modulo pi) into (-pi/2, pi/2].
pub fn fold_half_turn(angle: f64) -> f64 {
    use std::f64::consts::{FRAC_PI_2, PI};
    let mut a = angle % PI;
    if a > FRAC_PI_2 {
        a -= PI;
    } else if a <= -FRAC_PI_2 {
        a += PI;
    }
    a
}

/// Extent of a pixel set along and across `axis`, in pixels.
pub fn extents<I>(points: I, center: Point2<f64>, axis: Vector2<f64>) -> (f64, f64)
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let across = Vector2::new(-axis.y, axis.x);
    let (mut lo_a, mut hi_a, mut lo_c, mut hi_c) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    let mut any = false;
    for (x, y) in points {
        let d = Vector2::new(x - center.x, y - center.y);
        let (a, c) = (d.dot(&axis), d.dot(&across));
        lo_a = lo_a.min(a);
        hi_a = hi_a.max(a);
        lo_c = lo_c.min(c);
        hi_c = hi_c.max(c);
        any = true;
    }
    if !any {
        return (0.0, 0.0);
    }
    // +1: a single pixel is one pixel long.
    (hi_a - lo_a + 1.0, hi_c - lo_c + 1.0)
}

/// Uniform rescale between camera resolution and a tracker's working one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rescale {
    /// Working pixels per camera pixel; at most 1.
    pub factor: f32,
}

impl Rescale {
    pub fn new(pix_per_mm: f32, target_pix_per_mm: f32) -> Self {
        let factor = if target_pix_per_mm > 0.0 && pix_per_mm > 0.0 {
            (target_pix_per_mm / pix_per_mm).min(1.0)
        } else {
            1.0
        };
        Self { factor }
    }

    pub fn is_identity(&self) -> bool {
        (self.factor - 1.0).abs() < f32::EPSILON
    }

    pub fn apply(&self, image: &GrayImage) -> GrayImage {
        if self.is_identity() {
            return image.clone();
        }
        let w = ((image.width() as f32 * self.factor).round() as u32).max(1);
        let h = ((image.height() as f32 * self.factor).round() as u32).max(1);
        imageops::resize(image, w, h, FilterType::Triangle)
    }

    /// Working coordinates back to camera pixels.
    pub fn to_camera(&self, x: f64, y: f64) -> (f64, f64) {
        let s = 1.0 / self.factor as f64;
        ((x + 0.5) * s - 0.5, (y + 0.5) * s - 0.5)
    }

    pub fn length_to_camera(&self, len: f64) -> f64 {
        len / self.factor as f64
    }
}

/// Bilinear intensity lookup; zero outside the image.
pub fn bilinear(image: &GrayImage, x: f32, y: f32) -> f32 {
    if !(x.is_finite() && y.is_finite()) {
        return 0.0;
    }
    let (w, h) = (image.width() as i64, image.height() as i64);
    let (x0, y0) = (x.floor() as i64, y.floor() as i64);
    let (fx, fy) = (x - x0 as f32, y - y0 as f32);
    let at = |xi: i64, yi: i64| -> f32 {
        if xi < 0 || yi < 0 || xi >= w || yi >= h {
            0.0
        } else {
            image.get_pixel(xi as u32, yi as u32)[0] as f32
        }
    };
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Window of `width` x `height` pixels centered on `center` whose x axis is
/// `forward` and y axis its left-hand perpendicular. Pixel `(i, j)` of the
/// result samples `center + (i - w/2) * forward + (j - h/2) * left`, with
/// integer halves.
pub fn sample_aligned(
    image: &GrayImage,
    center: Point2<f32>,
    forward: Vector2<f32>,
    width: u32,
    height: u32,
) -> AlignedWindow {
    let forward = if forward.norm() > f32::EPSILON {
        forward.normalize()
    } else {
        Vector2::x()
    };
    let mut window = AlignedWindow {
        image: GrayImage::new(width, height),
        center,
        forward,
    };
    let mut out = GrayImage::new(width, height);
    for (i, j, p) in out.enumerate_pixels_mut() {
        let cam = window.to_camera(i as f32, j as f32);
        *p = Luma([bilinear(image, cam.x, cam.y).round().clamp(0.0, 255.0) as u8]);
    }
    window.image = out;
    window
}

/// An image resampled in the animal frame.
#[derive(Debug, Clone)]
pub struct AlignedWindow {
    pub image: GrayImage,
    pub center: Point2<f32>,
    pub forward: Vector2<f32>,
}

impl AlignedWindow {
    pub fn left(&self) -> Vector2<f32> {
        Vector2::new(-self.forward.y, self.forward.x)
    }

    /// Window pixel to camera pixel.
    pub fn to_camera(&self, i: f32, j: f32) -> Point2<f32> {
        let di = i - (self.image.width() / 2) as f32;
        let dj = j - (self.image.height() / 2) as f32;
        self.center + self.forward * di + self.left() * dj
    }
}

/// Pixels of `labels` carrying `label`, as coordinates.
pub fn label_pixels(labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>, label: u32) -> Vec<(f64, f64)> {
    labels
        .enumerate_pixels()
        .filter(|(_, _, p)| p[0] == label)
        .map(|(x, y, _)| (x as f64, y as f64))
        .collect()
}

/// Binary threshold: 255 where `image >= level`.
pub fn threshold(image: &GrayImage, level: u8) -> GrayImage {
    let mut out = image.clone();
    for p in out.pixels_mut() {
        p[0] = if p[0] >= level { 255 } else { 0 };
    }
    out
}
