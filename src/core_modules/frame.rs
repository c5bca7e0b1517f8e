// THEORY:
// The `frame` module holds the two image records that travel down the front of
// the pipeline:
//
// 1.  **Frame**: what the camera produced. An acquisition index, a timestamp in
//     session nanoseconds and the pixels. Cameras may deliver 8-bit grayscale
//     or 8-bit RGB; everything downstream works on grayscale, so RGB frames are
//     converted once, on first use.
// 2.  **SubtractedFrame**: the same geometry with signed differences from the
//     background. The sign convention is chosen by `Polarity` so that animals
//     are always positive, whichever way the arena is lit.
//
// Both are plain data containers. They know their shape and how to convert
// themselves; they know nothing about backgrounds or tracking.

use image::{DynamicImage, GrayImage, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// Sign convention for background subtraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    /// Animals are darker than the background (transmitted light).
    #[default]
    DarkOnBright,
    /// Animals are brighter than the background (dark-field illumination).
    BrightOnDark,
}

impl Polarity {
    /// Signed difference with animals positive.
    #[inline]
    pub fn apply(self, pixel: f32, background: f32) -> f32 {
        match self {
            Polarity::DarkOnBright => background - pixel,
            Polarity::BrightOnDark => pixel - background,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Polarity::DarkOnBright => 0,
            Polarity::BrightOnDark => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Polarity::DarkOnBright),
            1 => Some(Polarity::BrightOnDark),
            _ => None,
        }
    }
}

/// Raw pixels as delivered by a camera.
#[derive(Debug, Clone, PartialEq)]
pub enum FramePixels {
    Gray(GrayImage),
    Rgb(RgbImage),
}

impl FramePixels {
    pub fn width(&self) -> u32 {
        match self {
            FramePixels::Gray(img) => img.width(),
            FramePixels::Rgb(img) => img.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            FramePixels::Gray(img) => img.height(),
            FramePixels::Rgb(img) => img.height(),
        }
    }

    pub fn channels(&self) -> u8 {
        match self {
            FramePixels::Gray(_) => 1,
            FramePixels::Rgb(_) => 3,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FramePixels::Gray(img) => img.as_raw(),
            FramePixels::Rgb(img) => img.as_raw(),
        }
    }
}

/// One acquired camera image.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Acquisition counter assigned by the camera worker.
    pub index: u64,
    /// Session timestamp of the exposure, in nanoseconds.
    pub timestamp_ns: i64,
    pub pixels: FramePixels,
}

impl Frame {
    pub fn gray(index: u64, timestamp_ns: i64, image: GrayImage) -> Self {
        Self {
            index,
            timestamp_ns,
            pixels: FramePixels::Gray(image),
        }
    }

    pub fn rgb(index: u64, timestamp_ns: i64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp_ns,
            pixels: FramePixels::Rgb(image),
        }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Grayscale view; RGB frames are converted with Rec. 601 luma.
    pub fn to_gray(&self) -> Cow<'_, GrayImage> {
        match &self.pixels {
            FramePixels::Gray(img) => Cow::Borrowed(img),
            FramePixels::Rgb(img) => Cow::Owned(DynamicImage::ImageRgb8(img.clone()).to_luma8()),
        }
    }

    pub fn into_gray(self) -> Frame {
        match self.pixels {
            FramePixels::Gray(_) => self,
            FramePixels::Rgb(img) => Frame {
                index: self.index,
                timestamp_ns: self.timestamp_ns,
                pixels: FramePixels::Gray(DynamicImage::ImageRgb8(img).to_luma8()),
            },
        }
    }
}

/// Background-subtracted frame; positive values are candidate animal pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct SubtractedFrame {
    /// Always equal to the index of the source frame.
    pub index: u64,
    pub timestamp_ns: i64,
    pub polarity: Polarity,
    /// Signed differences, indexed `[row, column]`.
    pub data: Array2<i16>,
}

impl SubtractedFrame {
    pub fn zeros(index: u64, timestamp_ns: i64, polarity: Polarity, width: u32, height: u32) -> Self {
        Self {
            index,
            timestamp_ns,
            polarity,
            data: Array2::zeros((height as usize, width as usize)),
        }
    }

    pub fn width(&self) -> u32 {
        self.data.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.data.nrows() as u32
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> i16 {
        self.data[[y as usize, x as usize]]
    }

    /// Positive part of the difference, saturated to 8 bits.
    pub fn foreground(&self) -> GrayImage {
        let (h, w) = self.data.dim();
        GrayImage::from_fn(w as u32, h as u32, |x, y| {
            let v = self.data[[y as usize, x as usize]];
            image::Luma([v.clamp(0, 255) as u8])
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_frames_convert_to_gray() {
        let rgb = RgbImage::from_pixel(4, 3, image::Rgb([200, 200, 200]));
        let frame = Frame::rgb(7, 1_000, rgb);
        let gray = frame.to_gray();
        assert_eq!(gray.dimensions(), (4, 3));
        assert_eq!(gray.get_pixel(0, 0)[0], 200);
        let frame = frame.into_gray();
        assert_eq!(frame.pixels.channels(), 1);
        assert_eq!(frame.index, 7);
    }

    #[test]
    fn polarity_makes_animals_positive() {
        assert_eq!(Polarity::DarkOnBright.apply(40.0, 200.0), 160.0);
        assert_eq!(Polarity::BrightOnDark.apply(200.0, 40.0), 160.0);
        assert_eq!(Polarity::from_code(Polarity::BrightOnDark.code()), Some(Polarity::BrightOnDark));
    }

    #[test]
    fn foreground_clamps_negative_and_large_values() {
        let mut sub = SubtractedFrame::zeros(1, 0, Polarity::DarkOnBright, 3, 1);
        sub.data[[0, 0]] = -20;
        sub.data[[0, 1]] = 90;
        sub.data[[0, 2]] = 400;
        let fg = sub.foreground();
        assert_eq!(fg.as_raw(), &vec![0, 90, 255]);
    }
}
