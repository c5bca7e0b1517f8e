//! Decimated video sink fed by the camera.
//!
//! Two layouts: one PNG per kept frame, or a single raw 8-bit stream with a
//! JSON sidecar describing it. Encoding to a real video container is left to
//! offline tools.

use crate::core_modules::frame::Frame;
use crate::error::{Result, VrError};
use image::{GrayImage, imageops};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoMode {
    #[default]
    ImageSequence,
    SingleFile,
}

/// `[recorder.video]` section of the run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub enabled: bool,
    pub mode: VideoMode,
    /// Keep one frame out of `decimation`.
    pub decimation: u32,
    /// Resize factor applied to kept frames.
    pub scale: f32,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: VideoMode::ImageSequence,
            decimation: 10,
            scale: 0.5,
        }
    }
}

impl VideoConfig {
    pub fn validate(&self, errors: &mut Vec<String>) {
        if self.decimation == 0 {
            errors.push("recorder.video.decimation must be at least 1".into());
        }
        if !(self.scale > 0.0 && self.scale <= 1.0) {
            errors.push("recorder.video.scale must lie in (0, 1]".into());
        }
    }
}

/// Describes a `SingleFile` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawVideoSidecar {
    pub width: u32,
    pub height: u32,
    pub frame_count: u64,
    pub decimation: u32,
    pub scale: f32,
    /// Camera index of each stored frame.
    pub indices: Vec<u64>,
}

pub const RAW_VIDEO_FILE: &str = "video.raw";
pub const RAW_SIDECAR_FILE: &str = "video.json";

enum Sink {
    Images { dir: PathBuf },
    Raw { out: BufWriter<File>, sidecar: PathBuf },
}

pub struct VideoWriter {
    config: VideoConfig,
    sink: Sink,
    seen: u64,
    size: Option<(u32, u32)>,
    indices: Vec<u64>,
}

impl VideoWriter {
    /// Creates the output under `dir`.
    pub fn create(dir: &Path, config: &VideoConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let sink = match config.mode {
            VideoMode::ImageSequence => {
                let frames = dir.join("frames");
                std::fs::create_dir_all(&frames)?;
                Sink::Images { dir: frames }
            }
            VideoMode::SingleFile => Sink::Raw {
                out: BufWriter::new(File::create(dir.join(RAW_VIDEO_FILE))?),
                sidecar: dir.join(RAW_SIDECAR_FILE),
            },
        };
        Ok(Self {
            config: config.clone(),
            sink,
            seen: 0,
            size: None,
            indices: Vec::new(),
        })
    }

    /// Frames stored so far.
    pub fn written(&self) -> u64 {
        self.indices.len() as u64
    }

    /// Offers one camera frame; returns whether it was stored.
    pub fn write(&mut self, frame: &Frame) -> Result<bool> {
        let keep = self.seen % self.config.decimation.max(1) as u64 == 0;
        self.seen += 1;
        if !keep {
            return Ok(false);
        }

        let gray = frame.to_gray();
        let (w, h) = (
            ((gray.width() as f32 * self.config.scale).round() as u32).max(1),
            ((gray.height() as f32 * self.config.scale).round() as u32).max(1),
        );
        let image: GrayImage = if (w, h) == gray.dimensions() {
            gray.into_owned()
        } else {
            imageops::resize(gray.as_ref(), w, h, imageops::FilterType::Triangle)
        };

        match &mut self.sink {
            Sink::Images { dir } => {
                image.save(dir.join(format!("frame_{:08}.png", frame.index)))?;
            }
            Sink::Raw { out, .. } => {
                if let Some(size) = self.size.filter(|&size| size != (w, h)) {
                    return Err(VrError::Recorder(format!(
                        "frame {} is {w}x{h}, stream is {}x{}",
                        frame.index, size.0, size.1
                    )));
                }
                out.write_all(image.as_raw())?;
            }
        }
        self.size = Some((w, h));
        self.indices.push(frame.index);
        Ok(true)
    }

    /// Flushes the stream and writes the sidecar of a `SingleFile` run.
    pub fn finish(&mut self) -> Result<()> {
        if let Sink::Raw { out, sidecar } = &mut self.sink {
            out.flush()?;
            let (width, height) = self.size.unwrap_or((0, 0));
            let meta = RawVideoSidecar {
                width,
                height,
                frame_count: self.indices.len() as u64,
                decimation: self.config.decimation,
                scale: self.config.scale,
                indices: self.indices.clone(),
            };
            std::fs::write(sidecar, serde_json::to_vec_pretty(&meta)?)?;
        }
        Ok(())
    }
}
