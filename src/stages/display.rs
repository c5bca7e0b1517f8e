//! Live preview output.
//!
//! Annotated previews are JPEG-encoded once and handed to a `DisplaySink`
//! together with a small per-frame summary. Encoding is skipped while the sink
//! has nobody watching.

use crate::core_modules::overlay::AnnotatedFrame;
use crate::core_modules::records::TrackingRecord;
use crate::error::Result;
use crate::worker::Worker;
use image::codecs::jpeg::JpegEncoder;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnimalSummary {
    pub identity: u32,
    pub centroid_x: f32,
    pub centroid_y: f32,
    pub heading_rad: f32,
    pub has_eyes: bool,
    pub has_tail: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct PreviewSummary {
    pub index: u64,
    pub timestamp_ns: i64,
    pub animals: Vec<AnimalSummary>,
}

impl PreviewSummary {
    pub fn from_record(record: &TrackingRecord) -> Self {
        Self {
            index: record.index,
            timestamp_ns: record.timestamp_ns,
            animals: record
                .animals
                .iter()
                .map(|a| AnimalSummary {
                    identity: a.identity,
                    centroid_x: a.centroid_px.0,
                    centroid_y: a.centroid_px.1,
                    heading_rad: a.heading.angle(),
                    has_eyes: a.eyes.is_some(),
                    has_tail: a.tail.is_some(),
                })
                .collect(),
        }
    }
}

/// One encoded preview.
#[derive(Debug, Clone)]
pub struct DisplayPacket {
    pub width: u32,
    pub height: u32,
    pub jpeg: Arc<[u8]>,
    pub summary: PreviewSummary,
}

/// Where previews go: a window, a web socket, a test capture.
pub trait DisplaySink: Send {
    fn publish(&mut self, packet: DisplayPacket) -> Result<()>;

    /// False when nobody is watching; the frame is then not encoded.
    fn wants_frames(&self) -> bool {
        true
    }
}

/// Counts packets and drops them.
#[derive(Debug, Clone, Default)]
pub struct NullDisplay {
    published: Arc<AtomicU64>,
}

impl NullDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter of published packets.
    pub fn counter(&self) -> Arc<AtomicU64> {
        self.published.clone()
    }
}

impl DisplaySink for NullDisplay {
    fn publish(&mut self, _packet: DisplayPacket) -> Result<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

pub struct DisplayWorker {
    sink: Box<dyn DisplaySink>,
    quality: u8,
    published: u64,
    unwatched: u64,
    bytes: u64,
}

impl DisplayWorker {
    pub fn new(sink: Box<dyn DisplaySink>, jpeg_quality: u8) -> Self {
        Self {
            sink,
            quality: jpeg_quality.clamp(1, 100),
            published: 0,
            unwatched: 0,
            bytes: 0,
        }
    }
}

/// JPEG bytes of `image`.
pub fn encode_jpeg(image: &image::RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(image.as_raw().len() / 8);
    JpegEncoder::new_with_quality(&mut out, quality).encode_image(image)?;
    Ok(out)
}

impl Worker for DisplayWorker {
    type Input = AnnotatedFrame;
    type Output = ();

    fn name(&self) -> &str {
        "display"
    }

    fn work(&mut self, frame: Option<AnnotatedFrame>) -> Result<Option<()>> {
        let Some(frame) = frame else {
            return Ok(None);
        };
        if !self.sink.wants_frames() {
            self.unwatched += 1;
            return Ok(None);
        }
        let jpeg = encode_jpeg(&frame.image, self.quality)?;
        self.bytes += jpeg.len() as u64;
        self.sink.publish(DisplayPacket {
            width: frame.image.width(),
            height: frame.image.height(),
            jpeg: jpeg.into(),
            summary: PreviewSummary::from_record(&frame.record),
        })?;
        self.published += 1;
        Ok(None)
    }

    fn summary(&self) -> Option<serde_json::Value> {
        Some(json!({
            "published": self.published,
            "unwatched": self.unwatched,
            "mean_jpeg_bytes": if self.published > 0 { self.bytes / self.published } else { 0 },
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::records::{AnimalRecord, BoundingBox, Heading};
    use image::RgbImage;

    struct CapturingSink {
        watching: bool,
        packets: Arc<parking_lot::Mutex<Vec<DisplayPacket>>>,
    }

    impl DisplaySink for CapturingSink {
        fn publish(&mut self, packet: DisplayPacket) -> Result<()> {
            self.packets.lock().push(packet);
            Ok(())
        }

        fn wants_frames(&self) -> bool {
            self.watching
        }
    }

    fn capturing_sink(watching: bool) -> (CapturingSink, Arc<parking_lot::Mutex<Vec<DisplayPacket>>>) {
        let packets = Arc::new(parking_lot::Mutex::new(Vec::new()));
        (
            CapturingSink {
                watching,
                packets: packets.clone(),
            },
            packets,
        )
    }

    fn frame() -> AnnotatedFrame {
        AnnotatedFrame {
            record: TrackingRecord {
                index: 12,
                timestamp_ns: 120,
                animals: vec![AnimalRecord {
                    identity: 2,
                    bbox_px: BoundingBox::new(0, 0, 4, 4),
                    centroid_px: (2.0, 2.0),
                    heading: Heading::from_angle(std::f32::consts::FRAC_PI_2),
                    body: None,
                    eyes: None,
                    tail: None,
                }],
                image: None,
            },
            image: RgbImage::from_pixel(16, 8, image::Rgb([10, 200, 30])),
        }
    }

    #[test]
    fn publishes_decodable_jpeg_with_summary() {
        let (sink, packets) = capturing_sink(true);
        let mut worker = DisplayWorker::new(Box::new(sink), 90);
        worker.work(Some(frame())).unwrap();

        let packets = packets.lock();
        let packet = &packets[0];
        assert_eq!((packet.width, packet.height), (16, 8));
        let decoded = image::load_from_memory(&packet.jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (16, 8));
        assert_eq!(packet.summary.index, 12);
        assert_eq!(packet.summary.animals[0].identity, 2);
        approx::assert_abs_diff_eq!(
            packet.summary.animals[0].heading_rad,
            std::f32::consts::FRAC_PI_2,
            epsilon = 1e-5
        );
    }

    #[test]
    fn unwatched_sinks_skip_encoding() {
        let (sink, packets) = capturing_sink(false);
        let mut worker = DisplayWorker::new(Box::new(sink), 80);
        worker.work(Some(frame())).unwrap();
        assert!(packets.lock().is_empty());
        assert_eq!(worker.summary().unwrap()["unwatched"], 1);
    }

    #[test]
    fn null_display_counts() {
        let sink = NullDisplay::new();
        let counter = sink.counter();
        let mut worker = DisplayWorker::new(Box::new(sink), 80);
        worker.work(Some(frame())).unwrap();
        worker.work(None).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
    }
}
