// THEORY:
// Ring buffer slots are raw bytes; a `SlotCodec` is the typed lens through
// which one edge of the DAG reads and writes them. Each codec has a fixed slot
// size decided at construction (from the configured maximum geometry) so the
// ring can be allocated up front and never resized.
//
// Every layout starts with a sentinel byte. A reader that finds anything else
// in that byte is looking at an uninitialized or foreign slot and reports a
// transient `MalformedSlot` error rather than decoding garbage.
//
// All integers and floats are little-endian.

use crate::core_modules::frame::{Frame, FramePixels, Polarity, SubtractedFrame};
use crate::core_modules::overlay::AnnotatedFrame;
use crate::core_modules::records::{
    AnimalRecord, BodyPose, BoundingBox, EyePose, EyeState, Heading, TailPose, TrackingRecord,
};
use crate::error::{Result, VrError};
use image::{GrayImage, RgbImage};
use nalgebra::Matrix2;
use ndarray::Array2;

/// Marks a slot written by a codec.
pub const SENTINEL: u8 = 0xA5;

/// Byte-level serializer for one edge's item type.
pub trait SlotCodec: Clone + Send + Sync + 'static {
    type Item: Send + 'static;

    /// Fixed number of bytes every slot of this edge occupies.
    fn slot_size(&self) -> usize;

    fn pack(&self, item: &Self::Item, slot: &mut [u8]) -> Result<()>;

    fn unpack(&self, slot: &[u8]) -> Result<Self::Item>;
}

/// Sequential little-endian writer over a slot.
pub struct ByteWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            return Err(VrError::CodecSize {
                expected: end,
                actual: self.buf.len(),
            });
        }
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
        Ok(())
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(VrError::CodecSize {
                expected: end,
                actual: self.buf.len(),
            });
        }
        self.pos = end;
        Ok(())
    }

    pub fn put_u8(&mut self, v: u8) -> Result<()> {
        self.put_bytes(&[v])
    }

    pub fn put_u16(&mut self, v: u16) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u32(&mut self, v: u32) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_u64(&mut self, v: u64) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_i64(&mut self, v: i64) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }

    pub fn put_f32(&mut self, v: f32) -> Result<()> {
        self.put_bytes(&v.to_le_bytes())
    }
}

/// Sequential little-endian reader over a slot.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(VrError::CodecSize {
                expected: end,
                actual: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}

fn check_sentinel(reader: &mut ByteReader<'_>, what: &str) -> Result<()> {
    let sentinel = reader.u8()?;
    if sentinel != SENTINEL {
        return Err(VrError::MalformedSlot(format!(
            "{what} slot has sentinel {sentinel:#04x}"
        )));
    }
    Ok(())
}

// --- Frames ---

/// `[sentinel u8 | index u64 | timestamp i64 | H u32 | W u32 | C u8 | pixels]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    pub max_width: u32,
    pub max_height: u32,
    pub channels: u8,
}

const FRAME_HEADER: usize = 1 + 8 + 8 + 4 + 4 + 1;

impl FrameCodec {
    pub fn new(max_width: u32, max_height: u32, channels: u8) -> Self {
        Self {
            max_width,
            max_height,
            channels,
        }
    }
}

impl SlotCodec for FrameCodec {
    type Item = Frame;

    fn slot_size(&self) -> usize {
        FRAME_HEADER + (self.max_width * self.max_height) as usize * self.channels as usize
    }

    fn pack(&self, frame: &Frame, slot: &mut [u8]) -> Result<()> {
        let channels = frame.pixels.channels();
        if frame.width() > self.max_width || frame.height() > self.max_height || channels > self.channels {
            return Err(VrError::CodecSize {
                expected: self.slot_size(),
                actual: FRAME_HEADER + frame.pixels.as_bytes().len(),
            });
        }
        let mut w = ByteWriter::new(slot);
        w.put_u8(SENTINEL)?;
        w.put_u64(frame.index)?;
        w.put_i64(frame.timestamp_ns)?;
        w.put_u32(frame.height())?;
        w.put_u32(frame.width())?;
        w.put_u8(channels)?;
        w.put_bytes(frame.pixels.as_bytes())
    }

    fn unpack(&self, slot: &[u8]) -> Result<Frame> {
        let mut r = ByteReader::new(slot);
        check_sentinel(&mut r, "frame")?;
        let index = r.u64()?;
        let timestamp_ns = r.i64()?;
        let height = r.u32()?;
        let width = r.u32()?;
        let channels = r.u8()?;
        if width > self.max_width || height > self.max_height {
            return Err(VrError::MalformedSlot(format!(
                "frame {index} claims {width}x{height}, above {}x{}",
                self.max_width, self.max_height
            )));
        }
        let len = (width * height) as usize * channels as usize;
        let bytes = r.take(len)?.to_vec();
        let pixels = match channels {
            1 => GrayImage::from_raw(width, height, bytes).map(FramePixels::Gray),
            3 => RgbImage::from_raw(width, height, bytes).map(FramePixels::Rgb),
            _ => None,
        }
        .ok_or_else(|| VrError::MalformedSlot(format!("frame {index} has {channels} channels")))?;
        Ok(Frame {
            index,
            timestamp_ns,
            pixels,
        })
    }
}

// --- Subtracted frames ---

/// `[sentinel u8 | index u64 | timestamp i64 | H u32 | W u32 | polarity u8 | i16 pixels]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubtractedCodec {
    pub max_width: u32,
    pub max_height: u32,
}

impl SubtractedCodec {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
        }
    }
}

impl SlotCodec for SubtractedCodec {
    type Item = SubtractedFrame;

    fn slot_size(&self) -> usize {
        FRAME_HEADER + (self.max_width * self.max_height) as usize * 2
    }

    fn pack(&self, frame: &SubtractedFrame, slot: &mut [u8]) -> Result<()> {
        if frame.width() > self.max_width || frame.height() > self.max_height {
            return Err(VrError::CodecSize {
                expected: self.slot_size(),
                actual: FRAME_HEADER + frame.data.len() * 2,
            });
        }
        let mut w = ByteWriter::new(slot);
        w.put_u8(SENTINEL)?;
        w.put_u64(frame.index)?;
        w.put_i64(frame.timestamp_ns)?;
        w.put_u32(frame.height())?;
        w.put_u32(frame.width())?;
        w.put_u8(frame.polarity.code())?;
        for v in frame.data.iter() {
            w.put_bytes(&v.to_le_bytes())?;
        }
        Ok(())
    }

    fn unpack(&self, slot: &[u8]) -> Result<SubtractedFrame> {
        let mut r = ByteReader::new(slot);
        check_sentinel(&mut r, "subtracted frame")?;
        let index = r.u64()?;
        let timestamp_ns = r.i64()?;
        let height = r.u32()?;
        let width = r.u32()?;
        let polarity = Polarity::from_code(r.u8()?)
            .ok_or_else(|| VrError::MalformedSlot(format!("frame {index} has unknown polarity")))?;
        if width > self.max_width || height > self.max_height {
            return Err(VrError::MalformedSlot(format!(
                "subtracted frame {index} claims {width}x{height}"
            )));
        }
        let bytes = r.take((width * height) as usize * 2)?;
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        let data = Array2::from_shape_vec((height as usize, width as usize), values)
            .map_err(|e| VrError::MalformedSlot(e.to_string()))?;
        Ok(SubtractedFrame {
            index,
            timestamp_ns,
            polarity,
            data,
        })
    }
}

// --- Tracking records ---

const TRACKING_HEADER: usize = 1 + 8 + 8 + 2 + 1 + 2 + 2;
const ANIMAL_FIXED: usize = 4 + 16 + 8 + 16 + 1 + 24 + 32 + 2;

const HAS_BODY: u8 = 1;
const HAS_BLADDER: u8 = 1 << 1;
const HAS_EYES: u8 = 1 << 2;
const HAS_TAIL: u8 = 1 << 3;

/// Tracking records with room for a fixed number of animals, tail points and
/// an optional 8-bit preview image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingCodec {
    pub max_animals: usize,
    pub max_tail_points: usize,
    pub preview_width: u32,
    pub preview_height: u32,
}

impl TrackingCodec {
    pub fn new(max_animals: usize, max_tail_points: usize, preview_width: u32, preview_height: u32) -> Self {
        Self {
            max_animals,
            max_tail_points,
            preview_width,
            preview_height,
        }
    }

    fn animal_size(&self) -> usize {
        ANIMAL_FIXED + self.max_tail_points * 8
    }

    fn pack_animal(&self, w: &mut ByteWriter<'_>, animal: &AnimalRecord) -> Result<()> {
        let start = w.position();
        w.put_u32(animal.identity)?;
        let b = animal.bbox_px;
        for v in [b.x, b.y, b.width, b.height] {
            w.put_u32(v)?;
        }
        w.put_f32(animal.centroid_px.0)?;
        w.put_f32(animal.centroid_px.1)?;
        for v in animal.heading.0.iter() {
            w.put_f32(*v)?;
        }

        let mut flags = 0u8;
        if animal.body.is_some() {
            flags |= HAS_BODY;
        }
        if animal.body.as_ref().is_some_and(|b| b.swim_bladder_px.is_some()) {
            flags |= HAS_BLADDER;
        }
        if animal.eyes.is_some() {
            flags |= HAS_EYES;
        }
        if animal.tail.is_some() {
            flags |= HAS_TAIL;
        }
        w.put_u8(flags)?;

        match &animal.body {
            Some(body) => {
                let bladder = body.swim_bladder_px.unwrap_or((0.0, 0.0));
                for v in [
                    body.centroid_px.0,
                    body.centroid_px.1,
                    bladder.0,
                    bladder.1,
                    body.length_px,
                    body.width_px,
                ] {
                    w.put_f32(v)?;
                }
            }
            None => w.skip(24)?,
        }

        match &animal.eyes {
            Some(eyes) => {
                for eye in [&eyes.left, &eyes.right] {
                    w.put_f32(eye.centroid_px.0)?;
                    w.put_f32(eye.centroid_px.1)?;
                    w.put_f32(eye.angle_rad)?;
                    w.put_u32(eye.area_px)?;
                }
            }
            None => w.skip(32)?,
        }

        let points: &[(f32, f32)] = animal.tail.as_ref().map_or(&[], |t| &t.points_px);
        if points.len() > self.max_tail_points {
            return Err(VrError::CodecSize {
                expected: self.max_tail_points,
                actual: points.len(),
            });
        }
        w.put_u16(points.len() as u16)?;
        for &(x, y) in points {
            w.put_f32(x)?;
            w.put_f32(y)?;
        }
        let used = w.position() - start;
        w.skip(self.animal_size() - used)
    }

    fn unpack_animal(&self, r: &mut ByteReader<'_>) -> Result<AnimalRecord> {
        let identity = r.u32()?;
        let bbox_px = BoundingBox::new(r.u32()?, r.u32()?, r.u32()?, r.u32()?);
        let centroid_px = (r.f32()?, r.f32()?);
        let mut m = [0f32; 4];
        for v in m.iter_mut() {
            *v = r.f32()?;
        }
        let heading = Heading(Matrix2::from_column_slice(&m));
        let flags = r.u8()?;

        let body_values = [r.f32()?, r.f32()?, r.f32()?, r.f32()?, r.f32()?, r.f32()?];
        let body = (flags & HAS_BODY != 0).then(|| BodyPose {
            centroid_px: (body_values[0], body_values[1]),
            swim_bladder_px: (flags & HAS_BLADDER != 0).then_some((body_values[2], body_values[3])),
            length_px: body_values[4],
            width_px: body_values[5],
        });

        let mut eye_states = Vec::with_capacity(2);
        for _ in 0..2 {
            eye_states.push(EyeState {
                centroid_px: (r.f32()?, r.f32()?),
                angle_rad: r.f32()?,
                area_px: r.u32()?,
            });
        }
        let eyes = if flags & HAS_EYES != 0 {
            let right = eye_states.pop();
            let left = eye_states.pop();
            left.zip(right).map(|(left, right)| EyePose { left, right })
        } else {
            None
        };

        let count = r.u16()? as usize;
        if count > self.max_tail_points {
            return Err(VrError::MalformedSlot(format!(
                "animal {identity} claims {count} tail points"
            )));
        }
        let mut points_px = Vec::with_capacity(count);
        for _ in 0..count {
            points_px.push((r.f32()?, r.f32()?));
        }
        r.skip((self.max_tail_points - count) * 8)?;
        let tail = (flags & HAS_TAIL != 0).then_some(TailPose { points_px });

        Ok(AnimalRecord {
            identity,
            bbox_px,
            centroid_px,
            heading,
            body,
            eyes,
            tail,
        })
    }
}

impl SlotCodec for TrackingCodec {
    type Item = TrackingRecord;

    fn slot_size(&self) -> usize {
        TRACKING_HEADER
            + self.max_animals * self.animal_size()
            + (self.preview_width * self.preview_height) as usize
    }

    fn pack(&self, record: &TrackingRecord, slot: &mut [u8]) -> Result<()> {
        if record.animals.len() > self.max_animals {
            return Err(VrError::CodecSize {
                expected: self.max_animals,
                actual: record.animals.len(),
            });
        }
        let mut w = ByteWriter::new(slot);
        w.put_u8(SENTINEL)?;
        w.put_u64(record.index)?;
        w.put_i64(record.timestamp_ns)?;
        w.put_u16(record.animals.len() as u16)?;
        match &record.image {
            Some(img) if img.width() <= self.preview_width && img.height() <= self.preview_height => {
                w.put_u8(1)?;
                w.put_u16(img.width() as u16)?;
                w.put_u16(img.height() as u16)?;
            }
            Some(img) => {
                return Err(VrError::CodecSize {
                    expected: (self.preview_width * self.preview_height) as usize,
                    actual: img.as_raw().len(),
                });
            }
            None => {
                w.put_u8(0)?;
                w.put_u16(0)?;
                w.put_u16(0)?;
            }
        }
        for animal in &record.animals {
            self.pack_animal(&mut w, animal)?;
        }
        w.skip((self.max_animals - record.animals.len()) * self.animal_size())?;
        if let Some(img) = &record.image {
            w.put_bytes(img.as_raw())?;
        }
        Ok(())
    }

    fn unpack(&self, slot: &[u8]) -> Result<TrackingRecord> {
        let mut r = ByteReader::new(slot);
        check_sentinel(&mut r, "tracking")?;
        let index = r.u64()?;
        let timestamp_ns = r.i64()?;
        let count = r.u16()? as usize;
        let has_image = r.u8()? != 0;
        let img_w = r.u16()? as u32;
        let img_h = r.u16()? as u32;
        if count > self.max_animals {
            return Err(VrError::MalformedSlot(format!(
                "tracking record {index} claims {count} animals"
            )));
        }
        let mut animals = Vec::with_capacity(count);
        for _ in 0..count {
            animals.push(self.unpack_animal(&mut r)?);
        }
        r.skip((self.max_animals - count) * self.animal_size())?;
        let image = if has_image {
            let bytes = r.take((img_w * img_h) as usize)?.to_vec();
            GrayImage::from_raw(img_w, img_h, bytes)
        } else {
            None
        };
        Ok(TrackingRecord {
            index,
            timestamp_ns,
            animals,
            image,
        })
    }
}

// --- Annotated previews ---

/// A tracking record (without preview) followed by an RGB frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnotatedCodec {
    pub tracking: TrackingCodec,
    pub frame: FrameCodec,
}

impl AnnotatedCodec {
    pub fn new(max_animals: usize, max_tail_points: usize, width: u32, height: u32) -> Self {
        Self {
            tracking: TrackingCodec::new(max_animals, max_tail_points, 0, 0),
            frame: FrameCodec::new(width, height, 3),
        }
    }
}

impl SlotCodec for AnnotatedCodec {
    type Item = AnnotatedFrame;

    fn slot_size(&self) -> usize {
        self.tracking.slot_size() + self.frame.slot_size()
    }

    fn pack(&self, item: &AnnotatedFrame, slot: &mut [u8]) -> Result<()> {
        let split = self.tracking.slot_size();
        if slot.len() < self.slot_size() {
            return Err(VrError::CodecSize {
                expected: self.slot_size(),
                actual: slot.len(),
            });
        }
        let (head, tail) = slot.split_at_mut(split);
        if item.record.image.is_some() {
            let mut record = item.record.clone();
            record.image = None;
            self.tracking.pack(&record, head)?;
        } else {
            self.tracking.pack(&item.record, head)?;
        }
        let frame = Frame::rgb(item.record.index, item.record.timestamp_ns, item.image.clone());
        self.frame.pack(&frame, tail)
    }

    fn unpack(&self, slot: &[u8]) -> Result<AnnotatedFrame> {
        let split = self.tracking.slot_size();
        if slot.len() < self.slot_size() {
            return Err(VrError::CodecSize {
                expected: self.slot_size(),
                actual: slot.len(),
            });
        }
        let record = self.tracking.unpack(&slot[..split])?;
        let image = match self.frame.unpack(&slot[split..])?.pixels {
            FramePixels::Rgb(img) => img,
            FramePixels::Gray(img) => image::DynamicImage::ImageLuma8(img).to_rgb8(),
        };
        Ok(AnnotatedFrame { record, image })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn animal(identity: u32) -> AnimalRecord {
        AnimalRecord {
            identity,
            bbox_px: BoundingBox::new(10, 20, 30, 40),
            centroid_px: (25.5, 40.25),
            heading: Heading::from_angle(0.3),
            body: Some(BodyPose {
                centroid_px: (25.0, 40.0),
                swim_bladder_px: None,
                length_px: 60.0,
                width_px: 12.0,
            }),
            eyes: None,
            tail: Some(TailPose {
                points_px: vec![(1.0, 2.0), (3.0, 4.0)],
            }),
        }
    }

    #[test]
    fn frame_slot_preserves_index_and_pixels() {
        let codec = FrameCodec::new(8, 8, 1);
        let img = GrayImage::from_fn(4, 3, |x, y| image::Luma([(x + 10 * y) as u8]));
        let frame = Frame::gray(99, 1_234, img.clone());
        let mut slot = vec![0u8; codec.slot_size()];
        codec.pack(&frame, &mut slot).unwrap();
        let back = codec.unpack(&slot).unwrap();
        assert_eq!(back.index, 99);
        assert_eq!(back.timestamp_ns, 1_234);
        assert_eq!(back.to_gray().as_raw(), img.as_raw());
    }

    #[test]
    fn zeroed_slot_is_malformed() {
        let codec = FrameCodec::new(4, 4, 1);
        let slot = vec![0u8; codec.slot_size()];
        let err = codec.unpack(&slot).unwrap_err();
        assert!(matches!(err, VrError::MalformedSlot(_)));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let codec = FrameCodec::new(2, 2, 1);
        let frame = Frame::gray(0, 0, GrayImage::new(3, 3));
        let mut slot = vec![0u8; codec.slot_size()];
        assert!(matches!(codec.pack(&frame, &mut slot), Err(VrError::CodecSize { .. })));
    }

    #[test]
    fn subtracted_slot_keeps_sign_and_polarity() {
        let codec = SubtractedCodec::new(4, 4);
        let mut sub = SubtractedFrame::zeros(5, 50, Polarity::BrightOnDark, 3, 2);
        sub.data[[1, 2]] = -300;
        sub.data[[0, 0]] = 120;
        let mut slot = vec![0u8; codec.slot_size()];
        codec.pack(&sub, &mut slot).unwrap();
        assert_eq!(codec.unpack(&slot).unwrap(), sub);
    }

    #[test]
    fn tracking_slot_keeps_optional_substructures_absent() {
        let codec = TrackingCodec::new(4, 8, 16, 16);
        let record = TrackingRecord {
            index: 12,
            timestamp_ns: 7,
            animals: vec![animal(0), animal(3)],
            image: Some(GrayImage::from_pixel(5, 4, image::Luma([9]))),
        };
        let mut slot = vec![0u8; codec.slot_size()];
        codec.pack(&record, &mut slot).unwrap();
        let back = codec.unpack(&slot).unwrap();
        assert_eq!(back, record);
        assert!(back.animals[0].eyes.is_none());
        assert!(back.animals[0].body.as_ref().unwrap().swim_bladder_px.is_none());
    }

    #[test]
    fn annotated_slot_carries_record_and_rgb_preview() {
        let codec = AnnotatedCodec::new(2, 8, 6, 4);
        let item = AnnotatedFrame {
            record: TrackingRecord {
                index: 3,
                timestamp_ns: 30,
                animals: vec![animal(1)],
                image: None,
            },
            image: RgbImage::from_pixel(6, 4, image::Rgb([1, 2, 3])),
        };
        let mut slot = vec![0u8; codec.slot_size()];
        codec.pack(&item, &mut slot).unwrap();
        assert_eq!(codec.unpack(&slot).unwrap(), item);
    }

    #[test]
    fn too_many_animals_is_a_size_error() {
        let codec = TrackingCodec::new(1, 2, 0, 0);
        let record = TrackingRecord {
            index: 0,
            timestamp_ns: 0,
            animals: vec![animal(0), animal(1)],
            image: None,
        };
        let mut slot = vec![0u8; codec.slot_size()];
        assert!(codec.pack(&record, &mut slot).is_err());
    }
}
