// THEORY:
// A protocol is a queue of items; each item is a small state machine polled on
// every sequencer tick. The item decides on its own when it is finished and
// may hand the renderer a new stimulus command along the way.
//
// Built-in items fall in three groups:
// 1.  **Timing**: `Pause` finishes once its duration has elapsed on the clock.
// 2.  **Triggers**: `SoftwareTrigger`, `TtlTrigger` and `TrackingTrigger`
//     finish on a debounced edge of their source signal (an operator
//     message, the TTL line level, or "the animal is inside the mask").
// 3.  **Stimuli**: `StimulusItem` emits one command on its first poll and
//     finishes immediately; how long it stays on screen is set by the
//     following `Pause` or trigger.
//
// `ProtocolItemSpec` is the serialized form used in run configuration files.

use crate::clock::sec_to_ns;
use crate::core_modules::records::TrackingRecord;
use crate::error::{Result, VrError};
use crate::protocol::debouncer::{Debouncer, Edge};
use crate::stimulus::command::StimulusCommand;
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Signals available to items on one tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtocolContext<'a> {
    pub now_ns: i64,
    /// Latest tracking record, if any arrived so far.
    pub tracking: Option<&'a TrackingRecord>,
    /// An operator trigger arrived since the previous tick.
    pub software_trigger: bool,
    /// Current level of the TTL input line.
    pub ttl_level: bool,
}

/// Outcome of one poll.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemPoll {
    pub command: Option<StimulusCommand>,
    pub finished: bool,
}

impl ItemPoll {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn finished() -> Self {
        Self {
            command: None,
            finished: true,
        }
    }
}

pub trait ProtocolItem: Send + fmt::Debug {
    fn name(&self) -> String;

    /// Acquires item resources before the protocol starts.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the item becomes the current one.
    fn start(&mut self, now_ns: i64);

    /// Polled every tick until it reports `finished`.
    fn done(&mut self, ctx: &ProtocolContext<'_>) -> ItemPoll;

    fn cleanup(&mut self) {}

    /// Nominal duration, for items that have one.
    fn duration_sec(&self) -> Option<f64> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct Pause {
    duration_ns: i64,
    duration_sec: f64,
    started_ns: Option<i64>,
}

impl Pause {
    pub fn new(duration_sec: f64) -> Self {
        Self {
            duration_ns: sec_to_ns(duration_sec),
            duration_sec,
            started_ns: None,
        }
    }
}

impl ProtocolItem for Pause {
    fn name(&self) -> String {
        format!("Pause({:.3}s)", self.duration_sec)
    }

    fn start(&mut self, now_ns: i64) {
        self.started_ns = Some(now_ns);
    }

    fn done(&mut self, ctx: &ProtocolContext<'_>) -> ItemPoll {
        let started = *self.started_ns.get_or_insert(ctx.now_ns);
        if ctx.now_ns - started >= self.duration_ns {
            ItemPoll::finished()
        } else {
            ItemPoll::pending()
        }
    }

    fn duration_sec(&self) -> Option<f64> {
        Some(self.duration_sec)
    }
}

/// Finishes on an operator trigger.
#[derive(Debug, Clone)]
pub struct SoftwareTrigger {
    debouncer: Debouncer,
}

impl SoftwareTrigger {
    pub fn new(debounce: usize) -> Self {
        Self {
            debouncer: Debouncer::new(debounce, Edge::Rising).firing_from_idle(),
        }
    }
}

impl ProtocolItem for SoftwareTrigger {
    fn name(&self) -> String {
        "SoftwareTrigger".into()
    }

    fn start(&mut self, _now_ns: i64) {
        self.debouncer.reset();
    }

    fn done(&mut self, ctx: &ProtocolContext<'_>) -> ItemPoll {
        if self.debouncer.update(ctx.software_trigger) {
            ItemPoll::finished()
        } else {
            ItemPoll::pending()
        }
    }
}

/// Finishes on a debounced edge of the TTL line.
#[derive(Debug, Clone)]
pub struct TtlTrigger {
    debouncer: Debouncer,
    edge: Edge,
}

impl TtlTrigger {
    pub fn new(debounce: usize, edge: Edge) -> Self {
        Self {
            debouncer: Debouncer::new(debounce, edge),
            edge,
        }
    }
}

impl ProtocolItem for TtlTrigger {
    fn name(&self) -> String {
        format!("TtlTrigger({:?})", self.edge)
    }

    fn start(&mut self, _now_ns: i64) {
        self.debouncer.reset();
    }

    fn done(&mut self, ctx: &ProtocolContext<'_>) -> ItemPoll {
        if self.debouncer.update(ctx.ttl_level) {
            ItemPoll::finished()
        } else {
            ItemPoll::pending()
        }
    }
}

/// Finishes when the tracked animal enters (or leaves) a region of the arena.
#[derive(Debug, Clone)]
pub struct TrackingTrigger {
    /// Non-zero pixels are inside the region; camera pixel coordinates.
    mask: GrayImage,
    identity: Option<u32>,
    debouncer: Debouncer,
    last_index: Option<u64>,
}

impl TrackingTrigger {
    pub fn new(mask: GrayImage, identity: Option<u32>, debounce: usize, edge: Edge) -> Self {
        Self {
            mask,
            identity,
            debouncer: Debouncer::new(debounce, edge),
            last_index: None,
        }
    }

    /// Rectangular region `[x, y, width, height]` in a frame of the given size.
    pub fn rect_mask(frame_width: u32, frame_height: u32, rect: [u32; 4]) -> GrayImage {
        let [x0, y0, w, h] = rect;
        GrayImage::from_fn(frame_width, frame_height, |x, y| {
            let inside = x >= x0 && y >= y0 && x < x0.saturating_add(w) && y < y0.saturating_add(h);
            image::Luma([if inside { 255 } else { 0 }])
        })
    }

    fn inside(&self, record: &TrackingRecord) -> bool {
        let animal = match self.identity {
            Some(id) => record.animal(id),
            None => record.animals.iter().min_by_key(|a| a.identity),
        };
        let Some(animal) = animal else {
            return false;
        };
        let (x, y) = animal.centroid_px;
        if !(x.is_finite() && y.is_finite()) || x < 0.0 || y < 0.0 {
            return false;
        }
        let (x, y) = (x as u32, y as u32);
        x < self.mask.width() && y < self.mask.height() && self.mask.get_pixel(x, y)[0] > 0
    }
}

impl ProtocolItem for TrackingTrigger {
    fn name(&self) -> String {
        "TrackingTrigger".into()
    }

    fn start(&mut self, _now_ns: i64) {
        self.debouncer.reset();
        self.last_index = None;
    }

    fn done(&mut self, ctx: &ProtocolContext<'_>) -> ItemPoll {
        // One sample per tracking record, not per tick.
        let Some(record) = ctx.tracking else {
            return ItemPoll::pending();
        };
        if self.last_index == Some(record.index) {
            return ItemPoll::pending();
        }
        self.last_index = Some(record.index);
        if self.debouncer.update(self.inside(record)) {
            ItemPoll::finished()
        } else {
            ItemPoll::pending()
        }
    }
}

/// Emits one stimulus command and finishes.
#[derive(Debug, Clone)]
pub struct StimulusItem {
    command: StimulusCommand,
}

impl StimulusItem {
    pub fn new(command: StimulusCommand) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &StimulusCommand {
        &self.command
    }
}

impl ProtocolItem for StimulusItem {
    fn name(&self) -> String {
        self.command.to_string()
    }

    fn start(&mut self, _now_ns: i64) {}

    fn done(&mut self, _ctx: &ProtocolContext<'_>) -> ItemPoll {
        ItemPoll {
            command: Some(self.command.clone()),
            finished: true,
        }
    }
}

fn default_debounce() -> usize {
    1
}

fn default_ttl_debounce() -> usize {
    3
}

/// Serialized protocol item, as written in run configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProtocolItemSpec {
    Pause {
        duration_sec: f64,
    },
    SoftwareTrigger {
        #[serde(default = "default_debounce")]
        debounce: usize,
    },
    TtlTrigger {
        #[serde(default)]
        edge: Edge,
        #[serde(default = "default_ttl_debounce")]
        debounce: usize,
    },
    TrackingTrigger {
        /// Binary image; non-zero pixels are inside the region.
        #[serde(default)]
        mask_file: Option<PathBuf>,
        /// `[x, y, width, height]` in camera pixels, instead of a mask file.
        #[serde(default)]
        rect_px: Option<[u32; 4]>,
        #[serde(default)]
        identity: Option<u32>,
        #[serde(default)]
        edge: Edge,
        #[serde(default = "default_debounce")]
        debounce: usize,
    },
    Stimulus(StimulusCommand),
}

impl ProtocolItemSpec {
    pub fn is_stimulus(&self) -> bool {
        matches!(self, ProtocolItemSpec::Stimulus(_))
    }

    /// Checks values without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        match self {
            ProtocolItemSpec::Pause { duration_sec } => {
                if duration_sec.is_finite() && *duration_sec >= 0.0 {
                    Ok(())
                } else {
                    Err(VrError::protocol(format!("pause duration {duration_sec} is invalid")))
                }
            }
            ProtocolItemSpec::SoftwareTrigger { .. } | ProtocolItemSpec::TtlTrigger { .. } => Ok(()),
            ProtocolItemSpec::TrackingTrigger { mask_file, rect_px, .. } => match (mask_file, rect_px) {
                (Some(_), None) | (None, Some(_)) => Ok(()),
                _ => Err(VrError::protocol(
                    "tracking_trigger needs exactly one of mask_file or rect_px",
                )),
            },
            ProtocolItemSpec::Stimulus(command) => command.validate(),
        }
    }

    /// Builds the runtime item. `frame_size` sizes rectangular masks.
    pub fn build(&self, frame_size: (u32, u32)) -> Result<Box<dyn ProtocolItem>> {
        self.validate()?;
        Ok(match self {
            ProtocolItemSpec::Pause { duration_sec } => Box::new(Pause::new(*duration_sec)),
            ProtocolItemSpec::SoftwareTrigger { debounce } => Box::new(SoftwareTrigger::new(*debounce)),
            ProtocolItemSpec::TtlTrigger { edge, debounce } => Box::new(TtlTrigger::new(*debounce, *edge)),
            ProtocolItemSpec::TrackingTrigger {
                mask_file,
                rect_px,
                identity,
                edge,
                debounce,
            } => {
                let mask = match (mask_file, rect_px) {
                    (Some(path), _) => image::open(path)
                        .map_err(|e| {
                            VrError::protocol(format!("cannot load trigger mask {}: {e}", path.display()))
                        })?
                        .to_luma8(),
                    (None, Some(rect)) => TrackingTrigger::rect_mask(frame_size.0, frame_size.1, *rect),
                    (None, None) => unreachable!("validated above"),
                };
                Box::new(TrackingTrigger::new(mask, *identity, *debounce, *edge))
            }
            ProtocolItemSpec::Stimulus(command) => Box::new(StimulusItem::new(command.clone())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::records::{AnimalRecord, BoundingBox, Heading};

    fn ctx(now_ns: i64) -> ProtocolContext<'static> {
        ProtocolContext {
            now_ns,
            ..Default::default()
        }
    }

    fn record_at(index: u64, x: f32, y: f32) -> TrackingRecord {
        TrackingRecord {
            index,
            timestamp_ns: 0,
            animals: vec![AnimalRecord {
                identity: 0,
                bbox_px: BoundingBox::default(),
                centroid_px: (x, y),
                heading: Heading::identity(),
                body: None,
                eyes: None,
                tail: None,
            }],
            image: None,
        }
    }

    #[test]
    fn pause_waits_for_its_duration() {
        let mut pause = Pause::new(2.0);
        pause.start(1_000);
        assert!(!pause.done(&ctx(1_000)).finished);
        assert!(!pause.done(&ctx(1_000 + sec_to_ns(1.999))).finished);
        assert!(pause.done(&ctx(1_000 + sec_to_ns(2.0))).finished);
    }

    #[test]
    fn stimulus_item_emits_once_and_finishes() {
        let mut item = StimulusItem::new(StimulusCommand::bright());
        item.start(0);
        let poll = item.done(&ctx(0));
        assert_eq!(poll.command, Some(StimulusCommand::bright()));
        assert!(poll.finished);
    }

    #[test]
    fn tracking_trigger_fires_on_entering_the_region() {
        let mask = TrackingTrigger::rect_mask(200, 200, [100, 0, 100, 200]);
        let mut trigger = TrackingTrigger::new(mask, None, 2, Edge::Rising);
        trigger.start(0);
        let outside = record_at(1, 50.0, 50.0);
        let mut poll = |r: &TrackingRecord| {
            trigger
                .done(&ProtocolContext {
                    tracking: Some(r),
                    ..Default::default()
                })
                .finished
        };
        assert!(!poll(&outside));
        assert!(!poll(&record_at(2, 50.0, 50.0)));
        assert!(!poll(&record_at(3, 150.0, 50.0)));
        // Same record again does not count as a second sample.
        assert!(!poll(&record_at(3, 150.0, 50.0)));
        assert!(poll(&record_at(4, 151.0, 50.0)));
    }

    #[test]
    fn animal_already_inside_must_leave_and_reenter() {
        let mask = TrackingTrigger::rect_mask(200, 200, [100, 0, 100, 200]);
        let mut trigger = TrackingTrigger::new(mask, None, 1, Edge::Rising);
        trigger.start(0);
        let fired: Vec<bool> = [(1, 150.0), (2, 160.0), (3, 50.0), (4, 150.0)]
            .into_iter()
            .map(|(index, x)| {
                let record = record_at(index, x, 50.0);
                trigger
                    .done(&ProtocolContext {
                        tracking: Some(&record),
                        ..Default::default()
                    })
                    .finished
            })
            .collect();
        assert_eq!(fired, vec![false, false, false, true]);
    }

    #[test]
    fn ttl_line_low_at_start_does_not_count_as_falling() {
        let mut ttl = TtlTrigger::new(1, Edge::Falling);
        ttl.start(0);
        let mut poll = |ttl_level| {
            ttl.done(&ProtocolContext {
                ttl_level,
                ..Default::default()
            })
            .finished
        };
        assert!(!poll(false));
        assert!(!poll(false));
        assert!(!poll(true));
        assert!(poll(false));
    }

    #[test]
    fn software_trigger_fires_on_the_first_pulse() {
        let mut trigger = SoftwareTrigger::new(1);
        trigger.start(0);
        let pulse = ProtocolContext {
            software_trigger: true,
            ..Default::default()
        };
        assert!(trigger.done(&pulse).finished);
    }

    #[test]
    fn ttl_trigger_waits_for_a_stable_falling_edge() {
        let mut ttl = TtlTrigger::new(2, Edge::Falling);
        ttl.start(0);
        let levels = [true, true, false, true, false, false];
        let fired: Vec<bool> = levels
            .iter()
            .map(|&ttl_level| {
                ttl.done(&ProtocolContext {
                    ttl_level,
                    ..Default::default()
                })
                .finished
            })
            .collect();
        assert_eq!(fired, vec![false, false, false, false, false, true]);
    }

    #[test]
    fn specs_parse_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            items: Vec<ProtocolItemSpec>,
        }
        let parsed: Wrapper = toml::from_str(
            r#"
            [[items]]
            type = "stimulus"
            stim_select = "DARK"
            foreground_color = [0.0, 0.0, 0.0, 1.0]
            background_color = [0.0, 0.0, 0.0, 1.0]

            [[items]]
            type = "pause"
            duration_sec = 5.0

            [[items]]
            type = "tracking_trigger"
            rect_px = [0, 0, 10, 10]
            "#,
        )
        .unwrap();
        assert_eq!(parsed.items.len(), 3);
        assert_eq!(parsed.items[0], ProtocolItemSpec::Stimulus(StimulusCommand::dark()));
        assert!(parsed.items[2].build((64, 64)).is_ok());
    }

    #[test]
    fn tracking_trigger_needs_one_region() {
        let spec = ProtocolItemSpec::TrackingTrigger {
            mask_file: None,
            rect_px: None,
            identity: None,
            edge: Edge::Rising,
            debounce: 1,
        };
        assert_eq!(spec.validate().unwrap_err().exit_code(), 1);
    }
}
