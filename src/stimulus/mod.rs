//! Stimulus commands, the pattern definitions behind them, the projector-space
//! rasterizer, projector sinks and the stimulus log.

pub mod command;
pub mod patterns;
pub mod projector;
pub mod renderer;
pub mod stim_log;

pub use command::{LoomingCycle, LoomingGrowth, Rgba, StimulusCommand, StimulusKind};
pub use patterns::{AnimalPose, PatternContext};
pub use projector::{CapturedImage, FrameCaptureProjector, NullProjector, Projector, ProjectorGeometry, VsyncPacer};
pub use renderer::{RasterGeometry, StimulusRenderer};
pub use stim_log::{StimLog, StimLogEntry, read_stim_log};
