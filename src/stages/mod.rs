// THEORY:
// The stages are the concrete workers of a run. Each one wraps a piece of the
// engine behind the `Worker` trait and decides nothing about wiring; the
// session connects them:
//
// ```text
//            BROADCAST            DISPATCH          BROADCAST
// camera ───────────► background_i ────────► tracker_j ───────► stimulus  (LATEST)
//    │                (rank i of N)            (POLL)   ├──────► protocol  (LATEST) ──ctl──► stimulus
//    └──► video                                         ├──────► recorder  (POLL)
//                                                       └──────► overlay   (LATEST) ──► display
// ```
//
// With distance matching, every tracker_j feeds a single `identity` stage
// (POLL) and the consumers hang off it instead.
//
// Key architectural principles:
// 1.  **Exactly once past the background.** Every background worker sees
//     every frame to keep its model current, but forwards only the frames
//     whose index falls on its rank. Each frame therefore reaches one tracker
//     or shows up as a drop on some edge.
// 2.  **Fresh-biased consumers.** The renderer, the sequencer and the overlay
//     only care about the newest record; the recorder must see all of them.
// 3.  **Stateful identities are serial.** Distance matching carries tracks
//     from frame to frame, so it runs in one place that sees every record.
// 4.  **Control between iterations.** Stages react to `ControlMessage`s in
//     `on_control` and ignore the ones that are not theirs.

pub mod background;
pub mod camera;
pub mod display;
pub mod identity;
pub mod overlay;
pub mod protocol;
pub mod recorder;
pub mod stimulus;
pub mod tracker;

pub use background::BackgroundWorker;
pub use camera::{CameraWorker, VideoWorker};
pub use display::{AnimalSummary, DisplayPacket, DisplaySink, DisplayWorker, NullDisplay, PreviewSummary};
pub use identity::IdentityWorker;
pub use overlay::OverlayWorker;
pub use protocol::ProtocolWorker;
pub use recorder::RecorderWorker;
pub use stimulus::StimulusWorker;
pub use tracker::TrackerWorker;

/// Freshness key of tracking records for LATEST receivers.
pub fn record_index(record: &crate::core_modules::records::TrackingRecord) -> u64 {
    record.index
}
