// THEORY:
// This file is the entry point of the `larva_vr` library crate. It exposes
// the closed-loop engine as a set of layers, each one usable on its own:
//
// 1.  **Vision** (`core_modules`): background subtraction, localization,
//     body/eyes/tail pose, identity assignment. Pure functions of frames.
// 2.  **Transport** (`ipc`, `worker`): shared-memory rings, typed edges,
//     worker lifecycles and the DAG controller that owns them.
// 3.  **Stimulus** (`stimulus`, `protocol`): what the animal sees and when.
// 4.  **Run** (`config`, `session`, `stages`, `recorder`): the concrete
//     worker graph of an experiment and the files it leaves behind.
//
// The `larva_vr` binary is a thin CLI over `session::Session`.

pub mod calibration;
pub mod camera;
pub mod clock;
pub mod config;
pub mod core_modules;
pub mod error;
pub mod ipc;
pub mod logging;
pub mod protocol;
pub mod recorder;
pub mod session;
pub mod stages;
pub mod stimulus;
pub mod video;
pub mod worker;

pub use config::RunConfig;
pub use error::{ErrorClass, Result, VrError};
pub use session::{RunSummary, RunningSession, Session, StopReason};
