// THEORY:
// A run is described by one TOML file deserialized into `RunConfig`. Each
// section belongs to the module that consumes it (`[camera]` to the camera,
// `[tracker]` to the tracker, ...) and carries its own defaults, so an empty
// file is a valid synthetic run.
//
// Loading happens in three steps, all before any worker exists:
// 1.  **Parse.** `toml` + `serde`; unknown sections are rejected so typos do
//     not silently fall back to defaults.
// 2.  **Validate.** Every section appends its range violations to one list and
//     `validate` fails with a single configuration error naming all of them.
// 3.  **Resolve.** Calibration and protocol files are read and checked, still
//     as configuration errors (exit code 1).

use crate::calibration::Calibration;
use crate::camera::CameraConfig;
use crate::core_modules::assignment::AssignmentConfig;
use crate::core_modules::background::BackgroundConfig;
use crate::core_modules::overlay::DisplayConfig;
use crate::core_modules::tracker::TrackerConfig;
use crate::error::{Result, VrError};
use crate::ipc::monitored_queue::{Backing, QueueOptions};
use crate::protocol::items::ProtocolItemSpec;
use crate::protocol::sequencer::{ShortTrialPolicy, check_trial_lengths};
use crate::recorder::RecorderConfig;
use crate::stimulus::command::{LoomingCycle, StimulusCommand};
use crate::stimulus::projector::ProjectorGeometry;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Names the config file when the command line does not.
pub const CONFIG_ENV: &str = "LARVA_VR_CONFIG";

/// `[workers]`: how many parallel background and tracker workers to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub background: usize,
    pub trackers: usize,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            background: 1,
            trackers: default_tracker_count(),
        }
    }
}

/// Leaves a core each for the camera, background and stimulus workers.
fn default_tracker_count() -> usize {
    num_cpus::get().saturating_sub(3).clamp(1, 8)
}

/// `[queues]`: ring geometry shared by every data edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesConfig {
    pub capacity: usize,
    pub copy_on_read: bool,
    /// Directory for file-backed rings other processes can attach to. Rings
    /// are anonymous when unset.
    pub shm_dir: Option<PathBuf>,
}

impl Default for QueuesConfig {
    fn default() -> Self {
        Self {
            capacity: 16,
            copy_on_read: true,
            shm_dir: None,
        }
    }
}

impl QueuesConfig {
    /// Options for the edge called `edge`.
    pub fn options(&self, edge: &str) -> QueueOptions {
        QueueOptions {
            capacity: self.capacity,
            copy_on_read: self.copy_on_read,
            backing: match &self.shm_dir {
                Some(dir) => Backing::File(dir.join(format!("{edge}.ring"))),
                None => Backing::Anonymous,
            },
        }
    }
}

/// `[stimulus]`: renderer defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusConfig {
    pub looming_cycle: LoomingCycle,
    /// Animal whose pose drives the stimulus; the lowest identity when unset.
    pub target_identity: Option<u32>,
    /// Shown until the protocol or an operator selects something else.
    pub initial: StimulusCommand,
}

impl Default for StimulusConfig {
    fn default() -> Self {
        Self {
            looming_cycle: LoomingCycle::ResetToZero,
            target_identity: None,
            initial: StimulusCommand::dark(),
        }
    }
}

/// `[protocol]`: the trial sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub items: Vec<ProtocolItemSpec>,
    pub short_trial_policy: ShortTrialPolicy,
    pub min_trial_sec: f64,
    /// Sequencer tick period.
    pub tick_ms: u64,
    /// End the run once every item has completed.
    pub stop_when_done: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            short_trial_policy: ShortTrialPolicy::Warn,
            min_trial_sec: 0.0,
            tick_ms: 5,
            stop_when_done: false,
        }
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    /// Daily-rolled JSON log file, in addition to the console.
    pub file: Option<PathBuf>,
    /// Console output as JSON instead of text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            file: None,
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub camera: CameraConfig,
    pub projector: ProjectorGeometry,
    pub workers: WorkersConfig,
    pub background: BackgroundConfig,
    pub tracker: TrackerConfig,
    pub assignment: AssignmentConfig,
    pub queues: QueuesConfig,
    pub stimulus: StimulusConfig,
    pub protocol: ProtocolConfig,
    pub recorder: RecorderConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
    /// JSON calibration. Synthetic runs fall back to an identity map at the
    /// synthetic camera's scale.
    pub calibration_file: Option<PathBuf>,
}

impl RunConfig {
    /// Parses and validates a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| VrError::config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: RunConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// The explicit path, else `LARVA_VR_CONFIG`, else defaults.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(path) => Self::load(Path::new(&path)),
                None => {
                    tracing::info!("no configuration file given; using defaults");
                    Ok(Self::default())
                }
            },
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| VrError::config(e.to_string()))
    }

    /// Collects every range violation into one error.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        self.camera.validate(&mut errors);
        validate_projector(&self.projector, &mut errors);
        if self.workers.background == 0 {
            errors.push("workers.background must be at least 1".into());
        }
        if self.workers.trackers == 0 {
            errors.push("workers.trackers must be at least 1".into());
        }
        self.background.validate(&mut errors);
        self.tracker.validate(&mut errors);
        self.assignment.validate(&mut errors);
        if self.queues.capacity < 2 {
            errors.push("queues.capacity must be at least 2".into());
        }
        if let Err(err) = self.stimulus.initial.validate() {
            errors.push(format!("stimulus.initial: {err}"));
        }
        for (i, item) in self.protocol.items.iter().enumerate() {
            if let Err(err) = item.validate() {
                errors.push(format!("protocol.items[{i}]: {err}"));
            }
        }
        if !(self.protocol.min_trial_sec >= 0.0) {
            errors.push("protocol.min_trial_sec must be >= 0".into());
        }
        if self.protocol.tick_ms == 0 {
            errors.push("protocol.tick_ms must be at least 1".into());
        }
        if let Err(err) = check_trial_lengths(
            &self.protocol.items,
            self.protocol.short_trial_policy,
            self.protocol.min_trial_sec,
        ) {
            errors.push(err.to_string());
        }
        self.recorder.validate(&mut errors);
        self.display.validate(&mut errors);
        if let Err(err) = tracing_subscriber::EnvFilter::try_new(&self.logging.level) {
            errors.push(format!("logging.level: {err}"));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(VrError::config(errors.join("; ")))
        }
    }

    /// Loads the calibration, or the synthetic identity map when none is
    /// configured.
    pub fn calibration(&self) -> Result<Calibration> {
        match &self.calibration_file {
            Some(path) => {
                let calibration = Calibration::load(path)?;
                tracing::info!(path = %path.display(), pix_per_mm = calibration.pix_per_mm(), "calibration loaded");
                Ok(calibration)
            }
            None => {
                tracing::warn!(
                    pix_per_mm = self.camera.synthetic.pix_per_mm,
                    "no calibration_file; projector space equals camera space"
                );
                Ok(Calibration::identity(self.camera.synthetic.pix_per_mm))
            }
        }
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.camera.width, self.camera.height)
    }

    /// Animals a tracking record can carry.
    pub fn max_animals(&self) -> usize {
        self.assignment
            .capacity()
            .unwrap_or(0)
            .max(self.tracker.n_animals)
    }
}

fn validate_projector(geometry: &ProjectorGeometry, errors: &mut Vec<String>) {
    if geometry.width == 0 || geometry.height == 0 {
        errors.push("projector.width and projector.height must be positive".into());
    }
    if !(geometry.fps > 0.0 && geometry.fps.is_finite()) {
        errors.push("projector.fps must be positive".into());
    }
    if !(geometry.pixel_scale_x > 0.0 && geometry.pixel_scale_y > 0.0) {
        errors.push("projector pixel scales must be positive".into());
    }
}
