// THEORY:
// A session turns a validated `RunConfig` into a running worker graph and,
// at the end, into a run directory on disk:
//
// ```text
// <output>/tracking.csv     one row per animal per tracking record
// <output>/stimulus.jsonl   one line per stimulus command, first presentation
// <output>/metadata.json    calibration, config, worker and edge statistics
// <output>/video/           optional decimated frames
// ```
//
// Key architectural principles:
// 1.  **Everything is resolved before anything runs.** Calibration, the
//     protocol and every queue are built in `start`; a configuration error
//     surfaces before the first worker thread exists.
// 2.  **Hardware is injectable.** The camera, projector, display sink and
//     clock default to the synthetic camera, a null projector, a null display
//     and the monotonic clock. Tests and the visualizer swap them in.
// 3.  **One way out.** However a run ends (duration elapsed, interrupt,
//     protocol drained, worker fault) it goes through `stop`, which joins the
//     graph against a deadline and always writes the metadata file.

use crate::calibration::{Calibration, CalibrationFile};
use crate::camera::{Camera, SyntheticCamera};
use crate::clock::{Clock, MonotonicClock, SharedClock};
use crate::config::{QueuesConfig, RunConfig};
use crate::error::{Result, VrError};
use crate::ipc::codec::{AnnotatedCodec, FrameCodec, SlotCodec, SubtractedCodec, TrackingCodec};
use crate::ipc::control::{ControlBus, StopEvent};
use crate::ipc::dispatcher::{Dispatcher, FanOut, NullOutbox, Receiver, Ticker};
use crate::ipc::monitored_queue::{QueueReader, QueueStats, QueueWriter};
use crate::protocol::sequencer::build_protocol;
use crate::recorder::CsvColumns;
use crate::stages::{
    BackgroundWorker, CameraWorker, DisplaySink, DisplayWorker, IdentityWorker, NullDisplay, OverlayWorker,
    ProtocolWorker, RecorderWorker, StimulusWorker, TrackerWorker, VideoWorker, record_index,
};
use crate::stimulus::patterns::AnimalPose;
use crate::stimulus::projector::{NullProjector, Projector};
use crate::stimulus::renderer::{RasterGeometry, StimulusRenderer};
use crate::worker::{DagController, StopReport, WorkerNode, WorkerOptions, WorkerReport};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Join deadline used by `run`.
pub const DEFAULT_STOP_DEADLINE: Duration = Duration::from_secs(5);

const WAIT_POLL: Duration = Duration::from_millis(10);
/// Receive wait of the vsync-paced renderer; presentation does the pacing.
const RENDER_RECEIVE: Duration = Duration::from_millis(1);

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Duration,
    Interrupted,
    ProtocolDone,
    Fault,
}

/// Contents of `metadata.json`.
#[derive(Debug, Serialize)]
pub struct RunMetadata<'a> {
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
    pub duration_sec: f64,
    pub stop_reason: StopReason,
    pub exit_code: i32,
    pub calibration: CalibrationFile,
    pub config: &'a RunConfig,
    pub workers: &'a [WorkerReport],
    pub stragglers: &'a [String],
    pub edges: &'a [QueueStats],
    pub total_dropped: u64,
    /// Records that reached the recorder while recording was paused.
    pub paused_records: u64,
    pub tracking_failures: u64,
    pub stimulus_presentations: u64,
}

/// Outcome of a finished run.
#[derive(Debug)]
pub struct RunSummary {
    pub reason: StopReason,
    pub report: StopReport,
    pub output_dir: PathBuf,
    pub metadata_path: PathBuf,
}

impl RunSummary {
    /// 0 for a clean stop, 3 when a worker failed or missed the deadline.
    pub fn exit_code(&self) -> i32 {
        exit_code(self.reason, &self.report)
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerReport> {
        self.report.workers.iter().find(|w| w.name == name)
    }

    pub fn tracking_failures(&self) -> u64 {
        tracking_failures(&self.report)
    }

    pub fn total_dropped(&self) -> u64 {
        self.report.total_dropped()
    }
}

fn exit_code(reason: StopReason, report: &StopReport) -> i32 {
    if reason == StopReason::Fault || report.forced() || report.failed_workers().next().is_some() {
        3
    } else {
        0
    }
}

fn summary_u64(worker: &WorkerReport, key: &str) -> u64 {
    worker
        .summary
        .as_ref()
        .and_then(|s| s.get(key))
        .and_then(serde_json::Value::as_u64)
        .unwrap_or(0)
}

fn tracking_failures(report: &StopReport) -> u64 {
    report
        .workers
        .iter()
        .filter(|w| w.name.starts_with("tracker_"))
        .map(|w| summary_u64(w, "tracking_failures"))
        .sum()
}

fn edge<C: SlotCodec>(
    dag: &mut DagController,
    queues: &QueuesConfig,
    from: &str,
    to: &str,
    label: &str,
    codec: C,
) -> Result<(QueueWriter<C>, QueueReader<C>)> {
    let options = queues.options(&format!("{label}_{from}_{to}"));
    dag.connect_data(from, to, label, codec, &options)
}

/// A configured run that has not started yet.
pub struct Session {
    config: RunConfig,
    output_dir: PathBuf,
    clock: SharedClock,
    camera: Option<Box<dyn Camera>>,
    projector: Option<Box<dyn Projector>>,
    display: Option<Box<dyn DisplaySink>>,
}

impl Session {
    pub fn new(config: RunConfig, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            config,
            output_dir: output_dir.into(),
            clock: MonotonicClock::shared(),
            camera: None,
            projector: None,
            display: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_camera(mut self, camera: Box<dyn Camera>) -> Self {
        self.camera = Some(camera);
        self
    }

    pub fn with_projector(mut self, projector: Box<dyn Projector>) -> Self {
        self.projector = Some(projector);
        self
    }

    /// Receives the live preview; only used when `[display]` is enabled.
    pub fn with_display_sink(mut self, sink: Box<dyn DisplaySink>) -> Self {
        self.display = Some(sink);
        self
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Starts, waits for `duration` (or an interrupt, a drained protocol, a
    /// fault) and stops.
    pub fn run(self, duration: Option<Duration>, interrupt: &StopEvent) -> Result<RunSummary> {
        let running = self.start()?;
        let reason = running.wait(duration, interrupt);
        running.stop(DEFAULT_STOP_DEADLINE, reason)
    }

    /// Builds the graph and starts every worker.
    pub fn start(self) -> Result<RunningSession> {
        self.config.validate()?;
        let calibration = self.config.calibration()?;
        std::fs::create_dir_all(&self.output_dir)?;

        let started_at = Utc::now();
        let config = self.config.clone();
        let output_dir = self.output_dir.clone();
        let (mut dag, protocol_done) = self.build(&calibration)?;
        tracing::info!(
            workers = dag.workers().len(),
            output = %output_dir.display(),
            "starting run"
        );
        dag.start()?;

        Ok(RunningSession {
            dag,
            config,
            calibration,
            output_dir,
            started_at,
            started: Instant::now(),
            protocol_done,
        })
    }

    fn build(self, calibration: &Calibration) -> Result<(DagController, Option<StopEvent>)> {
        let Session {
            config: cfg,
            output_dir,
            clock,
            camera,
            projector,
            display,
        } = self;
        let (width, height) = cfg.frame_size();
        let n_background = cfg.workers.background;
        let n_trackers = cfg.workers.trackers;
        let queues = &cfg.queues;
        let mut dag = DagController::new();

        // --- 1. Camera and background workers ---
        let frame_codec = FrameCodec::new(width, height, 1);
        let mut camera_out = Vec::with_capacity(n_background + 1);
        let mut background_in = Vec::with_capacity(n_background);
        for rank in 0..n_background {
            let (tx, rx) = edge(&mut dag, queues, "camera", &format!("background_{rank}"), "frames", frame_codec)?;
            camera_out.push(tx);
            background_in.push(rx);
        }
        let video = cfg.recorder.enabled && cfg.recorder.video.enabled;
        let mut video_in = None;
        if video {
            let (tx, rx) = edge(&mut dag, queues, "camera", "video", "frames", frame_codec)?;
            camera_out.push(tx);
            video_in = Some(rx);
        }

        // --- 2. Background to tracker fan-out ---
        let subtracted_codec = SubtractedCodec::new(width, height);
        let mut background_out: Vec<Vec<_>> = (0..n_background).map(|_| Vec::new()).collect();
        let mut tracker_in: Vec<Vec<_>> = (0..n_trackers).map(|_| Vec::new()).collect();
        for (rank, outputs) in background_out.iter_mut().enumerate() {
            for (t, inputs) in tracker_in.iter_mut().enumerate() {
                let (tx, rx) = edge(
                    &mut dag,
                    queues,
                    &format!("background_{rank}"),
                    &format!("tracker_{t}"),
                    "subtracted",
                    subtracted_codec,
                )?;
                outputs.push(tx);
                inputs.push(rx);
            }
        }

        // --- 3. Tracking consumers ---
        let preview = cfg.tracker.preview_size(width, height);
        let (pw, ph) = preview.unwrap_or((0, 0));
        let tracking_codec = TrackingCodec::new(cfg.max_animals(), cfg.tracker.tail_points(), pw, ph);
        let with_protocol = !cfg.protocol.items.is_empty();
        let with_display = cfg.display.enabled && preview.is_some();
        if cfg.display.enabled && preview.is_none() {
            tracing::warn!("display enabled but tracker previews are off; no live preview");
        }
        let mut consumers = vec!["stimulus"];
        if with_protocol {
            consumers.push("protocol");
        }
        if cfg.recorder.enabled {
            consumers.push("recorder");
        }
        if with_display {
            consumers.push("overlay");
        }
        let mut tracker_out: Vec<Vec<_>> = (0..n_trackers).map(|_| Vec::new()).collect();
        let mut identity_in = Vec::new();
        let mut identity_out = Vec::new();
        // Distance matching puts one identity stage between trackers and consumers.
        let publishers: Vec<(String, &mut Vec<_>)> = if cfg.assignment.is_stateful() {
            for (t, outputs) in tracker_out.iter_mut().enumerate() {
                let (tx, rx) = edge(&mut dag, queues, &format!("tracker_{t}"), "identity", "tracking", tracking_codec)?;
                outputs.push(tx);
                identity_in.push(rx);
            }
            vec![("identity".to_string(), &mut identity_out)]
        } else {
            tracker_out
                .iter_mut()
                .enumerate()
                .map(|(t, outputs)| (format!("tracker_{t}"), outputs))
                .collect()
        };
        let mut consumer_in: Vec<Vec<_>> = consumers.iter().map(|_| Vec::new()).collect();
        for (from, outputs) in publishers {
            for (consumer, inputs) in consumers.iter().zip(consumer_in.iter_mut()) {
                let (tx, rx) = edge(&mut dag, queues, &from, consumer, "tracking", tracking_codec)?;
                outputs.push(tx);
                inputs.push(rx);
            }
        }
        let mut consumer_in: HashMap<&str, Vec<_>> = consumers.into_iter().zip(consumer_in).collect();
        let mut take_inputs = |name: &str| consumer_in.remove(name).unwrap_or_default();
        let stimulus_in = take_inputs("stimulus");
        let protocol_in = take_inputs("protocol");
        let recorder_in = take_inputs("recorder");
        let overlay_in = take_inputs("overlay");

        // --- 4. Workers ---
        let camera = camera.unwrap_or_else(|| Box::new(SyntheticCamera::new(cfg.camera.clone(), clock.clone())));
        let period = Duration::from_secs_f64(1.0 / cfg.camera.fps);
        let inbox = dag.control_inbox("camera");
        dag.add_worker(
            WorkerNode::new(
                CameraWorker::new(camera, cfg.camera.clone()),
                Ticker::every(period),
                Dispatcher::new(camera_out, FanOut::Broadcast),
            )
            .with_control(inbox),
        )?;

        if let Some(rx) = video_in {
            let inbox = dag.control_inbox("video");
            dag.add_worker(
                WorkerNode::new(
                    VideoWorker::new(output_dir.join("video"), cfg.recorder.video.clone()),
                    Receiver::poll(vec![rx]),
                    NullOutbox::new(),
                )
                .with_control(inbox),
            )?;
        }

        for (rank, (rx, outputs)) in background_in.into_iter().zip(background_out).enumerate() {
            let inbox = dag.control_inbox(&format!("background_{rank}"));
            dag.add_worker(
                WorkerNode::new(
                    BackgroundWorker::new(rank, n_background, &cfg.background),
                    Receiver::poll(vec![rx]),
                    Dispatcher::new(outputs, FanOut::Dispatch),
                )
                .with_control(inbox),
            )?;
        }

        for (rank, (inputs, outputs)) in tracker_in.into_iter().zip(tracker_out).enumerate() {
            let inbox = dag.control_inbox(&format!("tracker_{rank}"));
            dag.add_worker(
                WorkerNode::new(
                    TrackerWorker::new(
                        rank,
                        &cfg.tracker,
                        &cfg.assignment,
                        calibration.pix_per_mm(),
                        (width, height),
                    ),
                    Receiver::poll(inputs),
                    Dispatcher::new(outputs, FanOut::Broadcast),
                )
                .with_control(inbox),
            )?;
        }

        if !identity_in.is_empty() {
            let inbox = dag.control_inbox("identity");
            dag.add_worker(
                WorkerNode::new(
                    IdentityWorker::new(cfg.assignment.hungarian(calibration.pix_per_mm())),
                    Receiver::poll(identity_in),
                    Dispatcher::new(identity_out, FanOut::Broadcast),
                )
                .with_control(inbox),
            )?;
        }

        let mut protocol_done = None;
        if with_protocol {
            let sequencer = build_protocol(
                &cfg.protocol.items,
                cfg.protocol.short_trial_policy,
                cfg.protocol.min_trial_sec,
                (width, height),
            )?;
            let renderer = dag.connect_metadata("protocol", "stimulus")?;
            let worker = ProtocolWorker::new(sequencer, clock.clone(), renderer);
            protocol_done = Some(worker.finished());
            let inbox = dag.control_inbox("protocol");
            dag.add_worker(
                WorkerNode::new(worker, Receiver::latest(protocol_in, record_index), NullOutbox::new())
                    .with_control(inbox)
                    .with_options(WorkerOptions::ticking(Duration::from_millis(cfg.protocol.tick_ms))),
            )?;
        }

        let geometry = cfg.projector;
        let mut renderer = StimulusRenderer::new(
            calibration,
            RasterGeometry {
                width: geometry.width,
                height: geometry.height,
                pixel_scale: (geometry.pixel_scale_x, geometry.pixel_scale_y),
            },
            cfg.stimulus.looming_cycle,
            AnimalPose::new((width as f32 / 2.0, height as f32 / 2.0), (1.0, 0.0)),
        )
        .with_target_identity(cfg.stimulus.target_identity);
        renderer.set_command(cfg.stimulus.initial.clone(), clock.now_ns())?;
        let projector = projector.unwrap_or_else(|| Box::new(NullProjector::new(geometry)));
        let mut stimulus = StimulusWorker::new(renderer, projector, clock.clone());
        if cfg.recorder.enabled {
            stimulus = stimulus.with_log(output_dir.join(&cfg.recorder.stim_log));
        }
        let inbox = dag.control_inbox("stimulus");
        dag.add_worker(
            WorkerNode::new(stimulus, Receiver::latest(stimulus_in, record_index), NullOutbox::new())
                .with_control(inbox)
                .with_options(WorkerOptions::ticking(RENDER_RECEIVE)),
        )?;

        if cfg.recorder.enabled {
            let columns = CsvColumns {
                eyes: cfg.tracker.body.enabled && cfg.tracker.eyes.enabled,
                tail_points: cfg.tracker.tail_points(),
                heading_unwrap: cfg.recorder.heading_unwrap,
            };
            let inbox = dag.control_inbox("recorder");
            dag.add_worker(
                WorkerNode::new(
                    RecorderWorker::new(
                        output_dir.join(&cfg.recorder.tracking_csv),
                        columns,
                        cfg.tracker.heading_nan_policy,
                        cfg.recorder.flush_every,
                    )
                    .with_reorder_window(n_trackers),
                    Receiver::poll(recorder_in),
                    NullOutbox::new(),
                )
                .with_control(inbox),
            )?;
        }

        if with_display {
            let (tx, rx) = edge(
                &mut dag,
                queues,
                "overlay",
                "display",
                "annotated",
                AnnotatedCodec::new(cfg.max_animals(), cfg.tracker.tail_points(), pw, ph),
            )?;
            dag.add_worker(WorkerNode::new(
                OverlayWorker::new(&cfg.display, (width, height)),
                Receiver::latest(overlay_in, record_index),
                Dispatcher::new(vec![tx], FanOut::Broadcast),
            ))?;
            let sink = display.unwrap_or_else(|| Box::new(NullDisplay::new()));
            dag.add_worker(WorkerNode::new(
                DisplayWorker::new(sink, cfg.display.jpeg_quality),
                Receiver::poll(vec![rx]),
                NullOutbox::new(),
            ))?;
        }

        Ok((dag, protocol_done))
    }
}

/// A started run.
pub struct RunningSession {
    dag: DagController,
    config: RunConfig,
    calibration: Calibration,
    output_dir: PathBuf,
    started_at: DateTime<Utc>,
    started: Instant,
    protocol_done: Option<StopEvent>,
}

impl RunningSession {
    /// Operator channel to every worker.
    pub fn control(&self) -> &ControlBus {
        self.dag.control_bus()
    }

    pub fn edge_stats(&self) -> Vec<QueueStats> {
        self.dag.edge_stats()
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Blocks until `duration` has elapsed, `interrupt` is set, a worker
    /// faults or, with `protocol.stop_when_done`, the protocol has drained.
    pub fn wait(&self, duration: Option<Duration>, interrupt: &StopEvent) -> StopReason {
        let stop_on_protocol = self.config.protocol.stop_when_done;
        loop {
            if self.dag.fault().is_set() {
                tracing::error!("worker fault; stopping the run");
                return StopReason::Fault;
            }
            if interrupt.is_set() {
                tracing::info!("interrupted; stopping the run");
                return StopReason::Interrupted;
            }
            if stop_on_protocol && self.protocol_done.as_ref().is_some_and(StopEvent::is_set) {
                tracing::info!("protocol drained; stopping the run");
                return StopReason::ProtocolDone;
            }
            if duration.is_some_and(|d| self.started.elapsed() >= d) {
                return StopReason::Duration;
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Stops the graph and writes `metadata.json`.
    pub fn stop(mut self, deadline: Duration, reason: StopReason) -> Result<RunSummary> {
        let report = self.dag.stop(deadline);
        let reason = if self.dag.fault().is_set() { StopReason::Fault } else { reason };
        let stopped_at = Utc::now();

        let metadata_path = self.output_dir.join(&self.config.recorder.metadata);
        let metadata = RunMetadata {
            started_at: self.started_at,
            stopped_at,
            duration_sec: self.started.elapsed().as_secs_f64(),
            stop_reason: reason,
            exit_code: exit_code(reason, &report),
            calibration: self.calibration.to_file(),
            config: &self.config,
            workers: &report.workers,
            stragglers: &report.stragglers,
            edges: &report.edges,
            total_dropped: report.total_dropped(),
            paused_records: report
                .workers
                .iter()
                .find(|w| w.name == "recorder")
                .map_or(0, |w| summary_u64(w, "paused_records")),
            tracking_failures: tracking_failures(&report),
            stimulus_presentations: report
                .workers
                .iter()
                .find(|w| w.name == "stimulus")
                .map_or(0, |w| summary_u64(w, "presentations")),
        };
        let file = File::create(&metadata_path)
            .map_err(|e| VrError::Recorder(format!("cannot create {}: {e}", metadata_path.display())))?;
        serde_json::to_writer_pretty(BufWriter::new(file), &metadata)?;
        tracing::info!(
            reason = ?reason,
            dropped = metadata.total_dropped,
            tracking_failures = metadata.tracking_failures,
            path = %metadata_path.display(),
            "run stopped"
        );

        Ok(RunSummary {
            reason,
            report,
            output_dir: self.output_dir,
            metadata_path,
        })
    }
}
