//! Whole runs on the synthetic camera: every worker on its own thread, real
//! queues, real output files.

use larva_vr::config::RunConfig;
use larva_vr::core_modules::assignment::AssignmentMethod;
use larva_vr::ipc::control::{ControlMessage, StopEvent};
use larva_vr::protocol::items::ProtocolItemSpec;
use larva_vr::recorder::read_tracking_csv;
use larva_vr::stages::NullDisplay;
use larva_vr::stimulus::command::StimulusCommand;
use larva_vr::stimulus::stim_log::read_stim_log;
use larva_vr::{Session, StopReason};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn small_run() -> RunConfig {
    let mut config = RunConfig::default();
    config.camera.width = 160;
    config.camera.height = 120;
    config.camera.fps = 50.0;
    config.camera.synthetic.n_animals = 1;
    config.camera.synthetic.pix_per_mm = 10.0;
    config.projector.width = 64;
    config.projector.height = 48;
    config.projector.fps = 200.0;
    config.workers.background = 1;
    config.workers.trackers = 2;
    config.background.num_samples = 3;
    config.background.sample_interval_sec = 0.05;
    config.tracker.n_animals = 1;
    config.recorder.flush_every = 1;
    config.recorder.video.enabled = true;
    config.recorder.video.decimation = 5;
    config.display.enabled = true;
    config
}

#[test]
fn synthetic_run_writes_a_complete_run_directory() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("run");
    let mut config = small_run();
    config.protocol.items = vec![
        ProtocolItemSpec::Stimulus(StimulusCommand::dark()),
        ProtocolItemSpec::Pause { duration_sec: 0.3 },
        ProtocolItemSpec::Stimulus(StimulusCommand::bright()),
    ];
    let display = NullDisplay::new();
    let published = display.counter();

    let summary = Session::new(config, &output)
        .with_display_sink(Box::new(display))
        .run(Some(Duration::from_millis(1500)), &StopEvent::new())
        .unwrap();

    assert_eq!(summary.reason, StopReason::Duration);
    assert_eq!(summary.exit_code(), 0, "{:#?}", summary.report);
    assert!(summary.report.stragglers.is_empty());
    for worker in ["camera", "video", "background_0", "tracker_0", "tracker_1", "protocol", "stimulus", "recorder", "overlay", "display"] {
        assert!(summary.worker(worker).is_some(), "missing worker {worker}");
    }
    assert!(published.load(Ordering::Relaxed) > 0);

    // Each edge accounts for every item written to it.
    for edge in &summary.report.edges {
        assert_eq!(edge.enqueued, edge.dequeued + edge.dropped + edge.size, "{edge}");
    }

    let metadata: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(output.join("metadata.json")).unwrap()).unwrap();
    assert_eq!(metadata["stop_reason"], "duration");
    assert_eq!(metadata["exit_code"], 0);
    assert!(metadata["calibration"].is_object());
    assert_eq!(metadata["config"]["camera"]["width"], 160);
    assert!(!metadata["edges"].as_array().unwrap().is_empty());
    assert!(metadata["stimulus_presentations"].as_u64().unwrap() > 0);

    let rows = read_tracking_csv(&output.join("tracking.csv")).unwrap();
    assert!(rows.len() > 10, "only {} rows", rows.len());
    let keys: HashSet<(u64, Option<u32>)> = rows.iter().map(|r| (r.image_index, r.identity)).collect();
    assert_eq!(keys.len(), rows.len(), "a frame was recorded twice for one animal");
    for row in rows.iter().filter(|r| r.identity.is_some()) {
        let det = row.determinant().unwrap();
        assert!((det - 1.0).abs() < 1e-4, "heading determinant {det}");
    }

    let kinds: Vec<String> = read_stim_log(&output.join("stimulus.jsonl"))
        .unwrap()
        .iter()
        .map(|e| e.command.kind.name().to_string())
        .collect();
    assert_eq!(kinds, vec!["DARK", "BRIGHT"]);

    let video = summary.worker("video").unwrap().summary.as_ref().unwrap();
    assert!(video["frames_written"].as_u64().unwrap() > 0);
    assert!(std::fs::read_dir(output.join("video").join("frames")).unwrap().next().is_some());
}

#[test]
fn a_drained_protocol_or_an_interrupt_ends_the_run() {
    let dir = tempfile::tempdir().unwrap();

    let mut config = small_run();
    config.display.enabled = false;
    config.protocol.stop_when_done = true;
    config.protocol.items = vec![
        ProtocolItemSpec::Stimulus(StimulusCommand::bright()),
        ProtocolItemSpec::Pause { duration_sec: 0.2 },
    ];
    let summary = Session::new(config, dir.path().join("protocol"))
        .run(Some(Duration::from_secs(20)), &StopEvent::new())
        .unwrap();
    assert_eq!(summary.reason, StopReason::ProtocolDone);
    assert_eq!(summary.exit_code(), 0);

    let mut config = small_run();
    config.display.enabled = false;
    config.recorder.video.enabled = false;
    let running = Session::new(config, dir.path().join("interrupted")).start().unwrap();
    running.control().broadcast(&ControlMessage::SetRecording(false));
    let interrupt = StopEvent::new();
    let trigger = interrupt.clone();
    let waker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        trigger.set();
    });
    let reason = running.wait(None, &interrupt);
    waker.join().unwrap();
    assert_eq!(reason, StopReason::Interrupted);

    let summary = running.stop(Duration::from_secs(5), reason).unwrap();
    assert_eq!(summary.exit_code(), 0);
    assert!(summary.metadata_path.exists());
    let recorder = summary.worker("recorder").unwrap().summary.as_ref().unwrap();
    // The pause lands before the first record reaches the recorder, or right after it.
    assert!(recorder["rows"].as_u64().unwrap() <= 1);
    assert!(recorder["paused_records"].as_u64().unwrap() > 0);
}

#[test]
fn every_acquired_frame_is_recorded_or_counted_lost() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("overload");
    let mut config = small_run();
    // Far more frames than one tracker keeps up with, through two-slot edges.
    config.camera.width = 640;
    config.camera.height = 480;
    config.camera.fps = 2000.0;
    config.workers.trackers = 1;
    config.queues.capacity = 2;
    config.display.enabled = false;
    config.recorder.video.enabled = false;

    let summary = Session::new(config, &output)
        .run(Some(Duration::from_millis(1000)), &StopEvent::new())
        .unwrap();
    assert_eq!(summary.exit_code(), 0, "{:#?}", summary.report);

    let camera = summary.worker("camera").unwrap().summary.as_ref().unwrap();
    let acquired = camera["frames_acquired"].as_u64().unwrap();
    assert!(acquired > 0);

    let rows = read_tracking_csv(&output.join("tracking.csv")).unwrap();
    let recorded: HashSet<u64> = rows.iter().map(|r| r.image_index).collect();
    assert!(recorded.iter().all(|&i| i < acquired));

    // The stimulus branch only ever wants the newest record; every other edge
    // lies on the way from the camera to the CSV.
    let to_csv: Vec<_> = summary
        .report
        .edges
        .iter()
        .filter(|e| !e.name.ends_with("->stimulus]"))
        .collect();
    assert_eq!(to_csv.len(), 3, "{to_csv:#?}");
    for edge in &to_csv {
        assert_eq!(edge.enqueued, edge.dequeued + edge.dropped + edge.size, "{edge}");
    }
    let lost: u64 = to_csv.iter().map(|e| e.lost()).sum();
    assert!(lost > 0, "the run never overloaded: {to_csv:#?}");

    let metadata: serde_json::Value =
        serde_json::from_reader(std::fs::File::open(&summary.metadata_path).unwrap()).unwrap();
    let paused = metadata["paused_records"].as_u64().unwrap();
    assert_eq!(paused, 0);
    assert!(metadata["total_dropped"].as_u64().unwrap() >= lost);

    let missing = acquired - recorded.len() as u64;
    assert!(missing <= lost + paused, "{missing} frames vanished, {lost} counted lost");
}

#[test]
fn matched_identities_stay_with_one_animal_across_trackers() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("hungarian");
    let mut config = small_run();
    config.camera.width = 320;
    config.camera.synthetic.n_animals = 2;
    config.camera.synthetic.rows = 1;
    config.camera.synthetic.cols = 2;
    config.tracker.n_animals = 2;
    config.assignment.method = AssignmentMethod::Hungarian;
    config.workers.trackers = 2;
    config.display.enabled = false;
    config.recorder.video.enabled = false;

    let summary = Session::new(config, &output)
        .run(Some(Duration::from_millis(1500)), &StopEvent::new())
        .unwrap();
    assert_eq!(summary.exit_code(), 0, "{:#?}", summary.report);
    assert!(summary.worker("identity").is_some());
    for edge in ["tracking[tracker_0->identity]", "tracking[tracker_1->identity]", "tracking[identity->recorder]"] {
        assert!(summary.report.edges.iter().any(|e| e.name == edge), "missing edge {edge}");
    }
    assert!(!summary.report.edges.iter().any(|e| e.name == "tracking[tracker_0->recorder]"));

    // Identities never hop between the two wells, whichever tracker saw the frame.
    let rows = read_tracking_csv(&output.join("tracking.csv")).unwrap();
    let mut wells: HashMap<u32, HashSet<bool>> = HashMap::new();
    for row in rows.iter().filter(|r| r.identity.is_some()) {
        let right = row.centroid_x.unwrap() >= 160.0;
        wells.entry(row.identity.unwrap()).or_default().insert(right);
    }
    assert!(!wells.is_empty());
    for (identity, sides) in &wells {
        assert_eq!(sides.len(), 1, "identity {identity} seen in both wells");
    }
}
