// THEORY:
// A worker is one stage of the pipeline running in its own execution context
// (an OS thread here; the rings also allow a process boundary). Its life is a
// fixed state machine:
//
// ```text
// initialize ─► [ control → receive → work → send ]* ─► cleanup
// ```
//
// Key architectural principles:
// 1.  **`work` is pure of IPC.** A stage implements `Worker` and only ever sees
//     decoded inputs and returns an optional output. How inputs are gathered
//     (POLL, COLLECT, LATEST, ticks) and how outputs leave (BROADCAST,
//     DISPATCH) is decided by the `Inbox` and `Outbox` the node is wired with.
// 2.  **Suspension happens only in receive and send.** The receive step waits
//     with a timeout and returns `None` on expiry; the iteration is then
//     skipped unless the worker asked to run on timeouts (renderers and
//     sequencers that must tick without new data).
// 3.  **Stopping is cooperative.** Each node watches its own stop event and
//     leaves after the current iteration, then works through whatever is
//     still queued on its inputs (bounded by `drain_timeout`) so items that
//     made it into an edge are not stranded there. A fatal `work` error or a
//     panic stops the node and raises the DAG-wide fault event so the
//     controller can stop the rest.
// 4.  **Every iteration is timed.** Four monotonic stamps bracket the
//     receive, work and send steps; the deltas go to the `larva_vr::timing`
//     trace target and into a running summary reported at shutdown.

pub mod dag;

use crate::error::{ErrorClass, Result, VrError};
use crate::ipc::control::{ControlInbox, ControlMessage, StopEvent};
use crate::ipc::dispatcher::{Inbox, Outbox};
use crossbeam::channel::Sender;
use serde::Serialize;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

pub use dag::{DagController, EdgeKind, StopReport};

/// Trace target for per-iteration timing.
pub const TIMING_TARGET: &str = "larva_vr::timing";

/// A pipeline stage.
pub trait Worker: Send + 'static {
    type Input: Send + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &str;

    /// Runs inside the worker's own context before the loop starts. Hardware
    /// is opened here.
    fn initialize(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called for each control message, between data iterations.
    fn on_control(&mut self, _message: &ControlMessage) -> Result<()> {
        Ok(())
    }

    /// One unit of work. `input` is `None` only when the node runs on timeouts.
    fn work(&mut self, input: Option<Self::Input>) -> Result<Option<Self::Output>>;

    fn cleanup(&mut self) -> Result<()> {
        Ok(())
    }

    /// Worker-specific counters for the run metadata.
    fn summary(&self) -> Option<serde_json::Value> {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Upper bound on a single receive wait.
    pub receive_timeout: Duration,
    /// Call `work(None)` when a receive times out.
    pub work_on_timeout: bool,
    /// Upper bound on working through queued inputs after a stop request.
    pub drain_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_millis(100),
            work_on_timeout: false,
            drain_timeout: Duration::from_secs(1),
        }
    }
}

impl WorkerOptions {
    pub fn ticking(receive_timeout: Duration) -> Self {
        Self {
            receive_timeout,
            work_on_timeout: true,
            ..Default::default()
        }
    }
}

/// Mean and maximum duration of one loop step, microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StepTiming {
    pub mean_us: f64,
    pub max_us: f64,
}

impl StepTiming {
    fn record(&mut self, n: u64, sample: Duration) {
        let us = sample.as_secs_f64() * 1e6;
        self.mean_us += (us - self.mean_us) / n as f64;
        self.max_us = self.max_us.max(us);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingSummary {
    pub receive: StepTiming,
    pub work: StepTiming,
    pub send: StepTiming,
}

/// What a worker reports when its loop ends.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub iterations: u64,
    pub timeouts: u64,
    /// Inputs worked through after the stop request.
    pub drained: u64,
    pub timing: TimingSummary,
    pub error: Option<String>,
    pub summary: Option<serde_json::Value>,
}

/// Handles the runtime passes to a starting worker.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// This node's own stop request.
    pub stop: StopEvent,
    /// DAG-wide fault flag, raised by any node that fails fatally.
    pub fault: StopEvent,
}

/// A type-erased worker ready to run.
pub trait Runnable: Send {
    fn name(&self) -> &str;

    /// Runs the whole lifecycle. The initialization result is sent on
    /// `ready` before the loop starts.
    fn run(self: Box<Self>, ctx: RunContext, ready: Sender<Result<()>>) -> WorkerReport;
}

/// A worker wired to its inbox, outbox and control queue.
pub struct WorkerNode<W, I, O>
where
    W: Worker,
    I: Inbox<Item = W::Input>,
    O: Outbox<Item = W::Output>,
{
    worker: W,
    inbox: I,
    outbox: O,
    control: Option<ControlInbox>,
    options: WorkerOptions,
}

impl<W, I, O> WorkerNode<W, I, O>
where
    W: Worker,
    I: Inbox<Item = W::Input>,
    O: Outbox<Item = W::Output>,
{
    pub fn new(worker: W, inbox: I, outbox: O) -> Self {
        Self {
            worker,
            inbox,
            outbox,
            control: None,
            options: WorkerOptions::default(),
        }
    }

    pub fn with_control(mut self, control: ControlInbox) -> Self {
        self.control = Some(control);
        self
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    fn apply_control(&mut self) -> Result<()> {
        let Some(control) = &self.control else {
            return Ok(());
        };
        for message in control.drain() {
            self.worker.on_control(&message)?;
        }
        Ok(())
    }

    fn iterate(&mut self, ctx: &RunContext, report: &mut WorkerReport) -> Result<()> {
        self.apply_control()?;

        let t0 = Instant::now();
        let input = self.inbox.receive(self.options.receive_timeout, &ctx.stop)?;
        let t1 = Instant::now();
        if input.is_none() {
            report.timeouts += 1;
            if !self.options.work_on_timeout || ctx.stop.is_set() {
                return Ok(());
            }
        }

        let output = self.worker.work(input)?;
        let t2 = Instant::now();
        if let Some(output) = output {
            self.outbox.send(&output)?;
        }
        let t3 = Instant::now();

        report.iterations += 1;
        let n = report.iterations;
        report.timing.receive.record(n, t1 - t0);
        report.timing.work.record(n, t2 - t1);
        report.timing.send.record(n, t3 - t2);
        tracing::trace!(
            target: TIMING_TARGET,
            worker = %self.worker.name(),
            receive_us = (t1 - t0).as_micros() as u64,
            work_us = (t2 - t1).as_micros() as u64,
            send_us = (t3 - t2).as_micros() as u64,
        );
        Ok(())
    }

    /// Works through inputs already queued when the stop came.
    fn drain(&mut self, report: &mut WorkerReport) -> Result<()> {
        let until = Instant::now() + self.options.drain_timeout;
        while Instant::now() < until {
            self.apply_control()?;
            let input = match self.inbox.drain() {
                Ok(Some(input)) => input,
                Ok(None) => return Ok(()),
                Err(err) if err.class() == ErrorClass::Transient => continue,
                Err(err) => return Err(err),
            };
            report.drained += 1;
            match self.worker.work(Some(input)) {
                Ok(Some(output)) => self.outbox.send(&output)?,
                Ok(None) => {}
                Err(err) if err.class() == ErrorClass::Transient => {}
                Err(err) => return Err(err),
            }
        }
        tracing::warn!(worker = %report.name, drained = report.drained, "stopped draining at the deadline");
        Ok(())
    }

    /// The work loop and the drain. Returns the error that ended it, if any.
    fn run_loop(&mut self, ctx: &RunContext, report: &mut WorkerReport) -> Option<VrError> {
        while !ctx.stop.is_set() {
            if let Err(err) = self.iterate(ctx, report) {
                if err.class() == ErrorClass::Transient {
                    tracing::debug!(worker = %report.name, error = %err, "transient failure");
                    continue;
                }
                return Some(err);
            }
        }
        self.drain(report).err()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".into());
    format!("worker panicked: {detail}")
}

impl<W, I, O> Runnable for WorkerNode<W, I, O>
where
    W: Worker,
    I: Inbox<Item = W::Input> + 'static,
    O: Outbox<Item = W::Output> + 'static,
{
    fn name(&self) -> &str {
        self.worker.name()
    }

    fn run(mut self: Box<Self>, ctx: RunContext, ready: Sender<Result<()>>) -> WorkerReport {
        let mut report = WorkerReport {
            name: self.worker.name().to_string(),
            ..Default::default()
        };

        if let Err(err) = self.worker.initialize() {
            tracing::error!(worker = %report.name, error = %err, "initialize failed");
            report.error = Some(err.to_string());
            let _ = ready.send(Err(err));
            return report;
        }
        let _ = ready.send(Ok(()));
        tracing::debug!(worker = %report.name, "worker started");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run_loop(&ctx, &mut report)));
        let failure = match outcome {
            Ok(error) => error.map(|err| err.to_string()),
            Err(payload) => Some(panic_message(payload.as_ref())),
        };
        if let Some(failure) = failure {
            tracing::error!(worker = %report.name, error = %failure, "fatal failure in work loop; stopping");
            report.error = Some(failure);
            ctx.stop.set();
            ctx.fault.set();
        }

        match catch_unwind(AssertUnwindSafe(|| self.worker.cleanup())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(worker = %report.name, error = %err, "cleanup failed");
                report.error.get_or_insert_with(|| err.to_string());
            }
            Err(payload) => {
                let failure = panic_message(payload.as_ref());
                tracing::error!(worker = %report.name, error = %failure, "cleanup panicked");
                report.error.get_or_insert(failure);
                ctx.fault.set();
            }
        }
        report.summary = catch_unwind(AssertUnwindSafe(|| self.worker.summary())).unwrap_or(None);
        tracing::debug!(worker = %report.name, iterations = report.iterations, "worker stopped");
        report
    }
}

/// Wraps a failed worker into the error type the controller returns.
pub(crate) fn worker_panic(name: &str) -> VrError {
    VrError::worker(name, "worker thread panicked")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::Frame;
    use crate::ipc::codec::FrameCodec;
    use crate::ipc::dispatcher::{NullOutbox, Receiver, Ticker};
    use crate::ipc::monitored_queue::{QueueOptions, monitored_queue};
    use crossbeam::channel;
    use image::GrayImage;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Counter {
        seen: u64,
        fail_at: Option<u64>,
    }

    impl Worker for Counter {
        type Input = ();
        type Output = u64;

        fn name(&self) -> &str {
            "counter"
        }

        fn work(&mut self, _input: Option<()>) -> Result<Option<u64>> {
            self.seen += 1;
            if Some(self.seen) == self.fail_at {
                return Err(VrError::worker("counter", "boom"));
            }
            Ok(Some(self.seen))
        }

        fn summary(&self) -> Option<serde_json::Value> {
            Some(serde_json::json!({ "seen": self.seen }))
        }
    }

    struct Failing;

    impl Worker for Failing {
        type Input = ();
        type Output = ();

        fn name(&self) -> &str {
            "camera"
        }

        fn initialize(&mut self) -> Result<()> {
            Err(VrError::camera("no device"))
        }

        fn work(&mut self, _input: Option<()>) -> Result<Option<()>> {
            Ok(None)
        }
    }

    struct Indexing {
        table: Vec<u64>,
        cleaned: Arc<AtomicBool>,
    }

    impl Worker for Indexing {
        type Input = ();
        type Output = u64;

        fn name(&self) -> &str {
            "indexing"
        }

        fn work(&mut self, _input: Option<()>) -> Result<Option<u64>> {
            Ok(Some(self.table[3]))
        }

        fn cleanup(&mut self) -> Result<()> {
            self.cleaned.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Collecting {
        seen: Vec<u64>,
    }

    impl Worker for Collecting {
        type Input = Frame;
        type Output = ();

        fn name(&self) -> &str {
            "collecting"
        }

        fn work(&mut self, input: Option<Frame>) -> Result<Option<()>> {
            if let Some(frame) = input {
                self.seen.push(frame.index);
            }
            Ok(None)
        }

        fn summary(&self) -> Option<serde_json::Value> {
            Some(serde_json::json!({ "seen": self.seen }))
        }
    }

    fn ctx() -> RunContext {
        RunContext {
            stop: StopEvent::new(),
            fault: StopEvent::new(),
        }
    }

    #[test]
    fn fatal_work_error_stops_the_node_and_raises_the_fault() {
        let node = WorkerNode::new(
            Counter {
                seen: 0,
                fail_at: Some(5),
            },
            Ticker::free_running(),
            NullOutbox::new(),
        );
        let (tx, rx) = channel::bounded(1);
        let ctx = ctx();
        let report = Box::new(node).run(ctx.clone(), tx);
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(report.iterations, 4);
        assert!(report.error.unwrap().contains("boom"));
        assert!(ctx.fault.is_set());
        assert_eq!(report.summary.unwrap()["seen"], 5);
    }

    #[test]
    fn initialize_failure_is_reported_before_the_loop() {
        let node = WorkerNode::new(Failing, Ticker::free_running(), NullOutbox::new());
        let (tx, rx) = channel::bounded(1);
        let report = Box::new(node).run(ctx(), tx);
        let err = rx.recv().unwrap().unwrap_err();
        assert_eq!(err.class(), ErrorClass::Hardware);
        assert_eq!(report.iterations, 0);
    }

    #[test]
    fn stop_ends_the_loop_after_the_current_iteration() {
        let node = WorkerNode::new(
            Counter {
                seen: 0,
                fail_at: None,
            },
            Ticker::every(Duration::from_millis(1)),
            NullOutbox::new(),
        );
        let ctx = ctx();
        let stopper = ctx.stop.clone();
        let (tx, _rx) = channel::bounded(1);
        let handle = std::thread::spawn(move || Box::new(node).run(ctx, tx));
        std::thread::sleep(Duration::from_millis(20));
        stopper.set();
        let report = handle.join().unwrap();
        assert!(report.iterations > 0);
        assert!(report.error.is_none());
        assert!(report.timing.work.max_us >= report.timing.work.mean_us);
    }

    #[test]
    fn panic_in_work_raises_the_fault_and_still_cleans_up() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let node = WorkerNode::new(
            Indexing {
                table: Vec::new(),
                cleaned: cleaned.clone(),
            },
            Ticker::free_running(),
            NullOutbox::new(),
        );
        let (tx, rx) = channel::bounded(1);
        let ctx = ctx();
        let report = Box::new(node).run(ctx.clone(), tx);
        assert!(rx.recv().unwrap().is_ok());
        assert!(report.error.unwrap().contains("panicked"));
        assert!(ctx.stop.is_set());
        assert!(ctx.fault.is_set());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn queued_inputs_are_worked_through_after_stop() {
        let (mut writer, reader, monitor) =
            monitored_queue("tracking", FrameCodec::new(2, 2, 1), &QueueOptions::default()).unwrap();
        for i in 0..5 {
            writer.push(&Frame::gray(i, i as i64, GrayImage::new(2, 2))).unwrap();
        }
        let node = WorkerNode::new(
            Collecting { seen: Vec::new() },
            Receiver::poll(vec![reader]),
            NullOutbox::new(),
        );
        let ctx = ctx();
        ctx.stop.set();
        let (tx, _rx) = channel::bounded(1);
        let report = Box::new(node).run(ctx.clone(), tx);
        assert_eq!(report.iterations, 0);
        assert_eq!(report.drained, 5);
        assert_eq!(report.summary.unwrap()["seen"], serde_json::json!([0, 1, 2, 3, 4]));
        assert_eq!(monitor.snapshot().size, 0);
        assert!(!ctx.fault.is_set());
    }
}
