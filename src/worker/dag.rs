// THEORY:
// The DAG controller owns the graph of workers and edges and nothing else. It
// never touches items on the data path.
//
// Key architectural principles:
// 1.  **Registration before start.** Workers and edges are registered first.
//     `connect_data` creates the monitored ring for an edge and hands both ends
//     back so the caller can wire them into nodes; `connect_metadata` hands out
//     a control sender. Edges are recorded by worker name so the controller can
//     order the graph.
// 2.  **Consumers first.** `start` spawns workers in reverse topological order
//     and waits for each one's `initialize` before spawning the next. If any
//     initialization fails, the ones already running are torn down and the
//     error is returned; a camera that cannot open never starts producing into
//     a half-built graph.
// 3.  **Producers stop first.** `stop` signals workers in topological order
//     and joins them against one global deadline. Threads cannot be killed, so
//     workers still running at the deadline are detached and reported as
//     stragglers, which the binary turns into a forced-shutdown exit code.
// 4.  **Statistics on the way out.** Every edge's counters are logged and
//     returned in the `StopReport`.

use super::{RunContext, Runnable, WorkerReport, worker_panic};
use crate::error::{Result, VrError};
use crate::ipc::codec::SlotCodec;
use crate::ipc::control::{ControlBus, ControlInbox, ControlSender, StopEvent};
use crate::ipc::monitored_queue::{
    EdgeMonitor, QueueOptions, QueueReader, QueueStats, QueueWriter, monitored_queue,
};
use crossbeam::channel::{self, RecvTimeoutError};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

const DEFAULT_INIT_TIMEOUT: Duration = Duration::from_secs(10);
const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Data,
    Metadata,
}

#[derive(Debug, Clone)]
struct Edge {
    from: String,
    to: String,
    kind: EdgeKind,
    monitor: Option<EdgeMonitor>,
}

struct Running {
    name: String,
    stop: StopEvent,
    handle: JoinHandle<WorkerReport>,
}

/// Outcome of `DagController::stop`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StopReport {
    pub workers: Vec<WorkerReport>,
    pub stragglers: Vec<String>,
    pub edges: Vec<QueueStats>,
}

impl StopReport {
    pub fn forced(&self) -> bool {
        !self.stragglers.is_empty()
    }

    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers.iter().filter(|w| w.error.is_some())
    }

    /// Items that entered an edge and never reached its consumer: overwritten
    /// or refused, left queued at shutdown, or undecodable.
    pub fn total_dropped(&self) -> u64 {
        self.edges.iter().map(QueueStats::lost).sum()
    }
}

/// Registry and lifecycle owner of a worker graph.
pub struct DagController {
    pending: Vec<Box<dyn Runnable>>,
    names: Vec<String>,
    edges: Vec<Edge>,
    control: ControlBus,
    inboxes: HashMap<String, ControlInbox>,
    fault: StopEvent,
    running: Vec<Running>,
    order: Vec<String>,
    init_timeout: Duration,
}

impl Default for DagController {
    fn default() -> Self {
        Self::new()
    }
}

impl DagController {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            names: Vec::new(),
            edges: Vec::new(),
            control: ControlBus::new(),
            inboxes: HashMap::new(),
            fault: StopEvent::new(),
            running: Vec::new(),
            order: Vec::new(),
            init_timeout: DEFAULT_INIT_TIMEOUT,
        }
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    /// Creates the monitored edge `from -> to`.
    pub fn connect_data<C: SlotCodec>(
        &mut self,
        from: &str,
        to: &str,
        label: &str,
        codec: C,
        options: &QueueOptions,
    ) -> Result<(QueueWriter<C>, QueueReader<C>)> {
        let name = format!("{label}[{from}->{to}]");
        if self.edges.iter().any(|e| e.monitor.as_ref().is_some_and(|m| m.name() == name)) {
            return Err(VrError::Graph(format!("edge {name} registered twice")));
        }
        let (writer, reader, monitor) = monitored_queue(&name, codec, options)?;
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            kind: EdgeKind::Data,
            monitor: Some(monitor),
        });
        Ok((writer, reader))
    }

    /// Creates the lossless control edge `from -> to`.
    pub fn connect_metadata(&mut self, from: &str, to: &str) -> Result<ControlSender> {
        if !self.inboxes.contains_key(to) && self.control.sender(to).is_none() {
            let inbox = self.control.register(to);
            self.inboxes.insert(to.to_string(), inbox);
        }
        self.edges.push(Edge {
            from: from.to_string(),
            to: to.to_string(),
            kind: EdgeKind::Metadata,
            monitor: None,
        });
        self.control
            .sender(to)
            .ok_or_else(|| VrError::Graph(format!("no control queue for {to}")))
    }

    /// The control inbox a worker named `name` should be built with.
    pub fn control_inbox(&mut self, name: &str) -> ControlInbox {
        match self.inboxes.remove(name) {
            Some(inbox) => inbox,
            None => self.control.register(name),
        }
    }

    /// Bus reaching every worker that took a control inbox.
    pub fn control_bus(&self) -> &ControlBus {
        &self.control
    }

    pub fn add_worker<R: Runnable + 'static>(&mut self, node: R) -> Result<()> {
        let name = node.name().to_string();
        if self.names.contains(&name) {
            return Err(VrError::Graph(format!("worker {name} registered twice")));
        }
        self.names.push(name);
        self.pending.push(Box::new(node));
        Ok(())
    }

    pub fn workers(&self) -> &[String] {
        &self.names
    }

    /// Raised when a worker fails fatally.
    pub fn fault(&self) -> &StopEvent {
        &self.fault
    }

    pub fn edge_monitors(&self) -> Vec<EdgeMonitor> {
        self.edges.iter().filter_map(|e| e.monitor.clone()).collect()
    }

    pub fn edge_stats(&self) -> Vec<QueueStats> {
        self.edges
            .iter()
            .filter_map(|e| e.monitor.as_ref().map(EdgeMonitor::snapshot))
            .collect()
    }

    /// Kahn's algorithm over both edge kinds; producers come first.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let index: HashMap<&str, usize> = self
            .names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        let mut indegree = vec![0usize; self.names.len()];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); self.names.len()];
        for edge in &self.edges {
            let (Some(&from), Some(&to)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
            else {
                return Err(VrError::Graph(format!(
                    "{:?} edge {} -> {} references an unregistered worker",
                    edge.kind, edge.from, edge.to
                )));
            };
            successors[from].push(to);
            indegree[to] += 1;
        }

        let mut queue: VecDeque<usize> = (0..self.names.len()).filter(|&i| indegree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.names.len());
        while let Some(node) = queue.pop_front() {
            order.push(self.names[node].clone());
            for &next in &successors[node] {
                indegree[next] -= 1;
                if indegree[next] == 0 {
                    queue.push_back(next);
                }
            }
        }
        if order.len() != self.names.len() {
            return Err(VrError::Graph("worker graph has a cycle".into()));
        }
        Ok(order)
    }

    /// Spawns every registered worker, consumers first.
    pub fn start(&mut self) -> Result<()> {
        let order = self.topological_order()?;
        let mut nodes: HashMap<String, Box<dyn Runnable>> = self
            .pending
            .drain(..)
            .map(|n| (n.name().to_string(), n))
            .collect();

        for name in order.iter().rev() {
            let Some(node) = nodes.remove(name) else {
                continue;
            };
            let ctx = RunContext {
                stop: StopEvent::new(),
                fault: self.fault.clone(),
            };
            let stop = ctx.stop.clone();
            let (ready_tx, ready_rx) = channel::bounded(1);
            let handle = std::thread::Builder::new()
                .name(name.clone())
                .spawn(move || node.run(ctx, ready_tx))?;

            let outcome = match ready_rx.recv_timeout(self.init_timeout) {
                Ok(result) => result,
                Err(RecvTimeoutError::Timeout) => Err(VrError::worker(name.as_str(), "initialize timed out")),
                Err(RecvTimeoutError::Disconnected) => Err(worker_panic(name)),
            };
            self.running.push(Running {
                name: name.clone(),
                stop,
                handle,
            });
            if let Err(err) = outcome {
                tracing::error!(worker = %name, error = %err, "start aborted; tearing down started workers");
                self.order = order.clone();
                let _ = self.stop(self.init_timeout);
                return Err(err);
            }
            tracing::info!(worker = %name, "worker initialized");
        }
        self.order = order;
        Ok(())
    }

    /// Signals workers in topological order and joins them against `deadline`.
    pub fn stop(&mut self, deadline: Duration) -> StopReport {
        let until = Instant::now() + deadline;
        let mut running: HashMap<String, Running> =
            self.running.drain(..).map(|r| (r.name.clone(), r)).collect();
        let mut report = StopReport::default();

        for name in &self.order {
            let Some(worker) = running.remove(name) else {
                continue;
            };
            worker.stop.set();
            while !worker.handle.is_finished() && Instant::now() < until {
                std::thread::sleep(JOIN_POLL);
            }
            if worker.handle.is_finished() {
                match worker.handle.join() {
                    Ok(worker_report) => report.workers.push(worker_report),
                    Err(_) => {
                        let err = worker_panic(name);
                        tracing::error!(worker = %name, error = %err, "worker panicked");
                        report.workers.push(WorkerReport {
                            name: name.clone(),
                            error: Some(err.to_string()),
                            ..Default::default()
                        });
                    }
                }
            } else {
                tracing::warn!(worker = %name, "worker missed the stop deadline; detaching");
                report.stragglers.push(name.clone());
            }
        }

        report.edges = self.edge_stats();
        for stats in &report.edges {
            tracing::info!(target: "larva_vr::stats", "{stats}");
        }
        if report.forced() {
            tracing::warn!(stragglers = ?report.stragglers, "forced shutdown");
        }
        report
    }
}
