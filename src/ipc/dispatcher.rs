// THEORY:
// The dispatcher layer decides how a worker talks to several edges at once.
//
// Fan-out (`Dispatcher`):
// 1.  **Broadcast**: every output edge gets a copy. Each reader sees the items
//     in the same order.
// 2.  **Dispatch**: one edge per call, round-robin. No ordering holds across
//     destinations.
//
// Fan-in (`Inbox` implementations):
// 1.  **Poll**: the first input with data wins. The scan starts after the
//     input served last so a busy edge cannot starve the others.
// 2.  **Collect**: one item from each input, in declaration order. Items that
//     arrive before their siblings are held until the set is complete.
// 3.  **Latest**: fresh-biased. Every input is drained and only the newest item
//     (by a caller-supplied key) survives.
// 4.  **Ticker**: no inputs; paces a source worker.
//
// Every receive takes a timeout and honors the stop event; both end the wait
// with `None`, which the worker loop treats as "no work this iteration".

use crate::error::Result;
use crate::ipc::codec::SlotCodec;
use crate::ipc::control::StopEvent;
use crate::ipc::monitored_queue::{PushOutcome, QueueReader, QueueWriter};
use crossbeam::utils::Backoff;
use std::time::{Duration, Instant};

/// Idle sleep once spinning has given up.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOut {
    Broadcast,
    Dispatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanIn {
    Poll,
    Collect,
    Latest,
}

/// Sending side of a worker.
pub trait Outbox: Send {
    type Item;

    fn send(&mut self, item: &Self::Item) -> Result<()>;
}

/// Receiving side of a worker.
pub trait Inbox: Send {
    type Item;

    /// Waits at most `timeout` for the next input; `None` on timeout or stop.
    fn receive(&mut self, timeout: Duration, stop: &StopEvent) -> Result<Option<Self::Item>>;

    /// Takes one input that is already queued, without waiting. Used to empty
    /// the edges after a stop request; sources have nothing to drain.
    fn drain(&mut self) -> Result<Option<Self::Item>> {
        Ok(None)
    }
}

/// Writes to N monitored queues.
pub struct Dispatcher<C: SlotCodec> {
    outputs: Vec<QueueWriter<C>>,
    policy: FanOut,
    next: usize,
}

impl<C: SlotCodec> Dispatcher<C> {
    pub fn new(outputs: Vec<QueueWriter<C>>, policy: FanOut) -> Self {
        Self {
            outputs,
            policy,
            next: 0,
        }
    }

    pub fn policy(&self) -> FanOut {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    /// Non-blocking send. Returns how many edges had to overwrite.
    pub fn send_item(&mut self, item: &C::Item) -> Result<usize> {
        if self.outputs.is_empty() {
            return Ok(0);
        }
        match self.policy {
            FanOut::Broadcast => {
                let mut overwrote = 0;
                for output in &mut self.outputs {
                    if output.push(item)? == PushOutcome::Overwrote {
                        overwrote += 1;
                    }
                }
                Ok(overwrote)
            }
            FanOut::Dispatch => {
                let index = self.next % self.outputs.len();
                self.next = (index + 1) % self.outputs.len();
                let outcome = self.outputs[index].push(item)?;
                Ok(usize::from(outcome == PushOutcome::Overwrote))
            }
        }
    }
}

impl<C: SlotCodec> Outbox for Dispatcher<C> {
    type Item = C::Item;

    fn send(&mut self, item: &C::Item) -> Result<()> {
        self.send_item(item).map(|_| ())
    }
}

/// Outbox of a sink worker.
#[derive(Debug, Default)]
pub struct NullOutbox<T> {
    _marker: std::marker::PhantomData<fn(T)>,
}

impl<T> NullOutbox<T> {
    pub fn new() -> Self {
        Self {
            _marker: std::marker::PhantomData,
        }
    }
}

impl<T> Outbox for NullOutbox<T> {
    type Item = T;

    fn send(&mut self, _item: &T) -> Result<()> {
        Ok(())
    }
}

/// Spin, then snooze, then sleep until `ready` holds, the deadline passes or
/// stop is requested. Returns whether `ready` held.
fn wait_until(deadline: Instant, stop: &StopEvent, mut ready: impl FnMut() -> bool) -> bool {
    let backoff = Backoff::new();
    loop {
        if ready() {
            return true;
        }
        if stop.is_set() || Instant::now() >= deadline {
            return false;
        }
        if backoff.is_completed() {
            std::thread::sleep(IDLE_SLEEP.min(deadline.saturating_duration_since(Instant::now())));
        } else {
            backoff.snooze();
        }
    }
}

/// POLL and LATEST fan-in over N queues.
pub struct Receiver<C: SlotCodec> {
    inputs: Vec<QueueReader<C>>,
    policy: FanIn,
    cursor: usize,
    freshness: fn(&C::Item) -> u64,
    superseded: u64,
}

impl<C: SlotCodec> Receiver<C> {
    pub fn poll(inputs: Vec<QueueReader<C>>) -> Self {
        Self {
            inputs,
            policy: FanIn::Poll,
            cursor: 0,
            freshness: |_| 0,
            superseded: 0,
        }
    }

    /// Fresh-biased receiver; `freshness` orders items across inputs.
    pub fn latest(inputs: Vec<QueueReader<C>>, freshness: fn(&C::Item) -> u64) -> Self {
        Self {
            inputs,
            policy: FanIn::Latest,
            cursor: 0,
            freshness,
            superseded: 0,
        }
    }

    pub fn policy(&self) -> FanIn {
        self.policy
    }

    /// Items discarded because a newer one was ready.
    pub fn superseded(&self) -> u64 {
        self.superseded
    }

    fn try_poll(&mut self) -> Result<Option<C::Item>> {
        let n = self.inputs.len();
        for offset in 0..n {
            let i = (self.cursor + offset) % n;
            if !self.inputs[i].has_data() {
                continue;
            }
            if let Some(item) = self.inputs[i].try_pop()? {
                self.cursor = (i + 1) % n;
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    fn try_latest(&mut self) -> Result<Option<C::Item>> {
        let mut best: Option<C::Item> = None;
        for input in &mut self.inputs {
            if let Some((item, skipped)) = input.pop_latest()? {
                self.superseded += skipped;
                best = match best {
                    Some(current) if (self.freshness)(&current) >= (self.freshness)(&item) => {
                        self.superseded += 1;
                        Some(current)
                    }
                    Some(_) => {
                        self.superseded += 1;
                        Some(item)
                    }
                    None => Some(item),
                };
            }
        }
        Ok(best)
    }
}

impl<C: SlotCodec> Inbox for Receiver<C> {
    type Item = C::Item;

    fn receive(&mut self, timeout: Duration, stop: &StopEvent) -> Result<Option<C::Item>> {
        if self.inputs.is_empty() {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let got = match self.policy {
                FanIn::Latest => self.try_latest()?,
                FanIn::Poll | FanIn::Collect => self.try_poll()?,
            };
            if got.is_some() {
                return Ok(got);
            }
            let inputs = &self.inputs;
            if !wait_until(deadline, stop, || inputs.iter().any(|q| q.has_data())) {
                return Ok(None);
            }
        }
    }

    fn drain(&mut self) -> Result<Option<C::Item>> {
        match self.policy {
            FanIn::Latest => self.try_latest(),
            FanIn::Poll | FanIn::Collect => self.try_poll(),
        }
    }
}

/// COLLECT fan-in: one item per input, in declaration order.
pub struct Collector<C: SlotCodec> {
    inputs: Vec<QueueReader<C>>,
    pending: Vec<Option<C::Item>>,
}

impl<C: SlotCodec> Collector<C> {
    pub fn new(inputs: Vec<QueueReader<C>>) -> Self {
        let pending = inputs.iter().map(|_| None).collect();
        Self { inputs, pending }
    }

    /// Inputs that already delivered their item for the current set.
    pub fn pending_count(&self) -> usize {
        self.pending.iter().filter(|p| p.is_some()).count()
    }

    fn fill(&mut self) -> Result<bool> {
        for (input, slot) in self.inputs.iter_mut().zip(self.pending.iter_mut()) {
            if slot.is_none() {
                *slot = input.try_pop()?;
            }
        }
        Ok(self.pending.iter().all(Option::is_some))
    }
}

impl<C: SlotCodec> Inbox for Collector<C> {
    type Item = Vec<C::Item>;

    fn receive(&mut self, timeout: Duration, stop: &StopEvent) -> Result<Option<Vec<C::Item>>> {
        if self.inputs.is_empty() {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.fill()? {
                return Ok(Some(self.pending.iter_mut().filter_map(Option::take).collect()));
            }
            let (inputs, pending) = (&self.inputs, &self.pending);
            let waiting = || {
                inputs
                    .iter()
                    .zip(pending.iter())
                    .any(|(q, p)| p.is_none() && q.has_data())
            };
            if !wait_until(deadline, stop, waiting) {
                return Ok(None);
            }
        }
    }

    /// Only complete sets leave; a partial set stays in the edges.
    fn drain(&mut self) -> Result<Option<Vec<C::Item>>> {
        if !self.inputs.is_empty() && self.fill()? {
            return Ok(Some(self.pending.iter_mut().filter_map(Option::take).collect()));
        }
        Ok(None)
    }
}

/// Input of a source worker: yields `()` on a fixed period, or immediately
/// when free-running.
#[derive(Debug)]
pub struct Ticker {
    period: Option<Duration>,
    next: Option<Instant>,
}

impl Ticker {
    pub fn free_running() -> Self {
        Self {
            period: None,
            next: None,
        }
    }

    pub fn every(period: Duration) -> Self {
        Self {
            period: Some(period),
            next: None,
        }
    }
}

impl Inbox for Ticker {
    type Item = ();

    fn receive(&mut self, timeout: Duration, stop: &StopEvent) -> Result<Option<()>> {
        if stop.is_set() {
            return Ok(None);
        }
        let Some(period) = self.period else {
            return Ok(Some(()));
        };
        let now = Instant::now();
        let due = *self.next.get_or_insert(now);
        if due > now {
            let wait = due - now;
            if wait > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(wait);
        }
        // Skip missed ticks instead of bursting to catch up.
        let mut next = due + period;
        let now = Instant::now();
        while next <= now {
            next += period;
        }
        self.next = Some(next);
        Ok(Some(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::frame::Frame;
    use crate::ipc::codec::FrameCodec;
    use crate::ipc::monitored_queue::{QueueOptions, monitored_queue};
    use image::GrayImage;

    fn edges(n: usize) -> (Vec<QueueWriter<FrameCodec>>, Vec<QueueReader<FrameCodec>>) {
        (0..n)
            .map(|i| {
                let (tx, rx, _) = monitored_queue(
                    &format!("edge_{i}"),
                    FrameCodec::new(2, 2, 1),
                    &QueueOptions::default(),
                )
                .unwrap();
                (tx, rx)
            })
            .unzip()
    }

    fn frame(index: u64) -> Frame {
        Frame::gray(index, index as i64, GrayImage::new(2, 2))
    }

    #[test]
    fn broadcast_copies_to_every_edge_in_order() {
        let (writers, mut readers) = edges(3);
        let mut out = Dispatcher::new(writers, FanOut::Broadcast);
        for i in 0..4 {
            out.send(&frame(i)).unwrap();
        }
        for reader in &mut readers {
            let got: Vec<u64> = std::iter::from_fn(|| reader.try_pop().unwrap())
                .map(|f| f.index)
                .collect();
            assert_eq!(got, vec![0, 1, 2, 3]);
        }
    }

    #[test]
    fn dispatch_is_round_robin() {
        let (writers, mut readers) = edges(2);
        let mut out = Dispatcher::new(writers, FanOut::Dispatch);
        for i in 0..4 {
            out.send(&frame(i)).unwrap();
        }
        let first: Vec<u64> = std::iter::from_fn(|| readers[0].try_pop().unwrap())
            .map(|f| f.index)
            .collect();
        let second: Vec<u64> = std::iter::from_fn(|| readers[1].try_pop().unwrap())
            .map(|f| f.index)
            .collect();
        assert_eq!(first, vec![0, 2]);
        assert_eq!(second, vec![1, 3]);
    }

    #[test]
    fn poll_returns_none_after_deadline() {
        let (_writers, readers) = edges(2);
        let mut inbox = Receiver::poll(readers);
        let start = Instant::now();
        let got = inbox
            .receive(Duration::from_millis(20), &StopEvent::new())
            .unwrap();
        assert!(got.is_none());
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn poll_alternates_between_busy_inputs() {
        let (mut writers, readers) = edges(2);
        for i in 0..3 {
            writers[0].push(&frame(i)).unwrap();
            writers[1].push(&frame(100 + i)).unwrap();
        }
        let mut inbox = Receiver::poll(readers);
        let stop = StopEvent::new();
        let got: Vec<u64> = (0..4)
            .map(|_| inbox.receive(Duration::from_millis(5), &stop).unwrap().unwrap().index)
            .collect();
        assert_eq!(got, vec![0, 100, 1, 101]);
    }

    #[test]
    fn collect_holds_partial_sets() {
        let (mut writers, readers) = edges(2);
        let mut inbox = Collector::new(readers);
        let stop = StopEvent::new();
        writers[0].push(&frame(1)).unwrap();
        assert!(inbox.receive(Duration::from_millis(5), &stop).unwrap().is_none());
        assert_eq!(inbox.pending_count(), 1);
        writers[1].push(&frame(2)).unwrap();
        let set = inbox.receive(Duration::from_millis(5), &stop).unwrap().unwrap();
        assert_eq!(set.iter().map(|f| f.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn latest_is_fresh_biased_across_inputs() {
        let (mut writers, readers) = edges(2);
        writers[0].push(&frame(5)).unwrap();
        writers[0].push(&frame(7)).unwrap();
        writers[1].push(&frame(6)).unwrap();
        let mut inbox = Receiver::latest(readers, |f| f.index);
        let got = inbox
            .receive(Duration::from_millis(5), &StopEvent::new())
            .unwrap()
            .unwrap();
        assert_eq!(got.index, 7);
        assert_eq!(inbox.superseded(), 2);
    }

    #[test]
    fn drain_takes_only_what_is_already_queued() {
        let (mut writers, readers) = edges(2);
        writers[0].push(&frame(1)).unwrap();
        writers[1].push(&frame(2)).unwrap();
        let mut inbox = Receiver::poll(readers);
        let start = Instant::now();
        let mut got: Vec<u64> = std::iter::from_fn(|| inbox.drain().unwrap())
            .map(|f| f.index)
            .collect();
        got.sort();
        assert_eq!(got, vec![1, 2]);
        assert!(start.elapsed() < Duration::from_millis(50));
        assert!(Ticker::free_running().drain().unwrap().is_none());
    }

    #[test]
    fn stop_interrupts_a_wait() {
        let (_writers, readers) = edges(1);
        let mut inbox = Receiver::poll(readers);
        let stop = StopEvent::new();
        stop.set();
        let start = Instant::now();
        assert!(inbox.receive(Duration::from_secs(5), &stop).unwrap().is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn ticker_paces_to_its_period() {
        let mut ticker = Ticker::every(Duration::from_millis(10));
        let stop = StopEvent::new();
        let start = Instant::now();
        for _ in 0..3 {
            assert!(ticker.receive(Duration::from_millis(50), &stop).unwrap().is_some());
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
    }
}
