//! Edge detection on noisy boolean signals.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    #[default]
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebounceState {
    /// No stable level observed yet.
    Idle,
    On,
    Off,
}

/// A level becomes stable after `length` consecutive identical samples; the
/// debouncer fires when the stable level changes in the direction of `edge`.
/// The first stable level only arms it: a signal already at the target level
/// when sampling starts has to leave it and come back before it fires.
#[derive(Debug, Clone)]
pub struct Debouncer {
    length: usize,
    edge: Edge,
    fires_from_idle: bool,
    state: DebounceState,
    last_sample: Option<bool>,
    run: usize,
}

impl Debouncer {
    pub fn new(length: usize, edge: Edge) -> Self {
        Self {
            length: length.max(1),
            edge,
            fires_from_idle: false,
            state: DebounceState::Idle,
            last_sample: None,
            run: 0,
        }
    }

    /// Treats leaving `Idle` as an edge. For latched pulses, where any `true`
    /// sample is news.
    pub fn firing_from_idle(mut self) -> Self {
        self.fires_from_idle = true;
        self
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn reset(&mut self) {
        self.state = DebounceState::Idle;
        self.last_sample = None;
        self.run = 0;
    }

    /// Feeds one sample; returns true when the configured edge fires.
    pub fn update(&mut self, sample: bool) -> bool {
        if self.last_sample == Some(sample) {
            self.run += 1;
        } else {
            self.last_sample = Some(sample);
            self.run = 1;
        }
        if self.run < self.length {
            return false;
        }

        let stable = if sample { DebounceState::On } else { DebounceState::Off };
        if stable == self.state {
            return false;
        }
        let previous = self.state;
        self.state = stable;
        match (self.edge, previous, stable) {
            (Edge::Rising, DebounceState::Off, DebounceState::On) => true,
            (Edge::Falling, DebounceState::On, DebounceState::Off) => true,
            (Edge::Rising, DebounceState::Idle, DebounceState::On)
            | (Edge::Falling, DebounceState::Idle, DebounceState::Off) => self.fires_from_idle,
            _ => false,
        }
    }
}
