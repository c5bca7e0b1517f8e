// THEORY:
// The sequencer walks a finite queue of protocol items exactly once. On every
// tick it polls the current item; when that item finishes, the next one is
// started within the same tick, so items that complete immediately (stimulus
// items, zero-length pauses) chain without adding a tick of latency. Every
// command an item emits is returned to the caller in emission order.
//
// Key architectural principles:
// 1.  **Time comes from outside.** The sequencer never reads a clock; the
//     `ProtocolContext` carries `now_ns`. Tests drive it with a manual clock
//     and the protocol worker with the session clock.
// 2.  **One pass.** Finished items are moved to the completed list and never
//     revisited. Once the queue is empty `tick` returns nothing, forever.
// 3.  **Trial length checks happen at load.** `build_protocol` applies the
//     configured `ShortTrialPolicy` to every pause that follows a stimulus.

use crate::error::{Result, VrError};
use crate::protocol::items::{ProtocolContext, ProtocolItem, ProtocolItemSpec};
use crate::stimulus::command::StimulusCommand;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// What to do with a stimulus trial shorter than `min_trial_sec`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortTrialPolicy {
    Allow,
    #[default]
    Warn,
    Reject,
}

/// An item that has run to completion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletedItem {
    pub name: String,
    pub started_ns: i64,
    pub finished_ns: i64,
    /// Configured duration, for items that have one.
    pub duration_sec: Option<f64>,
}

struct Active {
    item: Box<dyn ProtocolItem>,
    started_ns: i64,
}

pub struct ProtocolSequencer {
    pending: VecDeque<Box<dyn ProtocolItem>>,
    current: Option<Active>,
    completed: Vec<CompletedItem>,
    drained_logged: bool,
}

impl ProtocolSequencer {
    pub fn new(items: Vec<Box<dyn ProtocolItem>>) -> Self {
        Self {
            pending: items.into(),
            current: None,
            completed: Vec::new(),
            drained_logged: false,
        }
    }

    /// Runs every item's `initialize` hook.
    pub fn initialize(&mut self) -> Result<()> {
        for item in self.pending.iter_mut() {
            item.initialize()?;
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.current.is_none() && self.pending.is_empty()
    }

    /// Items not started yet.
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn current_name(&self) -> Option<String> {
        self.current.as_ref().map(|a| a.item.name())
    }

    pub fn completed(&self) -> &[CompletedItem] {
        &self.completed
    }

    /// Completed items that had a duration, i.e. pauses.
    pub fn pauses_completed(&self) -> usize {
        self.completed.iter().filter(|c| c.duration_sec.is_some()).count()
    }

    /// Advances the protocol; returns the commands emitted on this tick.
    pub fn tick(&mut self, ctx: &ProtocolContext<'_>) -> Vec<StimulusCommand> {
        let mut commands = Vec::new();
        loop {
            if self.current.is_none() {
                let Some(mut item) = self.pending.pop_front() else {
                    break;
                };
                item.start(ctx.now_ns);
                tracing::debug!(item = %item.name(), now_ns = ctx.now_ns, "protocol item started");
                self.current = Some(Active {
                    item,
                    started_ns: ctx.now_ns,
                });
            }

            let Some(active) = self.current.as_mut() else {
                break;
            };
            let poll = active.item.done(ctx);
            if let Some(command) = poll.command {
                commands.push(command);
            }
            if !poll.finished {
                break;
            }

            if let Some(mut finished) = self.current.take() {
                finished.item.cleanup();
                let name = finished.item.name();
                tracing::info!(item = %name, elapsed_ns = ctx.now_ns - finished.started_ns, "protocol item finished");
                self.completed.push(CompletedItem {
                    name,
                    started_ns: finished.started_ns,
                    finished_ns: ctx.now_ns,
                    duration_sec: finished.item.duration_sec(),
                });
            }
        }

        if self.is_done() && !self.drained_logged {
            self.drained_logged = true;
            tracing::info!(items = self.completed.len(), "protocol queue drained");
        }
        commands
    }

    /// Runs cleanup on the active item and drops the rest unstarted.
    pub fn cleanup(&mut self) {
        if let Some(mut active) = self.current.take() {
            active.item.cleanup();
        }
        for item in self.pending.iter_mut() {
            item.cleanup();
        }
        self.pending.clear();
    }
}

/// Checks trial lengths and builds the runtime items.
pub fn build_protocol(
    specs: &[ProtocolItemSpec],
    policy: ShortTrialPolicy,
    min_trial_sec: f64,
    frame_size: (u32, u32),
) -> Result<ProtocolSequencer> {
    check_trial_lengths(specs, policy, min_trial_sec)?;
    let items = specs
        .iter()
        .map(|spec| spec.build(frame_size))
        .collect::<Result<Vec<_>>>()?;
    Ok(ProtocolSequencer::new(items))
}

/// Applies `policy` to every pause that directly follows a stimulus item.
pub fn check_trial_lengths(specs: &[ProtocolItemSpec], policy: ShortTrialPolicy, min_trial_sec: f64) -> Result<()> {
    for (i, pair) in specs.windows(2).enumerate() {
        let (ProtocolItemSpec::Stimulus(command), ProtocolItemSpec::Pause { duration_sec }) = (&pair[0], &pair[1])
        else {
            continue;
        };
        if *duration_sec >= min_trial_sec {
            continue;
        }
        match policy {
            ShortTrialPolicy::Allow => {}
            ShortTrialPolicy::Warn => tracing::warn!(
                item = i + 1,
                stimulus = %command.kind.name(),
                duration_sec,
                min_trial_sec,
                "stimulus trial is shorter than the minimum"
            ),
            ShortTrialPolicy::Reject => {
                return Err(VrError::protocol(format!(
                    "item {}: {} trial of {duration_sec}s is shorter than the minimum {min_trial_sec}s",
                    i + 1,
                    command.kind.name()
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock, sec_to_ns};

    fn specs(items: &[ProtocolItemSpec]) -> ProtocolSequencer {
        build_protocol(items, ShortTrialPolicy::Allow, 0.0, (64, 64)).unwrap()
    }

    fn pause(duration_sec: f64) -> ProtocolItemSpec {
        ProtocolItemSpec::Pause { duration_sec }
    }

    #[test]
    fn stimulus_items_chain_into_the_following_pause() {
        let clock = ManualClock::new();
        let mut seq = specs(&[
            ProtocolItemSpec::Stimulus(StimulusCommand::dark()),
            pause(5.0),
            ProtocolItemSpec::Stimulus(StimulusCommand::bright()),
            pause(5.0),
        ]);
        seq.initialize().unwrap();

        let ctx = |now_ns| ProtocolContext {
            now_ns,
            ..Default::default()
        };
        assert_eq!(seq.tick(&ctx(clock.now_ns())), vec![StimulusCommand::dark()]);
        assert_eq!(seq.current_name().unwrap(), "Pause(5.000s)");

        clock.advance_sec(4.9);
        assert!(seq.tick(&ctx(clock.now_ns())).is_empty());
        clock.advance_sec(0.1);
        assert_eq!(seq.tick(&ctx(clock.now_ns())), vec![StimulusCommand::bright()]);

        clock.advance_sec(5.0);
        assert!(seq.tick(&ctx(clock.now_ns())).is_empty());
        assert!(seq.is_done());
        assert_eq!(seq.pauses_completed(), 2);
        assert_eq!(seq.completed().len(), 4);
        assert_eq!(seq.completed()[1].finished_ns, sec_to_ns(5.0));
    }

    #[test]
    fn drained_queue_stays_drained() {
        let mut seq = specs(&[ProtocolItemSpec::Stimulus(StimulusCommand::bright())]);
        let ctx = ProtocolContext::default();
        assert_eq!(seq.tick(&ctx).len(), 1);
        for _ in 0..3 {
            assert!(seq.tick(&ctx).is_empty());
        }
        assert_eq!(seq.completed().len(), 1);
    }

    #[test]
    fn software_trigger_holds_the_queue() {
        let mut seq = specs(&[
            ProtocolItemSpec::SoftwareTrigger { debounce: 1 },
            ProtocolItemSpec::Stimulus(StimulusCommand::bright()),
        ]);
        let idle = ProtocolContext::default();
        assert!(seq.tick(&idle).is_empty());
        assert!(seq.tick(&idle).is_empty());
        // The idle ticks settle the debouncer at OFF; a trigger is the rising edge.
        let triggered = ProtocolContext {
            software_trigger: true,
            ..Default::default()
        };
        assert_eq!(seq.tick(&triggered), vec![StimulusCommand::bright()]);
    }

    #[test]
    fn short_trials_follow_the_policy() {
        let items = [ProtocolItemSpec::Stimulus(StimulusCommand::phototaxis(1)), pause(300.0)];
        assert!(check_trial_lengths(&items, ShortTrialPolicy::Warn, 600.0).is_ok());
        assert!(check_trial_lengths(&items, ShortTrialPolicy::Allow, 600.0).is_ok());
        let err = check_trial_lengths(&items, ShortTrialPolicy::Reject, 600.0).unwrap_err();
        assert_eq!(err.exit_code(), 1);
        assert!(check_trial_lengths(&items, ShortTrialPolicy::Reject, 300.0).is_ok());
        // A pause that does not follow a stimulus is not a trial.
        assert!(check_trial_lengths(&[pause(1.0)], ShortTrialPolicy::Reject, 600.0).is_ok());
    }
}
