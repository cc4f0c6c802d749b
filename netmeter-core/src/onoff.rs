// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! On/off event schedule materialization, per spec.md §3 TrafficSpec and §9
//! design notes: "the implementation should materialize the schedule as a
//! queue of absolute deadlines at flow start; repeat mode converts a pair of
//! deltas into an infinite repeating sequence."

use crate::randomvar::RandomVariable;
use std::collections::VecDeque;
use std::time::Duration;

/// One configured on/off event, as decoded from an `AddFlow` message
/// (spec.md §4.1 OnOffEvent entries).
#[derive(Clone, Copy, Debug)]
pub struct OnOffEvent {
    pub value: RandomVariable,
    pub relative_time: bool,
    pub repeat: bool,
}

/// A materialized, ready-to-consume schedule of absolute microsecond
/// deadlines at which the flow's output status flips. Built once at flow
/// start from the configured [`OnOffEvent`] list.
#[derive(Debug, Default)]
pub struct Schedule {
    deadlines: VecDeque<u64>,
    repeat_deltas: Option<VecDeque<u64>>,
    repeat_cursor: usize,
    repeat_base: u64,
}

impl Schedule {
    /// Materializes a schedule starting at `time_base` (microseconds),
    /// drawing each event's duration from its random variable.
    pub fn materialize(events: &[OnOffEvent], time_base: u64, rng: &mut impl rand::Rng) -> Self {
        let mut deadlines = VecDeque::new();
        let mut absolute = time_base;
        let mut repeat_deltas = None;

        for (idx, event) in events.iter().enumerate() {
            let draw_micros = (event.value.draw(rng).max(0.0) * 1e6) as u64;
            absolute = if event.relative_time {
                absolute.saturating_add(draw_micros)
            } else {
                time_base.saturating_add(draw_micros)
            };
            deadlines.push_back(absolute);

            if event.repeat && idx == events.len() - 1 {
                // The last event in a repeat-marked schedule seeds an
                // infinite repetition of the deltas seen so far.
                let mut deltas = VecDeque::new();
                let mut prev = time_base;
                for &d in deadlines.iter() {
                    deltas.push_back(d.saturating_sub(prev));
                    prev = d;
                }
                repeat_deltas = Some(deltas);
            }
        }

        Self {
            deadlines,
            repeat_deltas,
            repeat_cursor: 0,
            repeat_base: absolute,
        }
    }

    /// The next scheduled absolute deadline, or `None` if the schedule is
    /// exhausted and not repeating.
    pub fn peek(&self) -> Option<u64> {
        self.deadlines.front().copied()
    }

    /// Pops the next deadline, refilling from the repeat cycle if
    /// configured.
    pub fn pop(&mut self) -> Option<u64> {
        let popped = self.deadlines.pop_front();
        if self.deadlines.is_empty() {
            if let Some(deltas) = &self.repeat_deltas {
                if !deltas.is_empty() {
                    let delta = deltas[self.repeat_cursor % deltas.len()];
                    self.repeat_cursor += 1;
                    self.repeat_base = self.repeat_base.saturating_add(delta);
                    self.deadlines.push_back(self.repeat_base);
                }
            }
        }
        popped
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

pub fn parse_event_spec(token: &str, relative: bool, repeat: bool) -> Option<OnOffEvent> {
    let value = if let Some(rest) = token.strip_prefix("const") {
        RandomVariable::constant(rest.parse().ok()?)
    } else if let Some(rest) = token.strip_prefix("exp") {
        RandomVariable::exponential(rest.parse().ok()?)
    } else if let Some(rest) = token.strip_prefix("uniform") {
        let (lo, hi) = rest.split_once(',')?;
        RandomVariable::uniform(lo.parse().ok()?, hi.parse().ok()?)
    } else if let Some(rest) = token.strip_prefix("pareto") {
        let (m, k) = rest.split_once(',')?;
        RandomVariable::pareto(m.parse().ok()?, k.parse().ok()?)
    } else {
        RandomVariable::constant(token.parse().ok()?)
    };

    Some(OnOffEvent {
        value,
        relative_time: relative,
        repeat,
    })
}

/// Converts a microsecond duration into a `Duration`, saturating.
pub fn micros_to_duration(micros: u64) -> Duration {
    Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn materializes_absolute_then_relative() {
        let events = [
            OnOffEvent {
                value: RandomVariable::constant(1.0),
                relative_time: true,
                repeat: false,
            },
            OnOffEvent {
                value: RandomVariable::constant(2.0),
                relative_time: true,
                repeat: false,
            },
        ];
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let mut sched = Schedule::materialize(&events, 1_000_000, &mut rng);
        assert_eq!(sched.pop(), Some(2_000_000));
        assert_eq!(sched.pop(), Some(4_000_000));
        assert!(sched.is_empty());
    }

    #[test]
    fn repeat_cycles_forever() {
        let events = [OnOffEvent {
            value: RandomVariable::constant(1.0),
            relative_time: true,
            repeat: true,
        }];
        let mut rng = rand::rngs::StdRng::seed_from_u64(0);
        let mut sched = Schedule::materialize(&events, 0, &mut rng);
        let first = sched.pop().unwrap();
        for _ in 0..5 {
            assert!(!sched.is_empty());
            sched.pop();
        }
        assert_eq!(first, 1_000_000);
    }
}
