// Copyright (C) 2025, Cloudflare, Inc.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions are
// met:
//
//     * Redistributions of source code must retain the above copyright notice,
//       this list of conditions and the following disclaimer.
//
//     * Redistributions in binary form must reproduce the above copyright
//       notice, this list of conditions and the following disclaimer in the
//       documentation and/or other materials provided with the distribution.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS
// IS" AND ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO,
// THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR
// PURPOSE ARE DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR
// CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL,
// EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO,
// PROCUREMENT OF SUBSTITUTE GOODS OR SERVICES; LOSS OF USE, DATA, OR
// PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF
// LIABILITY, WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING
// NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE USE OF THIS
// SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Quantization of raw per-step measurements into grid observations.
//!
//! A trace is a stream of [`StepEvent`]s: delay samples reported by the
//! receiver, and control steps at which the sender adjusted its window. At
//! every control step the change in window and the change in delay since the
//! previous control step are expressed as log-scaled percentage changes and
//! snapped to the grid steps:
//!
//! ```text
//! wp = snap((round4(w / w_prev) * 100 - 100) * log10(w_prev), window_step)
//! dp = snap((round4(d / d_prev) * 100 - 100) * log10(d_prev), delay_step)
//! ```
//!
//! where `d` is the largest delay sample seen since the previous control
//! step. The first control step of a trace has nothing to compare against,
//! so it only seeds the previous window and delay.

use crate::GridConfig;
use crate::Result;
use crate::StateSpace;

// Delay (in ms) assumed before the first control step of a trace.
const INITIAL_DELAY: f64 = 1.0;

/// A quantized (delay change, window change) pair at one control step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Observation {
    pub delay: f64,
    pub window: f64,
}

impl Observation {
    pub const fn new(delay: f64, window: f64) -> Self {
        Observation { delay, window }
    }

    /// Returns the index of the state this observation falls on.
    pub fn index(&self, space: &StateSpace) -> Result<usize> {
        space.index_of(self.delay, self.window)
    }

    /// Parses a processed trace row, `"<delay> <window>"`.
    ///
    /// Fields may be separated by whitespace or commas. Returns `None` for
    /// malformed rows and rows holding non-finite values.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty());

        let delay: f64 = fields.next()?.parse().ok()?;
        let window: f64 = fields.next()?.parse().ok()?;

        if fields.next().is_some() || !delay.is_finite() || !window.is_finite()
        {
            return None;
        }

        Some(Observation { delay, window })
    }
}

/// One row of a combined sender/receiver log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepEvent {
    /// A delay sample (ms) reported by the receiver at `time` (s).
    Delay { time: f64, delay: f64 },

    /// A control step of the sender at `time` (s), with its current window.
    Control { time: f64, window: f64 },
}

impl StepEvent {
    /// Parses a row of a combined log.
    ///
    /// Receiver rows have 5 comma-separated fields, with the timestamp first
    /// and the delay third. Sender rows have at least 7 fields, with the
    /// timestamp first and the window fifth. Anything else is not an event.
    pub fn parse(line: &str) -> Option<Self> {
        let fields: Vec<&str> = line.trim().split(',').map(str::trim).collect();

        match fields.len() {
            5 => Some(StepEvent::Delay {
                time: fields[0].parse().ok()?,
                delay: fields[2].parse().ok()?,
            }),

            n if n >= 7 => Some(StepEvent::Control {
                time: fields[0].parse().ok()?,
                window: fields[4].parse().ok()?,
            }),

            _ => None,
        }
    }
}

fn round_to(value: f64, step: f64) -> f64 {
    (value / step).round_ties_even() * step
}

fn round4(value: f64) -> f64 {
    (value * 1e4).round_ties_even() / 1e4
}

/// Log-scaled percentage change from `prev` to `current`, snapped to `step`.
pub fn percent_change(prev: f64, current: f64, step: f64) -> f64 {
    round_to((round4(current / prev) * 100.0 - 100.0) * prev.log10(), step)
}

/// Quantizes one control step.
///
/// The result is not checked against the grid bounds: values that fall
/// outside the grid are kept so that a later lookup can report them.
pub fn quantize(
    config: &GridConfig, prev_window: f64, window: f64, prev_delay: f64,
    delay: f64,
) -> Observation {
    Observation {
        delay: percent_change(prev_delay, delay, config.delay.step),
        window: percent_change(prev_window, window, config.window.step),
    }
}

/// Per-trace quantization state.
///
/// Must be fed the events of exactly one trace, in order.
#[derive(Debug)]
pub struct Quantizer {
    config: GridConfig,

    last_window: Option<f64>,

    last_delay: f64,

    last_ack_time: f64,

    // Largest delay sample since the previous control step.
    max_delay: Option<f64>,
}

impl Quantizer {
    pub fn new(config: &GridConfig) -> Self {
        Quantizer {
            config: *config,
            last_window: None,
            last_delay: INITIAL_DELAY,
            last_ack_time: 0.0,
            max_delay: None,
        }
    }

    /// Feeds one event, returning an observation on every control step but
    /// the first.
    pub fn on_event(&mut self, event: StepEvent) -> Option<Observation> {
        match event {
            StepEvent::Delay { time, delay } => {
                self.max_delay =
                    Some(self.max_delay.map_or(delay, |d| d.max(delay)));
                self.last_ack_time = time;

                None
            },

            StepEvent::Control { time, window } => {
                let window = if window == 0.0 { 1.0 } else { window };

                let delay = match self.max_delay.take() {
                    Some(d) => d,

                    // No feedback this step: the delay is at least as long as
                    // the time since the last ack.
                    None => self
                        .last_delay
                        .max((time - self.last_ack_time) * 1000.0),
                };

                let prev_delay = std::mem::replace(&mut self.last_delay, delay);
                let prev_window = self.last_window.replace(window)?;

                Some(quantize(
                    &self.config,
                    prev_window,
                    window,
                    prev_delay,
                    delay,
                ))
            },
        }
    }
}

/// Lazy sequence of the observations of one trace.
///
/// Created by [`observations()`]. Restarting a trace means creating a new
/// sequence over its events.
pub struct Observations<I> {
    events: I,
    quantizer: Quantizer,
}

impl<I> Iterator for Observations<I>
where
    I: Iterator<Item = StepEvent>,
{
    type Item = Observation;

    fn next(&mut self) -> Option<Observation> {
        for event in self.events.by_ref() {
            if let Some(observation) = self.quantizer.on_event(event) {
                return Some(observation);
            }
        }

        None
    }
}

/// Quantizes the events of one trace.
pub fn observations<I>(
    config: &GridConfig, events: I,
) -> Observations<I::IntoIter>
where
    I: IntoIterator<Item = StepEvent>,
{
    Observations {
        events: events.into_iter(),
        quantizer: Quantizer::new(config),
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn control(time: f64, window: f64) -> StepEvent {
        StepEvent::Control { time, window }
    }

    fn delay(time: f64, delay: f64) -> StepEvent {
        StepEvent::Delay { time, delay }
    }

    #[rstest]
    #[case(10.0, 10.0, 2.0, 0.0)]
    #[case(10.0, 20.0, 2.0, 100.0)]
    // 5% of log10(10) is 2.5 steps, which rounds to even.
    #[case(10.0, 10.5, 2.0, 4.0)]
    #[case(10.0, 10.7, 2.0, 8.0)]
    #[case(10.0, 9.5, 2.0, -4.0)]
    #[case(2.0, 1.0, 2.0, -16.0)]
    #[case(1.0, 5.0, 2.0, 0.0)]
    fn percent_changes(
        #[case] prev: f64, #[case] current: f64, #[case] step: f64,
        #[case] expected: f64,
    ) {
        assert_eq!(percent_change(prev, current, step), expected);
    }

    #[test]
    fn first_control_step_is_dropped() {
        let config = GridConfig::default();

        let obs: Vec<_> = observations(&config, [control(0.0, 10.0)]).collect();
        assert!(obs.is_empty());

        let obs: Vec<_> = observations(&config, [
            control(0.0, 10.0),
            delay(0.05, 10.0),
            control(0.1, 10.5),
        ])
        .collect();
        assert_eq!(obs.len(), 1);
    }

    #[test]
    fn delay_is_max_since_previous_step() {
        let config = GridConfig::default();

        let events = [
            control(0.0, 10.0),
            delay(0.01, 10.0),
            control(0.02, 10.0),
            delay(0.03, 12.0),
            delay(0.04, 20.0),
            delay(0.05, 15.0),
            control(0.06, 10.0),
        ];

        let obs: Vec<_> = observations(&config, events).collect();

        // Seeded with the initial 1ms delay, log10(1) flattens the change.
        assert_eq!(obs[0], Observation::new(0.0, 0.0));
        // 10ms -> 20ms doubles the delay.
        assert_eq!(obs[1], Observation::new(100.0, 0.0));
    }

    #[test]
    fn delay_falls_back_to_ack_gap() {
        let config = GridConfig::default();
        let mut q = Quantizer::new(&config);

        assert_eq!(q.on_event(delay(1.0, 10.0)), None);
        assert_eq!(q.on_event(control(1.0, 10.0)), None);

        // 20ms since the last ack with no new delay sample.
        let obs = q.on_event(control(1.02, 10.0)).unwrap();
        assert_eq!(obs.delay, percent_change(10.0, 20.0, 2.0));

        assert_eq!(q.on_event(delay(1.03, 50.0)), None);
        assert!(q.on_event(control(1.03, 10.0)).is_some());

        // 10ms since the last ack is shorter than the previous 50ms delay.
        let obs = q.on_event(control(1.04, 10.0)).unwrap();
        assert_eq!(obs.delay, 0.0);
    }

    #[test]
    fn zero_window_is_one() {
        let config = GridConfig::default();

        let obs: Vec<_> = observations(&config, [
            control(0.0, 0.0),
            control(0.1, 2.0),
            control(0.2, 0.0),
        ])
        .collect();

        assert_eq!(obs[0].window, 0.0);
        assert_eq!(obs[1].window, -16.0);
    }

    #[test]
    fn sequence_restarts() {
        let config = GridConfig::default();
        let events = vec![
            control(0.0, 10.0),
            control(0.1, 20.0),
            control(0.2, 10.0),
        ];

        let first: Vec<_> = observations(&config, events.clone()).collect();
        let second: Vec<_> = observations(&config, events).collect();

        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[rstest]
    #[case("-2 4", Some(Observation::new(-2.0, 4.0)))]
    #[case("0,0", Some(Observation::new(0.0, 0.0)))]
    #[case("  10\t-20 ", Some(Observation::new(10.0, -20.0)))]
    #[case("nan nan", None)]
    #[case("inf 0", None)]
    #[case("2", None)]
    #[case("2 4 6", None)]
    #[case("a b", None)]
    fn parse_observation(
        #[case] line: &str, #[case] expected: Option<Observation>,
    ) {
        assert_eq!(Observation::parse(line), expected);
    }

    #[rstest]
    #[case("1.5,7,12.25,0,0", Some(delay(1.5, 12.25)))]
    #[case("2.0,0,0,0,42,0,0", Some(control(2.0, 42.0)))]
    #[case("2.0,0,0,0,42,0,0,9", Some(control(2.0, 42.0)))]
    #[case("1,2,3", None)]
    #[case("1,2,3,4,5,6", None)]
    #[case("x,7,12.25,0,0", None)]
    fn parse_event(#[case] line: &str, #[case] expected: Option<StepEvent>) {
        assert_eq!(StepEvent::parse(line), expected);
    }
}
