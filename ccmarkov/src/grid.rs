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

//! Discretized (delay, window) state space.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

// Fraction of a step by which a value may miss a grid point and still be
// considered on it. Absorbs the error of decimal round-trips through text.
const GRID_TOLERANCE: f64 = 1e-9;

/// One dimension of the grid: `min`, `min + step`, ..., `max`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl Axis {
    pub const fn new(min: f64, max: f64, step: f64) -> Self {
        Axis { min, max, step }
    }

    fn validate(&self, name: &str) -> Result<()> {
        if !self.step.is_finite() || self.step <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "{name} step must be positive, got {}",
                self.step
            )));
        }

        if !self.min.is_finite() || !self.max.is_finite() || self.max < self.min
        {
            return Err(Error::InvalidConfig(format!(
                "{name} range [{}, {}] is empty or not finite",
                self.min, self.max
            )));
        }

        let steps = (self.max - self.min) / self.step;
        if (steps - steps.round()).abs() > GRID_TOLERANCE {
            return Err(Error::InvalidConfig(format!(
                "{name} range [{}, {}] is not a whole number of {} steps",
                self.min, self.max, self.step
            )));
        }

        Ok(())
    }

    /// Number of grid points along this axis.
    pub fn len(&self) -> usize {
        ((self.max - self.min) / self.step).round() as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self, position: usize) -> f64 {
        self.min + position as f64 * self.step
    }

    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(move |i| self.value(i))
    }

    /// Returns the position of `value` on this axis, if it is a grid point.
    pub fn position(&self, value: f64) -> Option<usize> {
        let offset = (value - self.min) / self.step;
        if !offset.is_finite() {
            return None;
        }

        let rounded = offset.round();
        if (offset - rounded).abs() > GRID_TOLERANCE {
            return None;
        }

        if rounded < 0.0 || rounded as usize >= self.len() {
            return None;
        }

        Some(rounded as usize)
    }
}

/// Bounds and steps of both grid dimensions.
///
/// The configuration is constructed once and handed to every component that
/// needs the grid geometry. Training and plotting may use different grids, so
/// nothing about the grid is global.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    /// Delay-ratio percentage change buckets.
    pub delay: Axis,

    /// Window-ratio percentage change buckets.
    pub window: Axis,
}

impl Default for GridConfig {
    fn default() -> Self {
        GridConfig {
            delay: Axis::new(-10.0, 10.0, 2.0),
            window: Axis::new(-20.0, 20.0, 2.0),
        }
    }
}

impl GridConfig {
    /// Loads a grid configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: GridConfig = serde_json::from_reader(reader)?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.delay.validate("delay")?;
        self.window.validate("window")
    }
}

/// The set of states of the chain.
///
/// States are enumerated delay-major, window-minor: index `d * |windows| + w`
/// is the state at delay position `d` and window position `w`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StateSpace {
    config: GridConfig,
    delays: usize,
    windows: usize,
}

impl StateSpace {
    pub fn new(config: GridConfig) -> Result<Self> {
        config.validate()?;

        Ok(StateSpace {
            config,
            delays: config.delay.len(),
            windows: config.window.len(),
        })
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    /// Total number of states.
    pub fn len(&self) -> usize {
        self.delays * self.windows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn num_delays(&self) -> usize {
        self.delays
    }

    pub fn num_windows(&self) -> usize {
        self.windows
    }

    pub fn delays(&self) -> impl Iterator<Item = f64> + '_ {
        self.config.delay.values()
    }

    pub fn windows(&self) -> impl Iterator<Item = f64> + '_ {
        self.config.window.values()
    }

    /// All states as `(delay, window)` pairs, in index order.
    pub fn enumerate_states(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        (0..self.len()).map(move |i| self.coordinates(i))
    }

    /// Returns the index of the state at `(delay, window)`.
    pub fn index_of(&self, delay: f64, window: f64) -> Result<usize> {
        match (
            self.config.delay.position(delay),
            self.config.window.position(window),
        ) {
            (Some(d), Some(w)) => Ok(d * self.windows + w),

            _ => Err(Error::OutOfRange { delay, window }),
        }
    }

    /// Returns the `(delay, window)` coordinates of state `index`.
    pub fn state(&self, index: usize) -> Option<(f64, f64)> {
        (index < self.len()).then(|| self.coordinates(index))
    }

    fn coordinates(&self, index: usize) -> (f64, f64) {
        (
            self.config.delay.value(index / self.windows),
            self.config.window.value(index % self.windows),
        )
    }
}
