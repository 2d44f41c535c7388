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

//! Probability distributions over states, and their diagnostics.

use std::ops::Index;

use crate::StateSpace;

/// Probability mass whose smallest supporting state set is reported as the
/// effective support of a model.
pub const SUPPORT_MASS: f64 = 0.99;

/// A probability vector indexed by state.
#[derive(Clone, Debug, PartialEq)]
pub struct Distribution {
    probs: Vec<f64>,
}

/// One state and its probability.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TopState {
    pub index: usize,
    pub delay: f64,
    pub window: f64,
    pub probability: f64,
}

/// Distribution of each grid dimension on its own.
#[derive(Clone, Debug, PartialEq)]
pub struct Marginals {
    /// Probability of each delay bucket.
    pub delay: Vec<f64>,

    /// Probability of each window bucket.
    pub window: Vec<f64>,

    pub expected_delay: f64,

    pub expected_window: f64,
}

impl Distribution {
    pub fn new(probs: Vec<f64>) -> Self {
        Distribution { probs }
    }

    /// All mass on `state`.
    pub fn point_mass(states: usize, state: usize) -> Self {
        let mut probs = vec![0.0; states];
        probs[state] = 1.0;

        Distribution { probs }
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.probs
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        self.probs.iter().copied()
    }

    pub fn min(&self) -> f64 {
        self.iter().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.iter().fold(f64::NEG_INFINITY, f64::max)
    }

    /// State indices from most to least probable. Ties keep index order.
    pub fn ranked(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.probs[b].total_cmp(&self.probs[a]));

        order
    }

    /// All states from most to least probable, with their coordinates.
    pub fn top_states(&self, space: &StateSpace) -> Vec<TopState> {
        self.ranked()
            .into_iter()
            .filter_map(|index| {
                let (delay, window) = space.state(index)?;

                Some(TopState {
                    index,
                    delay,
                    window,
                    probability: self.probs[index],
                })
            })
            .collect()
    }

    /// Number of most probable states whose cumulative probability does not
    /// exceed `mass`.
    pub fn effective_support(&self, mass: f64) -> usize {
        let mut cumulative = 0.0;

        self.ranked()
            .into_iter()
            .take_while(|&i| {
                cumulative += self.probs[i];
                cumulative <= mass
            })
            .count()
    }

    /// Largest absolute per-state difference to `other`.
    pub fn max_abs_diff(&self, other: &Distribution) -> f64 {
        self.iter()
            .zip(other.iter())
            .map(|(p, q)| (p - q).abs())
            .fold(0.0, f64::max)
    }

    /// Sums the distribution over each grid dimension.
    pub fn marginals(&self, space: &StateSpace) -> Marginals {
        let mut delay = vec![0.0; space.num_delays()];
        let mut window = vec![0.0; space.num_windows()];

        for (i, p) in self.iter().enumerate() {
            delay[i / space.num_windows()] += p;
            window[i % space.num_windows()] += p;
        }

        let expected_delay: f64 =
            delay.iter().zip(space.delays()).map(|(p, d)| p * d).sum();
        let expected_window: f64 =
            window.iter().zip(space.windows()).map(|(p, w)| p * w).sum();

        Marginals {
            delay,
            window,
            expected_delay,
            expected_window,
        }
    }

    /// Cross entropy `H(self, q)` and KL divergence `D(self || q)`.
    ///
    /// States where either distribution is zero are left out of both sums.
    pub fn cross_entropy(&self, q: &Distribution) -> (f64, f64) {
        let mut cross_entropy = 0.0;
        let mut entropy = 0.0;

        for (p, q) in self.iter().zip(q.iter()) {
            if p > 0.0 {
                entropy -= p * p.ln();

                if q > 0.0 {
                    cross_entropy -= p * q.ln();
                }
            }
        }

        (cross_entropy, cross_entropy - entropy)
    }
}

impl Index<usize> for Distribution {
    type Output = f64;

    fn index(&self, state: usize) -> &f64 {
        &self.probs[state]
    }
}
