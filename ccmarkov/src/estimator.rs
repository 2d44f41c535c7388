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

//! Transition counting over independent traces.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use nalgebra::DMatrix;

use crate::Error;
use crate::Observation;
use crate::Result;
use crate::StateSpace;

/// Number of observed one-step transitions between every pair of states.
///
/// Entry `(i, j)` counts transitions from state `i` to state `j`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CountMatrix {
    counts: DMatrix<u64>,
}

impl CountMatrix {
    pub fn zeros(states: usize) -> Self {
        CountMatrix {
            counts: DMatrix::zeros(states, states),
        }
    }

    pub fn from_matrix(counts: DMatrix<u64>) -> Result<Self> {
        if !counts.is_square() {
            return Err(Error::DegenerateMatrix {
                matrix: "count".to_string(),
                row: 0,
                reason: format!(
                    "{}x{} is not square",
                    counts.nrows(),
                    counts.ncols()
                ),
            });
        }

        Ok(CountMatrix { counts })
    }

    /// Builds a matrix from its rows, which must all have one entry per row.
    pub fn from_rows(rows: &[Vec<u64>]) -> Result<Self> {
        let n = rows.len();

        if let Some((row, r)) = rows.iter().enumerate().find(|(_, r)| r.len() != n)
        {
            return Err(Error::DegenerateMatrix {
                matrix: "count".to_string(),
                row,
                reason: format!("has {} entries, expected {}", r.len(), n),
            });
        }

        Ok(CountMatrix {
            counts: DMatrix::from_fn(n, n, |i, j| rows[i][j]),
        })
    }

    /// Number of states.
    pub fn dim(&self) -> usize {
        self.counts.nrows()
    }

    pub fn get(&self, from: usize, to: usize) -> u64 {
        self.counts[(from, to)]
    }

    pub fn row(&self, from: usize) -> impl Iterator<Item = u64> + '_ {
        (0..self.dim()).map(move |to| self.counts[(from, to)])
    }

    pub fn row_sum(&self, from: usize) -> u64 {
        self.counts.row(from).iter().sum()
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// States that were never left in any trace.
    pub fn zero_rows(&self) -> Vec<usize> {
        (0..self.dim()).filter(|&i| self.row_sum(i) == 0).collect()
    }

    pub fn as_matrix(&self) -> &DMatrix<u64> {
        &self.counts
    }

    fn add(&mut self, from: usize, to: usize, n: u64) {
        self.counts[(from, to)] += n;
    }
}

/// Lazily yields the state transitions of one trace.
///
/// Consecutive observations form a transition only when both are present and
/// on the grid. A missing or off-grid observation breaks the chain on both
/// sides.
pub fn transitions<'a>(
    space: &'a StateSpace, trace: &'a [Option<Observation>],
) -> impl Iterator<Item = (usize, usize)> + 'a {
    trace.windows(2).filter_map(move |pair| {
        let from = pair[0]?.index(space).ok()?;
        let to = pair[1]?.index(space).ok()?;

        Some((from, to))
    })
}

/// Counts contributed by a single trace.
///
/// Partial counts are computed without reference to any other trace and are
/// summed into a [`TransitionEstimator`] with [`TransitionEstimator::merge`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceCounts {
    states: usize,

    transitions: BTreeMap<(usize, usize), u64>,

    occupancy: BTreeMap<usize, u64>,

    skipped: u64,
}

impl TraceCounts {
    pub fn from_trace(space: &StateSpace, trace: &[Option<Observation>]) -> Self {
        let mut counts = TraceCounts {
            states: space.len(),
            transitions: BTreeMap::new(),
            occupancy: BTreeMap::new(),
            skipped: 0,
        };

        let mut pairs = 0;
        for transition in transitions(space, trace) {
            *counts.transitions.entry(transition).or_insert(0) += 1;
            pairs += 1;
        }

        counts.skipped = trace.len().saturating_sub(1) as u64 - pairs;

        for index in trace.iter().flatten().filter_map(|o| o.index(space).ok()) {
            *counts.occupancy.entry(index).or_insert(0) += 1;
        }

        counts
    }

    pub fn transitions(&self) -> impl Iterator<Item = ((usize, usize), u64)> + '_ {
        self.transitions.iter().map(|(k, v)| (*k, *v))
    }

    /// Number of consecutive pairs that did not form a transition.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    /// Size of the state space the trace was counted against.
    pub fn states(&self) -> usize {
        self.states
    }
}

/// The result of counting transitions over a set of traces.
#[derive(Clone, Debug)]
pub struct Estimate {
    pub counts: CountMatrix,

    /// How many in-grid observations fell on each state.
    pub state_counts: Vec<u64>,

    /// The traces that contributed, in ascending order.
    pub trace_ids: Vec<usize>,

    /// Consecutive pairs that were not counted.
    pub skipped_pairs: u64,
}

/// Accumulates transition counts over many independent traces.
pub struct TransitionEstimator {
    space: StateSpace,

    counts: CountMatrix,

    state_counts: Vec<u64>,

    trace_ids: BTreeSet<usize>,

    skipped_pairs: u64,
}

impl TransitionEstimator {
    pub fn new(space: &StateSpace) -> Self {
        TransitionEstimator {
            space: *space,
            counts: CountMatrix::zeros(space.len()),
            state_counts: vec![0; space.len()],
            trace_ids: BTreeSet::new(),
            skipped_pairs: 0,
        }
    }

    /// Counts the transitions of one trace.
    pub fn accumulate(&mut self, trace_id: usize, trace: &[Option<Observation>]) {
        let partial = TraceCounts::from_trace(&self.space, trace);

        self.add_partial(trace_id, partial);
    }

    /// Adds the counts of a trace that was processed separately.
    ///
    /// The counts must come from the same state space as the estimator.
    pub fn merge(&mut self, trace_id: usize, partial: TraceCounts) -> Result<()> {
        if partial.states != self.space.len() {
            return Err(Error::InvalidConfig(format!(
                "trace {} was counted over {} states, expected {}",
                trace_id,
                partial.states,
                self.space.len()
            )));
        }

        self.add_partial(trace_id, partial);

        Ok(())
    }

    fn add_partial(&mut self, trace_id: usize, partial: TraceCounts) {
        if !self.trace_ids.insert(trace_id) {
            warn!("trace {} was counted more than once", trace_id);
        }

        let mut counted = 0;
        for ((from, to), n) in partial.transitions {
            self.counts.add(from, to, n);
            counted += n;
        }

        for (state, n) in partial.occupancy {
            self.state_counts[state] += n;
        }

        self.skipped_pairs += partial.skipped;

        debug!(
            "trace {}: {} transitions counted, {} pairs skipped",
            trace_id, counted, partial.skipped
        );
    }

    pub fn finalize(self) -> Estimate {
        info!(
            "counted {} transitions from {} traces ({} pairs skipped)",
            self.counts.total(),
            self.trace_ids.len(),
            self.skipped_pairs
        );

        Estimate {
            counts: self.counts,
            state_counts: self.state_counts,
            trace_ids: self.trace_ids.into_iter().collect(),
            skipped_pairs: self.skipped_pairs,
        }
    }
}
