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

//! Limiting distributions and mixing times by power iteration.
//!
//! From every start state, a point mass is pushed through the chain until
//! one more step moves no entry by more than the threshold. The number of
//! steps taken is the mixing time of that state, in control steps.

use nalgebra::DMatrix;
use nalgebra::DVector;
use serde::Deserialize;
use serde::Serialize;

use crate::condition::Conditioning;
use crate::condition::StochasticMatrix;
use crate::Distribution;
use crate::Error;
use crate::Result;

/// Convergence thresholds analyzed by default.
pub const DEFAULT_THRESHOLDS: [f64; 3] = [1e-3, 1e-5, 1e-7];

/// Default cap on the iterations from a single start state.
///
/// A well-conditioned chain over a few hundred states mixes within hundreds
/// of steps even at the tightest default threshold. Periodic chains never
/// converge and are stopped here.
pub const DEFAULT_MAX_ITERATIONS: u64 = 100_000;

/// Power iteration parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixingConfig {
    /// Each threshold is analyzed independently.
    pub thresholds: Vec<f64>,

    pub max_iterations: u64,
}

impl Default for MixingConfig {
    fn default() -> Self {
        MixingConfig {
            thresholds: DEFAULT_THRESHOLDS.to_vec(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Outcome of power iteration from one start state.
#[derive(Clone, Debug, PartialEq)]
pub enum StateMixing {
    Converged {
        iterations: u64,
        limit: Distribution,
    },

    NotConverged {
        iterations: u64,
    },
}

impl StateMixing {
    pub fn mixing_time(&self) -> Option<u64> {
        match self {
            StateMixing::Converged { iterations, .. } => Some(*iterations),

            StateMixing::NotConverged { .. } => None,
        }
    }

    pub fn limit(&self) -> Option<&Distribution> {
        match self {
            StateMixing::Converged { limit, .. } => Some(limit),

            StateMixing::NotConverged { .. } => None,
        }
    }
}

/// Results for one threshold, over every start state.
#[derive(Clone, Debug, PartialEq)]
pub struct MixingReport {
    pub threshold: f64,

    pub max_iterations: u64,

    /// Indexed by start state.
    pub states: Vec<StateMixing>,
}

impl MixingReport {
    /// Mixing time of every start state, `None` where iteration failed.
    pub fn mixing_times(&self) -> Vec<Option<u64>> {
        self.states.iter().map(StateMixing::mixing_time).collect()
    }

    pub fn min_mixing_time(&self) -> Option<u64> {
        self.states.iter().filter_map(StateMixing::mixing_time).min()
    }

    pub fn max_mixing_time(&self) -> Option<u64> {
        self.states.iter().filter_map(StateMixing::mixing_time).max()
    }

    /// Start states whose iteration hit the cap.
    pub fn failed_states(&self) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| s.mixing_time().is_none())
            .map(|(i, _)| i)
            .collect()
    }

    /// Largest difference in any state's probability between the limits
    /// reached from different start states.
    ///
    /// Close to zero when the chain has a unique limiting distribution.
    pub fn uniqueness(&self) -> f64 {
        let limits: Vec<&Distribution> =
            self.states.iter().filter_map(StateMixing::limit).collect();

        let Some(first) = limits.first() else {
            return 0.0;
        };

        (0..first.len())
            .map(|k| {
                let (lo, hi) = limits.iter().fold(
                    (f64::INFINITY, f64::NEG_INFINITY),
                    |(lo, hi), l| (lo.min(l[k]), hi.max(l[k])),
                );

                hi - lo
            })
            .fold(0.0, f64::max)
    }

    /// Largest difference between any reached limit and `stationary`.
    pub fn consistency(&self, stationary: &Distribution) -> f64 {
        self.states
            .iter()
            .filter_map(StateMixing::limit)
            .map(|l| l.max_abs_diff(stationary))
            .fold(0.0, f64::max)
    }

    /// Fails with the first start state that did not converge.
    pub fn into_result(self) -> Result<Self> {
        if let Some(state) = self.failed_states().first() {
            return Err(Error::NonConvergence {
                state: *state,
                threshold: self.threshold,
                iterations: self.max_iterations,
            });
        }

        Ok(self)
    }
}

/// Runs power iteration from every start state of a matrix.
pub struct MixingAnalyzer {
    config: MixingConfig,
}

impl MixingAnalyzer {
    pub fn new(config: MixingConfig) -> Result<Self> {
        if let Some(t) = config
            .thresholds
            .iter()
            .find(|t| !t.is_finite() || **t <= 0.0)
        {
            return Err(Error::InvalidConfig(format!(
                "convergence threshold must be positive, got {t}"
            )));
        }

        Ok(MixingAnalyzer { config })
    }

    /// Analyzes every configured threshold.
    pub fn analyze(&self, m: &StochasticMatrix) -> Result<Vec<MixingReport>> {
        self.config
            .thresholds
            .iter()
            .map(|&t| self.analyze_threshold(m, t))
            .collect()
    }

    pub fn analyze_threshold(
        &self, m: &StochasticMatrix, threshold: f64,
    ) -> Result<MixingReport> {
        if m.conditioning() != Conditioning::Filled {
            return Err(Error::DegenerateMatrix {
                matrix: m.conditioning().to_string(),
                row: 0,
                reason: "power iteration needs a row-stochastic matrix"
                    .to_string(),
            });
        }

        m.validate()?;

        let mt = m.as_matrix().transpose();

        let states = (0..m.dim())
            .map(|start| {
                match power_iterate(
                    &mt,
                    start,
                    threshold,
                    self.config.max_iterations,
                ) {
                    Ok((iterations, limit)) =>
                        StateMixing::Converged { iterations, limit },

                    Err(e) => {
                        warn!("{}", e);

                        StateMixing::NotConverged {
                            iterations: self.config.max_iterations,
                        }
                    },
                }
            })
            .collect();

        let report = MixingReport {
            threshold,
            max_iterations: self.config.max_iterations,
            states,
        };

        info!(
            "threshold {:e}: mixing time min {:?} max {:?}, {} states failed",
            threshold,
            report.min_mixing_time(),
            report.max_mixing_time(),
            report.failed_states().len()
        );

        Ok(report)
    }
}

/// Iterates `v ← v·M` from a point mass at `start`.
///
/// `mt` is the transpose of `M`. Returns the number of steps taken before
/// the next step would move no entry by `threshold` or more, and the
/// distribution reached.
pub fn power_iterate(
    mt: &DMatrix<f64>, start: usize, threshold: f64, max_iterations: u64,
) -> Result<(u64, Distribution)> {
    let n = mt.nrows();

    let mut v = DVector::<f64>::zeros(n);
    v[start] = 1.0;

    let mut iterations = 0;

    loop {
        let next = mt * &v;

        if (&next - &v).amax() < threshold {
            return Ok((iterations, Distribution::new(v.iter().copied().collect())));
        }

        if iterations == max_iterations {
            return Err(Error::NonConvergence {
                state: start,
                threshold,
                iterations,
            });
        }

        v = next;
        iterations += 1;
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    use crate::condition;
    use crate::estimator::CountMatrix;
    use crate::spectral;

    fn chain(n: usize, values: &[f64]) -> StochasticMatrix {
        StochasticMatrix::new(DMatrix::from_row_slice(n, n, values)).unwrap()
    }

    #[test]
    fn already_stationary() {
        let m = chain(2, &[0.5, 0.5, 0.5, 0.5]);
        let analyzer = MixingAnalyzer::new(MixingConfig::default()).unwrap();

        let report = analyzer.analyze_threshold(&m, 1e-3).unwrap();

        // One step from either point mass reaches the uniform distribution.
        assert_eq!(report.mixing_times(), vec![Some(1), Some(1)]);
        assert_eq!(report.uniqueness(), 0.0);
    }

    #[rstest]
    fn limits_agree(#[values(1e-3, 1e-5, 1e-7)] threshold: f64) {
        let counts = CountMatrix::from_rows(&[
            vec![3, 1, 0, 0, 0],
            vec![0, 2, 2, 1, 0],
            vec![1, 0, 0, 4, 1],
            vec![0, 0, 0, 0, 0],
            vec![5, 0, 0, 0, 5],
        ])
        .unwrap();
        let m = condition::filled_normalize(&counts).unwrap();

        let analyzer = MixingAnalyzer::new(MixingConfig {
            thresholds: vec![threshold],
            ..Default::default()
        })
        .unwrap();

        let reports = analyzer.analyze(&m).unwrap();
        assert_eq!(reports.len(), 1);

        let report = reports.into_iter().next().unwrap().into_result().unwrap();
        let stationary = spectral::stationary_distribution(&m).unwrap();

        assert!(report.failed_states().is_empty());
        assert!(report.uniqueness() < threshold * 100.0);
        assert!(report.consistency(&stationary) < threshold * 100.0);
        assert!(report.min_mixing_time() <= report.max_mixing_time());
    }

    #[test]
    fn tighter_threshold_mixes_slower() {
        let m = chain(3, &[0.8, 0.1, 0.1, 0.1, 0.8, 0.1, 0.1, 0.1, 0.8]);
        let analyzer = MixingAnalyzer::new(MixingConfig::default()).unwrap();

        let reports = analyzer.analyze(&m).unwrap();
        let max: Vec<_> = reports.iter().map(|r| r.max_mixing_time()).collect();

        assert!(max[0] < max[1]);
        assert!(max[1] < max[2]);
    }

    #[test]
    fn periodic_chain_is_capped() {
        let m = chain(2, &[0.0, 1.0, 1.0, 0.0]);
        let analyzer = MixingAnalyzer::new(MixingConfig {
            thresholds: vec![1e-3],
            max_iterations: 50,
        })
        .unwrap();

        let report = analyzer.analyze_threshold(&m, 1e-3).unwrap();

        assert_eq!(report.failed_states(), vec![0, 1]);
        assert_eq!(report.min_mixing_time(), None);

        assert!(matches!(
            report.into_result(),
            Err(Error::NonConvergence {
                state: 0,
                iterations: 50,
                ..
            })
        ));
    }

    #[test]
    fn rejects_quadrant_normalized() {
        let space = crate::StateSpace::new(crate::GridConfig {
            delay: crate::Axis::new(0.0, 1.0, 1.0),
            window: crate::Axis::new(0.0, 1.0, 1.0),
        })
        .unwrap();

        let counts = CountMatrix::from_rows(&vec![vec![1; 4]; 4]).unwrap();
        let m = condition::quadrant_normalize(
            &counts,
            &space,
            condition::SPARSIFY_THRESHOLD,
        )
        .unwrap();

        let analyzer = MixingAnalyzer::new(MixingConfig::default()).unwrap();

        assert!(matches!(
            analyzer.analyze_threshold(&m, 1e-3),
            Err(Error::DegenerateMatrix { .. })
        ));
        assert!(analyzer.analyze(&m).is_err());
    }

    #[test]
    fn partial_failure() {
        // State 2 alternates with 3 forever, 0 and 1 settle into state 0.
        let m = chain(4, &[
            1.0, 0.0, 0.0, 0.0, //
            0.5, 0.5, 0.0, 0.0, //
            0.0, 0.0, 0.0, 1.0, //
            0.0, 0.0, 1.0, 0.0,
        ]);
        let analyzer = MixingAnalyzer::new(MixingConfig {
            thresholds: vec![1e-5],
            max_iterations: 1_000,
        })
        .unwrap();

        let report = analyzer.analyze_threshold(&m, 1e-5).unwrap();

        assert_eq!(report.failed_states(), vec![2, 3]);
        assert_eq!(report.mixing_times()[0], Some(0));
        assert!(report.mixing_times()[1].is_some());
        assert!(report.uniqueness() < 1e-4);
    }

    #[rstest]
    #[case(0.0)]
    #[case(-1e-3)]
    #[case(f64::NAN)]
    fn invalid_threshold(#[case] threshold: f64) {
        assert!(matches!(
            MixingAnalyzer::new(MixingConfig {
                thresholds: vec![1e-3, threshold],
                ..Default::default()
            }),
            Err(Error::InvalidConfig(_))
        ));
    }
}
