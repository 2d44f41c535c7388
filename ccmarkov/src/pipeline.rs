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

//! File-level training and analysis runs.
//!
//! A run reads processed traces named `processed-<index>-<name>.out` from a
//! directory, counts their transitions and writes the count matrix with the
//! train/test file lists. Analysis reads a count matrix back, conditions it
//! and writes the stationary distribution, mixing times and a text summary.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::condition;
use crate::condition::StochasticMatrix;
use crate::distribution::Marginals;
use crate::distribution::SUPPORT_MASS;
use crate::estimator::CountMatrix;
use crate::estimator::Estimate;
use crate::estimator::TraceCounts;
use crate::estimator::TransitionEstimator;
use crate::mixing::MixingAnalyzer;
use crate::mixing::MixingConfig;
use crate::mixing::MixingReport;
use crate::partition::Partition;
use crate::persist;
use crate::quantize;
use crate::spectral;
use crate::Distribution;
use crate::Error;
use crate::GridConfig;
use crate::Result;
use crate::StateSpace;
use crate::TopState;

/// Parameters of a matrix analysis.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Block entries below this probability are dropped from the model.
    pub sparsify_threshold: f64,

    /// Probability mass covered by the effective support.
    pub support_mass: f64,

    pub mixing: MixingConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            sparsify_threshold: condition::SPARSIFY_THRESHOLD,
            support_mass: SUPPORT_MASS,
            mixing: MixingConfig::default(),
        }
    }
}

impl AnalysisConfig {
    /// Loads an analysis configuration from a JSON file.
    ///
    /// Missing fields take their default values.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: AnalysisConfig =
            serde_json::from_reader(std::io::BufReader::new(fs::File::open(
                path,
            )?))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.sparsify_threshold) {
            return Err(Error::InvalidConfig(format!(
                "sparsify threshold must be in [0, 1), got {}",
                self.sparsify_threshold
            )));
        }

        if !(self.support_mass > 0.0 && self.support_mass <= 1.0) {
            return Err(Error::InvalidConfig(format!(
                "support mass must be in (0, 1], got {}",
                self.support_mass
            )));
        }

        MixingAnalyzer::new(self.mixing.clone()).map(|_| ())
    }
}

/// Path of the processed trace `index` of the traces called `name`.
pub fn trace_path(dir: &Path, name: &str, index: usize) -> PathBuf {
    dir.join(format!("processed-{index}-{name}.out"))
}

/// Quantizes a combined log into a processed trace file.
///
/// Returns the number of observations written.
pub fn preprocess<P: AsRef<Path>, Q: AsRef<Path>>(
    config: &GridConfig, log: P, out: Q,
) -> Result<usize> {
    let events = persist::read_combined_log(log.as_ref())?;
    let observations: Vec<_> = quantize::observations(config, events).collect();

    persist::write_trace(out.as_ref(), &observations)?;

    debug!(
        "{}: {} observations",
        out.as_ref().display(),
        observations.len()
    );

    Ok(observations.len())
}

/// Counts the transitions of the training traces of `partition`.
///
/// Trace files that cannot be read are skipped with a warning.
pub fn train(
    space: &StateSpace, dir: &Path, name: &str, partition: &Partition,
) -> Result<Estimate> {
    let mut estimator = TransitionEstimator::new(space);

    info!(
        "training {} on {} traces, holding out {}",
        name,
        partition.train.len(),
        partition.test.len()
    );

    for &index in &partition.train {
        let path = trace_path(dir, name, index);

        let trace = match persist::read_trace(&path) {
            Ok(v) => v,

            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                continue;
            },
        };

        estimator.merge(index, TraceCounts::from_trace(space, &trace))?;
    }

    Ok(estimator.finalize())
}

/// Writes the products of a training run into `dir`.
///
/// `suffix` distinguishes runs over different partitions of the same traces.
pub fn write_training(
    dir: &Path, name: &str, suffix: &str, estimate: &Estimate,
    partition: &Partition,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let matrix = dir.join(format!("transmatrix-{name}-{suffix}.csv"));

    persist::write_count_matrix(&matrix, &estimate.counts)?;
    persist::write_indices(
        dir.join(format!("findex-train-{name}-{suffix}.csv")),
        &partition.train,
    )?;
    persist::write_indices(
        dir.join(format!("findex-test-{name}-{suffix}.csv")),
        &partition.test,
    )?;
    persist::write_state_counts(
        dir.join(format!("statescounts-{name}-{suffix}.txt")),
        &estimate.state_counts,
    )?;

    info!("wrote {}", matrix.display());

    Ok(matrix)
}

/// Output file prefix for the analysis of a count matrix file.
///
/// `transmatrix-verus-N940.csv` is analyzed as `verus-N940`.
pub fn output_prefix(matrix: &Path) -> String {
    let stem = matrix
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    match stem.split_once('-') {
        Some((_, prefix)) => prefix.to_string(),

        None => stem,
    }
}

/// Everything derived from one count matrix.
#[derive(Clone, Debug)]
pub struct Analysis {
    pub space: StateSpace,

    /// States that were never left.
    pub zero_states: Vec<usize>,

    /// Row-stochastic matrix used for the spectral and mixing analysis.
    pub filled: StochasticMatrix,

    /// Sparsified block-stochastic matrix handed to the model runtime.
    pub quadrant: StochasticMatrix,

    pub stationary: Distribution,

    pub top_states: Vec<TopState>,

    pub effective_support: usize,

    pub support_mass: f64,

    pub marginals: Marginals,

    pub mixing: Vec<MixingReport>,

    /// Cross entropy and KL divergence of the observed state occupancy
    /// against the stationary distribution.
    pub occupancy_divergence: Option<(f64, f64)>,
}

/// Analyzes a count matrix.
///
/// `occupancy` holds the number of observations on each state, if known.
pub fn analyze(
    counts: &CountMatrix, space: &StateSpace, config: &AnalysisConfig,
    occupancy: Option<&[u64]>,
) -> Result<Analysis> {
    config.validate()?;

    if let Some(o) = occupancy {
        if o.len() != space.len() {
            return Err(Error::InvalidConfig(format!(
                "{} state counts, but the grid has {} states",
                o.len(),
                space.len()
            )));
        }
    }

    let zero_states = counts.zero_rows();
    info!("{} zero states", zero_states.len());

    let filled = condition::filled_normalize(counts)?;
    let quadrant =
        condition::quadrant_normalize(counts, space, config.sparsify_threshold)?;

    let stationary = spectral::stationary_distribution(&filled)?;
    let top_states = stationary.top_states(space);
    let effective_support = stationary.effective_support(config.support_mass);
    let marginals = stationary.marginals(space);

    info!("effective support: {} states", effective_support);

    let mixing = MixingAnalyzer::new(config.mixing.clone())?.analyze(&filled)?;

    let occupancy_divergence = occupancy
        .and_then(empirical)
        .map(|p| p.cross_entropy(&stationary));

    Ok(Analysis {
        space: *space,
        zero_states,
        filled,
        quadrant,
        stationary,
        top_states,
        effective_support,
        support_mass: config.support_mass,
        marginals,
        mixing,
        occupancy_divergence,
    })
}

fn empirical(counts: &[u64]) -> Option<Distribution> {
    let total: u64 = counts.iter().sum();
    if total == 0 {
        return None;
    }

    Some(Distribution::new(
        counts.iter().map(|&c| c as f64 / total as f64).collect(),
    ))
}

impl fmt::Display for Analysis {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let zero: Vec<_> = self
            .zero_states
            .iter()
            .filter_map(|&i| self.space.state(i))
            .collect();

        writeln!(f, "Num zero states: {}", zero.len())?;
        writeln!(f, "Zero states: {zero:?}")?;
        writeln!(
            f,
            "Stat distr: min {}, max {}",
            self.stationary.min(),
            self.stationary.max()
        )?;
        writeln!(
            f,
            "Stat distr top states (p <= {}): {}",
            self.support_mass, self.effective_support
        )?;
        writeln!(
            f,
            "Expected delay change: {}, expected window change: {}",
            self.marginals.expected_delay, self.marginals.expected_window
        )?;

        if let Some((ce, kld)) = self.occupancy_divergence {
            writeln!(
                f,
                "Occupancy vs stat distr: cross entropy {ce}, KL divergence {kld}"
            )?;
        }

        for report in &self.mixing {
            writeln!(f)?;
            writeln!(f, "**** Threshold = {:e} ****", report.threshold)?;
            writeln!(
                f,
                "Limiting distr unique? Max diff in probs = {}",
                report.uniqueness()
            )?;
            writeln!(
                f,
                "Limiting distrs close to statdistr? Max diff in probs = {}",
                report.consistency(&self.stationary)
            )?;

            if let (Some(min), Some(max)) =
                (report.min_mixing_time(), report.max_mixing_time())
            {
                writeln!(f, "Min mixing time: {min} iterations / RTTs")?;
                writeln!(f, "Max mixing time: {max} iterations / RTTs")?;
            }

            let failed = report.failed_states();
            if !failed.is_empty() {
                writeln!(
                    f,
                    "No convergence within {} iterations from states {:?}",
                    report.max_iterations, failed
                )?;
            }
        }

        Ok(())
    }
}

impl Analysis {
    /// Writes every table of the analysis into `dir`, named after `prefix`.
    pub fn write_outputs(&self, dir: &Path, prefix: &str) -> Result<()> {
        if !dir.exists() {
            info!("creating output directory {}", dir.display());
            fs::create_dir_all(dir)?;
        }

        fs::write(dir.join(format!("{prefix}-output.txt")), self.to_string())?;

        persist::write_distribution(
            dir.join(format!("{prefix}-statdistr.txt")),
            &self.stationary,
        )?;
        persist::write_top_states(
            dir.join(format!("{prefix}-topstates.txt")),
            &self.top_states,
        )?;

        for report in &self.mixing {
            persist::write_mixing_times(
                dir.join(format!("{prefix}-mixingtimes-{:e}.txt", report.threshold)),
                report,
            )?;
        }

        persist::write_model(
            dir.join(format!("{prefix}-transMatrix.csv")),
            &self.quadrant,
            self.space.config(),
        )?;

        Ok(())
    }
}
