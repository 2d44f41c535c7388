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

//! Markov chain models of congestion control signals.
//!
//! [ccmarkov] estimates a discrete-time Markov chain describing how a
//! congestion controller's control signals evolve from one control step to
//! the next. Each step is summarized by two log-scaled percentage changes:
//! the change of the delay (RTT) and the change of the congestion window.
//! Both are quantized onto a fixed grid, and every grid point is a state of
//! the chain.
//!
//! The library is organized as a pipeline:
//!
//! * [`grid`] defines the state space from an explicit [`GridConfig`].
//! * [`quantize`] turns raw per-step measurements into [`Observation`]s.
//! * [`estimator`] counts one-step transitions over many independent traces.
//! * [`partition`] splits trace files into training and test sets.
//! * [`condition`] turns the counts into row-stochastic matrices.
//! * [`spectral`] computes the stationary distribution.
//! * [`mixing`] runs power iteration to find limiting distributions and
//!   mixing times.
//! * [`persist`] reads and writes the plain-text tables consumed by the
//!   model runtime and the plotting tools.
//! * [`pipeline`] runs training and analysis over files.
//!
//! ## Estimating a model
//!
//! ```
//! use ccmarkov::condition;
//! use ccmarkov::estimator::TransitionEstimator;
//! use ccmarkov::spectral;
//! use ccmarkov::GridConfig;
//! use ccmarkov::Observation;
//! use ccmarkov::StateSpace;
//!
//! let space = StateSpace::new(GridConfig::default())?;
//! let mut estimator = TransitionEstimator::new(&space);
//!
//! let trace = vec![
//!     Some(Observation::new(0.0, 2.0)),
//!     Some(Observation::new(2.0, 0.0)),
//!     Some(Observation::new(0.0, 2.0)),
//! ];
//! estimator.accumulate(0, &trace);
//!
//! let estimate = estimator.finalize();
//! let model = condition::filled_normalize(&estimate.counts)?;
//! let stationary = spectral::stationary_distribution(&model)?;
//!
//! assert_eq!(stationary.len(), space.len());
//! # Ok::<(), ccmarkov::Error>(())
//! ```
//!
//! [ccmarkov]: https://github.com/ccmarkov/ccmarkov/

#[macro_use]
extern crate log;

use std::path::PathBuf;

/// A specialized [`Result`] type for ccmarkov operations.
///
/// [`Result`]: https://doc.rust-lang.org/std/result/enum.Result.html
pub type Result<T> = std::result::Result<T, Error>;

/// A ccmarkov error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A value does not land on a grid point of the state space.
    #[error("({delay}, {window}) is not a grid point of the state space")]
    OutOfRange { delay: f64, window: f64 },

    /// A stochastic matrix invariant does not hold.
    #[error("{matrix} matrix is degenerate at row {row}: {reason}")]
    DegenerateMatrix {
        matrix: String,
        row: usize,
        reason: String,
    },

    /// The spectral solve did not produce a real, one-signed Perron
    /// eigenvector.
    #[error(
        "stationary eigenvector is not real (eigenvalue {eigenvalue_re} + {eigenvalue_im}i)"
    )]
    ComplexStationary {
        eigenvalue_re: f64,
        eigenvalue_im: f64,
    },

    /// The Perron eigenvalue has more than one independent eigenvector, so
    /// the chain has several closed classes.
    #[error(
        "stationary distribution is not unique (eigenspace of dimension {multiplicity})"
    )]
    NonUniqueStationary { multiplicity: usize },

    /// Power iteration from a start state exceeded its iteration cap.
    #[error(
        "power iteration from state {state} did not converge within {iterations} iterations (threshold {threshold:e})"
    )]
    NonConvergence {
        state: usize,
        threshold: f64,
        iterations: u64,
    },

    /// A grid, partition or analysis parameter is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A table file could not be parsed.
    #[error("{}:{line}: {reason}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub use crate::distribution::Distribution;
pub use crate::distribution::TopState;
pub use crate::grid::Axis;
pub use crate::grid::GridConfig;
pub use crate::grid::StateSpace;
pub use crate::quantize::Observation;

pub mod condition;
pub mod distribution;
pub mod estimator;
pub mod grid;
pub mod mixing;
pub mod partition;
pub mod persist;
pub mod pipeline;
pub mod quantize;
pub mod spectral;
