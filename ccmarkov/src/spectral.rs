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

//! Stationary distribution by eigen-decomposition.
//!
//! The stationary distribution `π` of a row-stochastic matrix `M` satisfies
//! `π = πM`, i.e. it is a left eigenvector of `M` for eigenvalue 1, or a
//! right eigenvector of `Mᵗ`. The eigenvalue with the largest real part is
//! chosen; for an irreducible and aperiodic chain this is the Perron
//! eigenvalue 1 and its eigenvector is real with entries of one sign.

use nalgebra::Complex;
use nalgebra::DMatrix;
use nalgebra::DVector;

use crate::condition::Conditioning;
use crate::condition::StochasticMatrix;
use crate::Distribution;
use crate::Error;
use crate::Result;

/// Largest imaginary part of the chosen eigenvalue still considered real.
pub const EIGEN_TOLERANCE: f64 = 1e-9;

// Singular values of `Mᵗ - λI` below this span the eigenspace of `λ`.
const NULL_SPACE_TOLERANCE: f64 = 1e-9;

/// Computes the stationary distribution of a filled-normalized matrix.
///
/// Fails with [`Error::NonUniqueStationary`] when the chain has more than one
/// closed class, and with [`Error::ComplexStationary`] when it does not have
/// a real, one-signed Perron eigenvector. Either means it violates the
/// irreducibility and aperiodicity assumptions of the model.
pub fn stationary_distribution(m: &StochasticMatrix) -> Result<Distribution> {
    if m.conditioning() != Conditioning::Filled {
        return Err(Error::DegenerateMatrix {
            matrix: m.conditioning().to_string(),
            row: 0,
            reason: "spectral analysis needs a row-stochastic matrix".to_string(),
        });
    }

    let n = m.dim();
    if n == 0 {
        return Err(Error::DegenerateMatrix {
            matrix: m.conditioning().to_string(),
            row: 0,
            reason: "matrix has no states".to_string(),
        });
    }

    let mt = m.as_matrix().transpose();

    let lambda = perron_eigenvalue(mt.complex_eigenvalues().as_slice())?;

    debug!("perron eigenvalue {}", lambda);

    let vector = eigenvector(mt - DMatrix::identity(n, n) * lambda, lambda)?;
    let stationary = normalize(&vector, lambda)?;

    info!(
        "stationary distribution: min {}, max {}",
        stationary.min(),
        stationary.max()
    );

    Ok(stationary)
}

/// Picks the eigenvalue with the largest real part, which must be real.
fn perron_eigenvalue(eigenvalues: &[Complex<f64>]) -> Result<f64> {
    let lambda = eigenvalues
        .iter()
        .max_by(|a, b| a.re.total_cmp(&b.re))
        .copied()
        .ok_or(Error::ComplexStationary {
            eigenvalue_re: f64::NAN,
            eigenvalue_im: f64::NAN,
        })?;

    if !lambda.re.is_finite() || lambda.im.abs() > EIGEN_TOLERANCE {
        return Err(Error::ComplexStationary {
            eigenvalue_re: lambda.re,
            eigenvalue_im: lambda.im,
        });
    }

    Ok(lambda.re)
}

/// Returns the vector spanning the null space of `a`.
///
/// `a` is `Mᵗ - λI`. A null space of more than one dimension means the chain
/// has several stationary distributions.
fn eigenvector(a: DMatrix<f64>, lambda: f64) -> Result<DVector<f64>> {
    let svd = a.svd(false, true);

    let complex = || Error::ComplexStationary {
        eigenvalue_re: lambda,
        eigenvalue_im: 0.0,
    };

    let v_t = svd.v_t.ok_or_else(complex)?;

    let multiplicity = svd
        .singular_values
        .iter()
        .filter(|s| **s < NULL_SPACE_TOLERANCE)
        .count();

    if multiplicity > 1 {
        return Err(Error::NonUniqueStationary { multiplicity });
    }

    let (smallest, _) = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|(_, a), (_, b)| a.total_cmp(b))
        .ok_or_else(complex)?;

    Ok(v_t.row(smallest).transpose())
}

/// Scales an eigenvector to a probability vector.
///
/// Entries below machine epsilon are set to 0. The vector must not mix
/// signs.
fn normalize(vector: &DVector<f64>, lambda: f64) -> Result<Distribution> {
    let complex = || Error::ComplexStationary {
        eigenvalue_re: lambda,
        eigenvalue_im: 0.0,
    };

    let sum = vector.sum();
    if !sum.is_finite() || sum.abs() < EIGEN_TOLERANCE {
        return Err(complex());
    }

    let scaled: Vec<f64> = vector.iter().map(|v| v / sum).collect();

    if let Some(p) = scaled.iter().find(|p| **p < -EIGEN_TOLERANCE) {
        debug!("stationary vector entry {} is negative", p);

        return Err(complex());
    }

    let probs: Vec<f64> = scaled
        .into_iter()
        .map(|p| if p < f64::EPSILON { 0.0 } else { p })
        .collect();

    let total: f64 = probs.iter().sum();
    if (total - 1.0).abs() > EIGEN_TOLERANCE {
        return Err(complex());
    }

    Ok(Distribution::new(probs))
}
