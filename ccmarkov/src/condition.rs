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

//! Conditioning of transition counts into stochastic matrices.
//!
//! Two independent transforms exist. [`filled_normalize()`] yields a proper
//! row-stochastic matrix for spectral and mixing analysis. States that were
//! never left get a uniform row. [`quadrant_normalize()`] yields the
//! sparsified model exported to the controller. The matrix is split into
//! blocks by (source delay, destination delay) and each block is normalized
//! and denoised on its own.

use std::fmt;

use nalgebra::DMatrix;

use crate::estimator::CountMatrix;
use crate::Error;
use crate::Result;
use crate::StateSpace;

/// Conditional probabilities below this are dropped from quadrant-normalized
/// models.
pub const SPARSIFY_THRESHOLD: f64 = 0.02;

/// Allowed deviation of a row sum from 1.
pub const ROW_SUM_TOLERANCE: f64 = 1e-9;

/// How a [`StochasticMatrix`] was derived from its counts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Conditioning {
    /// Every row sums to 1.
    Filled,

    /// Every row sums to 1 within each block of `block` columns, or is zero
    /// there.
    Quadrant { block: usize },
}

impl fmt::Display for Conditioning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Conditioning::Filled => write!(f, "filled-normalized"),

            Conditioning::Quadrant { .. } => write!(f, "quadrant-normalized"),
        }
    }
}

/// A conditioned transition matrix.
#[derive(Clone, Debug, PartialEq)]
pub struct StochasticMatrix {
    conditioning: Conditioning,
    matrix: DMatrix<f64>,
}

impl StochasticMatrix {
    /// Wraps a row-stochastic matrix.
    pub fn new(matrix: DMatrix<f64>) -> Result<Self> {
        let m = StochasticMatrix {
            conditioning: Conditioning::Filled,
            matrix,
        };

        m.validate()?;

        Ok(m)
    }

    pub fn conditioning(&self) -> Conditioning {
        self.conditioning
    }

    /// Number of states.
    pub fn dim(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn get(&self, from: usize, to: usize) -> f64 {
        self.matrix[(from, to)]
    }

    pub fn as_matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    /// Checks the invariants of the matrix's conditioning.
    pub fn validate(&self) -> Result<()> {
        let degenerate = |row: usize, reason: String| Error::DegenerateMatrix {
            matrix: self.conditioning.to_string(),
            row,
            reason,
        };

        if !self.matrix.is_square() {
            return Err(degenerate(
                0,
                format!(
                    "{}x{} is not square",
                    self.matrix.nrows(),
                    self.matrix.ncols()
                ),
            ));
        }

        let block = match self.conditioning {
            Conditioning::Filled => self.dim(),

            Conditioning::Quadrant { block } => block,
        };

        if block == 0 || self.dim() % block != 0 {
            return Err(degenerate(
                0,
                format!("{} states do not split into blocks of {block}", self.dim()),
            ));
        }

        for i in 0..self.dim() {
            if let Some(v) = self
                .matrix
                .row(i)
                .iter()
                .find(|v| !v.is_finite() || **v < 0.0)
            {
                return Err(degenerate(i, format!("holds invalid entry {v}")));
            }

            for j in (0..self.dim()).step_by(block) {
                let sum = self.matrix.view((i, j), (1, block)).sum();

                let ok = match self.conditioning {
                    Conditioning::Filled =>
                        (sum - 1.0).abs() <= ROW_SUM_TOLERANCE,

                    Conditioning::Quadrant { .. } =>
                        sum == 0.0 || (sum - 1.0).abs() <= ROW_SUM_TOLERANCE,
                };

                if !ok {
                    return Err(degenerate(i, format!("sums to {sum}")));
                }
            }
        }

        Ok(())
    }
}

/// Normalizes every row to sum to 1, with never-left states made uniform.
pub fn filled_normalize(counts: &CountMatrix) -> Result<StochasticMatrix> {
    let n = counts.dim();
    let mut matrix = counts.as_matrix().map(|c| c as f64);

    for i in 0..n {
        let mut row = matrix.row_mut(i);

        if row.sum() == 0.0 {
            row.fill(1.0);
        }

        let sum = row.sum();
        if sum == 0.0 {
            return Err(Error::DegenerateMatrix {
                matrix: Conditioning::Filled.to_string(),
                row: i,
                reason: "row sum is zero after filling".to_string(),
            });
        }

        row /= sum;
    }

    let m = StochasticMatrix {
        conditioning: Conditioning::Filled,
        matrix,
    };

    m.validate()?;

    Ok(m)
}

/// Normalizes and sparsifies the counts block by block.
///
/// Block `(i, j)` holds the transitions from delay bucket `i` to delay
/// bucket `j`. Within a block every row is normalized, entries below
/// `threshold` are dropped and the row is normalized again. Rows with no
/// counts in a block stay zero in that block.
pub fn quadrant_normalize(
    counts: &CountMatrix, space: &StateSpace, threshold: f64,
) -> Result<StochasticMatrix> {
    if counts.dim() != space.len() {
        return Err(Error::DegenerateMatrix {
            matrix: "count".to_string(),
            row: 0,
            reason: format!(
                "{} states, but the grid has {}",
                counts.dim(),
                space.len()
            ),
        });
    }

    let matrix = counts.as_matrix().map(|c| c as f64);
    let block = space.num_windows();

    let m = StochasticMatrix {
        conditioning: Conditioning::Quadrant { block },
        matrix: quadrant_normalize_matrix(&matrix, block, threshold)?,
    };

    m.validate()?;

    Ok(m)
}

/// Block-wise normalization of a non-negative matrix.
///
/// See [`quadrant_normalize()`].
pub fn quadrant_normalize_matrix(
    matrix: &DMatrix<f64>, block: usize, threshold: f64,
) -> Result<DMatrix<f64>> {
    let n = matrix.nrows();

    if !matrix.is_square() || block == 0 || n % block != 0 {
        return Err(Error::DegenerateMatrix {
            matrix: Conditioning::Quadrant { block }.to_string(),
            row: 0,
            reason: format!(
                "{}x{} does not split into blocks of {block}",
                n,
                matrix.ncols()
            ),
        });
    }

    let mut out = matrix.clone();

    for i in 0..n {
        for j in (0..n).step_by(block) {
            let mut row = out.view_mut((i, j), (1, block));

            let sum = row.sum();
            if sum == 0.0 {
                continue;
            }
            row /= sum;

            row.apply(|p| {
                if *p < threshold {
                    *p = 0.0;
                }
            });

            let sum = row.sum();
            if sum == 0.0 {
                continue;
            }
            row /= sum;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::Rng;
    use rand::SeedableRng;

    use super::*;

    use crate::Axis;
    use crate::GridConfig;

    fn random_counts(n: usize, seed: u64) -> CountMatrix {
        let mut rng = StdRng::seed_from_u64(seed);

        let rows: Vec<Vec<u64>> = (0..n)
            .map(|i| {
                // Leave some states unvisited.
                if i % 5 == 3 {
                    return vec![0; n];
                }

                (0..n)
                    .map(|_| if rng.gen_bool(0.3) { rng.gen_range(1..100) } else { 0 })
                    .collect()
            })
            .collect();

        CountMatrix::from_rows(&rows).unwrap()
    }

    fn small_space() -> StateSpace {
        StateSpace::new(GridConfig {
            delay: Axis::new(-2.0, 2.0, 2.0),
            window: Axis::new(-4.0, 4.0, 2.0),
        })
        .unwrap()
    }

    #[test]
    fn filled_rows_are_stochastic() {
        let counts = random_counts(15, 7);
        let m = filled_normalize(&counts).unwrap();

        assert_eq!(m.conditioning(), Conditioning::Filled);

        for row in m.as_matrix().row_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-9);
            assert!(row.iter().all(|p| (0.0..=1.0).contains(p)));
        }
    }

    #[test]
    fn zero_row_becomes_uniform() {
        let counts =
            CountMatrix::from_rows(&[vec![0, 3, 1], vec![0, 0, 0], vec![5, 0, 0]])
                .unwrap();

        let m = filled_normalize(&counts).unwrap();

        for j in 0..3 {
            assert!((m.get(1, j) - 1.0 / 3.0).abs() < 1e-12);
        }

        assert_eq!(m.get(0, 1), 0.75);
        assert_eq!(m.get(2, 0), 1.0);
    }

    #[test]
    fn quadrant_blocks() {
        let space = StateSpace::new(GridConfig {
            delay: Axis::new(0.0, 1.0, 1.0),
            window: Axis::new(0.0, 1.0, 1.0),
        })
        .unwrap();

        let counts = CountMatrix::from_rows(&[
            vec![1, 99, 50, 50],
            vec![0, 0, 3, 1],
            vec![0, 0, 0, 0],
            vec![2, 2, 0, 7],
        ])
        .unwrap();

        let m = quadrant_normalize(&counts, &space, SPARSIFY_THRESHOLD).unwrap();

        assert_eq!(m.conditioning(), Conditioning::Quadrant { block: 2 });

        let rows: Vec<Vec<f64>> = m
            .as_matrix()
            .row_iter()
            .map(|r| r.iter().copied().collect())
            .collect();

        // 1% falls below the threshold.
        assert_eq!(rows[0], vec![0.0, 1.0, 0.5, 0.5]);
        assert_eq!(rows[1], vec![0.0, 0.0, 0.75, 0.25]);
        assert_eq!(rows[2], vec![0.0; 4]);
        assert_eq!(rows[3], vec![0.5, 0.5, 0.0, 1.0]);
    }

    #[test]
    fn quadrant_is_idempotent() {
        let space = small_space();
        let counts = random_counts(space.len(), 11);

        let once = quadrant_normalize(&counts, &space, SPARSIFY_THRESHOLD).unwrap();
        let twice = quadrant_normalize_matrix(
            once.as_matrix(),
            space.num_windows(),
            SPARSIFY_THRESHOLD,
        )
        .unwrap();

        for (a, b) in once.as_matrix().iter().zip(twice.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn quadrant_drops_noise() {
        let space = small_space();
        let counts = random_counts(space.len(), 3);

        let m = quadrant_normalize(&counts, &space, 0.2).unwrap();

        assert!(m.as_matrix().iter().all(|p| *p == 0.0 || *p >= 0.2));
    }

    #[test]
    fn quadrant_grid_mismatch() {
        let space = small_space();
        let counts = CountMatrix::zeros(4);

        assert!(matches!(
            quadrant_normalize(&counts, &space, SPARSIFY_THRESHOLD),
            Err(Error::DegenerateMatrix { .. })
        ));
    }

    #[test]
    fn rejects_non_stochastic() {
        let m = DMatrix::from_row_slice(2, 2, &[0.5, 0.4, 0.0, 1.0]);

        assert!(matches!(
            StochasticMatrix::new(m),
            Err(Error::DegenerateMatrix { row: 0, .. })
        ));

        let m = DMatrix::from_row_slice(2, 2, &[1.5, -0.5, 0.0, 1.0]);

        assert!(matches!(
            StochasticMatrix::new(m),
            Err(Error::DegenerateMatrix { row: 0, .. })
        ));
    }
}
