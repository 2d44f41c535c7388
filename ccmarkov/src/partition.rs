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

//! Reproducible train/test splits of trace files.

use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::Error;
use crate::Result;

/// Trace file indices split into a training set and a held-out test set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Partition {
    /// Trains on every file.
    pub fn all(num_files: usize) -> Self {
        Partition {
            train: (0..num_files).collect(),
            test: Vec::new(),
        }
    }

    /// Holds out `test`, training on the rest of `0..num_files`.
    pub fn with_test_set(num_files: usize, test: &[usize]) -> Result<Self> {
        if let Some(i) = test.iter().find(|&&i| i >= num_files) {
            return Err(Error::InvalidConfig(format!(
                "test file {i} is not among {num_files} files"
            )));
        }

        let held_out: BTreeSet<usize> = test.iter().copied().collect();

        Ok(Partition {
            train: (0..num_files).filter(|i| !held_out.contains(i)).collect(),
            test: held_out.into_iter().collect(),
        })
    }

    /// Holds out `test_count` files picked by a shuffle seeded with `seed`.
    pub fn random(num_files: usize, test_count: usize, seed: u64) -> Result<Self> {
        if test_count > num_files {
            return Err(Error::InvalidConfig(format!(
                "cannot hold out {test_count} of {num_files} files"
            )));
        }

        let mut rng = StdRng::seed_from_u64(seed);

        let mut files: Vec<usize> = (0..num_files).collect();
        files.shuffle(&mut rng);

        Self::with_test_set(num_files, &files[..test_count])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complement() {
        let p = Partition::with_test_set(6, &[4, 1]).unwrap();

        assert_eq!(p.train, vec![0, 2, 3, 5]);
        assert_eq!(p.test, vec![1, 4]);
    }

    #[test]
    fn all_files() {
        let p = Partition::all(3);

        assert_eq!(p.train, vec![0, 1, 2]);
        assert!(p.test.is_empty());
    }

    #[test]
    fn out_of_range_test_file() {
        assert!(matches!(
            Partition::with_test_set(3, &[3]),
            Err(Error::InvalidConfig(_))
        ));

        assert!(matches!(
            Partition::random(3, 4, 0),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn random_is_reproducible() {
        let a = Partition::random(100, 20, 42).unwrap();
        let b = Partition::random(100, 20, 42).unwrap();

        assert_eq!(a, b);
        assert_eq!(a.test.len(), 20);
        assert_eq!(a.train.len(), 80);

        let mut all: Vec<usize> = a.train.iter().chain(&a.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).collect::<Vec<_>>());
    }
}
