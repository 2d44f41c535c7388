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

mod config;

use std::path::Path;
use std::process::exit;

use log::error;
use log::info;

use ccmarkov::partition::Partition;
use ccmarkov::persist;
use ccmarkov::pipeline;
use ccmarkov::StateSpace;

use crate::config::Action;
use crate::config::AppConfig;
use crate::config::TestSelection;

fn main() {
    let rc = run();

    exit(rc);
}

fn run() -> i32 {
    env_logger::builder().init();

    let config = match AppConfig::from_clap() {
        Ok(v) => v,

        Err(e) => {
            error!("Error loading configuration, exiting: {}", e);
            return 1;
        },
    };

    let space = match StateSpace::new(config.grid) {
        Ok(v) => v,

        Err(e) => {
            error!("invalid grid: {}", e);
            return 1;
        },
    };

    let res = match config.action {
        Action::Preprocess { log, out } =>
            pipeline::preprocess(space.config(), &log, &out).map(|n| {
                info!("wrote {} observations to {}", n, out.display());
            }),

        Action::Train {
            traces_dir,
            name,
            num_files,
            test,
            out_dir,
        } => train(&space, &traces_dir, &name, num_files, test, &out_dir),

        Action::Analyze {
            matrix,
            state_counts,
            out_dir,
            analysis,
        } => analyze(&space, &matrix, state_counts.as_deref(), &out_dir, &analysis),
    };

    match res {
        Ok(()) => 0,

        Err(e) => {
            error!("{}", e);
            2
        },
    }
}

fn train(
    space: &StateSpace, traces_dir: &Path, name: &str,
    num_files: usize, test: TestSelection, out_dir: &Path,
) -> ccmarkov::Result<()> {
    let (partition, suffix) = match test {
        TestSelection::None =>
            (Partition::all(num_files), format!("N{num_files:03}")),

        TestSelection::File(path) => {
            let partition = Partition::with_test_set(
                num_files,
                &persist::read_indices(&path)?,
            )?;
            let suffix = format!("N{:03}-T{:03}", num_files, partition.test.len());

            (partition, suffix)
        },

        TestSelection::Random { count, seed } => (
            Partition::random(num_files, count, seed)?,
            format!("N{:03}-{}", num_files - count, seed),
        ),
    };

    let estimate = pipeline::train(space, traces_dir, name, &partition)?;

    pipeline::write_training(out_dir, name, &suffix, &estimate, &partition)?;

    Ok(())
}

fn analyze(
    space: &StateSpace, matrix: &Path,
    state_counts: Option<&Path>, out_dir: &Path,
    config: &pipeline::AnalysisConfig,
) -> ccmarkov::Result<()> {
    let counts = persist::read_count_matrix(matrix)?;

    let occupancy = match state_counts {
        Some(path) => Some(persist::read_state_counts(path)?),

        None => None,
    };

    let analysis =
        pipeline::analyze(&counts, space, config, occupancy.as_deref())?;

    print!("{analysis}");

    analysis.write_outputs(out_dir, &pipeline::output_prefix(matrix))
}
