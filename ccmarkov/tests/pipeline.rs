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

use std::fs;

use ccmarkov::mixing::MixingConfig;
use ccmarkov::partition::Partition;
use ccmarkov::persist;
use ccmarkov::pipeline;
use ccmarkov::pipeline::AnalysisConfig;
use ccmarkov::GridConfig;
use ccmarkov::StateSpace;

// A sender that alternates between growing and shrinking its window by 2%,
// with the delay tracking the window.
fn combined_log(steps: usize, phase: usize) -> String {
    let mut log = String::new();
    let mut window = 100.0;
    let mut delay = 50.0;

    for i in 0..steps {
        let t = i as f64 * 0.01;

        log.push_str(&format!("{:.3},0,0,0,{},0,0\n", t, window));
        log.push_str(&format!("{:.3},{},{},0,0\n", t + 0.005, i, delay));

        let factor = if (i + phase) % 3 == 0 { 0.98 } else { 1.02 };
        window *= factor;
        delay *= factor;
    }

    log
}

#[test]
fn train_and_analyze() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();
    let logs = dir.join("logs");
    let processed = dir.join("processed");
    let training = dir.join("training");
    let figures = dir.join("figures");

    fs::create_dir_all(&logs).unwrap();
    fs::create_dir_all(&processed).unwrap();

    let grid = GridConfig::default();
    let space = StateSpace::new(grid).unwrap();

    for i in 0..4 {
        let log = logs.join(format!("channel_log_{i}-combined.out"));
        fs::write(&log, combined_log(60, i)).unwrap();

        let n = pipeline::preprocess(
            &grid,
            &log,
            pipeline::trace_path(&processed, "toy", i),
        )
        .unwrap();

        assert_eq!(n, 59);
    }

    let partition = Partition::with_test_set(4, &[1]).unwrap();
    let estimate = pipeline::train(&space, &processed, "toy", &partition).unwrap();

    assert_eq!(estimate.trace_ids, vec![0, 2, 3]);
    assert!(estimate.counts.total() > 0);

    let matrix =
        pipeline::write_training(&training, "toy", "N003", &estimate, &partition)
            .unwrap();

    assert_eq!(
        persist::read_indices(training.join("findex-train-toy-N003.csv"))
            .unwrap(),
        vec![0, 2, 3]
    );

    let counts = persist::read_count_matrix(&matrix).unwrap();
    assert_eq!(counts, estimate.counts);

    let config = AnalysisConfig {
        mixing: MixingConfig {
            thresholds: vec![1e-3],
            ..Default::default()
        },
        ..Default::default()
    };

    let analysis = pipeline::analyze(
        &counts,
        &space,
        &config,
        Some(&estimate.state_counts[..]),
    )
    .unwrap();

    assert!((analysis.stationary.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    assert!(analysis.effective_support <= space.len());
    assert_eq!(analysis.zero_states, counts.zero_rows());
    assert!(analysis.zero_states.len() < space.len());

    let prefix = pipeline::output_prefix(&matrix);
    assert_eq!(prefix, "toy-N003");

    analysis.write_outputs(&figures, &prefix).unwrap();

    for file in [
        "toy-N003-output.txt",
        "toy-N003-statdistr.txt",
        "toy-N003-topstates.txt",
        "toy-N003-mixingtimes-1e-3.txt",
        "toy-N003-transMatrix.csv",
    ] {
        assert!(figures.join(file).exists(), "{file} missing");
    }

    let statdistr = fs::read_to_string(figures.join("toy-N003-statdistr.txt"))
        .unwrap();
    assert_eq!(statdistr.lines().count(), space.len());

    let model =
        fs::read_to_string(figures.join("toy-N003-transMatrix.csv")).unwrap();
    assert_eq!(model.lines().count(), space.len() + 1);
}

#[test]
fn missing_matrix_file() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path();

    assert!(matches!(
        persist::read_count_matrix(dir.join("nope.csv")),
        Err(ccmarkov::Error::Io(_))
    ));
}
