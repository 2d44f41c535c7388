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

use std::path::PathBuf;

use clap::value_parser;
use clap::Arg;
use clap::ArgMatches;
use clap::Command;

use ccmarkov::pipeline::AnalysisConfig;
use ccmarkov::GridConfig;

/// How the held-out test traces are chosen.
#[derive(Debug)]
pub enum TestSelection {
    None,

    /// File with one test trace index per line.
    File(PathBuf),

    /// Shuffle the traces and hold out the first `count`.
    Random { count: usize, seed: u64 },
}

#[derive(Debug)]
pub enum Action {
    Preprocess {
        log: PathBuf,
        out: PathBuf,
    },

    Train {
        traces_dir: PathBuf,
        name: String,
        num_files: usize,
        test: TestSelection,
        out_dir: PathBuf,
    },

    Analyze {
        matrix: PathBuf,
        state_counts: Option<PathBuf>,
        out_dir: PathBuf,
        analysis: AnalysisConfig,
    },
}

#[derive(Debug)]
pub struct AppConfig {
    pub grid: GridConfig,

    pub action: Action,
}

fn grid_arg() -> Arg {
    Arg::new("grid")
        .long("grid")
        .help("JSON file describing the state grid")
        .value_parser(value_parser!(PathBuf))
        .global(true)
}

impl AppConfig {
    pub fn from_clap() -> std::result::Result<Self, String> {
        let mut matches = Command::new("ccmarkov")
            .version("v0.1.0")
            .about("trains and analyzes Markov models of congestion control")
            .subcommand_required(true)
            .arg(grid_arg())
            .subcommand(
                Command::new("preprocess")
                    .about("Quantizes a combined sender/receiver log")
                    .arg(
                        Arg::new("LOG")
                            .help("Combined log file")
                            .required(true)
                            .value_parser(value_parser!(PathBuf))
                            .index(1),
                    )
                    .arg(
                        Arg::new("OUT")
                            .help("Processed trace file to write")
                            .required(true)
                            .value_parser(value_parser!(PathBuf))
                            .index(2),
                    ),
            )
            .subcommand(
                Command::new("train")
                    .about("Counts state transitions over processed traces")
                    .arg(
                        Arg::new("NAME")
                            .help("Name of the traces, as in processed-<i>-<NAME>.out")
                            .required(true)
                            .index(1),
                    )
                    .arg(
                        Arg::new("traces_dir")
                            .long("traces-dir")
                            .help("Directory holding the processed traces")
                            .value_parser(value_parser!(PathBuf))
                            .default_value("processed"),
                    )
                    .arg(
                        Arg::new("num_files")
                            .long("num-files")
                            .help("Number of processed traces")
                            .value_parser(value_parser!(usize))
                            .default_value("940"),
                    )
                    .arg(
                        Arg::new("test_set")
                            .long("test-set")
                            .help("File listing the trace indices to hold out")
                            .value_parser(value_parser!(PathBuf))
                            .conflicts_with("test_count"),
                    )
                    .arg(
                        Arg::new("test_count")
                            .long("test-count")
                            .help("Number of randomly chosen traces to hold out")
                            .value_parser(value_parser!(usize)),
                    )
                    .arg(
                        Arg::new("seed")
                            .long("seed")
                            .help("Random seed for choosing held out traces")
                            .value_parser(value_parser!(u64))
                            .default_value("0"),
                    )
                    .arg(
                        Arg::new("out_dir")
                            .long("out-dir")
                            .help("Directory for the count matrix and file lists")
                            .value_parser(value_parser!(PathBuf))
                            .default_value("training"),
                    ),
            )
            .subcommand(
                Command::new("analyze")
                    .about("Analyzes a count matrix and writes the model")
                    .arg(
                        Arg::new("MATRIX")
                            .help("Count matrix file")
                            .required(true)
                            .value_parser(value_parser!(PathBuf))
                            .index(1),
                    )
                    .arg(
                        Arg::new("state_counts")
                            .long("state-counts")
                            .help("Per-state observation counts of the training traces")
                            .value_parser(value_parser!(PathBuf)),
                    )
                    .arg(
                        Arg::new("out_dir")
                            .long("out-dir")
                            .help("Folder to save outputs of analyses")
                            .value_parser(value_parser!(PathBuf))
                            .default_value("figures"),
                    )
                    .arg(
                        Arg::new("config")
                            .long("config")
                            .help("JSON file with analysis parameters")
                            .value_parser(value_parser!(PathBuf)),
                    ),
            )
            .get_matches();

        let grid = match matches.remove_one::<PathBuf>("grid") {
            Some(path) => GridConfig::from_json_file(&path)
                .map_err(|e| format!("{}: {}", path.display(), e))?,

            None => GridConfig::default(),
        };

        let action = match matches.remove_subcommand() {
            Some((name, m)) => Self::action(&name, m)?,

            None => return Err("no command given".into()),
        };

        Ok(AppConfig { grid, action })
    }

    fn action(
        name: &str, mut m: ArgMatches,
    ) -> std::result::Result<Action, String> {
        let missing = |arg: &str| format!("missing argument {arg}");

        let action = match name {
            "preprocess" => Action::Preprocess {
                log: m.remove_one("LOG").ok_or_else(|| missing("LOG"))?,
                out: m.remove_one("OUT").ok_or_else(|| missing("OUT"))?,
            },

            "train" => {
                let test = match (
                    m.remove_one::<PathBuf>("test_set"),
                    m.remove_one::<usize>("test_count"),
                ) {
                    (Some(path), _) => TestSelection::File(path),

                    (None, Some(count)) => TestSelection::Random {
                        count,
                        seed: m.remove_one("seed").unwrap_or(0),
                    },

                    (None, None) => TestSelection::None,
                };

                Action::Train {
                    traces_dir: m
                        .remove_one("traces_dir")
                        .ok_or_else(|| missing("--traces-dir"))?,
                    name: m.remove_one("NAME").ok_or_else(|| missing("NAME"))?,
                    num_files: m
                        .remove_one("num_files")
                        .ok_or_else(|| missing("--num-files"))?,
                    test,
                    out_dir: m
                        .remove_one("out_dir")
                        .ok_or_else(|| missing("--out-dir"))?,
                }
            },

            "analyze" => {
                let analysis = match m.remove_one::<PathBuf>("config") {
                    Some(path) => AnalysisConfig::from_json_file(&path)
                        .map_err(|e| format!("{}: {}", path.display(), e))?,

                    None => AnalysisConfig::default(),
                };

                Action::Analyze {
                    matrix: m
                        .remove_one("MATRIX")
                        .ok_or_else(|| missing("MATRIX"))?,
                    state_counts: m.remove_one("state_counts"),
                    out_dir: m
                        .remove_one("out_dir")
                        .ok_or_else(|| missing("--out-dir"))?,
                    analysis,
                }
            },

            _ => return Err(format!("unknown command {name}")),
        };

        Ok(action)
    }
}
