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

//! Plain-text tables read and written by the engine.
//!
//! Every table is line oriented: one matrix row, vector entry or index per
//! line, in state order. Matrices are comma separated; processed traces and
//! top-state lists are space separated.

use std::fmt::Display;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

use crate::condition::StochasticMatrix;
use crate::estimator::CountMatrix;
use crate::mixing::MixingReport;
use crate::quantize::StepEvent;
use crate::Distribution;
use crate::Error;
use crate::GridConfig;
use crate::Observation;
use crate::Result;
use crate::TopState;

fn create(path: &Path) -> Result<BufWriter<File>> {
    Ok(BufWriter::new(File::create(path)?))
}

fn lines(path: &Path) -> Result<impl Iterator<Item = std::io::Result<String>>> {
    Ok(BufReader::new(File::open(path)?).lines())
}

fn parse_error(path: &Path, line: usize, reason: String) -> Error {
    Error::Parse {
        path: path.to_path_buf(),
        line: line + 1,
        reason,
    }
}

/// Writes a count matrix, one comma-separated row per line.
pub fn write_count_matrix<P: AsRef<Path>>(
    path: P, counts: &CountMatrix,
) -> Result<()> {
    let mut out = create(path.as_ref())?;

    for i in 0..counts.dim() {
        let row: Vec<String> = counts.row(i).map(|c| c.to_string()).collect();
        writeln!(out, "{}", row.join(","))?;
    }

    out.flush()?;

    Ok(())
}

/// Reads a count matrix written by [`write_count_matrix()`].
pub fn read_count_matrix<P: AsRef<Path>>(path: P) -> Result<CountMatrix> {
    let path = path.as_ref();
    let mut rows = Vec::new();

    for (n, line) in lines(path)?.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let row = line
            .split(',')
            .map(|f| f.trim().parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| parse_error(path, n, e.to_string()))?;

        rows.push(row);
    }

    CountMatrix::from_rows(&rows)
}

/// Writes a conditioned model.
///
/// The header line describes the grid so that the model runtime can rebuild
/// the state space: `count,min,max,step` of the window axis, then of the
/// delay axis.
pub fn write_model<P: AsRef<Path>>(
    path: P, m: &StochasticMatrix, grid: &GridConfig,
) -> Result<()> {
    let mut out = create(path.as_ref())?;

    writeln!(
        out,
        "{},{},{},{},{},{},{},{}",
        grid.window.len(),
        grid.window.min,
        grid.window.max,
        grid.window.step,
        grid.delay.len(),
        grid.delay.min,
        grid.delay.max,
        grid.delay.step,
    )?;

    for row in m.as_matrix().row_iter() {
        let row: Vec<String> = row.iter().map(|p| format!("{p:.10}")).collect();
        writeln!(out, "{}", row.join(","))?;
    }

    out.flush()?;

    Ok(())
}

/// Writes one probability per line.
pub fn write_distribution<P: AsRef<Path>>(
    path: P, d: &Distribution,
) -> Result<()> {
    let mut out = create(path.as_ref())?;

    for p in d.iter() {
        writeln!(out, "{p:.6}")?;
    }

    out.flush()?;

    Ok(())
}

/// Writes the mixing time of every start state, `-1` where it failed.
pub fn write_mixing_times<P: AsRef<Path>>(
    path: P, report: &MixingReport,
) -> Result<()> {
    let mut out = create(path.as_ref())?;

    for t in report.mixing_times() {
        match t {
            Some(t) => writeln!(out, "{t}")?,

            None => writeln!(out, "-1")?,
        }
    }

    out.flush()?;

    Ok(())
}

/// Writes `delay window probability` per line.
pub fn write_top_states<P: AsRef<Path>>(path: P, top: &[TopState]) -> Result<()> {
    let mut out = create(path.as_ref())?;

    for s in top {
        writeln!(out, "{} {} {:.6}", s.delay, s.window, s.probability)?;
    }

    out.flush()?;

    Ok(())
}

fn write_column<T: Display>(path: &Path, values: &[T]) -> Result<()> {
    let mut out = create(path)?;

    for v in values {
        writeln!(out, "{v}")?;
    }

    out.flush()?;

    Ok(())
}

fn read_column<T>(path: &Path) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let mut values = Vec::new();

    for (n, line) in lines(path)?.enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let v = line
            .parse()
            .map_err(|e: T::Err| parse_error(path, n, e.to_string()))?;

        values.push(v);
    }

    Ok(values)
}

/// Writes one file index per line.
pub fn write_indices<P: AsRef<Path>>(path: P, indices: &[usize]) -> Result<()> {
    write_column(path.as_ref(), indices)
}

pub fn read_indices<P: AsRef<Path>>(path: P) -> Result<Vec<usize>> {
    read_column(path.as_ref())
}

/// Writes how many observations fell on each state, one per line.
pub fn write_state_counts<P: AsRef<Path>>(path: P, counts: &[u64]) -> Result<()> {
    write_column(path.as_ref(), counts)
}

pub fn read_state_counts<P: AsRef<Path>>(path: P) -> Result<Vec<u64>> {
    read_column(path.as_ref())
}

/// Writes the observations of one trace, `delay window` per line.
pub fn write_trace<P: AsRef<Path>>(
    path: P, observations: &[Observation],
) -> Result<()> {
    let mut out = create(path.as_ref())?;

    for o in observations {
        writeln!(out, "{} {}", o.delay, o.window)?;
    }

    out.flush()?;

    Ok(())
}

/// Reads a processed trace.
///
/// Rows that cannot be read as two finite numbers become missing
/// observations. Blank lines are ignored.
pub fn read_trace<P: AsRef<Path>>(path: P) -> Result<Vec<Option<Observation>>> {
    let mut trace = Vec::new();

    for line in lines(path.as_ref())? {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        trace.push(Observation::parse(&line));
    }

    Ok(trace)
}

/// Reads the events of a combined sender/receiver log.
pub fn read_combined_log<P: AsRef<Path>>(path: P) -> Result<Vec<StepEvent>> {
    let mut events = Vec::new();

    for line in lines(path.as_ref())? {
        if let Some(event) = StepEvent::parse(&line?) {
            events.push(event);
        }
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    use crate::condition;
    use crate::Axis;
    use crate::StateSpace;

    #[test]
    fn count_matrix_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        let counts =
            CountMatrix::from_rows(&[vec![0, 7, 1], vec![0, 0, 0], vec![12, 0, 3]])
                .unwrap();

        write_count_matrix(&path, &counts).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "0,7,1\n0,0,0\n12,0,3\n");
        assert_eq!(read_count_matrix(&path).unwrap(), counts);
    }

    #[test]
    fn malformed_count_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad-counts.csv");

        fs::write(&path, "1,2\n3,x\n").unwrap();
        assert!(matches!(
            read_count_matrix(&path),
            Err(Error::Parse { line: 2, .. })
        ));

        fs::write(&path, "1,2\n3\n").unwrap();
        assert!(matches!(
            read_count_matrix(&path),
            Err(Error::DegenerateMatrix { row: 1, .. })
        ));
    }

    #[test]
    fn model_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.csv");
        let space = StateSpace::new(GridConfig::default()).unwrap();
        let counts = CountMatrix::zeros(space.len());

        let m = condition::quadrant_normalize(
            &counts,
            &space,
            condition::SPARSIFY_THRESHOLD,
        )
        .unwrap();

        write_model(&path, &m, space.config()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();

        assert_eq!(lines.next(), Some("21,-20,20,2,11,-10,10,2"));

        let first = lines.next().unwrap();
        assert_eq!(first.split(',').count(), 231);
        assert!(first.starts_with("0.0000000000,"));
        assert_eq!(lines.count(), 230);
    }

    #[test]
    fn trace_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.out");

        fs::write(&path, "0 0\n-2 4\n\nnan nan\n10 20\n").unwrap();

        assert_eq!(read_trace(&path).unwrap(), vec![
            Some(Observation::new(0.0, 0.0)),
            Some(Observation::new(-2.0, 4.0)),
            None,
            Some(Observation::new(10.0, 20.0)),
        ]);

        write_trace(&path, &[Observation::new(-4.0, 2.0)]).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "-4 2\n");
    }

    #[test]
    fn index_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("findex.csv");

        write_indices(&path, &[3, 0, 17]).unwrap();

        assert_eq!(read_indices(&path).unwrap(), vec![3, 0, 17]);

        fs::write(&path, "1\n-1\n").unwrap();
        assert!(matches!(
            read_indices(&path),
            Err(Error::Parse { line: 2, .. })
        ));
    }

    #[test]
    fn top_states_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("top.txt");

        write_top_states(&path, &[TopState {
            index: 0,
            delay: -2.0,
            window: 4.0,
            probability: 0.25,
        }])
        .unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "-2 4 0.250000\n");
    }

    #[test]
    fn fractional_grid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.csv");

        let space = StateSpace::new(GridConfig {
            delay: Axis::new(-1.0, 1.0, 0.5),
            window: Axis::new(-1.0, 1.0, 0.5),
        })
        .unwrap();
        let counts = CountMatrix::zeros(space.len());
        let m = condition::filled_normalize(&counts).unwrap();

        write_model(&path, &m, space.config()).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().next(), Some("5,-1,1,0.5,5,-1,1,0.5"));

        let trace = [Observation::new(0.5, -0.5), Observation::new(-1.0, 0.25)];
        let path = dir.path().join("trace.out");

        write_trace(&path, &trace).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0.5 -0.5\n-1 0.25\n");

        let read: Vec<_> = read_trace(&path).unwrap().into_iter().flatten().collect();
        assert_eq!(read, trace);
    }
}
