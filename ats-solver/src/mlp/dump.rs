use std::{
    fmt::Write as _,
    fs,
    io,
    path::{Path, PathBuf},
};

use super::problem::{ColumnKind, Problem, RowBound};

/// On-disk format of problem dumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpFormat {
    /// CPLEX LP format.
    #[default]
    Cplex,
    /// Free MPS format.
    Mps,
}

impl DumpFormat {
    const fn extension(self) -> &'static str {
        match self {
            Self::Cplex => "lp",
            Self::Mps => "mps",
        }
    }
}

/// Base path of the dump files for one solve, without extension.
pub(crate) fn dump_path(dir: &Path, peers: usize, addresses: usize) -> PathBuf {
    dir.join(format!("problem_p{peers}_a{addresses}_{}", ats_common::unix_micros()))
}

/// Writes `problem` next to `base` in the given format and returns the file name.
pub(crate) fn write_problem(problem: &Problem, format: DumpFormat, base: &Path) -> io::Result<PathBuf> {
    let path = base.with_extension(format.extension());
    let text = match format {
        DumpFormat::Cplex => to_cplex(problem),
        DumpFormat::Mps => to_mps(problem),
    };
    fs::write(&path, text)?;
    Ok(path)
}

/// Writes the column values of a solution next to `base`.
pub(crate) fn write_solution(
    problem: &Problem,
    status: &str,
    objective: Option<f64>,
    values: &[f64],
    base: &Path,
) -> io::Result<PathBuf> {
    let path = base.with_extension("sol");
    let mut out = String::new();
    let _ = writeln!(out, "status {status}");
    if let Some(objective) = objective {
        let _ = writeln!(out, "objective {objective}");
    }
    for (column, value) in problem.columns().iter().zip(values) {
        let _ = writeln!(out, "{} {value}", column.name);
    }
    fs::write(&path, out)?;
    Ok(path)
}

fn term(out: &mut String, coefficient: f64, name: &str) {
    let sign = if coefficient < 0.0 { '-' } else { '+' };
    let _ = write!(out, " {sign} {} {name}", coefficient.abs());
}

fn to_cplex(problem: &Problem) -> String {
    let mut out = String::from("\\* ats bandwidth allocation problem *\\\n\nMaximize\n obj:");
    let objective: Vec<_> = problem.columns().iter().filter(|c| c.objective != 0.0).collect();
    if objective.is_empty() {
        out.push_str(" 0");
    }
    for column in objective {
        term(&mut out, column.objective, &column.name);
    }

    out.push_str("\n\nSubject To\n");
    for row in problem.rows() {
        let mut expr = String::new();
        for (column, value) in &row.entries {
            term(&mut expr, *value, &problem.column(*column).name);
        }
        if expr.is_empty() {
            expr.push_str(" 0");
        }
        let _ = match row.bound {
            RowBound::Upper(u) => writeln!(out, " {}:{expr} <= {u}", row.name),
            RowBound::Lower(l) => writeln!(out, " {}:{expr} >= {l}", row.name),
            RowBound::Fixed(v) => writeln!(out, " {}:{expr} = {v}", row.name),
            RowBound::Range(l, u) => writeln!(out, " {}_lo:{expr} >= {l}\n {}_up:{expr} <= {u}", row.name, row.name),
        };
    }

    out.push_str("\nBounds\n");
    for column in problem.columns() {
        let _ = match column.upper {
            Some(u) => writeln!(out, " {} <= {} <= {u}", column.lower, column.name),
            None => writeln!(out, " {} >= {}", column.name, column.lower),
        };
    }

    let binaries: Vec<_> =
        problem.columns().iter().filter(|c| c.kind == ColumnKind::Binary).collect();
    if !binaries.is_empty() {
        out.push_str("\nBinary\n");
        for column in binaries {
            let _ = writeln!(out, " {}", column.name);
        }
    }

    out.push_str("\nEnd\n");
    out
}

fn to_mps(problem: &Problem) -> String {
    let mut out = String::from("NAME ats\nROWS\n N obj\n");
    for row in problem.rows() {
        let kind = match row.bound {
            RowBound::Upper(_) => 'L',
            RowBound::Lower(_) | RowBound::Range(..) => 'G',
            RowBound::Fixed(_) => 'E',
        };
        let _ = writeln!(out, " {kind} {}", row.name);
    }

    let mut by_column = vec![Vec::new(); problem.columns().len()];
    for row in problem.rows() {
        for (column, value) in &row.entries {
            by_column[column.index()].push((row.name.as_str(), *value));
        }
    }

    out.push_str("COLUMNS\n");
    let mut integer = false;
    for (column, entries) in problem.columns().iter().zip(&by_column) {
        let binary = column.kind == ColumnKind::Binary;
        if binary != integer {
            let marker = if binary { "INTORG" } else { "INTEND" };
            let _ = writeln!(out, " MARKER 'MARKER' '{marker}'");
            integer = binary;
        }
        if column.objective != 0.0 {
            let _ = writeln!(out, " {} obj {}", column.name, column.objective);
        }
        for (row, value) in entries {
            let _ = writeln!(out, " {} {row} {value}", column.name);
        }
    }
    if integer {
        out.push_str(" MARKER 'MARKER' 'INTEND'\n");
    }

    out.push_str("RHS\n");
    for row in problem.rows() {
        let rhs = match row.bound {
            RowBound::Upper(v) | RowBound::Lower(v) | RowBound::Fixed(v) | RowBound::Range(v, _) => v,
        };
        if rhs != 0.0 {
            let _ = writeln!(out, " RHS {} {rhs}", row.name);
        }
    }

    let ranges: Vec<_> = problem
        .rows()
        .iter()
        .filter_map(|r| match r.bound {
            RowBound::Range(l, u) => Some((r.name.as_str(), u - l)),
            _ => None,
        })
        .collect();
    if !ranges.is_empty() {
        out.push_str("RANGES\n");
        for (name, range) in ranges {
            let _ = writeln!(out, " RNG {name} {range}");
        }
    }

    out.push_str("BOUNDS\n");
    for column in problem.columns() {
        if column.lower != 0.0 {
            let _ = writeln!(out, " LO BND {} {}", column.name, column.lower);
        }
        if let Some(u) = column.upper {
            let _ = writeln!(out, " UP BND {} {u}", column.name);
        }
    }

    out.push_str("ENDATA\n");
    out
}
