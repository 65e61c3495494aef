//! Dense two-phase primal simplex over bounded variables.
//!
//! Every column is shifted to its lower bound (`x = l + y`, `y >= 0`) and finite upper
//! bounds become explicit `y <= u - l` rows. Rows are normalized to a non-negative right hand
//! side and completed with slack, surplus and artificial columns. Phase one minimizes the sum
//! of artificials, phase two maximizes the objective with artificials barred from entering.

use std::time::Instant;

use super::problem::{Problem, RowBound};

/// Smallest magnitude accepted as a pivot element.
const PIVOT_EPS: f64 = 1e-9;
/// Reduced costs below this are treated as zero.
const COST_EPS: f64 = 1e-9;
/// Consecutive degenerate pivots before switching to Bland's rule.
const DEGENERATE_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpStatus {
    Optimal,
    Infeasible,
    Unbounded,
    IterationLimit,
    TimeLimit,
}

/// Per column bounds used for one LP solve. Branch-and-bound tightens these without
/// touching the [`Problem`].
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Bounds {
    pub(crate) lower: Vec<f64>,
    pub(crate) upper: Vec<Option<f64>>,
}

impl Bounds {
    pub(crate) fn of(problem: &Problem) -> Self {
        Self {
            lower: problem.columns().iter().map(|c| c.lower).collect(),
            upper: problem.columns().iter().map(|c| c.upper).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Limits {
    pub(crate) max_pivots: usize,
    pub(crate) deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub(crate) struct LpSolution {
    pub(crate) status: LpStatus,
    pub(crate) objective: f64,
    pub(crate) values: Vec<f64>,
    pub(crate) pivots: usize,
    /// Whether a saved basis was accepted as the starting point.
    pub(crate) warm: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sense {
    Le,
    Ge,
    Eq,
}

/// An optimal basis, reusable as the starting point of a later solve with the same layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Basis {
    layout: Vec<Sense>,
    width: usize,
    basic: Vec<usize>,
}

struct StdRow {
    coeffs: Vec<(usize, f64)>,
    sense: Sense,
    rhs: f64,
}

/// Turns the problem rows and column bounds into `a·y (<=|>=|=) rhs` rows with `rhs >= 0`.
/// Returns `None` if a row without entries can never be satisfied or bounds cross.
fn standardize(problem: &Problem, bounds: &Bounds) -> Option<Vec<StdRow>> {
    let mut rows = Vec::with_capacity(problem.rows().len() + bounds.upper.len());

    for row in problem.rows() {
        let shift: f64 = row.entries.iter().map(|(c, v)| v * bounds.lower[c.index()]).sum();

        if row.entries.iter().all(|(_, v)| *v == 0.0) {
            if !row.bound.contains(shift, 1e-9) {
                tracing::debug!(row = %row.name, "empty row is infeasible");
                return None;
            }
            continue;
        }

        let coeffs: Vec<_> = row.entries.iter().map(|(c, v)| (c.index(), *v)).collect();
        let mut push = |sense, rhs: f64| {
            rows.push(StdRow { coeffs: coeffs.clone(), sense, rhs: rhs - shift })
        };

        match row.bound {
            RowBound::Upper(u) => push(Sense::Le, u),
            RowBound::Lower(l) => push(Sense::Ge, l),
            RowBound::Fixed(v) => push(Sense::Eq, v),
            RowBound::Range(l, u) if l == u => push(Sense::Eq, l),
            RowBound::Range(l, u) => {
                push(Sense::Le, u);
                push(Sense::Ge, l);
            }
        }
    }

    for (j, upper) in bounds.upper.iter().enumerate() {
        let Some(u) = upper else { continue };
        let range = u - bounds.lower[j];
        if range < -1e-9 {
            return None;
        }
        rows.push(StdRow { coeffs: vec![(j, 1.0)], sense: Sense::Le, rhs: range.max(0.0) });
    }

    for row in &mut rows {
        if row.rhs < 0.0 {
            row.rhs = -row.rhs;
            row.coeffs.iter_mut().for_each(|(_, v)| *v = -*v);
            row.sense = match row.sense {
                Sense::Le => Sense::Ge,
                Sense::Ge => Sense::Le,
                Sense::Eq => Sense::Eq,
            };
        }
    }

    Some(rows)
}

struct Tableau {
    rows: usize,
    /// Columns including slacks and artificials, without the right hand side.
    width: usize,
    /// First artificial column.
    art_start: usize,
    data: Vec<f64>,
    obj: Vec<f64>,
    basic: Vec<usize>,
    layout: Vec<Sense>,
    pivots: usize,
}

impl Tableau {
    fn new(structural: usize, rows: &[StdRow]) -> Self {
        let slacks = rows.iter().filter(|r| r.sense != Sense::Eq).count();
        let art_start = structural + slacks;
        let arts = rows.iter().filter(|r| r.sense != Sense::Le).count();
        let width = art_start + arts;
        let stride = width + 1;

        let mut data = vec![0.0; rows.len() * stride];
        let mut basic = Vec::with_capacity(rows.len());
        let (mut next_slack, mut next_art) = (structural, art_start);

        for (i, row) in rows.iter().enumerate() {
            let line = &mut data[i * stride..(i + 1) * stride];
            for (j, v) in &row.coeffs {
                line[*j] += v;
            }
            line[width] = row.rhs;

            match row.sense {
                Sense::Le => {
                    line[next_slack] = 1.0;
                    basic.push(next_slack);
                    next_slack += 1;
                }
                Sense::Ge => {
                    line[next_slack] = -1.0;
                    line[next_art] = 1.0;
                    basic.push(next_art);
                    next_slack += 1;
                    next_art += 1;
                }
                Sense::Eq => {
                    line[next_art] = 1.0;
                    basic.push(next_art);
                    next_art += 1;
                }
            }
        }

        Self {
            rows: rows.len(),
            width,
            art_start,
            data,
            obj: vec![0.0; stride],
            basic,
            layout: rows.iter().map(|r| r.sense).collect(),
            pivots: 0,
        }
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> f64 {
        self.data[i * (self.width + 1) + j]
    }

    #[inline]
    fn rhs(&self, i: usize) -> f64 {
        self.at(i, self.width)
    }

    /// Sets the objective row to the reduced costs of `costs` under the current basis.
    fn price(&mut self, costs: &[f64]) {
        let stride = self.width + 1;
        self.obj.iter_mut().for_each(|v| *v = 0.0);
        self.obj[..costs.len()].copy_from_slice(costs);

        for i in 0..self.rows {
            let cb = costs.get(self.basic[i]).copied().unwrap_or_default();
            if cb == 0.0 {
                continue;
            }
            let line = &self.data[i * stride..(i + 1) * stride];
            for (o, a) in self.obj.iter_mut().zip(line) {
                *o -= cb * a;
            }
        }
    }

    fn pivot(&mut self, r: usize, c: usize) {
        let stride = self.width + 1;
        let pivot = self.at(r, c);

        let (before, rest) = self.data.split_at_mut(r * stride);
        let (prow, after) = rest.split_at_mut(stride);
        prow.iter_mut().for_each(|v| *v /= pivot);
        prow[c] = 1.0;

        for line in before.chunks_exact_mut(stride).chain(after.chunks_exact_mut(stride)) {
            let factor = line[c];
            if factor == 0.0 {
                continue;
            }
            for (v, p) in line.iter_mut().zip(prow.iter()) {
                *v -= factor * p;
            }
            line[c] = 0.0;
            if line[self.width].abs() < 1e-12 {
                line[self.width] = 0.0;
            }
        }

        let factor = self.obj[c];
        if factor != 0.0 {
            for (v, p) in self.obj.iter_mut().zip(prow.iter()) {
                *v -= factor * p;
            }
            self.obj[c] = 0.0;
        }

        self.basic[r] = c;
        self.pivots += 1;
    }

    /// Runs primal simplex iterations on the current objective row over columns `< limit`.
    fn iterate(&mut self, limit: usize, limits: &Limits) -> LpStatus {
        let mut degenerate = 0;
        let mut bland = false;

        loop {
            let entering = if bland {
                (0..limit).find(|j| self.obj[*j] > COST_EPS)
            } else {
                (0..limit)
                    .filter(|j| self.obj[*j] > COST_EPS)
                    .max_by(|a, b| self.obj[*a].total_cmp(&self.obj[*b]))
            };
            let Some(c) = entering else {
                return LpStatus::Optimal;
            };

            if self.pivots >= limits.max_pivots {
                return LpStatus::IterationLimit;
            }
            if limits.deadline.is_some_and(|d| Instant::now() >= d) {
                return LpStatus::TimeLimit;
            }

            let mut leaving: Option<(usize, f64)> = None;
            for i in 0..self.rows {
                let a = self.at(i, c);
                if a <= PIVOT_EPS {
                    continue;
                }
                let ratio = self.rhs(i).max(0.0) / a;
                leaving = match leaving {
                    Some((r, best))
                        if ratio > best + 1e-12
                            || ((ratio - best).abs() <= 1e-12
                                && self.basic[i] > self.basic[r]) =>
                    {
                        Some((r, best))
                    }
                    _ => Some((i, ratio)),
                };
            }
            let Some((r, ratio)) = leaving else {
                return LpStatus::Unbounded;
            };

            if ratio <= 1e-12 {
                degenerate += 1;
                if degenerate > DEGENERATE_LIMIT {
                    bland = true;
                }
            } else {
                degenerate = 0;
            }

            self.pivot(r, c);
        }
    }

    /// Pivots the artificials left at zero out of the basis where possible.
    fn drive_out_artificials(&mut self) {
        for i in 0..self.rows {
            if self.basic[i] < self.art_start {
                continue;
            }
            let candidate = (0..self.art_start)
                .filter(|j| self.at(i, *j).abs() > 1e-7)
                .max_by(|a, b| self.at(i, *a).abs().total_cmp(&self.at(i, *b).abs()));
            if let Some(j) = candidate {
                self.pivot(i, j);
            }
        }
    }

    /// Pivots the columns of a saved basis into the tableau. Returns `false` if the basis is
    /// singular or not primal feasible for the current data.
    fn install(&mut self, basis: &Basis, tol: f64) -> bool {
        if basis.layout != self.layout || basis.width != self.width {
            return false;
        }

        let mut wanted = vec![false; self.width];
        for &j in &basis.basic {
            wanted[j] = true;
        }

        for &col in &basis.basic {
            if self.basic.contains(&col) {
                continue;
            }
            let row = (0..self.rows)
                .filter(|i| !wanted[self.basic[*i]])
                .max_by(|a, b| self.at(*a, col).abs().total_cmp(&self.at(*b, col).abs()));
            match row {
                Some(r) if self.at(r, col).abs() > 1e-7 => self.pivot(r, col),
                _ => return false,
            }
        }

        (0..self.rows).all(|i| {
            let rhs = self.rhs(i);
            rhs >= -tol && (self.basic[i] < self.art_start || rhs.abs() <= tol)
        })
    }

    fn basis(&self) -> Basis {
        Basis { layout: self.layout.clone(), width: self.width, basic: self.basic.clone() }
    }

    fn primal(&self, structural: usize) -> Vec<f64> {
        let mut y = vec![0.0; structural];
        for i in 0..self.rows {
            if self.basic[i] < structural {
                y[self.basic[i]] = self.rhs(i).max(0.0);
            }
        }
        y
    }
}

/// Maximizes the objective of `problem` under `bounds`.
///
/// If `warm` holds a basis of a problem with the same layout, it is tried as the starting
/// point and phase one is skipped when it is still feasible. Returns the solution and, when
/// optimal, the final basis.
pub(crate) fn solve(
    problem: &Problem,
    bounds: &Bounds,
    limits: &Limits,
    warm: Option<&Basis>,
) -> (LpSolution, Option<Basis>) {
    let n = problem.columns().len();
    let infeasible = |pivots| LpSolution {
        status: LpStatus::Infeasible,
        objective: f64::NEG_INFINITY,
        values: Vec::new(),
        pivots,
        warm: false,
    };

    let Some(rows) = standardize(problem, bounds) else {
        return (infeasible(0), None);
    };

    let scale = rows.iter().map(|r| r.rhs).fold(1.0, f64::max);
    let costs: Vec<f64> = problem.columns().iter().map(|c| c.objective).collect();

    let mut warm_used = false;
    let mut tableau = Tableau::new(n, &rows);
    if let Some(basis) = warm {
        if tableau.install(basis, 1e-6) {
            warm_used = true;
        } else {
            tracing::trace!("saved basis rejected, cold start");
            tableau = Tableau::new(n, &rows);
        }
    }

    if !warm_used && tableau.art_start < tableau.width {
        let mut phase_one = vec![0.0; tableau.width];
        phase_one[tableau.art_start..].iter_mut().for_each(|c| *c = -1.0);
        tableau.price(&phase_one);

        let status = tableau.iterate(tableau.width, limits);
        if status != LpStatus::Optimal {
            let pivots = tableau.pivots;
            return (
                LpSolution {
                    status,
                    objective: f64::NEG_INFINITY,
                    values: Vec::new(),
                    pivots,
                    warm: false,
                },
                None,
            );
        }

        let infeasibility = tableau.obj[tableau.width];
        if infeasibility > 1e-9 * scale {
            tracing::debug!(infeasibility, "phase one ended with artificials in the basis");
            return (infeasible(tableau.pivots), None);
        }

        tableau.drive_out_artificials();
    }

    tableau.price(&costs);
    let status = tableau.iterate(tableau.art_start, limits);

    let values: Vec<f64> =
        tableau.primal(n).iter().zip(&bounds.lower).map(|(y, l)| l + y).collect();
    let objective = problem.objective_value(&values);
    let basis = (status == LpStatus::Optimal).then(|| tableau.basis());

    tracing::trace!(?status, objective, pivots = tableau.pivots, warm = warm_used, "lp solved");

    (LpSolution { status, objective, values, pivots: tableau.pivots, warm: warm_used }, basis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mlp::problem::ColumnKind;

    fn limits() -> Limits {
        Limits { max_pivots: 1000, deadline: None }
    }

    /// max 3x + 2y  s.t. x + y <= 4, x + 3y <= 6, x <= 3
    #[test]
    fn textbook_maximum() {
        let mut p = Problem::new();
        let x = p.add_column("x", ColumnKind::Continuous, 0.0, Some(3.0), 3.0);
        let y = p.add_column("y", ColumnKind::Continuous, 0.0, None, 2.0);
        let r1 = p.add_row("r1", RowBound::Upper(4.0));
        let r2 = p.add_row("r2", RowBound::Upper(6.0));
        p.set_value(r1, x, 1.0).unwrap();
        p.set_value(r1, y, 1.0).unwrap();
        p.set_value(r2, x, 1.0).unwrap();
        p.set_value(r2, y, 3.0).unwrap();

        let (sol, basis) = solve(&p, &Bounds::of(&p), &limits(), None);
        assert_eq!(sol.status, LpStatus::Optimal);
        assert!((sol.objective - 11.0).abs() < 1e-9);
        assert!((sol.values[0] - 3.0).abs() < 1e-9);
        assert!((sol.values[1] - 1.0).abs() < 1e-9);

        // Same layout, new coefficient: the saved basis is a valid start.
        p.update_value(r2, y, 2.0).unwrap();
        let (sol, _) = solve(&p, &Bounds::of(&p), &limits(), basis.as_ref());
        assert_eq!(sol.status, LpStatus::Optimal);
        assert!(sol.warm);
        assert!((sol.objective - 11.0).abs() < 1e-9);
    }

    /// max x  s.t. x + y = 5, x - y >= 1, y >= 1
    #[test]
    fn equality_and_lower_rows() {
        let mut p = Problem::new();
        let x = p.add_column("x", ColumnKind::Continuous, 0.0, None, 1.0);
        let y = p.add_column("y", ColumnKind::Continuous, 1.0, None, 0.0);
        let r1 = p.add_row("r1", RowBound::Fixed(5.0));
        let r2 = p.add_row("r2", RowBound::Lower(1.0));
        p.set_value(r1, x, 1.0).unwrap();
        p.set_value(r1, y, 1.0).unwrap();
        p.set_value(r2, x, 1.0).unwrap();
        p.set_value(r2, y, -1.0).unwrap();

        let (sol, _) = solve(&p, &Bounds::of(&p), &limits(), None);
        assert_eq!(sol.status, LpStatus::Optimal);
        assert!((sol.values[0] - 4.0).abs() < 1e-9);
        assert!((sol.values[1] - 1.0).abs() < 1e-9);
    }

    #[test]
    fn infeasible_and_unbounded() {
        let mut p = Problem::new();
        let x = p.add_column("x", ColumnKind::Continuous, 0.0, None, 1.0);
        let r1 = p.add_row("r1", RowBound::Upper(1.0));
        let r2 = p.add_row("r2", RowBound::Lower(2.0));
        p.set_value(r1, x, 1.0).unwrap();
        p.set_value(r2, x, 1.0).unwrap();
        let (sol, basis) = solve(&p, &Bounds::of(&p), &limits(), None);
        assert_eq!(sol.status, LpStatus::Infeasible);
        assert!(basis.is_none());

        let mut p = Problem::new();
        let x = p.add_column("x", ColumnKind::Continuous, 0.0, None, 1.0);
        let r = p.add_row("r", RowBound::Lower(1.0));
        p.set_value(r, x, 1.0).unwrap();
        let (sol, _) = solve(&p, &Bounds::of(&p), &limits(), None);
        assert_eq!(sol.status, LpStatus::Unbounded);
    }

    #[test]
    fn pivot_cap() {
        let mut p = Problem::new();
        let x = p.add_column("x", ColumnKind::Continuous, 0.0, Some(1.0), 1.0);
        let y = p.add_column("y", ColumnKind::Continuous, 0.0, Some(1.0), 1.0);
        let r = p.add_row("r", RowBound::Upper(5.0));
        p.set_value(r, x, 1.0).unwrap();
        p.set_value(r, y, 1.0).unwrap();

        let (sol, _) = solve(&p, &Bounds::of(&p), &Limits { max_pivots: 1, deadline: None }, None);
        assert_eq!(sol.status, LpStatus::IterationLimit);
    }
}
