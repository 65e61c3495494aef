use std::time::Instant;

use super::{
    problem::{ColumnKind, Problem},
    simplex::{self, Basis, Bounds, Limits, LpSolution, LpStatus},
};

/// Values closer than this to an integer count as integral.
pub(crate) const INT_TOL: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MipStatus {
    /// Search finished, the incumbent is optimal.
    Optimal,
    /// Search stopped early with the incumbent within the configured gaps.
    Feasible,
    /// A budget ran out with an incumbent outside the configured gaps.
    FeasibleOutsideGap,
    /// A budget ran out before any integer solution was found.
    Undefined,
    /// No integer solution exists.
    Infeasible,
}

impl MipStatus {
    #[inline]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Optimal | Self::Feasible)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MipParams {
    pub(crate) mip_gap: f64,
    pub(crate) lp_mip_gap: f64,
    pub(crate) max_nodes: usize,
    pub(crate) max_pivots: usize,
    pub(crate) deadline: Option<Instant>,
}

#[derive(Debug, Clone)]
pub(crate) struct MipResult {
    pub(crate) status: MipStatus,
    pub(crate) values: Vec<f64>,
    pub(crate) objective: Option<f64>,
    pub(crate) mip_gap: f64,
    pub(crate) lp_mip_gap: f64,
    pub(crate) nodes: usize,
}

/// Relative gap between an incumbent and a bound.
#[inline]
pub(crate) fn relative_gap(incumbent: f64, bound: f64) -> f64 {
    (incumbent - bound).abs() / (incumbent.abs() + f64::EPSILON)
}

struct Node {
    bounds: Bounds,
    /// Objective of the parent relaxation, an upper bound for this subtree.
    bound: f64,
    basis: Option<Basis>,
}

/// Depth-first branch-and-bound over the integer columns of `problem`, starting from the
/// already solved root relaxation.
pub(crate) fn branch_and_bound(
    problem: &Problem,
    root: &LpSolution,
    root_basis: Option<Basis>,
    params: &MipParams,
) -> MipResult {
    let integers: Vec<usize> = problem
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, c)| c.kind == ColumnKind::Binary)
        .map(|(j, _)| j)
        .collect();

    let limits = Limits { max_pivots: params.max_pivots, deadline: params.deadline };
    let lp_bound = root.objective;

    let mut incumbent: Option<(f64, Vec<f64>)> = None;
    let mut nodes = 0;
    let mut stack =
        vec![Node { bounds: Bounds::of(problem), bound: lp_bound, basis: root_basis }];
    let mut first = Some(root.clone());

    let gaps = |objective: f64, stack: &[Node]| {
        let open = stack.iter().map(|n| n.bound).fold(f64::NEG_INFINITY, f64::max);
        let mip_gap = if open.is_finite() { relative_gap(objective, open.max(objective)) } else { 0.0 };
        (mip_gap, relative_gap(objective, lp_bound))
    };

    let finish = |status, incumbent: Option<(f64, Vec<f64>)>, stack: &[Node], nodes| {
        let (objective, values) = match incumbent {
            Some((o, v)) => (Some(o), v),
            None => (None, Vec::new()),
        };
        let (mip_gap, lp_mip_gap) = objective.map_or((f64::INFINITY, f64::INFINITY), |o| gaps(o, stack));
        MipResult { status, values, objective, mip_gap, lp_mip_gap, nodes }
    };

    // Status of a search cut short with `stack` still open.
    let truncated = |incumbent: &Option<(f64, Vec<f64>)>, stack: &[Node]| match incumbent {
        Some((objective, _)) => {
            let (mip_gap, lp_mip_gap) = gaps(*objective, stack);
            if mip_gap <= params.mip_gap || lp_mip_gap <= params.lp_mip_gap {
                MipStatus::Feasible
            } else {
                MipStatus::FeasibleOutsideGap
            }
        }
        None => MipStatus::Undefined,
    };

    while let Some(node) = stack.pop() {
        if let Some((best, _)) = &incumbent {
            if node.bound <= *best + 1e-9 * best.abs().max(1.0) {
                continue;
            }
        }

        if nodes >= params.max_nodes || params.deadline.is_some_and(|d| Instant::now() >= d) {
            stack.push(node);
            tracing::debug!(nodes, "branch-and-bound budget exhausted");
            let status = truncated(&incumbent, &stack);
            return finish(status, incumbent, &stack, nodes);
        }
        nodes += 1;

        let (lp, basis) = match first.take() {
            Some(root) => (root, node.basis.clone()),
            None => simplex::solve(problem, &node.bounds, &limits, node.basis.as_ref()),
        };

        match lp.status {
            LpStatus::Optimal => {}
            LpStatus::Infeasible => continue,
            LpStatus::Unbounded => {
                tracing::debug!("node relaxation is unbounded");
                continue;
            }
            LpStatus::IterationLimit | LpStatus::TimeLimit => {
                tracing::debug!(status = ?lp.status, nodes, "node relaxation ran out of budget");
                stack.push(node);
                let status = truncated(&incumbent, &stack);
                return finish(status, incumbent, &stack, nodes);
            }
        }

        if let Some((best, _)) = &incumbent {
            if lp.objective <= *best + 1e-9 * best.abs().max(1.0) {
                continue;
            }
        }

        let fractional = integers
            .iter()
            .map(|j| (*j, lp.values[*j]))
            .filter(|(_, v)| (v - v.round()).abs() > INT_TOL)
            .max_by(|a, b| {
                let fa = (a.1 - a.1.floor() - 0.5).abs();
                let fb = (b.1 - b.1.floor() - 0.5).abs();
                fb.total_cmp(&fa)
            });

        let Some((j, value)) = fractional else {
            let mut values = lp.values;
            for j in &integers {
                values[*j] = values[*j].round();
            }
            tracing::trace!(objective = lp.objective, nodes, "new incumbent");
            incumbent = Some((lp.objective, values));

            let (mip_gap, lp_mip_gap) = gaps(lp.objective, &stack);
            if !stack.is_empty() && (mip_gap <= params.mip_gap || lp_mip_gap <= params.lp_mip_gap) {
                tracing::debug!(mip_gap, lp_mip_gap, "stopping within gap");
                return finish(MipStatus::Feasible, incumbent, &stack, nodes);
            }
            continue;
        };

        let mut down = node.bounds.clone();
        down.upper[j] = Some(value.floor());
        let mut up = node.bounds;
        up.lower[j] = value.ceil();

        let down = Node { bounds: down, bound: lp.objective, basis: basis.clone() };
        let up = Node { bounds: up, bound: lp.objective, basis };

        // The child closer to the relaxed value is explored first.
        if value - value.floor() >= 0.5 {
            stack.push(down);
            stack.push(up);
        } else {
            stack.push(up);
            stack.push(down);
        }
    }

    let status = if incumbent.is_some() { MipStatus::Optimal } else { MipStatus::Infeasible };
    finish(status, incumbent, &stack, nodes)
}
