use rustc_hash::FxHashMap;

use ats_env::{Address, AddressId, NetworkScope, PeerId, Properties, PropertyKind, Quotas, QUALITY_PROPERTIES};

use super::{
    problem::{ColumnId, ColumnKind, Problem, ProblemError, RowBound, RowId},
    simplex::Basis,
    MlpOptions,
};

/// A requesting peer and its candidate addresses, as fed into [`MlpModel::build`].
#[derive(Debug)]
pub(crate) struct PeerInput<'a> {
    pub(crate) peer: PeerId,
    /// Weight `f` of the peer in the relativity row.
    pub(crate) relativity: f64,
    pub(crate) addresses: Vec<(&'a Address, Properties)>,
}

/// Handles of the variables of one address.
#[derive(Debug, Clone, Copy)]
pub(crate) struct AddressColumns {
    pub(crate) b: ColumnId,
    pub(crate) n: ColumnId,
}

/// The built problem plus the handles needed to patch it in place.
#[derive(Debug)]
pub(crate) struct MlpModel {
    pub(crate) problem: Problem,
    pub(crate) addresses: FxHashMap<AddressId, AddressColumns>,
    /// Per peer relativity rows (`c9`).
    pub(crate) relativity_rows: FxHashMap<PeerId, RowId>,
    pub(crate) col_r: Option<ColumnId>,
    /// Per quality metric rows (`c7`).
    pub(crate) quality_rows: [Option<RowId>; QUALITY_PROPERTIES],
    pub(crate) peers: usize,
    /// Basis of the last optimal relaxation.
    pub(crate) basis: Option<Basis>,
}

fn sanitize(name: &str) -> String {
    name.chars().map(|c| if c.is_ascii_alphanumeric() { c } else { '_' }).collect()
}

impl MlpModel {
    /// Builds the complete problem for the given peers.
    pub(crate) fn build(
        options: &MlpOptions,
        quotas: &Quotas,
        peers: &[PeerInput<'_>],
    ) -> Result<Self, ProblemError> {
        let mut p = Problem::new();
        let feasibility = options.feasibility_only;
        let big_m = (options.big_m as f64).min(quotas.max() as f64);
        let b_min = options.b_min as f64;

        let mut addresses = FxHashMap::default();
        let mut all = Vec::new();

        for peer in peers {
            for (address, properties) in &peer.addresses {
                let suffix = format!("{}_{}_{}", peer.peer.0, sanitize(&address.plugin), address.id.0);
                let b = p.add_column(
                    format!("b_{suffix}"),
                    ColumnKind::Continuous,
                    0.0,
                    None,
                    if feasibility { 1.0 } else { 0.0 },
                );
                let n = p.add_column(format!("n_{suffix}"), ColumnKind::Binary, 0.0, Some(1.0), 0.0);
                addresses.insert(address.id, AddressColumns { b, n });
                all.push((peer, *address, *properties, AddressColumns { b, n }, suffix));
            }
        }

        // c1: b - M n <= 0
        for (_, address, _, cols, suffix) in &all {
            let quota = quotas.get(address.scope).min() as f64;
            let row = p.add_row(format!("c1_{suffix}"), RowBound::Upper(0.0));
            p.set_value(row, cols.b, 1.0)?;
            p.set_value(row, cols.n, -quota.min(big_m))?;
        }

        // c3: b - b_min n >= 0
        for (_, _, _, cols, suffix) in &all {
            let row = p.add_row(format!("c3_{suffix}"), RowBound::Lower(0.0));
            p.set_value(row, cols.b, 1.0)?;
            p.set_value(row, cols.n, -b_min)?;
        }

        // c2: exactly one active address per peer
        let mut with_addresses = 0;
        for peer in peers.iter().filter(|input| !input.addresses.is_empty()) {
            with_addresses += 1;
            let row = p.add_row(format!("c2_{}", peer.peer.0), RowBound::Fixed(1.0));
            for (address, _) in &peer.addresses {
                p.set_value(row, addresses[&address.id].n, 1.0)?;
            }
        }

        // c4: minimum number of connections
        let min_connections = with_addresses.min(options.n_min) as f64;
        let row = p.add_row("c4", RowBound::Lower(min_connections));
        for (_, _, _, cols, _) in &all {
            p.set_value(row, cols.n, 1.0)?;
        }

        // c10: scope quotas
        for scope in NetworkScope::ALL {
            let members: Vec<_> = all.iter().filter(|a| a.1.scope == scope).collect();
            if members.is_empty() {
                continue;
            }
            let quota = quotas.get(scope).min() as f64;
            let row = p.add_row(format!("c10_quota_{scope}"), RowBound::Upper(quota));
            for (_, _, _, cols, _) in members {
                p.set_value(row, cols.b, 1.0)?;
            }
        }

        let mut model = Self {
            problem: p,
            addresses,
            relativity_rows: FxHashMap::default(),
            col_r: None,
            quality_rows: [None; QUALITY_PROPERTIES],
            peers: with_addresses,
            basis: None,
        };

        if feasibility {
            return Ok(model);
        }
        let p = &mut model.problem;

        // c6: diversity, d = sum of n
        if options.optimize_diversity {
            let d = p.add_column("d", ColumnKind::Continuous, 0.0, None, options.co_d);
            let row = p.add_row("c6", RowBound::Fixed(0.0));
            for (_, _, _, cols, _) in &all {
                p.set_value(row, cols.n, 1.0)?;
            }
            p.set_value(row, d, -1.0)?;
        }

        // c8: utility, u = sum of b
        if options.optimize_utility {
            let u = p.add_column("u", ColumnKind::Continuous, 0.0, None, options.co_u);
            let row = p.add_row("c8", RowBound::Fixed(0.0));
            for (_, _, _, cols, _) in &all {
                p.set_value(row, cols.b, 1.0)?;
            }
            p.set_value(row, u, -1.0)?;
        }

        // c9: relativity, sum of b of a peer - f r >= 0
        if options.optimize_relativity {
            let r = p.add_column("r", ColumnKind::Continuous, 0.0, None, options.co_r);
            for peer in peers.iter().filter(|input| !input.addresses.is_empty()) {
                let row = p.add_row(format!("c9_{}", peer.peer.0), RowBound::Lower(0.0));
                for (address, _) in &peer.addresses {
                    p.set_value(row, model.addresses[&address.id].b, 1.0)?;
                }
                p.set_value(row, r, -peer.relativity)?;
                model.relativity_rows.insert(peer.peer, row);
            }
            model.col_r = Some(r);
        }

        // c7: quality, sum of prop_i b - q_i = 0
        if options.optimize_quality {
            for (i, kind) in PropertyKind::QUALITY.iter().enumerate() {
                let q = p.add_column(format!("q_{kind}"), ColumnKind::Continuous, 0.0, None, options.co_q[i]);
                let row = p.add_row(format!("c7_q{i}_{kind}"), RowBound::Fixed(0.0));
                for (_, _, properties, cols, _) in &all {
                    p.set_value(row, cols.b, properties[i])?;
                }
                p.set_value(row, q, -1.0)?;
                model.quality_rows[i] = Some(row);
            }
        }

        Ok(model)
    }

    /// Patches the quality coefficient of an address. Returns whether it changed.
    pub(crate) fn update_quality(
        &mut self,
        address: AddressId,
        index: usize,
        value: f64,
    ) -> Result<bool, ProblemError> {
        let (Some(row), Some(cols)) = (self.quality_rows[index], self.addresses.get(&address)) else {
            return Ok(false);
        };
        self.problem.update_value(row, cols.b, value)
    }

    /// Patches the relativity weight of a peer. Returns whether it changed.
    pub(crate) fn update_relativity(&mut self, peer: PeerId, weight: f64) -> Result<bool, ProblemError> {
        let (Some(row), Some(r)) = (self.relativity_rows.get(&peer), self.col_r) else {
            return Ok(false);
        };
        self.problem.update_value(*row, r, -weight)
    }
}
