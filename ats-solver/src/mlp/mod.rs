//! Mixed integer linear programming solver.
//!
//! For every requesting peer exactly one candidate address is selected (`n = 1`) and given a
//! bandwidth `b` such that scope quotas hold, maximizing a weighted sum of diversity,
//! utility, relativity and quality terms. The problem is rebuilt when the set of peers or
//! addresses changes and patched in place when only a coefficient changes.

use std::{
    fmt,
    path::PathBuf,
    sync::Arc,
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

use ats_common::{bandwidth_from_f64, constants::DEFAULT_BW_IN_OUT};
use ats_env::{
    Address, AddressId, BulkLock, ConfigError, Environment, InfoDetail, NetworkScope, Operation,
    PeerId, PreferenceKind, Preferences, PropertyKind, Quotas, Solver, SolverError, Status,
    QUALITY_PROPERTIES,
};

use crate::stats::SolverStats;

mod branch;
mod dump;
mod model;
mod problem;
mod simplex;

pub use branch::MipStatus;
pub use dump::DumpFormat;
pub use problem::{ColumnId, ColumnKind, Problem, ProblemError, RowBound, RowId};
pub use simplex::LpStatus;

use branch::{MipParams, MipResult};
use model::{MlpModel, PeerInput};
use simplex::{Bounds, Limits};

#[derive(Debug, Error)]
pub enum MlpError {
    #[error("Problem construction failed: {0}")]
    Problem(#[from] ProblemError),
    #[error("LP relaxation is infeasible")]
    Infeasible,
    #[error("LP relaxation is unbounded")]
    Unbounded,
    #[error("Iteration limit reached")]
    IterationLimit,
    #[error("Time limit reached")]
    TimeLimit,
    #[error("No integer solution found")]
    NoIntegerSolution,
    #[error("Integer search ran out of budget before finding a solution")]
    SearchIncomplete,
    #[error("Integer solution outside the configured gaps (mip gap {mip_gap}, lp/mip gap {lp_mip_gap})")]
    GapNotReached { mip_gap: f64, lp_mip_gap: f64 },
}

impl From<LpStatus> for MlpError {
    fn from(status: LpStatus) -> Self {
        match status {
            LpStatus::Infeasible | LpStatus::Optimal => Self::Infeasible,
            LpStatus::Unbounded => Self::Unbounded,
            LpStatus::IterationLimit => Self::IterationLimit,
            LpStatus::TimeLimit => Self::TimeLimit,
        }
    }
}

/// Which problems and solutions get written to disk.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    pub problem_all: bool,
    pub solution_all: bool,
    pub problem_on_fail: bool,
    pub solution_on_fail: bool,
    pub format: DumpFormat,
    pub dir: PathBuf,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            problem_all: false,
            solution_all: false,
            problem_on_fail: false,
            solution_on_fail: false,
            format: DumpFormat::Cplex,
            dir: std::env::temp_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MlpOptions {
    /// Solve automatically whenever the problem changed.
    pub auto_solve: bool,
    /// Only look for a feasible assignment, maximizing total bandwidth.
    pub feasibility_only: bool,
    pub optimize_diversity: bool,
    pub optimize_utility: bool,
    pub optimize_relativity: bool,
    pub optimize_quality: bool,
    pub co_d: f64,
    pub co_u: f64,
    pub co_r: f64,
    pub co_q: [f64; QUALITY_PROPERTIES],
    /// Minimum bandwidth of a selected address.
    pub b_min: u32,
    /// Minimum number of selected addresses.
    pub n_min: usize,
    /// Stop once the relative gap between incumbent and best open bound is below this.
    pub mip_gap: f64,
    /// Stop once the relative gap between incumbent and LP relaxation is below this.
    pub lp_mip_gap: f64,
    pub max_duration: Duration,
    /// Pivot cap per relaxation and node cap of the branch-and-bound search.
    pub max_iterations: usize,
    /// Ceiling of the big-M coefficient linking `b` and `n`.
    pub big_m: u32,
    pub dump: DumpOptions,
}

impl MlpOptions {
    pub fn with_auto_solve(mut self, auto_solve: bool) -> Self {
        self.auto_solve = auto_solve;
        self
    }

    pub fn with_feasibility_only(mut self, feasibility_only: bool) -> Self {
        self.feasibility_only = feasibility_only;
        self
    }

    /// Enables or disables the diversity, utility, relativity and quality terms.
    pub fn with_objective_terms(
        mut self,
        diversity: bool,
        utility: bool,
        relativity: bool,
        quality: bool,
    ) -> Self {
        self.optimize_diversity = diversity;
        self.optimize_utility = utility;
        self.optimize_relativity = relativity;
        self.optimize_quality = quality;
        self
    }

    /// Sets the diversity, utility and relativity coefficients.
    pub fn with_coefficients(mut self, co_d: f64, co_u: f64, co_r: f64) -> Self {
        self.co_d = co_d;
        self.co_u = co_u;
        self.co_r = co_r;
        self
    }

    pub fn with_quality_coefficients(mut self, co_q: [f64; QUALITY_PROPERTIES]) -> Self {
        self.co_q = co_q;
        self
    }

    pub fn with_b_min(mut self, b_min: u32) -> Self {
        self.b_min = b_min;
        self
    }

    pub fn with_n_min(mut self, n_min: usize) -> Self {
        self.n_min = n_min;
        self
    }

    pub fn with_gaps(mut self, mip_gap: f64, lp_mip_gap: f64) -> Self {
        self.mip_gap = mip_gap;
        self.lp_mip_gap = lp_mip_gap;
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = max_duration;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_dump(mut self, dump: DumpOptions) -> Self {
        self.dump = dump;
        self
    }

    fn validate(&self, quotas: &Quotas) -> Result<(), ConfigError> {
        for (name, value) in [("mip_gap", self.mip_gap), ("lp_mip_gap", self.lp_mip_gap)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { name, value, min: 0.0, max: 1.0 });
            }
        }

        let coefficients = [("co_d", self.co_d), ("co_u", self.co_u), ("co_r", self.co_r)];
        for (name, value) in coefficients.into_iter().chain(self.co_q.iter().map(|q| ("co_q", *q))) {
            if value < 0.0 || value.is_nan() {
                return Err(ConfigError::Negative { name, value });
            }
        }

        if self.b_min == 0 {
            return Err(ConfigError::Zero { name: "b_min" });
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Zero { name: "max_iterations" });
        }

        let required = self.n_min as u64 * self.b_min as u64;
        for (scope, quota) in quotas.iter() {
            if quota.min() < required {
                return Err(ConfigError::QuotaTooSmall { scope, quota: quota.min(), required });
            }
        }

        Ok(())
    }
}

impl Default for MlpOptions {
    fn default() -> Self {
        Self {
            auto_solve: true,
            feasibility_only: false,
            optimize_diversity: true,
            optimize_utility: true,
            optimize_relativity: true,
            optimize_quality: true,
            co_d: 1.0,
            co_u: 1.0,
            co_r: 1.0,
            co_q: [1.0; QUALITY_PROPERTIES],
            b_min: DEFAULT_BW_IN_OUT,
            n_min: 4,
            mip_gap: 0.0,
            lp_mip_gap: 0.0,
            max_duration: Duration::from_secs(10),
            max_iterations: 4096,
            big_m: u32::MAX / 10,
            dump: DumpOptions::default(),
        }
    }
}

/// Figures of the last solve that got past the fast path.
#[derive(Debug, Clone, Default)]
pub struct SolveReport {
    /// Whether the problem was rebuilt from scratch.
    pub rebuilt: bool,
    pub rows: usize,
    pub columns: usize,
    pub elements: usize,
    pub lp_status: Option<LpStatus>,
    pub mip_status: Option<MipStatus>,
    pub lp_objective: f64,
    pub mip_objective: Option<f64>,
    pub mip_gap: f64,
    pub lp_mip_gap: f64,
    /// Whether the relaxation started from the previous basis.
    pub warm_start: bool,
    pub lp_pivots: usize,
    pub nodes: usize,
    pub setup: Duration,
    pub lp: Duration,
    pub mip: Duration,
    pub total: Duration,
}

/// Relativity weight of a peer: mean preference plus one.
fn relativity_weight(preferences: &Preferences) -> f64 {
    preferences.iter().sum::<f64>() / preferences.len() as f64 + 1.0
}

pub struct MlpSolver<E> {
    env: Arc<E>,
    quotas: Quotas,
    options: MlpOptions,
    addresses: FxHashMap<AddressId, Address>,
    /// Candidate addresses per peer, in registration order.
    peers: FxHashMap<PeerId, Vec<AddressId>>,
    /// Requesting peers and their relativity weight.
    requests: FxHashMap<PeerId, f64>,
    model: Option<MlpModel>,
    /// The problem must be rebuilt.
    changed: bool,
    /// Coefficients changed since the last successful solve.
    updated: bool,
    bulk: BulkLock,
    /// Peer whose changes are returned rather than notified.
    exclude_peer: Option<PeerId>,
    stats: SolverStats,
    last_report: Option<SolveReport>,
}

impl<E> fmt::Debug for MlpSolver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MlpSolver")
            .field("options", &self.options)
            .field("addresses", &self.addresses.len())
            .field("requests", &self.requests.len())
            .field("changed", &self.changed)
            .field("updated", &self.updated)
            .field("bulk", &self.bulk)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> MlpSolver<E> {
    pub fn new(env: Arc<E>, quotas: Quotas, options: MlpOptions) -> Result<Self, ConfigError> {
        options.validate(&quotas)?;
        info!(
            mip_gap = options.mip_gap,
            lp_mip_gap = options.lp_mip_gap,
            max_duration = ?options.max_duration,
            max_iterations = options.max_iterations,
            feasibility_only = options.feasibility_only,
            "mlp solver initialized"
        );

        Ok(Self {
            env,
            quotas,
            options,
            addresses: FxHashMap::default(),
            peers: FxHashMap::default(),
            requests: FxHashMap::default(),
            model: None,
            changed: true,
            updated: false,
            bulk: BulkLock::default(),
            exclude_peer: None,
            stats: SolverStats::default(),
            last_report: None,
        })
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    pub fn last_report(&self) -> Option<&SolveReport> {
        self.last_report.as_ref()
    }

    fn active_address(&self, peer: PeerId) -> Option<Address> {
        self.peers
            .get(&peer)?
            .iter()
            .filter_map(|id| self.addresses.get(id))
            .find(|a| a.active)
            .cloned()
    }

    fn has_candidates(&self, peer: PeerId) -> bool {
        self.peers.get(&peer).is_some_and(|ids| !ids.is_empty())
    }

    /// Solves now if allowed, otherwise only records the change.
    fn trigger(&mut self) {
        if !self.bulk.record_change() || !self.options.auto_solve {
            return;
        }
        if let Err(e) = self.run() {
            warn!(%e, "solve failed, keeping previous assignment");
        }
    }

    fn build_model(&self) -> Result<MlpModel, ProblemError> {
        let mut requested: Vec<_> = self.requests.iter().map(|(p, f)| (*p, *f)).collect();
        requested.sort_by_key(|(p, _)| *p);

        let inputs: Vec<_> = requested
            .into_iter()
            .map(|(peer, relativity)| PeerInput {
                peer,
                relativity,
                addresses: self
                    .peers
                    .get(&peer)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| self.addresses.get(id))
                    .map(|a| (a, self.env.properties(a.id)))
                    .collect(),
            })
            .collect();

        MlpModel::build(&self.options, &self.quotas, &inputs)
    }

    fn run(&mut self) -> Result<(), SolverError> {
        let span = tracing::debug_span!("mlp_solve", requests = self.requests.len());
        let _enter = span.enter();

        self.stats.increment_solves();
        let rebuild = self.changed || self.model.is_none();
        let detail = if rebuild { InfoDetail::Full } else { InfoDetail::Updated };
        self.env.info(Operation::SolveStart, Status::Success, detail);

        let candidates: usize =
            self.requests.keys().filter_map(|p| self.peers.get(p)).map(Vec::len).sum();
        if candidates == 0 {
            debug!(requests = self.requests.len(), "no requests with addresses, nothing to solve");
            self.env.info(Operation::SolveStop, Status::Success, InfoDetail::None);
            return Ok(());
        }

        if !rebuild && !self.updated {
            debug!("problem unchanged, skipping solve");
            self.env.info(Operation::SolveStop, Status::Success, InfoDetail::None);
            return Ok(());
        }

        let start = Instant::now();
        let deadline = start + self.options.max_duration;
        let mut report = SolveReport { rebuilt: rebuild, ..Default::default() };

        if rebuild {
            self.env.info(Operation::SetupStart, Status::Success, InfoDetail::Full);
            match self.build_model() {
                Ok(model) => {
                    self.model = Some(model);
                    self.changed = false;
                    // A fresh problem always needs a solve, even if this one fails.
                    self.updated = true;
                    self.stats.increment_rebuilds();
                    self.env.info(Operation::SetupStop, Status::Success, InfoDetail::Full);
                }
                Err(e) => {
                    warn!(%e, "building the problem failed");
                    self.env.info(Operation::SetupStop, Status::Fail, InfoDetail::Full);
                    self.env.info(Operation::SolveStop, Status::Fail, detail);
                    self.stats.increment_failed();
                    return Err(SolverError::solve_failed(MlpError::Problem(e)));
                }
            }
            report.setup = start.elapsed();
        }

        let Some(mut model) = self.model.take() else {
            return Ok(());
        };
        report.rows = model.problem.rows().len();
        report.columns = model.problem.columns().len();
        report.elements = model.problem.elements();

        let outcome = self.solve_model(&mut model, rebuild, deadline, &mut report);
        report.total = start.elapsed();

        let success = outcome.is_ok();
        self.env.info(Operation::SolveStop, Status::from_ok(success), detail);

        let result = match outcome {
            Ok(mip) => {
                info!(
                    objective = ?mip.objective,
                    nodes = mip.nodes,
                    elapsed = ?report.total,
                    "mlp solve succeeded"
                );
                self.propagate(&model, &mip.values);
                self.updated = false;
                Ok(())
            }
            Err(e) => {
                tracing::error!(%e, elapsed = ?report.total, "mlp solve failed");
                self.stats.increment_failed();
                Err(SolverError::solve_failed(e))
            }
        };

        self.model = Some(model);
        self.last_report = Some(report);
        result
    }

    /// Runs the relaxation and the integer search, dumping files as configured.
    fn solve_model(
        &self,
        model: &mut MlpModel,
        rebuilt: bool,
        deadline: Instant,
        report: &mut SolveReport,
    ) -> Result<MipResult, MlpError> {
        let detail = if rebuilt { InfoDetail::Full } else { InfoDetail::Updated };
        let limits = Limits { max_pivots: self.options.max_iterations, deadline: Some(deadline) };

        self.env.info(Operation::LpStart, Status::Success, detail);
        let lp_start = Instant::now();
        let warm = if rebuilt { None } else { model.basis.as_ref() };
        let (lp, basis) = simplex::solve(&model.problem, &Bounds::of(&model.problem), &limits, warm);
        report.lp = lp_start.elapsed();
        report.lp_status = Some(lp.status);
        report.lp_objective = lp.objective;
        report.lp_pivots = lp.pivots;
        report.warm_start = lp.warm;

        let lp_ok = lp.status == LpStatus::Optimal;
        self.env.info(Operation::LpStop, Status::from_ok(lp_ok), detail);

        let outcome = if lp_ok {
            model.basis.clone_from(&basis);

            self.env.info(Operation::MilpStart, Status::Success, detail);
            let mip_start = Instant::now();
            let params = MipParams {
                mip_gap: self.options.mip_gap,
                lp_mip_gap: self.options.lp_mip_gap,
                max_nodes: self.options.max_iterations,
                max_pivots: self.options.max_iterations,
                deadline: Some(deadline),
            };
            let mip = branch::branch_and_bound(&model.problem, &lp, basis, &params);
            report.mip = mip_start.elapsed();
            report.mip_status = Some(mip.status);
            report.mip_objective = mip.objective;
            report.mip_gap = mip.mip_gap;
            report.lp_mip_gap = mip.lp_mip_gap;
            report.nodes = mip.nodes;

            self.env.info(Operation::MilpStop, Status::from_ok(mip.status.is_success()), detail);
            debug!(status = ?mip.status, nodes = mip.nodes, mip_gap = mip.mip_gap, "integer search done");

            match mip.status {
                MipStatus::Optimal | MipStatus::Feasible => Ok(mip),
                MipStatus::FeasibleOutsideGap => Err(MlpError::GapNotReached {
                    mip_gap: mip.mip_gap,
                    lp_mip_gap: mip.lp_mip_gap,
                }),
                MipStatus::Infeasible => Err(MlpError::NoIntegerSolution),
                MipStatus::Undefined => Err(MlpError::SearchIncomplete),
            }
        } else {
            debug!(status = ?lp.status, "relaxation failed");
            model.basis = None;
            Err(MlpError::from(lp.status))
        };

        self.dump(model, &outcome, &lp.values);
        outcome
    }

    fn dump(&self, model: &MlpModel, outcome: &Result<MipResult, MlpError>, lp_values: &[f64]) {
        let dump = &self.options.dump;
        let failed = outcome.is_err();
        let problem = dump.problem_all || (failed && dump.problem_on_fail);
        let solution = dump.solution_all || (failed && dump.solution_on_fail);
        if !problem && !solution {
            return;
        }

        let base = dump::dump_path(&dump.dir, model.peers, model.addresses.len());
        if problem {
            match dump::write_problem(&model.problem, dump.format, &base) {
                Ok(path) => info!(path = %path.display(), "dumped problem"),
                Err(e) => warn!(%e, "failed to dump problem"),
            }
        }
        if solution {
            let (status, objective, values) = match outcome {
                Ok(mip) => (format!("{:?}", mip.status), mip.objective, mip.values.as_slice()),
                Err(e) => (e.to_string(), None, lp_values),
            };
            match dump::write_solution(&model.problem, &status, objective, values, &base) {
                Ok(path) => info!(path = %path.display(), "dumped solution"),
                Err(e) => warn!(%e, "failed to dump solution"),
            }
        }
    }

    /// Applies the solution and notifies every real change of a requesting peer, except for
    /// the excluded peer. Deactivations go out before activations.
    fn propagate(&mut self, model: &MlpModel, values: &[f64]) {
        self.env.info(Operation::UpdateNotifyStart, Status::Success, InfoDetail::None);

        let mut ids: Vec<_> = model.addresses.iter().map(|(id, cols)| (*id, *cols)).collect();
        ids.sort_by_key(|(id, cols)| (values[cols.n.index()] > 0.5, *id));

        for (id, cols) in ids {
            let Some(address) = self.addresses.get_mut(&id) else {
                continue;
            };
            if !self.requests.contains_key(&address.peer) {
                continue;
            }

            let selected = values[cols.n.index()] > 0.5;
            let bw = if selected { bandwidth_from_f64(values[cols.b.index()]) } else { 0 };
            if !address.assign(selected, bw, bw) {
                continue;
            }

            debug!(id = %address.id, peer = %address.peer, active = selected, bw, "assignment changed");
            if self.exclude_peer != Some(address.peer) {
                self.env.bandwidth_changed(address);
                self.stats.increment_notifications();
            }
        }

        self.env.info(Operation::UpdateNotifyStop, Status::Success, InfoDetail::None);
    }
}

impl<E: Environment> Solver for MlpSolver<E> {
    fn name(&self) -> &'static str {
        "mlp"
    }

    fn address_add(&mut self, address: &Address, scope: NetworkScope) -> Result<(), SolverError> {
        if self.addresses.contains_key(&address.id) {
            return Err(SolverError::DuplicateAddress(address.id));
        }

        let mut address = address.clone();
        address.scope = scope;
        address.deactivate();
        let (id, peer) = (address.id, address.peer);
        self.addresses.insert(id, address);
        self.peers.entry(peer).or_default().push(id);
        debug!(%id, %peer, %scope, "address added");

        if self.requests.contains_key(&peer) {
            self.changed = true;
            self.trigger();
        }
        Ok(())
    }

    fn address_delete(&mut self, id: AddressId, session_only: bool) -> Result<(), SolverError> {
        let Some(address) = self.addresses.get_mut(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        let peer = address.peer;
        let requested = self.requests.contains_key(&peer);

        if session_only {
            debug!(%id, %peer, "address lost its session");
            if address.deactivate() && requested {
                self.env.bandwidth_changed(address);
                self.stats.increment_notifications();
            }
            if requested {
                self.changed = true;
                self.trigger();
            }
            return Ok(());
        }

        let Some(mut address) = self.addresses.remove(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        if let Some(ids) = self.peers.get_mut(&peer) {
            ids.retain(|a| *a != id);
            if ids.is_empty() {
                self.peers.remove(&peer);
            }
        }
        debug!(%id, %peer, active = address.active, "address deleted");

        if !requested {
            return Ok(());
        }

        self.changed = true;
        self.trigger();

        if address.active && self.active_address(peer).is_none() {
            debug!(%peer, "no replacement address, disconnecting");
            address.deactivate();
            self.env.bandwidth_changed(&address);
            self.stats.increment_notifications();
        }
        Ok(())
    }

    fn address_property_changed(
        &mut self,
        id: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    ) -> Result<(), SolverError> {
        let Some(address) = self.addresses.get(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        let Some(index) = kind.quality_index() else {
            return Ok(());
        };
        let peer = address.peer;
        debug!(%id, %kind, abs_value, rel_value, "property changed");

        if self.changed {
            return Ok(());
        }
        let Some(model) = self.model.as_mut() else {
            return Ok(());
        };

        match model.update_quality(id, index, rel_value) {
            Ok(true) => {
                self.updated = true;
                self.stats.increment_updates();
                if self.requests.contains_key(&peer) {
                    self.trigger();
                }
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%e, "failed to update quality coefficient, rebuilding");
                self.changed = true;
            }
        }
        Ok(())
    }

    fn address_change_network(
        &mut self,
        id: AddressId,
        scope: NetworkScope,
    ) -> Result<(), SolverError> {
        let Some(address) = self.addresses.get_mut(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        if address.scope == scope {
            return Ok(());
        }
        debug!(%id, from = %address.scope, to = %scope, "address changed network");
        address.scope = scope;

        if self.requests.contains_key(&address.peer) {
            self.changed = true;
            self.trigger();
        }
        Ok(())
    }

    fn get_preferred_address(&mut self, peer: PeerId) -> Result<Option<Address>, SolverError> {
        if !self.requests.contains_key(&peer) {
            let weight = relativity_weight(&self.env.preferences(&peer));
            self.requests.insert(peer, weight);
            debug!(%peer, weight, "new address request");

            if self.has_candidates(peer) {
                self.changed = true;
                self.exclude_peer = Some(peer);
                self.trigger();
                self.exclude_peer = None;
            }
        }

        Ok(self.active_address(peer))
    }

    fn stop_get_preferred_address(&mut self, peer: PeerId) -> Result<(), SolverError> {
        if self.requests.remove(&peer).is_none() {
            return Err(SolverError::NoPendingRequest(peer));
        }
        debug!(%peer, "address request stopped");

        let ids = self.peers.get(&peer).cloned().unwrap_or_default();
        for id in &ids {
            if let Some(address) = self.addresses.get_mut(id) {
                address.deactivate();
            }
        }

        if !ids.is_empty() {
            self.changed = true;
            if !self.requests.is_empty() {
                self.trigger();
            }
        }
        Ok(())
    }

    fn change_preference(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        rel_value: f64,
    ) -> Result<(), SolverError> {
        if !self.requests.contains_key(&peer) {
            debug!(%peer, %kind, "preference change for peer without request");
            return Ok(());
        }

        let mut preferences = self.env.preferences(&peer);
        preferences[kind.index()] = rel_value;
        let weight = relativity_weight(&preferences);
        self.requests.insert(peer, weight);
        debug!(%peer, %kind, rel_value, weight, "preference changed");

        if self.changed {
            return Ok(());
        }
        let Some(model) = self.model.as_mut() else {
            return Ok(());
        };
        match model.update_relativity(peer, weight) {
            Ok(true) => {
                self.updated = true;
                self.stats.increment_updates();
                self.trigger();
            }
            Ok(false) => {}
            Err(e) => {
                warn!(%e, "failed to update relativity coefficient, rebuilding");
                self.changed = true;
            }
        }
        Ok(())
    }

    fn feedback(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        scope: Duration,
        score: f64,
    ) -> Result<(), SolverError> {
        debug!(%peer, %kind, ?scope, score, "feedback ignored");
        Ok(())
    }

    fn bulk_start(&mut self) {
        self.bulk.start();
        debug!(depth = self.bulk.depth(), "bulk start");
    }

    fn bulk_stop(&mut self) -> Result<(), SolverError> {
        let due = self.bulk.stop()?;
        debug!(depth = self.bulk.depth(), due, "bulk stop");
        if due && self.options.auto_solve {
            if let Err(e) = self.run() {
                warn!(%e, "solve after bulk failed, keeping previous assignment");
            }
        }
        Ok(())
    }

    fn solve(&mut self) -> Result<(), SolverError> {
        if self.bulk.is_active() {
            self.bulk.record_change();
            return Ok(());
        }
        self.run()
    }
}
