//! Reinforcement learning solver.
//!
//! Every peer is served by an [`Agent`](agent::Agent) that learns which of its addresses to
//! use and how much bandwidth to take. All agents advance together in periodic global steps;
//! the step interval adapts to how much of the available bandwidth is in use.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, SeedableRng};
use rustc_hash::FxHashMap;
use tokio::{runtime::Handle, task::JoinHandle, time::Instant};
use tracing::{debug, info, trace};

use ats_common::{clamp_quota, constants::KiB};
use ats_env::{
    Address, AddressId, BulkLock, ConfigError, Environment, InfoDetail, NetworkScope, Operation,
    PeerId, PreferenceKind, PropertyKind, Quotas, ScopeQuota, Solver, SolverError, Status,
};

use crate::stats::SolverStats;

mod action;
mod agent;
mod features;
mod matrix;
mod scheduler;

use action::{Action, Limits};
use agent::{Agent, Observation};
use features::Rbf;
use scheduler::Discount;

/// Temporal difference control algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Algorithm {
    /// On-policy, updates towards the value of the action actually taken next.
    #[default]
    Sarsa,
    /// Watkins' Q(λ), updates towards the greedy value and cuts traces on exploration.
    Q,
}

/// Action selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    EpsilonGreedy,
    Softmax,
}

/// Aggregate of the utilities of all agents in a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Welfare {
    /// Geometric mean of the utilities.
    #[default]
    Nash,
    /// Minimum utility.
    Egalitarian,
}

/// How visited features enter the eligibility trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TraceMode {
    #[default]
    Accumulate,
    Replace,
}

#[derive(Debug, Clone)]
pub struct RilOptions {
    pub algorithm: Algorithm,
    pub selection: Selection,
    pub welfare: Welfare,
    pub trace_mode: TraceMode,
    /// Gradient step size.
    pub alpha: f64,
    /// Semi-Markov discount rate per `step_time_min`.
    pub beta: f64,
    /// Per-step discount in simulation mode.
    pub gamma: f64,
    /// Eligibility trace decay.
    pub lambda: f64,
    pub explore_ratio: f64,
    pub explore_decay: f64,
    pub temperature: f64,
    pub temperature_decay: f64,
    /// Resolution of the radial basis function grid per direction.
    pub rbf_divisor: usize,
    pub step_time_min: Duration,
    pub step_time_max: Duration,
    pub interval_exponent: i32,
    /// Bandwidth below which no agent is pushed, and the quota a scope needs to be used.
    pub min_bw: u32,
    /// Increase and decrease step, in multiples of `min_bw`.
    pub inc_dec_step: u32,
    pub nop_decay: f64,
    pub penalty_weight: f64,
    /// Constant discount and no periodic timer; steps only happen on demand.
    pub simulate: bool,
    pub seed: Option<u64>,
}

impl RilOptions {
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_selection(mut self, selection: Selection) -> Self {
        self.selection = selection;
        self
    }

    pub fn with_welfare(mut self, welfare: Welfare) -> Self {
        self.welfare = welfare;
        self
    }

    pub fn with_trace_mode(mut self, trace_mode: TraceMode) -> Self {
        self.trace_mode = trace_mode;
        self
    }

    pub fn with_alpha(mut self, alpha: f64) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_discount(mut self, beta: f64, gamma: f64) -> Self {
        self.beta = beta;
        self.gamma = gamma;
        self
    }

    pub fn with_lambda(mut self, lambda: f64) -> Self {
        self.lambda = lambda;
        self
    }

    pub fn with_exploration(mut self, ratio: f64, decay: f64) -> Self {
        self.explore_ratio = ratio;
        self.explore_decay = decay;
        self
    }

    pub fn with_temperature(mut self, temperature: f64, decay: f64) -> Self {
        self.temperature = temperature;
        self.temperature_decay = decay;
        self
    }

    pub fn with_rbf_divisor(mut self, divisor: usize) -> Self {
        self.rbf_divisor = divisor;
        self
    }

    pub fn with_step_times(mut self, min: Duration, max: Duration) -> Self {
        self.step_time_min = min;
        self.step_time_max = max;
        self
    }

    pub fn with_interval_exponent(mut self, exponent: i32) -> Self {
        self.interval_exponent = exponent;
        self
    }

    pub fn with_min_bw(mut self, min_bw: u32) -> Self {
        self.min_bw = min_bw;
        self
    }

    pub fn with_inc_dec_step(mut self, step: u32) -> Self {
        self.inc_dec_step = step;
        self
    }

    pub fn with_nop_decay(mut self, decay: f64) -> Self {
        self.nop_decay = decay;
        self
    }

    pub fn with_penalty_weight(mut self, weight: f64) -> Self {
        self.penalty_weight = weight;
        self
    }

    pub fn with_simulate(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let unit = [
            ("alpha", self.alpha),
            ("gamma", self.gamma),
            ("lambda", self.lambda),
            ("explore_ratio", self.explore_ratio),
            ("explore_decay", self.explore_decay),
            ("temperature_decay", self.temperature_decay),
            ("nop_decay", self.nop_decay),
        ];
        for (name, value) in unit {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::OutOfRange { name, value, min: 0.0, max: 1.0 });
            }
        }

        for (name, value) in [("beta", self.beta), ("temperature", self.temperature)] {
            if value.is_nan() || value < 0.0 {
                return Err(ConfigError::Negative { name, value });
            }
            if value == 0.0 {
                return Err(ConfigError::Zero { name });
            }
        }
        if self.penalty_weight.is_nan() || self.penalty_weight < 0.0 {
            return Err(ConfigError::Negative { name: "penalty_weight", value: self.penalty_weight });
        }

        if self.rbf_divisor == 0 {
            return Err(ConfigError::Zero { name: "rbf_divisor" });
        }
        if self.min_bw == 0 {
            return Err(ConfigError::Zero { name: "min_bw" });
        }
        if self.step_time_min.is_zero() {
            return Err(ConfigError::Zero { name: "step_time_min" });
        }
        if self.step_time_min > self.step_time_max {
            return Err(ConfigError::StepTimes { min: self.step_time_min, max: self.step_time_max });
        }
        Ok(())
    }
}

impl Default for RilOptions {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::Sarsa,
            selection: Selection::EpsilonGreedy,
            welfare: Welfare::Nash,
            trace_mode: TraceMode::Accumulate,
            alpha: 0.01,
            beta: 0.6,
            gamma: 0.5,
            lambda: 0.5,
            explore_ratio: 1.0,
            explore_decay: 0.95,
            temperature: 0.1,
            temperature_decay: 1.0,
            rbf_divisor: 50,
            step_time_min: Duration::from_millis(200),
            step_time_max: Duration::from_millis(2000),
            interval_exponent: 10,
            min_bw: 5 * KiB,
            inc_dec_step: 1,
            nop_decay: 0.5,
            penalty_weight: 10.0,
            simulate: false,
            seed: None,
        }
    }
}

/// Externally visible state of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentState {
    pub active: bool,
    pub blocked: bool,
    pub step_count: u64,
    pub address: Option<AddressId>,
    pub bw_in: u32,
    pub bw_out: u32,
    pub addresses: usize,
}

#[derive(Debug)]
struct RilAddress {
    address: Address,
    /// Last `(active, bw_in, bw_out)` reported to the environment.
    reported: (bool, u32, u32),
}

/// Per-scope figures, recomputed once per global step.
#[derive(Debug, Clone, Copy)]
struct ScopeState {
    quota: ScopeQuota,
    assigned_in: u64,
    assigned_out: u64,
    agents: usize,
    welfare: f64,
}

impl ScopeState {
    const fn new(quota: ScopeQuota) -> Self {
        Self { quota, assigned_in: 0, assigned_out: 0, agents: 0, welfare: 0.0 }
    }

    /// Quadratic penalty on the relative overuse of the more overused direction.
    fn penalty(&self, weight: f64) -> f64 {
        let overuse = |assigned: u64, quota: u64| {
            if quota == 0 || assigned <= quota {
                0.0
            } else {
                (assigned - quota) as f64 / quota as f64
            }
        };
        let x = overuse(self.assigned_in, self.quota.inbound)
            .max(overuse(self.assigned_out, self.quota.outbound));
        weight * x * x
    }
}

fn welfare(mode: Welfare, utilities: &[f64]) -> f64 {
    if utilities.is_empty() {
        return 0.0;
    }
    match mode {
        Welfare::Nash => {
            let n = utilities.len() as f64;
            utilities.iter().map(|u| u.max(0.0).powf(1.0 / n)).product()
        }
        Welfare::Egalitarian => utilities.iter().copied().fold(f64::INFINITY, f64::min),
    }
}

struct RilInner<E> {
    env: Arc<E>,
    options: RilOptions,
    quotas: Quotas,
    rbf: Rbf,
    rng: StdRng,
    addresses: FxHashMap<AddressId, RilAddress>,
    /// Agents in creation order.
    agents: Vec<Agent>,
    scopes: [ScopeState; NetworkScope::COUNT],
    bulk: BulkLock,
    /// Addresses whose assignment may have changed since the last notification round.
    pending: Vec<AddressId>,
    step_count: u64,
    last_step: Option<Instant>,
    timer: Option<JoinHandle<()>>,
    this: Weak<Mutex<RilInner<E>>>,
    done: bool,
    stats: Arc<SolverStats>,
}

impl<E: Environment> RilInner<E> {
    fn agent_index(&self, peer: PeerId) -> Option<usize> {
        self.agents.iter().position(|a| a.peer == peer)
    }

    fn agent_or_create(&mut self, peer: PeerId) -> usize {
        if let Some(i) = self.agent_index(peer) {
            return i;
        }
        debug!(%peer, "creating agent");
        self.agents.push(Agent::new(peer, self.rbf.block_len(), &self.options));
        self.agents.len() - 1
    }

    fn is_requested(&self, peer: PeerId) -> bool {
        self.agent_index(peer).is_some_and(|i| self.agents[i].active)
    }

    fn scope_is_active(&self, scope: NetworkScope) -> bool {
        self.quotas.get(scope).min() >= self.options.min_bw as u64
    }

    fn scope_of(&self, id: AddressId) -> Option<NetworkScope> {
        self.addresses.get(&id).map(|a| a.address.scope)
    }

    /// Whether one more agent fits into `scope` with the minimum bandwidth.
    fn scope_admits(&self, scope: NetworkScope) -> bool {
        let count = self
            .agents
            .iter()
            .filter(|a| a.active)
            .filter_map(Agent::address_in_use)
            .filter(|id| self.scope_of(*id) == Some(scope))
            .count() as u64;
        let needed = (count + 1) * self.options.min_bw as u64;
        let quota = self.quotas.get(scope);
        quota.inbound >= needed && quota.outbound >= needed
    }

    fn limits(&self, scope: NetworkScope) -> Limits {
        let quota = self.quotas.get(scope);
        Limits {
            min_bw: self.options.min_bw,
            step: self.options.min_bw.saturating_mul(self.options.inc_dec_step),
            ceiling_in: clamp_quota(quota.inbound),
            ceiling_out: clamp_quota(quota.outbound),
            over_in: false,
            over_out: false,
        }
    }

    /// Bandwidth held right now by active agents in `scope`, leaving out agent `skip`.
    fn live_usage(&self, scope: NetworkScope, skip: Option<usize>) -> (u64, u64) {
        self.agents
            .iter()
            .enumerate()
            .filter(|(i, a)| a.active && Some(*i) != skip)
            .filter(|(_, a)| a.address_in_use().and_then(|id| self.scope_of(id)) == Some(scope))
            .fold((0, 0), |(bw_in, bw_out), (_, a)| {
                (bw_in + a.bw_in as u64, bw_out + a.bw_out as u64)
            })
    }

    /// Limits of agent `i` in `scope`: increases are capped to the room the scope has left.
    fn agent_limits(&self, i: usize, scope: NetworkScope) -> Limits {
        let agent = &self.agents[i];
        let quota = self.quotas.get(scope);
        let (others_in, others_out) = self.live_usage(scope, Some(i));
        let (used_in, used_out) = (others_in + agent.bw_in as u64, others_out + agent.bw_out as u64);

        let mut limits = self.limits(scope);
        limits.over_in = used_in > quota.inbound;
        limits.over_out = used_out > quota.outbound;
        limits.ceiling_in = limits
            .ceiling_in
            .min(clamp_quota(quota.inbound.saturating_sub(others_in)))
            .max(agent.bw_in.min(limits.ceiling_in));
        limits.ceiling_out = limits
            .ceiling_out
            .min(clamp_quota(quota.outbound.saturating_sub(others_out)))
            .max(agent.bw_out.min(limits.ceiling_out));
        limits
    }

    /// Whether agent `i` fits into the scope of its address `k` with at least the minimum
    /// bandwidth.
    fn switch_fits(&self, i: usize, k: usize) -> bool {
        let Some(scope) = self.agents[i].addresses.get(k).and_then(|id| self.scope_of(*id)) else {
            return false;
        };
        if !self.scope_is_active(scope) {
            return false;
        }
        let quota = self.quotas.get(scope);
        let (others_in, others_out) = self.live_usage(scope, Some(i));
        let min = self.options.min_bw as u64;
        others_in + min <= quota.inbound && others_out + min <= quota.outbound
    }

    /// Writes the agent's decision into its address records and queues changed records.
    fn apply_agent(&mut self, i: usize) {
        let agent = &self.agents[i];
        for (k, id) in agent.addresses.iter().enumerate() {
            let Some(record) = self.addresses.get_mut(id) else {
                continue;
            };
            let changed = if agent.in_use == Some(k) {
                record.address.assign(agent.active, agent.bw_in, agent.bw_out)
            } else {
                record.address.deactivate()
            };
            if changed {
                self.pending.push(*id);
            }
        }
    }

    /// Marks the current assignment of an agent's addresses as known to the environment.
    fn settle_silently(&mut self, i: usize) {
        let agent = &self.agents[i];
        for id in &agent.addresses {
            if let Some(record) = self.addresses.get_mut(id) {
                record.reported = record.address.assignment();
            }
        }
        self.pending.retain(|id| !agent.addresses.contains(id));
    }

    /// Gives a blocked agent the first address whose scope still admits it.
    fn try_unblock(&mut self, i: usize) -> bool {
        let candidate = self.agents[i]
            .addresses
            .iter()
            .position(|id| self.scope_of(*id).is_some_and(|s| self.scope_admits(s)));

        let agent = &mut self.agents[i];
        let Some(k) = candidate else {
            trace!(peer = %agent.peer, "agent stays blocked");
            return false;
        };
        agent.in_use = Some(k);
        agent.bw_in = self.options.min_bw;
        agent.bw_out = self.options.min_bw;
        debug!(peer = %agent.peer, id = %agent.addresses[k], "agent unblocked");
        self.apply_agent(i);
        true
    }

    fn utility(&self, agent: &Agent, id: AddressId) -> f64 {
        let preferences = self.env.preferences(&agent.peer);
        let properties = self.env.properties(id);
        let delay = PropertyKind::Delay.quality_index().map_or(0.0, |q| properties[q]).max(0.0);

        let min = self.options.min_bw as f64;
        let latency = (1.0 + preferences[PreferenceKind::Latency.index()]) / (1.0 + delay);
        let bandwidth = (1.0 + preferences[PreferenceKind::Bandwidth.index()])
            * ((agent.bw_in as f64 / min) * (agent.bw_out as f64 / min)).sqrt();
        latency + bandwidth
    }

    fn compute_scopes(&mut self) {
        let mut scopes = NetworkScope::ALL.map(|s| ScopeState::new(self.quotas.get(s)));
        let mut utilities: [Vec<f64>; NetworkScope::COUNT] = Default::default();

        for agent in self.agents.iter().filter(|a| a.active) {
            let Some(id) = agent.address_in_use() else {
                continue;
            };
            let Some(scope) = self.scope_of(id) else {
                continue;
            };
            let state = &mut scopes[scope.index()];
            state.assigned_in += agent.bw_in as u64;
            state.assigned_out += agent.bw_out as u64;
            state.agents += 1;
            utilities[scope.index()].push(self.utility(agent, id));
        }

        for (state, utilities) in scopes.iter_mut().zip(&utilities) {
            state.welfare = welfare(self.options.welfare, utilities);
        }
        self.scopes = scopes;
    }

    fn discount(&mut self, now: Instant) -> Discount {
        if self.options.simulate {
            return Discount::fixed(self.options.gamma);
        }
        let elapsed = self.last_step.map_or(Duration::ZERO, |last| now.saturating_duration_since(last));
        Discount::semi_markov(elapsed, self.options.step_time_min, self.options.beta)
    }

    /// Runs a step of the agent at `i`, which must have an address in use.
    fn agent_step(&mut self, i: usize, discount: Discount) {
        let agent = &self.agents[i];
        let (Some(index), Some(id)) = (agent.in_use, agent.address_in_use()) else {
            return;
        };
        let Some(scope) = self.scope_of(id) else {
            return;
        };
        let limits = self.agent_limits(i, scope);
        let snapshot = self.scopes[scope.index()];

        let block = self.rbf.block_len();
        let mut state = vec![0.0; agent.features()];
        self.rbf.encode(
            &mut state[index * block..(index + 1) * block],
            (agent.bw_in, agent.bw_out),
            (snapshot.quota.inbound, snapshot.quota.outbound),
        );

        let current = (agent.bw_in, agent.bw_out);
        let legal = (0..agent.actions())
            .filter(|a| match Action::from_index(*a) {
                Action::Switch(k) => {
                    action::is_legal(Action::Switch(k), index, agent.addresses.len(), current, &limits)
                        && self.switch_fits(i, k)
                }
                other => action::is_legal(other, index, agent.addresses.len(), current, &limits),
            })
            .collect();
        let obs = Observation {
            state,
            objective: (self.utility(agent, id) + snapshot.welfare) / 2.0,
            penalty: snapshot.penalty(self.options.penalty_weight),
            legal,
        };

        let action = self.agents[i].step(&obs, discount, &self.options, &mut self.rng);
        let agent = &mut self.agents[i];
        trace!(peer = %agent.peer, step = agent.step_count, %action, objective = obs.objective, "agent acted");

        match action {
            Action::Switch(k) => {
                let Some(target) = agent.addresses.get(k).copied() else {
                    return;
                };
                agent.in_use = Some(k);
                if let Some(target_scope) = self.addresses.get(&target).map(|a| a.address.scope) {
                    let quota = self.quotas.get(target_scope);
                    let (others_in, others_out) = self.live_usage(target_scope, Some(i));
                    let min = self.options.min_bw;
                    let room_in = clamp_quota(quota.inbound.saturating_sub(others_in)).max(min);
                    let room_out = clamp_quota(quota.outbound.saturating_sub(others_out)).max(min);
                    let agent = &mut self.agents[i];
                    agent.bw_in = agent.bw_in.clamp(min, room_in);
                    agent.bw_out = agent.bw_out.clamp(min, room_out);
                }
            }
            _ => {
                (agent.bw_in, agent.bw_out) = action::apply(action, current, &limits);
            }
        }
        self.apply_agent(i);
    }

    /// Runs a global step now unless a bulk operation is in progress.
    fn trigger(&mut self) {
        if self.bulk.record_change() {
            self.step();
        }
    }

    fn step(&mut self) {
        let span = tracing::debug_span!("ril_step", step = self.step_count);
        let _enter = span.enter();

        self.stats.increment_solves();
        self.stats.increment_steps();
        self.env.info(Operation::SolveStart, Status::Success, InfoDetail::None);

        let now = Instant::now();
        let discount = self.discount(now);
        self.last_step = Some(now);
        self.compute_scopes();

        let mut stepped = 0;
        for i in 0..self.agents.len() {
            if !self.agents[i].active {
                continue;
            }
            if self.agents[i].in_use.is_none() && !self.try_unblock(i) {
                continue;
            }
            self.agent_step(i, discount);
            stepped += 1;
        }

        self.compute_scopes();
        self.step_count += 1;
        debug!(stepped, agents = self.agents.len(), discount = discount.variable, "step done");
        self.env.info(Operation::SolveStop, Status::Success, InfoDetail::None);

        self.notify();
        self.schedule_next();
    }

    /// Reports every queued record whose assignment differs from the last report.
    fn notify(&mut self) {
        self.env.info(Operation::UpdateNotifyStart, Status::Success, InfoDetail::None);
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort_unstable();
        pending.dedup();

        for id in pending {
            let Some(peer) = self.addresses.get(&id).map(|a| a.address.peer) else {
                continue;
            };
            if !self.is_requested(peer) {
                continue;
            }
            let Some(record) = self.addresses.get_mut(&id) else {
                continue;
            };
            let current = record.address.assignment();
            if current == record.reported {
                continue;
            }
            record.reported = current;
            self.env.bandwidth_changed(&record.address);
            self.stats.increment_notifications();
        }
        self.env.info(Operation::UpdateNotifyStop, Status::Success, InfoDetail::None);
    }

    fn used_ratio(&self) -> f64 {
        scheduler::used_ratio(self.scopes.iter().map(|s| {
            ((s.assigned_in, s.assigned_out), (s.quota.inbound, s.quota.outbound))
        }))
    }

    fn schedule_next(&mut self) {
        if !self.agents.iter().any(|a| a.active) {
            if let Some(timer) = self.timer.take() {
                trace!("no active agents, periodic steps paused");
                timer.abort();
            }
            return;
        }
        if self.options.simulate || self.done || self.timer.is_some() {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            trace!("no runtime, periodic steps disabled");
            return;
        };

        let interval = scheduler::next_interval(
            self.used_ratio(),
            self.options.step_time_min,
            self.options.step_time_max,
            self.options.interval_exponent,
        );
        trace!(?interval, "scheduling next step");

        let this = self.this.clone();
        self.timer = Some(handle.spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(inner) = this.upgrade() {
                let mut inner = inner.lock();
                inner.timer = None;
                inner.trigger();
            }
        }));
    }

    fn shutdown(&mut self) {
        self.done = true;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn address_add(&mut self, address: &Address, scope: NetworkScope) -> Result<(), SolverError> {
        if self.addresses.contains_key(&address.id) {
            return Err(SolverError::DuplicateAddress(address.id));
        }

        let mut address = address.clone();
        address.scope = scope;
        address.deactivate();
        let (id, peer) = (address.id, address.peer);
        self.addresses.insert(id, RilAddress { address, reported: (false, 0, 0) });

        if !self.scope_is_active(scope) {
            debug!(%id, %peer, %scope, "scope quota below minimum bandwidth, address not used");
            return Ok(());
        }

        let i = self.agent_or_create(peer);
        let alpha = self.options.alpha;
        self.agents[i].add_address(id, &mut self.rng, alpha);
        debug!(%id, %peer, %scope, addresses = self.agents[i].addresses.len(), "address added");

        if self.agents[i].is_blocked() {
            self.try_unblock(i);
        }
        self.trigger();
        Ok(())
    }

    fn address_delete(&mut self, id: AddressId, session_only: bool) -> Result<(), SolverError> {
        let Some(record) = self.addresses.get(&id) else {
            return Err(SolverError::UnknownAddress(id));
        };
        let peer = record.address.peer;
        debug!(%id, %peer, session_only, active = record.address.active, "deleting address");

        let found = self
            .agent_index(peer)
            .and_then(|i| self.agents[i].index_of(id).map(|k| (i, k)));
        let Some((i, k)) = found else {
            // never handed to an agent, its scope lacks bandwidth
            if !session_only {
                self.addresses.remove(&id);
            }
            return Ok(());
        };

        if session_only {
            if self.agents[i].in_use == Some(k) {
                self.agents[i].in_use = None;
                self.apply_agent(i);
                self.notify();
            }
            self.trigger();
            return Ok(());
        }

        let removed = self.addresses.remove(&id);
        let was_in_use = self.agents[i].remove_address(k);
        if was_in_use && self.agents[i].active && !self.try_unblock(i) {
            if let Some(mut record) = removed {
                debug!(%peer, "no alternative address, disconnecting");
                record.address.deactivate();
                self.env.bandwidth_changed(&record.address);
                self.stats.increment_notifications();
            }
        }

        if self.agents[i].addresses.is_empty() && !self.agents[i].active {
            debug!(%peer, "removing idle agent");
            self.agents.remove(i);
        }
        self.trigger();
        Ok(())
    }

    fn get_preferred_address(&mut self, peer: PeerId) -> Option<Address> {
        let i = self.agent_or_create(peer);
        if !self.agents[i].active {
            debug!(%peer, "activating agent");
            self.agents[i].active = true;
        }
        if self.agents[i].in_use.is_none() {
            self.try_unblock(i);
        }
        self.apply_agent(i);
        self.settle_silently(i);
        self.schedule_next();

        let address = self.agents[i].address_in_use()?;
        self.addresses.get(&address).map(|a| a.address.clone())
    }

    fn stop_get_preferred_address(&mut self, peer: PeerId) -> Result<(), SolverError> {
        let Some(i) = self.agent_index(peer).filter(|i| self.agents[*i].active) else {
            return Err(SolverError::NoPendingRequest(peer));
        };
        debug!(%peer, "pausing agent");
        self.agents[i].active = false;
        self.apply_agent(i);
        self.settle_silently(i);

        if self.agents[i].addresses.is_empty() {
            self.agents.remove(i);
        }
        self.trigger();
        Ok(())
    }
}

/// Reinforcement learning solver.
///
/// The state lives behind a mutex shared with the periodic step task, which only holds a weak
/// reference. Dropping the solver cancels the task.
pub struct RilSolver<E> {
    inner: Arc<Mutex<RilInner<E>>>,
    stats: Arc<SolverStats>,
}

impl<E> fmt::Debug for RilSolver<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("RilSolver")
            .field("options", &inner.options)
            .field("agents", &inner.agents.len())
            .field("step_count", &inner.step_count)
            .field("bulk", &inner.bulk)
            .finish_non_exhaustive()
    }
}

impl<E: Environment> RilSolver<E> {
    pub fn new(env: Arc<E>, quotas: Quotas, options: RilOptions) -> Result<Self, ConfigError> {
        options.validate()?;

        let stats = Arc::new(SolverStats::default());
        let rng = options.seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        let rbf = Rbf::new(options.rbf_divisor);
        for (scope, quota) in quotas.iter() {
            if quota.min() < options.min_bw as u64 {
                info!(%scope, quota = quota.min(), "scope quota below minimum bandwidth, scope inactive");
            }
        }
        info!(
            algorithm = ?options.algorithm,
            selection = ?options.selection,
            welfare = ?options.welfare,
            features = rbf.block_len(),
            simulate = options.simulate,
            "ril solver initialized"
        );

        let inner = Arc::new_cyclic(|this| {
            Mutex::new(RilInner {
                env,
                scopes: NetworkScope::ALL.map(|s| ScopeState::new(quotas.get(s))),
                quotas,
                rbf,
                rng,
                options,
                addresses: FxHashMap::default(),
                agents: Vec::new(),
                bulk: BulkLock::default(),
                pending: Vec::new(),
                step_count: 0,
                last_step: None,
                timer: None,
                this: this.clone(),
                done: false,
                stats: Arc::clone(&stats),
            })
        });

        Ok(Self { inner, stats })
    }

    pub fn stats(&self) -> &SolverStats {
        &self.stats
    }

    /// Number of global steps taken.
    pub fn step_count(&self) -> u64 {
        self.inner.lock().step_count
    }

    pub fn agent_count(&self) -> usize {
        self.inner.lock().agents.len()
    }

    pub fn agent_state(&self, peer: PeerId) -> Option<AgentState> {
        let inner = self.inner.lock();
        let agent = &inner.agents[inner.agent_index(peer)?];
        Some(AgentState {
            active: agent.active,
            blocked: agent.is_blocked(),
            step_count: agent.step_count,
            address: agent.address_in_use(),
            bw_in: agent.bw_in,
            bw_out: agent.bw_out,
            addresses: agent.addresses.len(),
        })
    }

    /// Whether a periodic step is currently scheduled.
    pub fn is_scheduled(&self) -> bool {
        self.inner.lock().timer.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancels the periodic step. Further steps only happen on demand.
    pub fn shutdown(&self) {
        self.inner.lock().shutdown();
    }
}

impl<E> Drop for RilSolver<E> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        inner.done = true;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
    }
}

impl<E: Environment> Solver for RilSolver<E> {
    fn name(&self) -> &'static str {
        "ril"
    }

    fn address_add(&mut self, address: &Address, scope: NetworkScope) -> Result<(), SolverError> {
        self.inner.lock().address_add(address, scope)
    }

    fn address_delete(&mut self, address: AddressId, session_only: bool) -> Result<(), SolverError> {
        self.inner.lock().address_delete(address, session_only)
    }

    fn address_property_changed(
        &mut self,
        address: AddressId,
        kind: PropertyKind,
        abs_value: u32,
        rel_value: f64,
    ) -> Result<(), SolverError> {
        let mut inner = self.inner.lock();
        if !inner.addresses.contains_key(&address) {
            return Err(SolverError::UnknownAddress(address));
        }
        debug!(id = %address, %kind, abs_value, rel_value, "property changed");
        if kind.quality_index().is_some() {
            inner.trigger();
        }
        Ok(())
    }

    fn address_change_network(
        &mut self,
        address: AddressId,
        scope: NetworkScope,
    ) -> Result<(), SolverError> {
        let mut inner = self.inner.lock();
        let Some(record) = inner.addresses.get(&address) else {
            return Err(SolverError::UnknownAddress(address));
        };
        if record.address.scope == scope {
            return Ok(());
        }
        let snapshot = record.address.clone();
        debug!(id = %address, from = %snapshot.scope, to = %scope, "address changed network");

        inner.bulk.start();
        let result = inner
            .address_delete(address, false)
            .and_then(|()| inner.address_add(&snapshot, scope));
        if inner.bulk.stop()? {
            inner.step();
        }
        result
    }

    fn get_preferred_address(&mut self, peer: PeerId) -> Result<Option<Address>, SolverError> {
        Ok(self.inner.lock().get_preferred_address(peer))
    }

    fn stop_get_preferred_address(&mut self, peer: PeerId) -> Result<(), SolverError> {
        self.inner.lock().stop_get_preferred_address(peer)
    }

    fn change_preference(
        &mut self,
        peer: PeerId,
        kind: PreferenceKind,
        rel_value: f64,
    ) -> Result<(), SolverError> {
        let mut inner = self.inner.lock();
        debug!(%peer, %kind, rel_value, "preference changed");
        if inner.is_requested(peer) {
            inner.trigger();
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
        let mut inner = self.inner.lock();
        inner.bulk.start();
        debug!(depth = inner.bulk.depth(), "bulk start");
    }

    fn bulk_stop(&mut self) -> Result<(), SolverError> {
        let mut inner = self.inner.lock();
        if inner.bulk.stop()? {
            inner.step();
        }
        Ok(())
    }

    fn solve(&mut self) -> Result<(), SolverError> {
        self.inner.lock().trigger();
        Ok(())
    }
}
