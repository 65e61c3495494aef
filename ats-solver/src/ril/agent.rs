use rand::{distributions::WeightedIndex, prelude::Distribution, rngs::StdRng, seq::SliceRandom, Rng};
use tracing::{trace, warn};

use ats_env::{AddressId, PeerId};

use super::{
    action::{Action, ACTION_TYPES},
    matrix::BlockMatrix,
    scheduler::Discount,
    Algorithm, RilOptions, Selection, TraceMode,
};

/// Replaces a diverged value estimate by a large finite sentinel.
fn sanitize(q: f64) -> f64 {
    const SENTINEL: f64 = u32::MAX as f64;
    if q.is_nan() {
        warn!("value estimate is NaN, clamping");
        SENTINEL
    } else if q.is_infinite() {
        warn!(q, "value estimate is infinite, clamping");
        q.signum() * SENTINEL
    } else {
        q
    }
}

/// What an agent observes in one step.
#[derive(Debug)]
pub(crate) struct Observation {
    pub(crate) state: Vec<f64>,
    /// Mean of the agent's utility and the social welfare of its scope.
    pub(crate) objective: f64,
    /// Penalty for overusing the scope.
    pub(crate) penalty: f64,
    /// Indices of the actions that are legal in `state`.
    pub(crate) legal: Vec<usize>,
}

/// A linear function approximation agent serving one peer.
#[derive(Debug)]
pub(crate) struct Agent {
    pub(crate) peer: PeerId,
    /// The peer has a pending request.
    pub(crate) active: bool,
    /// Candidate addresses, the index is the feature block and the switch action offset.
    pub(crate) addresses: Vec<AddressId>,
    /// Index of the address in use, `None` while blocked.
    pub(crate) in_use: Option<usize>,
    pub(crate) bw_in: u32,
    pub(crate) bw_out: u32,
    pub(crate) step_count: u64,
    block_len: usize,
    w: BlockMatrix,
    e: BlockMatrix,
    s_old: Vec<f64>,
    a_old: Option<usize>,
    explore_ratio: f64,
    temperature: f64,
    nop_bonus: f64,
    objective: f64,
}

impl Agent {
    pub(crate) fn new(peer: PeerId, block_len: usize, options: &RilOptions) -> Self {
        Self {
            peer,
            active: false,
            addresses: Vec::new(),
            in_use: None,
            bw_in: options.min_bw,
            bw_out: options.min_bw,
            step_count: 0,
            block_len,
            w: BlockMatrix::new(ACTION_TYPES, block_len),
            e: BlockMatrix::new(ACTION_TYPES, block_len),
            s_old: Vec::new(),
            a_old: None,
            explore_ratio: options.explore_ratio,
            temperature: options.temperature,
            nop_bonus: 0.0,
            objective: 0.0,
        }
    }

    /// Number of actions, including one switch action per address.
    #[inline]
    pub(crate) fn actions(&self) -> usize {
        self.w.rows()
    }

    #[inline]
    pub(crate) const fn features(&self) -> usize {
        self.w.width()
    }

    #[inline]
    pub(crate) const fn is_blocked(&self) -> bool {
        self.active && self.in_use.is_none()
    }

    pub(crate) fn address_in_use(&self) -> Option<AddressId> {
        self.in_use.and_then(|i| self.addresses.get(i).copied())
    }

    pub(crate) fn index_of(&self, id: AddressId) -> Option<usize> {
        self.addresses.iter().position(|a| *a == id)
    }

    /// Adds a feature block and a switch action for a new address. New weights are drawn
    /// uniformly from `[-alpha, alpha]`.
    pub(crate) fn add_address(&mut self, id: AddressId, rng: &mut StdRng, alpha: f64) {
        let mut init = || if alpha > 0.0 { rng.gen_range(-alpha..=alpha) } else { 0.0 };
        self.w.push_block(&mut init);
        self.w.push_row(&mut init);
        self.e.push_block(|| 0.0);
        self.e.push_row(|| 0.0);
        self.s_old.resize(self.s_old.len() + self.block_len, 0.0);
        self.addresses.push(id);
    }

    /// Removes the block and the switch action of address `index`. Returns whether the address
    /// was in use.
    pub(crate) fn remove_address(&mut self, index: usize) -> bool {
        if index >= self.addresses.len() {
            return false;
        }

        let switch = ACTION_TYPES + index;
        self.w.remove_block(index);
        self.w.remove_row(switch);
        self.e.remove_block(index);
        self.e.remove_row(switch);
        let start = index * self.block_len;
        self.s_old.drain(start..start + self.block_len);
        self.addresses.remove(index);

        self.a_old = match self.a_old {
            Some(a) if a == switch => None,
            Some(a) if a > switch => Some(a - 1),
            other => other,
        };

        match self.in_use {
            Some(i) if i == index => {
                self.in_use = None;
                true
            }
            Some(i) if i > index => {
                self.in_use = Some(i - 1);
                false
            }
            _ => false,
        }
    }

    /// Estimated value of `action` in `state`.
    pub(crate) fn q(&self, state: &[f64], action: usize) -> f64 {
        sanitize(self.w.dot(action, state))
    }

    fn greedy(&self, state: &[f64], legal: &[usize]) -> usize {
        legal
            .iter()
            .copied()
            .map(|a| (a, self.q(state, a)))
            .fold(None, |best: Option<(usize, f64)>, (a, q)| match best {
                Some((_, best_q)) if best_q >= q => best,
                _ => Some((a, q)),
            })
            .map_or(Action::Nothing.index(), |(a, _)| a)
    }

    /// Picks the next action. Returns it and whether it deviates from the greedy choice.
    fn select(
        &mut self,
        state: &[f64],
        legal: &[usize],
        greedy: usize,
        options: &RilOptions,
        rng: &mut StdRng,
    ) -> (usize, bool) {
        match options.selection {
            Selection::EpsilonGreedy => {
                if rng.gen::<f64>() >= self.explore_ratio {
                    return (greedy, false);
                }
                self.explore_ratio *= options.explore_decay;
                let action = legal.choose(rng).copied().unwrap_or(greedy);
                (action, action != greedy)
            }
            Selection::Softmax => {
                let values: Vec<f64> = legal.iter().map(|a| self.q(state, *a)).collect();
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let temperature = self.temperature.max(f64::MIN_POSITIVE);
                let weights = values.iter().map(|q| ((q - max) / temperature).exp());

                let action = match WeightedIndex::new(weights) {
                    Ok(dist) => legal[dist.sample(rng)],
                    Err(e) => {
                        warn!(%e, "softmax weights degenerate, acting greedily");
                        greedy
                    }
                };
                let explored = action != greedy;
                if explored {
                    self.temperature *= options.temperature_decay;
                }
                (action, explored)
            }
        }
    }

    /// Turns the observed objective into a reward: the change since the previous step, a
    /// decaying bonus for standing still and the overuse penalty.
    fn reward(&mut self, objective: f64, penalty: f64, nop_decay: f64) -> f64 {
        let delta = objective - self.objective;
        self.objective = objective;

        let reward = if self.a_old == Some(Action::Nothing.index()) {
            self.nop_bonus *= nop_decay;
            delta + self.nop_bonus
        } else {
            self.nop_bonus = delta.abs() * nop_decay;
            delta
        };
        reward - penalty
    }

    /// One learning step: observe, update the weights for the previous action and pick the
    /// next one.
    pub(crate) fn step(
        &mut self,
        obs: &Observation,
        discount: Discount,
        options: &RilOptions,
        rng: &mut StdRng,
    ) -> Action {
        let reward = self.reward(obs.objective, obs.penalty, options.nop_decay);
        let greedy = self.greedy(&obs.state, &obs.legal);
        let (next, explored) = self.select(&obs.state, &obs.legal, greedy, options, rng);

        if let Some(a_old) = self.a_old {
            let target = match options.algorithm {
                Algorithm::Sarsa => next,
                Algorithm::Q => greedy,
            };
            let delta = discount.integrated * reward + discount.variable * self.q(&obs.state, target)
                - self.q(&self.s_old, a_old);
            self.w.add_scaled(&self.e, options.alpha * delta);
            trace!(peer = %self.peer, step = self.step_count, reward, delta, "weights updated");
        }

        if options.algorithm == Algorithm::Q && explored {
            self.e.fill(0.0);
        } else {
            self.e.scale(discount.variable * options.lambda);
        }

        let trace = self.e.row_mut(next);
        for (e, s) in trace.iter_mut().zip(&obs.state) {
            match options.trace_mode {
                TraceMode::Accumulate => *e += s,
                TraceMode::Replace => {
                    if *s != 0.0 {
                        *e = *s;
                    }
                }
            }
        }

        self.s_old.clone_from(&obs.state);
        self.a_old = Some(next);
        self.step_count += 1;

        Action::from_index(next)
    }
}
