use std::sync::atomic::{AtomicUsize, Ordering};

/// Counters shared by all solver strategies. Strategies that have no notion of a
/// counter leave it at zero.
#[derive(Debug, Default)]
pub struct SolverStats {
    /// Solves started, including fast-path exits.
    solves: AtomicUsize,
    /// Solves that reported failure.
    solves_failed: AtomicUsize,
    /// Bandwidth notifications issued.
    notifications: AtomicUsize,
    /// Full problem rebuilds.
    rebuilds: AtomicUsize,
    /// In-place coefficient updates.
    updates: AtomicUsize,
    /// Reinforcement learning global steps.
    steps: AtomicUsize,
}

impl SolverStats {
    #[inline]
    pub(crate) fn increment_solves(&self) {
        self.solves.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_failed(&self) {
        self.solves_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_notifications(&self) {
        self.notifications.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_rebuilds(&self) {
        self.rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_updates(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn increment_steps(&self) {
        self.steps.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn solves(&self) -> usize {
        self.solves.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn solves_failed(&self) -> usize {
        self.solves_failed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn notifications(&self) -> usize {
        self.notifications.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn rebuilds(&self) -> usize {
        self.rebuilds.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn steps(&self) -> usize {
        self.steps.load(Ordering::Relaxed)
    }
}
