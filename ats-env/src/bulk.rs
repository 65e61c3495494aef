use tracing::{trace, warn};

use crate::SolverError;

/// Reentrant suppression of solving.
///
/// While the lock is held, state-changing operations only record that a change happened.
/// Releasing the outermost hold reports whether exactly one solve is now due.
#[derive(Debug, Default)]
pub struct BulkLock {
    depth: usize,
    pending: bool,
}

impl BulkLock {
    #[inline]
    pub fn start(&mut self) {
        self.depth += 1;
    }

    /// Releases one hold. Returns `true` if this was the outermost hold and a change was
    /// recorded meanwhile, in which case the pending flag is cleared.
    pub fn stop(&mut self) -> Result<bool, SolverError> {
        if self.depth == 0 {
            warn!("bulk stop without matching bulk start");
            return Err(SolverError::BulkUnderflow);
        }

        self.depth -= 1;
        if self.depth == 0 && self.pending {
            trace!("bulk released with pending changes");
            self.pending = false;
            return Ok(true);
        }

        Ok(false)
    }

    #[inline]
    pub const fn is_active(&self) -> bool {
        self.depth > 0
    }

    /// Records a change. Returns `true` if the caller should solve right away.
    #[inline]
    pub fn record_change(&mut self) -> bool {
        if self.depth > 0 {
            self.pending = true;
            false
        } else {
            true
        }
    }

    #[inline]
    pub const fn depth(&self) -> usize {
        self.depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_holds_solve_once() {
        let mut bulk = BulkLock::default();
        assert!(bulk.record_change());

        bulk.start();
        bulk.start();
        bulk.start();
        assert!(!bulk.record_change());
        assert!(!bulk.stop().unwrap());
        assert!(!bulk.record_change());
        assert!(!bulk.stop().unwrap());
        assert!(bulk.stop().unwrap());
        assert!(!bulk.is_active());

        assert!(matches!(bulk.stop(), Err(SolverError::BulkUnderflow)));
    }

    #[test]
    fn underflow_leaves_the_lock_usable() {
        let _ = tracing_subscriber::fmt::try_init();

        let mut bulk = BulkLock::default();
        assert!(matches!(bulk.stop(), Err(SolverError::BulkUnderflow)));
        assert_eq!(bulk.depth(), 0);

        bulk.start();
        assert!(!bulk.record_change());
        assert!(bulk.stop().unwrap());
    }

    #[test]
    fn release_without_change_is_quiet() {
        let mut bulk = BulkLock::default();
        bulk.start();
        assert!(!bulk.stop().unwrap());
    }
}
