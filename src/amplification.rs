//! Anti-amplification limit (RFC 9000 §8)
//!
//! Until a path is validated, bytes sent on it are capped at
//! `amplification_factor` times the bytes received from it. The counters live
//! on the path rather than on a validation attempt, so restarting validation
//! never refreshes the budget.

use tracing::trace;

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::path::{NetworkPath, PathState};

#[derive(Debug, Clone, Copy)]
pub struct AntiAmplificationGuard {
    factor: u64,
}

impl AntiAmplificationGuard {
    pub fn new(config: &MigrationConfig) -> Self {
        Self { factor: config.amplification_factor }
    }

    /// Start limiting sends on a path the peer moved to
    pub fn engage(&self, path: &mut NetworkPath) {
        if path.state != PathState::Validated {
            path.amplification_limited = true;
        }
    }

    pub fn is_limited(&self, path: &NetworkPath) -> bool {
        path.amplification_limited && path.state != PathState::Validated
    }

    /// Bytes that may still be sent on `path`; `u64::MAX` when unrestricted
    pub fn remaining(&self, path: &NetworkPath) -> u64 {
        if !self.is_limited(path) {
            return u64::MAX;
        }
        path.bytes_received
            .saturating_mul(self.factor)
            .saturating_sub(path.bytes_sent)
    }

    pub fn can_send(&self, path: &NetworkPath, bytes: u64) -> bool {
        bytes <= self.remaining(path)
    }

    /// Account `bytes` against the budget, refusing the send if it does not fit
    pub fn try_send(&self, path: &mut NetworkPath, bytes: u64) -> Result<()> {
        let available = self.remaining(path);
        if bytes > available {
            trace!(
                "Amplification limit on {}: {} requested, {} available",
                path.key(),
                bytes,
                available
            );
            return Err(MigrationError::AmplificationBudgetExceeded { requested: bytes, available });
        }
        path.bytes_sent += bytes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{PathId, PathKey};
    use std::time::{Duration, Instant};

    fn unvalidated(received: u64) -> NetworkPath {
        let key = PathKey::new("10.0.0.1:443".parse().unwrap(), "203.0.113.9:7000".parse().unwrap());
        let mut path = NetworkPath::new(PathId(3), key, Duration::from_millis(100), Instant::now());
        path.bytes_received = received;
        path
    }

    #[test]
    fn test_budget_is_three_times_received() {
        let guard = AntiAmplificationGuard::new(&MigrationConfig::default());
        let mut path = unvalidated(100);
        guard.engage(&mut path);

        assert_eq!(guard.remaining(&path), 300);
        assert!(guard.can_send(&path, 300));
        assert!(!guard.can_send(&path, 301));

        guard.try_send(&mut path, 250).unwrap();
        assert!(matches!(
            guard.try_send(&mut path, 51),
            Err(MigrationError::AmplificationBudgetExceeded { requested: 51, available: 50 })
        ));
        assert_eq!(path.bytes_sent, 250);
    }

    #[test]
    fn test_budget_grows_with_received_bytes() {
        let guard = AntiAmplificationGuard::new(&MigrationConfig::default());
        let mut path = unvalidated(10);
        guard.engage(&mut path);
        guard.try_send(&mut path, 30).unwrap();
        assert_eq!(guard.remaining(&path), 0);

        path.bytes_received += 20;
        assert_eq!(guard.remaining(&path), 60);
    }

    #[test]
    fn test_validation_lifts_limit() {
        let guard = AntiAmplificationGuard::new(&MigrationConfig::default());
        let mut path = unvalidated(1);
        guard.engage(&mut path);
        assert!(!guard.can_send(&path, 1200));

        path.state = PathState::Validated;
        assert!(guard.can_send(&path, 1200));
        assert_eq!(guard.remaining(&path), u64::MAX);
    }

    #[test]
    fn test_locally_initiated_path_unrestricted() {
        let guard = AntiAmplificationGuard::new(&MigrationConfig::default());
        let mut path = unvalidated(0);
        guard.try_send(&mut path, 1200).unwrap();
        assert!(!guard.is_limited(&path));
    }
}
