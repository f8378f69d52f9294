//! Path validation (RFC 9000 §8.2)
//!
//! Every PATH_CHALLENGE carries a fresh unpredictable token. A path only
//! accepts the token of its most recent attempt, so responses to superseded
//! attempts, or responses replayed from another path, never validate it.
//! Attempt state lives on the [`NetworkPath`] itself; the validator owns the
//! token source and the retransmission policy.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::MigrationConfig;
use crate::path::{NetworkPath, PathState};

/// PATH_CHALLENGE / PATH_RESPONSE payload length
pub const CHALLENGE_TOKEN_LENGTH: usize = 8;

/// Unpredictable challenge payload bound to one path and one attempt
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChallengeToken([u8; CHALLENGE_TOKEN_LENGTH]);

impl ChallengeToken {
    pub fn new(data: [u8; CHALLENGE_TOKEN_LENGTH]) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_TOKEN_LENGTH] {
        &self.0
    }
}

impl fmt::Debug for ChallengeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChallengeToken({})", hex::encode(self.0))
    }
}

/// Outstanding challenge of a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Challenge {
    pub token: ChallengeToken,
    /// 1-based attempt number
    pub attempt: u32,
    pub sent_at: Instant,
    pub deadline: Instant,
    /// False while the anti-amplification budget holds the challenge back
    pub transmitted: bool,
}

/// Result of matching a PATH_RESPONSE against a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Matched { rtt: Duration },
    /// A challenge is outstanding but the token belongs to another attempt or path
    Mismatched,
    /// No challenge is outstanding on the path
    Unknown,
}

/// Result of a validation timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutOutcome {
    /// A new attempt was armed with a fresh token
    Retry(ChallengeToken),
    /// Attempts exhausted, the path is now `Failed`
    Exhausted { attempts: u32 },
    NotDue,
    Idle,
}

/// Issues challenge tokens and drives retransmission with exponential backoff
#[derive(Debug)]
pub struct PathValidator {
    rng: StdRng,
    max_attempts: u32,
    rtt_factor: u32,
    min_timeout: Duration,
}

impl PathValidator {
    pub fn new(config: &MigrationConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: &MigrationConfig, rng: StdRng) -> Self {
        Self {
            rng,
            max_attempts: config.max_validation_attempts,
            rtt_factor: config.validation_timeout_rtt_factor,
            min_timeout: config.min_validation_timeout(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Start a new validation of `path`, superseding any outstanding attempt
    pub fn begin_validation(&mut self, path: &mut NetworkPath, now: Instant) -> ChallengeToken {
        let token = self.fresh_token();
        path.state = PathState::Validating;
        path.failed_at = None;
        path.challenge = Some(Challenge {
            token,
            attempt: 1,
            sent_at: now,
            deadline: now + self.timeout(path, 1),
            transmitted: false,
        });
        debug!(
            "Path validation started for {} (token {:?})",
            path.key(),
            token
        );
        token
    }

    /// Match a PATH_RESPONSE received on `path`
    pub fn on_response(
        &mut self,
        path: &mut NetworkPath,
        token: ChallengeToken,
        now: Instant,
    ) -> ValidationOutcome {
        let Some(challenge) = path.challenge else {
            return ValidationOutcome::Unknown;
        };
        if challenge.token != token {
            debug!("Dropping stale PATH_RESPONSE on {} ({:?})", path.key(), token);
            return ValidationOutcome::Mismatched;
        }

        let rtt = now.saturating_duration_since(challenge.sent_at);
        path.rtt.update(rtt);
        path.state = PathState::Validated;
        path.challenge = None;
        path.amplification_limited = false;
        info!("Path validated for {} (RTT: {:?})", path.key(), rtt);
        ValidationOutcome::Matched { rtt }
    }

    /// Handle expiry of the validation timer of `path`
    pub fn on_timeout(&mut self, path: &mut NetworkPath, now: Instant) -> TimeoutOutcome {
        let Some(challenge) = path.challenge else {
            return TimeoutOutcome::Idle;
        };
        if now < challenge.deadline {
            return TimeoutOutcome::NotDue;
        }
        path.challenges_lost += 1;

        if challenge.attempt >= self.max_attempts {
            path.state = PathState::Failed;
            path.challenge = None;
            path.failed_at = Some(now);
            warn!(
                "Path validation for {} failed after {} attempts",
                path.key(),
                challenge.attempt
            );
            return TimeoutOutcome::Exhausted { attempts: challenge.attempt };
        }

        let attempt = challenge.attempt + 1;
        let token = self.fresh_token();
        path.challenge = Some(Challenge {
            token,
            attempt,
            sent_at: now,
            deadline: now + self.timeout(path, attempt),
            transmitted: false,
        });
        debug!("Retrying path validation for {} (attempt {})", path.key(), attempt);
        TimeoutOutcome::Retry(token)
    }

    /// Record that the outstanding challenge actually left; restarts its timer
    pub fn on_challenge_sent(&self, path: &mut NetworkPath, now: Instant) {
        let timeout = path.challenge.map(|challenge| self.timeout(path, challenge.attempt));
        if let (Some(challenge), Some(timeout)) = (path.challenge.as_mut(), timeout) {
            challenge.sent_at = now;
            challenge.deadline = now + timeout;
            challenge.transmitted = true;
        }
    }

    /// Discard any outstanding attempt
    pub fn cancel(&self, path: &mut NetworkPath) {
        if path.challenge.take().is_some() && path.state == PathState::Validating {
            path.state = PathState::Unvalidated;
        }
    }

    /// Timeout for `attempt`: RTT-derived, doubled per retry
    fn timeout(&self, path: &NetworkPath, attempt: u32) -> Duration {
        let base = (path.rtt.conservative() * self.rtt_factor).max(self.min_timeout);
        base.saturating_mul(1u32 << (attempt.saturating_sub(1)).min(16))
    }

    fn fresh_token(&mut self) -> ChallengeToken {
        let mut data = [0u8; CHALLENGE_TOKEN_LENGTH];
        self.rng.fill_bytes(&mut data);
        ChallengeToken(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::{PathId, PathKey};

    fn path(now: Instant) -> NetworkPath {
        let key = PathKey::new("10.0.0.1:443".parse().unwrap(), "192.0.2.1:5000".parse().unwrap());
        NetworkPath::new(PathId(1), key, Duration::from_millis(100), now)
    }

    fn validator() -> PathValidator {
        PathValidator::with_rng(&MigrationConfig::default(), StdRng::seed_from_u64(7))
    }

    #[test]
    fn test_matching_response_validates() {
        let now = Instant::now();
        let mut validator = validator();
        let mut path = path(now);

        let token = validator.begin_validation(&mut path, now);
        assert_eq!(path.state, PathState::Validating);

        let outcome = validator.on_response(&mut path, token, now + Duration::from_millis(40));
        assert_eq!(outcome, ValidationOutcome::Matched { rtt: Duration::from_millis(40) });
        assert_eq!(path.state, PathState::Validated);
        assert!(path.challenge.is_none());
    }

    #[test]
    fn test_duplicate_response_is_noop() {
        let now = Instant::now();
        let mut validator = validator();
        let mut path = path(now);
        let token = validator.begin_validation(&mut path, now);

        assert!(matches!(validator.on_response(&mut path, token, now), ValidationOutcome::Matched { .. }));
        assert_eq!(validator.on_response(&mut path, token, now), ValidationOutcome::Unknown);
        assert_eq!(path.state, PathState::Validated);
    }

    #[test]
    fn test_stale_token_rejected_after_retry() {
        let now = Instant::now();
        let mut validator = validator();
        let mut path = path(now);

        let first = validator.begin_validation(&mut path, now);
        let deadline = path.challenge.unwrap().deadline;
        let TimeoutOutcome::Retry(second) = validator.on_timeout(&mut path, deadline) else {
            panic!("expected retry");
        };
        assert_ne!(first, second);

        assert_eq!(validator.on_response(&mut path, first, deadline), ValidationOutcome::Mismatched);
        assert_eq!(path.state, PathState::Validating);
        assert!(matches!(
            validator.on_response(&mut path, second, deadline),
            ValidationOutcome::Matched { .. }
        ));
    }

    #[test]
    fn test_exponential_backoff_and_exhaustion() {
        let now = Instant::now();
        let mut validator = validator();
        let mut path = path(now);

        validator.begin_validation(&mut path, now);
        let first = path.challenge.unwrap();
        // 3 x 100ms RTT
        assert_eq!(first.deadline - first.sent_at, Duration::from_millis(300));

        assert_eq!(validator.on_timeout(&mut path, now), TimeoutOutcome::NotDue);

        let t1 = first.deadline;
        assert!(matches!(validator.on_timeout(&mut path, t1), TimeoutOutcome::Retry(_)));
        let second = path.challenge.unwrap();
        assert_eq!(second.deadline - t1, Duration::from_millis(600));

        let t2 = second.deadline;
        assert!(matches!(validator.on_timeout(&mut path, t2), TimeoutOutcome::Retry(_)));
        let t3 = path.challenge.unwrap().deadline;
        assert_eq!(t3 - t2, Duration::from_millis(1200));

        assert_eq!(validator.on_timeout(&mut path, t3), TimeoutOutcome::Exhausted { attempts: 3 });
        assert_eq!(path.state, PathState::Failed);
        assert_eq!(path.failed_at, Some(t3));
        assert_eq!(validator.on_timeout(&mut path, t3), TimeoutOutcome::Idle);
    }

    #[test]
    fn test_minimum_timeout() {
        let now = Instant::now();
        let mut validator = validator();
        let key = PathKey::new("10.0.0.1:443".parse().unwrap(), "192.0.2.1:5000".parse().unwrap());
        let mut path = NetworkPath::new(PathId(2), key, Duration::from_millis(1), now);
        validator.begin_validation(&mut path, now);
        let challenge = path.challenge.unwrap();
        assert_eq!(challenge.deadline - now, Duration::from_millis(50));
    }

    #[test]
    fn test_cancel_returns_path_to_unvalidated() {
        let now = Instant::now();
        let mut validator = validator();
        let mut path = path(now);
        let token = validator.begin_validation(&mut path, now);
        validator.cancel(&mut path);
        assert_eq!(path.state, PathState::Unvalidated);
        assert_eq!(validator.on_response(&mut path, token, now), ValidationOutcome::Unknown);
    }
}
