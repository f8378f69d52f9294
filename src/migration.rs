//! Connection Migration state machine
//!
//! The controller decides *whether* a path change happens; the connection
//! carries out the decision (validation, CID rotation, sending). A failed
//! migration attempt never touches the active path.
//!
//! ```text
//! Stable ──trigger──▶ ProbingNewPath ──validated──▶ Migrating ──grace elapsed──▶ Stable
//!    ▲                      │
//!    └──────failed──────────┘          any state ──close──▶ Closed
//! ```

use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::events::MigrationTrigger;
use crate::path::PathId;

/// Migration state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Single validated active path, nothing pending
    Stable,
    /// A candidate is being validated while the active path keeps carrying traffic
    ProbingNewPath {
        candidate: PathId,
        trigger: MigrationTrigger,
    },
    /// The candidate is active; the old path's connection ID is in its grace window
    Migrating {
        from: PathId,
        to: PathId,
        retire_deadline: Instant,
    },
    Closed,
}

/// What the connection should do in response to a trigger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationDirective {
    None,
    /// Validate the path (unless it already is being validated)
    Validate(PathId),
    /// Make the path active
    Promote {
        path: PathId,
        trigger: MigrationTrigger,
    },
}

#[derive(Debug)]
pub struct MigrationController {
    state: MigrationState,
    /// Most recent trigger seen while `Migrating`
    queued: Option<(PathId, MigrationTrigger)>,
    migration_enabled: bool,
    grace: Duration,
}

impl MigrationController {
    pub fn new(config: &MigrationConfig) -> Self {
        Self {
            state: MigrationState::Stable,
            queued: None,
            migration_enabled: config.migration_enabled,
            grace: config.cid_retirement_grace(),
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == MigrationState::Closed
    }

    /// Candidate currently being probed, if any
    pub fn candidate(&self) -> Option<PathId> {
        match self.state {
            MigrationState::ProbingNewPath { candidate, .. } => Some(candidate),
            _ => None,
        }
    }

    /// A path that still needs validation was triggered; it becomes the candidate
    pub fn on_new_path(&mut self, path: PathId, trigger: MigrationTrigger) -> MigrationDirective {
        match self.state {
            MigrationState::Closed => MigrationDirective::None,
            MigrationState::Stable | MigrationState::ProbingNewPath { .. } => {
                if let MigrationState::ProbingNewPath { candidate, .. } = self.state {
                    if candidate != path {
                        debug!("Candidate {} superseded by {}", candidate, path);
                    }
                }
                self.state = MigrationState::ProbingNewPath { candidate: path, trigger };
                MigrationDirective::Validate(path)
            }
            MigrationState::Migrating { .. } => {
                self.queued = Some((path, trigger));
                MigrationDirective::Validate(path)
            }
        }
    }

    /// A path that is already validated was triggered; migrate without probing
    pub fn on_validated_trigger(
        &mut self,
        path: PathId,
        trigger: MigrationTrigger,
    ) -> MigrationDirective {
        match self.state {
            MigrationState::Closed => MigrationDirective::None,
            MigrationState::Stable | MigrationState::ProbingNewPath { .. } => {
                MigrationDirective::Promote { path, trigger }
            }
            MigrationState::Migrating { to, .. } if to == path => MigrationDirective::None,
            MigrationState::Migrating { .. } => {
                self.queued = Some((path, trigger));
                MigrationDirective::None
            }
        }
    }

    /// Validation of `path` succeeded. Only the current candidate is promoted.
    pub fn on_path_validated(&mut self, path: PathId) -> MigrationDirective {
        match self.state {
            MigrationState::ProbingNewPath { candidate, trigger } if candidate == path => {
                MigrationDirective::Promote { path, trigger }
            }
            _ => {
                debug!("{} validated without taking over", path);
                MigrationDirective::None
            }
        }
    }

    /// Validation of `path` was exhausted. Returns whether it was the candidate.
    pub fn on_validation_failed(&mut self, path: PathId) -> bool {
        if self.queued.is_some_and(|(queued, _)| queued == path) {
            self.queued = None;
        }
        match self.state {
            MigrationState::ProbingNewPath { candidate, .. } if candidate == path => {
                info!("Migration to {} abandoned, staying on the active path", path);
                self.state = MigrationState::Stable;
                true
            }
            _ => false,
        }
    }

    /// Locally initiated migration towards `path`
    pub fn begin_active_migration(
        &mut self,
        path: PathId,
        trigger: MigrationTrigger,
        validated: bool,
    ) -> Result<MigrationDirective> {
        if self.state == MigrationState::Closed {
            return Err(MigrationError::ConnectionClosed);
        }
        if !self.migration_enabled {
            return Err(MigrationError::MigrationDisabled);
        }
        Ok(if validated {
            self.on_validated_trigger(path, trigger)
        } else {
            self.on_new_path(path, trigger)
        })
    }

    /// The connection made `to` active
    pub fn on_migrated(&mut self, from: PathId, to: PathId, now: Instant) {
        if self.state == MigrationState::Closed {
            return;
        }
        if self.queued.is_some_and(|(queued, _)| queued == to) {
            self.queued = None;
        }
        self.state = MigrationState::Migrating { from, to, retire_deadline: now + self.grace };
    }

    /// A path left the table
    pub fn on_path_removed(&mut self, path: PathId) {
        if self.queued.is_some_and(|(queued, _)| queued == path) {
            self.queued = None;
        }
        if self.candidate() == Some(path) {
            self.state = MigrationState::Stable;
        }
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match self.state {
            MigrationState::Migrating { retire_deadline, .. } => Some(retire_deadline),
            _ => None,
        }
    }

    /// Finish a migration whose grace window elapsed.
    ///
    /// Returns a trigger that arrived while migrating; the caller replays it.
    pub fn handle_timeout(&mut self, now: Instant) -> Option<(PathId, MigrationTrigger)> {
        match self.state {
            MigrationState::Migrating { to, retire_deadline, .. } if now >= retire_deadline => {
                debug!("Migration to {} settled", to);
                self.state = MigrationState::Stable;
                self.queued.take()
            }
            _ => None,
        }
    }

    /// Terminal; pending triggers are discarded
    pub fn close(&mut self) {
        self.state = MigrationState::Closed;
        self.queued = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: MigrationTrigger = MigrationTrigger::PeerAddressChange;

    fn controller() -> MigrationController {
        MigrationController::new(&MigrationConfig::default())
    }

    #[test]
    fn test_probe_validate_settle() {
        let now = Instant::now();
        let mut controller = controller();

        assert_eq!(controller.on_new_path(PathId(1), PEER), MigrationDirective::Validate(PathId(1)));
        assert_eq!(
            controller.state(),
            MigrationState::ProbingNewPath { candidate: PathId(1), trigger: PEER }
        );

        assert_eq!(
            controller.on_path_validated(PathId(1)),
            MigrationDirective::Promote { path: PathId(1), trigger: PEER }
        );
        controller.on_migrated(PathId(0), PathId(1), now);
        let deadline = controller.poll_timeout().unwrap();
        assert_eq!(deadline, now + Duration::from_secs(3));

        assert_eq!(controller.handle_timeout(now), None);
        assert!(matches!(controller.state(), MigrationState::Migrating { .. }));
        assert_eq!(controller.handle_timeout(deadline), None);
        assert_eq!(controller.state(), MigrationState::Stable);
    }

    #[test]
    fn test_failure_returns_to_stable() {
        let mut controller = controller();
        controller.on_new_path(PathId(4), PEER);
        assert!(controller.on_validation_failed(PathId(4)));
        assert_eq!(controller.state(), MigrationState::Stable);
    }

    #[test]
    fn test_only_latest_candidate_takes_over() {
        let mut controller = controller();
        controller.on_new_path(PathId(1), PEER);
        controller.on_new_path(PathId(2), PEER);

        assert_eq!(controller.on_path_validated(PathId(1)), MigrationDirective::None);
        assert!(!controller.on_validation_failed(PathId(1)));
        assert_eq!(
            controller.on_path_validated(PathId(2)),
            MigrationDirective::Promote { path: PathId(2), trigger: PEER }
        );
    }

    #[test]
    fn test_trigger_while_migrating_is_replayed() {
        let now = Instant::now();
        let mut controller = controller();
        controller.on_new_path(PathId(1), PEER);
        controller.on_migrated(PathId(0), PathId(1), now);

        assert_eq!(controller.on_validated_trigger(PathId(0), PEER), MigrationDirective::None);
        let deadline = controller.poll_timeout().unwrap();
        assert_eq!(controller.handle_timeout(deadline), Some((PathId(0), PEER)));
    }

    #[test]
    fn test_active_migration_disabled() {
        let config = MigrationConfig { migration_enabled: false, ..Default::default() };
        let mut controller = MigrationController::new(&config);
        assert!(matches!(
            controller.begin_active_migration(PathId(1), MigrationTrigger::LocalProbe, false),
            Err(MigrationError::MigrationDisabled)
        ));
    }

    #[test]
    fn test_close_is_terminal() {
        let mut controller = controller();
        controller.on_new_path(PathId(1), PEER);
        controller.close();
        assert_eq!(controller.on_path_validated(PathId(1)), MigrationDirective::None);
        assert_eq!(controller.on_new_path(PathId(2), PEER), MigrationDirective::None);
        assert!(matches!(
            controller.begin_active_migration(PathId(2), MigrationTrigger::LocalProbe, false),
            Err(MigrationError::ConnectionClosed)
        ));
    }
}
