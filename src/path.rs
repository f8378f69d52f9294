//! Network paths and the per-connection path table
//!
//! A path is a (local address, remote address) pair. The table creates a path
//! the first time a packet is observed on a new tuple and never merges two
//! tuples. Exactly one path is active; [`NetworkPathTable::set_active`] is the
//! only place that moves the active pointer, and it rotates connection IDs
//! as it does so.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::MigrationConfig;
use crate::connection_id::{ConnectionIdRegistry, IssuedConnectionId};
use crate::error::{MigrationError, Result};
use crate::validator::{Challenge, ChallengeToken};

/// Identity of a path within its connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathId(pub u64);

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path#{}", self.0)
    }
}

/// The address tuple that identifies a path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

impl PathKey {
    pub fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

impl fmt::Display for PathKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local, self.remote)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PathState {
    Unvalidated,
    Validating,
    Validated,
    Failed,
}

/// RTT estimation for a particular network path (RFC 6298 smoothing)
#[derive(Debug, Clone, Copy)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Option<Duration>,
    var: Duration,
    min: Duration,
}

impl RttEstimator {
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Maximum of smoothed and latest RTT
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn var(&self) -> Duration {
        self.var
    }

    pub fn update(&mut self, sample: Duration) {
        self.latest = sample;
        match self.smoothed {
            None => {
                self.min = sample;
                self.smoothed = Some(sample);
                self.var = sample / 2;
            }
            Some(smoothed) => {
                self.min = self.min.min(sample);
                let deviation = if smoothed > sample { smoothed - sample } else { sample - smoothed };
                self.var = (3 * self.var + deviation) / 4;
                self.smoothed = Some((7 * smoothed + sample) / 8);
            }
        }
    }
}

/// One candidate network path of a connection
#[derive(Debug, Clone)]
pub struct NetworkPath {
    pub id: PathId,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub state: PathState,
    /// Outstanding PATH_CHALLENGE, if validation is in progress
    pub challenge: Option<Challenge>,
    /// PATH_RESPONSE owed to the peer, held back by the amplification budget
    pub pending_response: Option<ChallengeToken>,
    /// Datagram bytes received on this path
    pub bytes_received: u64,
    /// Datagram bytes sent on this path
    pub bytes_sent: u64,
    pub rtt: RttEstimator,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub failed_at: Option<Instant>,
    /// Whether sends are capped by the anti-amplification budget
    pub amplification_limited: bool,
    pub challenges_sent: u32,
    pub challenges_lost: u32,
    /// Sequence number of our connection ID the peer used on this path
    pub local_cid_seq: Option<u64>,
    /// Sequence number of the peer connection ID we address this path with
    pub peer_cid_seq: Option<u64>,
}

impl NetworkPath {
    pub fn new(id: PathId, key: PathKey, initial_rtt: Duration, now: Instant) -> Self {
        Self {
            id,
            local: key.local,
            remote: key.remote,
            state: PathState::Unvalidated,
            challenge: None,
            pending_response: None,
            bytes_received: 0,
            bytes_sent: 0,
            rtt: RttEstimator::new(initial_rtt),
            created_at: now,
            last_activity: now,
            failed_at: None,
            amplification_limited: false,
            challenges_sent: 0,
            challenges_lost: 0,
            local_cid_seq: None,
            peer_cid_seq: None,
        }
    }

    pub fn key(&self) -> PathKey {
        PathKey::new(self.local, self.remote)
    }

    pub fn is_validated(&self) -> bool {
        self.state == PathState::Validated
    }

    /// Fraction of challenges on this path that went unanswered
    pub fn loss_estimate(&self) -> f64 {
        if self.challenges_sent == 0 {
            0.0
        } else {
            f64::from(self.challenges_lost.min(self.challenges_sent)) / f64::from(self.challenges_sent)
        }
    }
}

/// Connection ID changes made while switching the active path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CidRotation {
    /// Local sequence numbers retired (still resolvable during the grace window)
    pub retired_local: Vec<u64>,
    /// Fresh local IDs to advertise with NEW_CONNECTION_ID
    pub issued: Vec<IssuedConnectionId>,
    pub retire_prior_to: u64,
    /// Peer sequence numbers to retire with RETIRE_CONNECTION_ID
    pub retired_peer: Vec<u64>,
}

/// Per-connection table of candidate paths
#[derive(Debug)]
pub struct NetworkPathTable {
    paths: HashMap<PathId, NetworkPath>,
    index: HashMap<PathKey, PathId>,
    active: PathId,
    next_id: u64,
    initial_rtt: Duration,
    idle_timeout: Duration,
    failed_retention: Duration,
    max_paths: usize,
    /// Paths removed to make room, not yet reported to the connection
    evicted: Vec<NetworkPath>,
}

impl NetworkPathTable {
    /// Create the table around the handshake path, which is implicitly validated
    pub fn new(config: &MigrationConfig, handshake: PathKey, now: Instant) -> Self {
        let id = PathId(0);
        let mut path = NetworkPath::new(id, handshake, config.initial_rtt(), now);
        path.state = PathState::Validated;
        path.local_cid_seq = Some(0);
        path.peer_cid_seq = Some(0);

        Self {
            paths: HashMap::from([(id, path)]),
            index: HashMap::from([(handshake, id)]),
            active: id,
            next_id: 1,
            initial_rtt: config.initial_rtt(),
            idle_timeout: config.path_idle_timeout(),
            failed_retention: config.failed_path_retention(),
            max_paths: config.max_paths,
            evicted: Vec::new(),
        }
    }

    /// Account an inbound datagram on `key`, creating an `Unvalidated` path for a new tuple.
    ///
    /// Returns the path and whether it was created by this call. `keep` is
    /// never evicted to make room.
    pub fn observe(
        &mut self,
        key: PathKey,
        size: usize,
        now: Instant,
        keep: Option<PathId>,
    ) -> Result<(PathId, bool)> {
        let (id, created) = self.get_or_insert(key, now, keep)?;
        if let Some(path) = self.paths.get_mut(&id) {
            path.bytes_received += size as u64;
            path.last_activity = now;
        }
        Ok((id, created))
    }

    /// Find or create the path for `key` without accounting any traffic.
    ///
    /// A full table first drops stale paths, then the least recently active
    /// path that is neither active, `keep` nor `Failed`. Failed paths stay
    /// until their retention ends so their amplification budget survives.
    /// Removed paths are handed out by [`NetworkPathTable::take_evicted`].
    pub fn get_or_insert(
        &mut self,
        key: PathKey,
        now: Instant,
        keep: Option<PathId>,
    ) -> Result<(PathId, bool)> {
        if let Some(id) = self.index.get(&key) {
            return Ok((*id, false));
        }

        if self.paths.len() >= self.max_paths {
            let stale = self.evict_stale(now);
            self.evicted.extend(stale);
        }
        if self.paths.len() >= self.max_paths {
            let victim = self
                .paths
                .values()
                .filter(|path| {
                    path.id != self.active
                        && Some(path.id) != keep
                        && path.state != PathState::Failed
                })
                .min_by_key(|path| path.last_activity)
                .map(|path| path.id);
            match victim.and_then(|id| self.remove(id)) {
                Some(path) => {
                    debug!("Path table full, dropping least recently active {}", path.key());
                    self.evicted.push(path);
                }
                None => {
                    debug!("Path table full, ignoring new path {}", key);
                    return Err(MigrationError::PathLimit(self.max_paths));
                }
            }
        }

        let id = PathId(self.next_id);
        self.next_id += 1;
        self.paths.insert(id, NetworkPath::new(id, key, self.initial_rtt, now));
        self.index.insert(key, id);
        trace!("New {} for {}", id, key);
        Ok((id, true))
    }

    pub fn get(&self, id: PathId) -> Option<&NetworkPath> {
        self.paths.get(&id)
    }

    pub fn get_mut(&mut self, id: PathId) -> Option<&mut NetworkPath> {
        self.paths.get_mut(&id)
    }

    pub fn lookup(&self, key: &PathKey) -> Option<PathId> {
        self.index.get(key).copied()
    }

    pub fn active_id(&self) -> PathId {
        self.active
    }

    pub fn active(&self) -> &NetworkPath {
        // The active path is never removed from the table
        &self.paths[&self.active]
    }

    pub fn iter(&self) -> impl Iterator<Item = &NetworkPath> {
        self.paths.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut NetworkPath> {
        self.paths.values_mut()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Paths removed by [`NetworkPathTable::get_or_insert`] since the last call
    pub fn take_evicted(&mut self) -> Vec<NetworkPath> {
        std::mem::take(&mut self.evicted)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Make `id` the active path. The path must be `Validated`.
    ///
    /// Retires the local connection ID the peer used on the old path, issues
    /// replacements, and moves outgoing traffic to a peer connection ID that
    /// was never used on the old path.
    pub fn set_active(
        &mut self,
        id: PathId,
        cids: &mut ConnectionIdRegistry,
        now: Instant,
    ) -> Result<CidRotation> {
        let new_path = self.paths.get(&id).ok_or(MigrationError::UnknownPath(id))?;
        if new_path.state != PathState::Validated {
            return Err(MigrationError::PathNotValidated(id));
        }
        if id == self.active {
            return Ok(CidRotation::default());
        }
        let new_local_seq = new_path.local_cid_seq;
        let new_peer_seq = new_path.peer_cid_seq;

        let old_id = self.active;
        let (old_local_seq, old_peer_seq) = {
            let old = &self.paths[&old_id];
            (old.local_cid_seq, old.peer_cid_seq)
        };
        self.active = id;

        let mut rotation = CidRotation::default();

        if let Some(old_seq) = old_local_seq {
            if new_local_seq.is_none_or(|seq| seq >= old_seq) {
                rotation.retired_local = cids.retire_through(old_seq, now);
            }
        }
        if !rotation.retired_local.is_empty() {
            while let Ok(issued) = cids.issue() {
                rotation.issued.push(issued);
            }
        }
        rotation.retire_prior_to = cids.lowest_active_sequence();

        let peer_seq = match new_peer_seq {
            Some(seq) if Some(seq) != old_peer_seq => {
                cids.set_current_peer_cid(seq)?;
                if let Some(old_seq) = old_peer_seq {
                    if cids.retire_peer_cid(old_seq) {
                        rotation.retired_peer.push(old_seq);
                    }
                }
                Some(seq)
            }
            _ => match cids.rotate_peer_cid() {
                Ok((retired, next)) => {
                    rotation.retired_peer.extend(retired);
                    Some(next)
                }
                Err(_) => {
                    debug!("No spare peer connection ID, keeping the current one on {}", id);
                    old_peer_seq
                }
            },
        };
        if let Some(old) = self.paths.get_mut(&old_id) {
            old.peer_cid_seq = None;
        }
        if let Some(new) = self.paths.get_mut(&id) {
            new.peer_cid_seq = peer_seq;
        }

        debug!(
            "Active path {} -> {} (retired local {:?}, retired peer {:?})",
            old_id, id, rotation.retired_local, rotation.retired_peer
        );
        Ok(rotation)
    }

    fn eviction_time(&self, path: &NetworkPath) -> Instant {
        let idle = path.last_activity + self.idle_timeout;
        match path.failed_at {
            Some(failed_at) if path.state == PathState::Failed => {
                idle.min(failed_at.max(path.last_activity) + self.failed_retention)
            }
            _ => idle,
        }
    }

    /// Remove failed or idle non-active paths, returning them
    pub fn evict_stale(&mut self, now: Instant) -> Vec<NetworkPath> {
        let stale: Vec<PathId> = self
            .paths
            .values()
            .filter(|path| path.id != self.active && self.eviction_time(path) <= now)
            .map(|path| path.id)
            .collect();

        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Earliest time at which a non-active path becomes eligible for eviction
    pub fn next_eviction(&self) -> Option<Instant> {
        self.paths
            .values()
            .filter(|path| path.id != self.active)
            .map(|path| self.eviction_time(path))
            .min()
    }

    /// Remove a non-active path
    pub fn remove(&mut self, id: PathId) -> Option<NetworkPath> {
        if id == self.active {
            return None;
        }
        let path = self.paths.remove(&id)?;
        self.index.remove(&path.key());
        trace!("Evicted {} ({})", id, path.key());
        Some(path)
    }

    /// Earliest outstanding validation deadline
    pub fn next_challenge_deadline(&self) -> Option<Instant> {
        self.paths
            .values()
            .filter_map(|path| path.challenge.map(|challenge| challenge.deadline))
            .min()
    }
}
