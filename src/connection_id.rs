//! QUIC connection ID management and rotation
//!
//! Implements RFC 9000 connection ID management for a single connection:
//! - Issuing local connection IDs up to the peer's `active_connection_id_limit`,
//!   capped at [`LOCAL_CID_COUNT`]
//! - Resolving destination connection IDs, honouring a retirement grace window
//! - Tracking connection IDs issued by the peer for use on outgoing packets
//! - Rotation of the peer connection ID when the active path changes

use bytes::Bytes;
use hmac::{Hmac, Mac};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sha2::Sha256;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::MigrationConfig;
use crate::error::{MigrationError, Result};
use crate::quic::Frame;

/// Maximum length of a connection ID (RFC 9000)
pub const MAX_CONNECTION_ID_LENGTH: usize = 20;

/// Stateless reset token length (128 bits)
pub const STATELESS_RESET_TOKEN_LENGTH: usize = 16;

/// Most local connection IDs kept active at once, whatever limit the peer advertises
pub const LOCAL_CID_COUNT: u64 = 8;

/// Random draws per issued ID before the ID space counts as exhausted
const MAX_GENERATE_ATTEMPTS: usize = 16;

/// Expired IDs remembered to avoid handing them out again.
///
/// IDs older than this window are only protected by the collision
/// probability of random IDs, which is negligible at the default length.
const RECENTLY_ISSUED_WINDOW: usize = 64;

/// Opaque connection identifier, 0 to 20 bytes
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Bytes);

impl ConnectionId {
    pub fn from_bytes(bytes: Bytes) -> Result<Self> {
        if bytes.len() > MAX_CONNECTION_ID_LENGTH {
            return Err(MigrationError::ConnectionIdTooLong(bytes.len()));
        }
        Ok(Self(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(Bytes::copy_from_slice(bytes))
    }

    /// Generate a random connection ID of `length` bytes
    pub fn generate<R: RngCore>(rng: &mut R, length: usize) -> Result<Self> {
        if length > MAX_CONNECTION_ID_LENGTH {
            return Err(MigrationError::ConnectionIdTooLong(length));
        }
        let mut data = vec![0u8; length];
        rng.fill_bytes(&mut data);
        Ok(Self(Bytes::from(data)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self)
    }
}

/// Stateless reset token bound to a connection ID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatelessResetToken([u8; STATELESS_RESET_TOKEN_LENGTH]);

impl StatelessResetToken {
    pub fn new(data: [u8; STATELESS_RESET_TOKEN_LENGTH]) -> Self {
        Self(data)
    }

    /// Derive a stateless reset token from a connection ID and a static secret
    pub fn derive(secret: &[u8], connection_id: &ConnectionId) -> Result<Self> {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret)
            .map_err(|e| MigrationError::Config(format!("invalid reset secret: {}", e)))?;
        mac.update(connection_id.as_bytes());
        let digest = mac.finalize().into_bytes();

        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        token.copy_from_slice(&digest[..STATELESS_RESET_TOKEN_LENGTH]);
        Ok(Self(token))
    }

    pub fn as_bytes(&self) -> &[u8; STATELESS_RESET_TOKEN_LENGTH] {
        &self.0
    }
}

/// A local connection ID ready to be advertised in NEW_CONNECTION_ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedConnectionId {
    pub id: ConnectionId,
    pub sequence_number: u64,
    pub reset_token: StatelessResetToken,
}

impl IssuedConnectionId {
    pub fn to_frame(&self, retire_prior_to: u64) -> Frame {
        Frame::NewConnectionId {
            sequence_number: self.sequence_number,
            retire_prior_to,
            connection_id: self.id.clone(),
            stateless_reset_token: self.reset_token,
        }
    }
}

/// Result of resolving a destination connection ID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CidLookup {
    pub sequence_number: u64,
    /// Retired but still inside its grace window
    pub retired: bool,
}

/// What happened to a connection ID received from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerCidOutcome {
    Stored,
    Duplicate,
    /// Below a previously received `retire_prior_to`; must be retired right away
    RetireImmediately,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CidStatus {
    Active,
    Retired { expires_at: Instant },
}

#[derive(Debug)]
struct LocalCid {
    id: ConnectionId,
    reset_token: StatelessResetToken,
    status: CidStatus,
}

#[derive(Debug)]
struct PeerCid {
    id: ConnectionId,
    /// Unknown for the handshake connection ID until transport parameters arrive
    reset_token: Option<StatelessResetToken>,
    in_use: bool,
}

/// Per-connection registry of local and peer connection IDs
#[derive(Debug)]
pub struct ConnectionIdRegistry {
    /// Locally issued IDs that are active or inside their grace window
    local: BTreeMap<u64, LocalCid>,
    by_bytes: HashMap<ConnectionId, u64>,
    /// IDs that left the table recently, oldest first
    recently_issued: VecDeque<ConnectionId>,
    recently_issued_set: HashSet<ConnectionId>,
    next_sequence: u64,
    /// `active_connection_id_limit` advertised by the peer, capped at [`LOCAL_CID_COUNT`]
    peer_limit: u64,
    cid_length: usize,
    grace: Duration,
    reset_secret: [u8; 32],
    rng: StdRng,

    /// IDs issued by the peer, usable as destination connection IDs
    peer: BTreeMap<u64, PeerCid>,
    peer_current: Option<u64>,
    peer_retire_prior_to: u64,
    /// `active_connection_id_limit` we advertised to the peer
    local_limit: u64,
}

impl ConnectionIdRegistry {
    pub fn new(config: &MigrationConfig, peer_limit: u64) -> Self {
        let mut rng = StdRng::from_entropy();
        let mut reset_secret = [0u8; 32];
        rng.fill_bytes(&mut reset_secret);

        Self {
            local: BTreeMap::new(),
            by_bytes: HashMap::new(),
            recently_issued: VecDeque::new(),
            recently_issued_set: HashSet::new(),
            next_sequence: 0,
            peer_limit: peer_limit.min(LOCAL_CID_COUNT),
            cid_length: config.connection_id_length,
            grace: config.cid_retirement_grace(),
            reset_secret,
            rng,
            peer: BTreeMap::new(),
            peer_current: None,
            peer_retire_prior_to: 0,
            local_limit: config.active_connection_id_limit,
        }
    }

    /// Register the connection IDs agreed during the handshake (both sequence 0)
    pub fn with_initial(mut self, local: ConnectionId, peer: ConnectionId) -> Result<Self> {
        self.insert_local(local)?;
        self.peer.insert(0, PeerCid { id: peer, reset_token: None, in_use: true });
        self.peer_current = Some(0);
        Ok(self)
    }

    /// Issue a new local connection ID
    pub fn issue(&mut self) -> Result<IssuedConnectionId> {
        if self.active_count() as u64 >= self.peer_limit {
            return Err(MigrationError::CidLimitExceeded { limit: self.peer_limit });
        }

        for _ in 0..MAX_GENERATE_ATTEMPTS {
            let candidate = ConnectionId::generate(&mut self.rng, self.cid_length)?;
            if !self.is_known(&candidate) {
                return self.insert_local(candidate);
            }
        }
        debug!("No unused {}-byte connection ID after {} draws", self.cid_length, MAX_GENERATE_ATTEMPTS);
        Err(MigrationError::ConnectionIdSpaceExhausted(self.cid_length))
    }

    /// Whether `id` routes to this connection or left it recently
    fn is_known(&self, id: &ConnectionId) -> bool {
        self.by_bytes.contains_key(id) || self.recently_issued_set.contains(id)
    }

    fn remember_expired(&mut self, id: ConnectionId) {
        if self.recently_issued.len() == RECENTLY_ISSUED_WINDOW {
            if let Some(oldest) = self.recently_issued.pop_front() {
                self.recently_issued_set.remove(&oldest);
            }
        }
        self.recently_issued_set.insert(id.clone());
        self.recently_issued.push_back(id);
    }

    fn insert_local(&mut self, id: ConnectionId) -> Result<IssuedConnectionId> {
        if self.is_known(&id) {
            return Err(MigrationError::ProtocolViolation(format!(
                "connection ID {} already issued",
                id
            )));
        }
        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        let reset_token = StatelessResetToken::derive(&self.reset_secret, &id)?;
        self.by_bytes.insert(id.clone(), sequence_number);
        self.local.insert(
            sequence_number,
            LocalCid { id: id.clone(), reset_token, status: CidStatus::Active },
        );

        trace!("Issued connection ID {} (seq {})", id, sequence_number);
        Ok(IssuedConnectionId { id, sequence_number, reset_token })
    }

    /// Look up a destination connection ID of an incoming packet
    pub fn resolve(&self, cid: &ConnectionId, now: Instant) -> Option<CidLookup> {
        let sequence_number = *self.by_bytes.get(cid)?;
        let entry = self.local.get(&sequence_number)?;
        match entry.status {
            CidStatus::Active => Some(CidLookup { sequence_number, retired: false }),
            CidStatus::Retired { expires_at } if now < expires_at => {
                Some(CidLookup { sequence_number, retired: true })
            }
            CidStatus::Retired { .. } => None,
        }
    }

    /// Retire a local connection ID; it keeps resolving until the grace window ends
    pub fn retire(&mut self, sequence_number: u64, now: Instant) -> Result<()> {
        match self.local.get_mut(&sequence_number) {
            Some(entry) => {
                if entry.status == CidStatus::Active {
                    entry.status = CidStatus::Retired { expires_at: now + self.grace };
                    debug!("Retired connection ID {} (seq {})", entry.id, sequence_number);
                }
                Ok(())
            }
            // Already expired and collected
            None if sequence_number < self.next_sequence => Ok(()),
            None => Err(MigrationError::UnknownSequence(sequence_number)),
        }
    }

    /// Retire every active local ID with a sequence number up to and including `sequence_number`
    pub fn retire_through(&mut self, sequence_number: u64, now: Instant) -> Vec<u64> {
        let targets: Vec<u64> = self
            .local
            .range(..=sequence_number)
            .filter(|(_, entry)| entry.status == CidStatus::Active)
            .map(|(seq, _)| *seq)
            .collect();
        for seq in &targets {
            // Present in the map, cannot fail
            let _ = self.retire(*seq, now);
        }
        targets
    }

    /// Drop retired IDs whose grace window has elapsed, returning them
    pub fn expire_retired(&mut self, now: Instant) -> Vec<ConnectionId> {
        let expired: Vec<u64> = self
            .local
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.status, CidStatus::Retired { expires_at } if expires_at <= now)
            })
            .map(|(seq, _)| *seq)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for seq in expired {
            if let Some(entry) = self.local.remove(&seq) {
                self.by_bytes.remove(&entry.id);
                trace!("Connection ID {} (seq {}) left its grace window", entry.id, seq);
                self.remember_expired(entry.id.clone());
                removed.push(entry.id);
            }
        }
        removed
    }

    /// Earliest grace window expiry among retired IDs
    pub fn next_expiry(&self) -> Option<Instant> {
        self.local
            .values()
            .filter_map(|entry| match entry.status {
                CidStatus::Retired { expires_at } => Some(expires_at),
                CidStatus::Active => None,
            })
            .min()
    }

    /// Smallest active local sequence number, the `retire_prior_to` to advertise
    pub fn lowest_active_sequence(&self) -> u64 {
        self.local
            .iter()
            .find(|(_, entry)| entry.status == CidStatus::Active)
            .map(|(seq, _)| *seq)
            .unwrap_or(self.next_sequence)
    }

    pub fn active_count(&self) -> usize {
        self.local.values().filter(|entry| entry.status == CidStatus::Active).count()
    }

    /// Local IDs that currently route packets (active or inside the grace window)
    pub fn live_local_ids(&self) -> impl Iterator<Item = &ConnectionId> {
        self.local.values().map(|entry| &entry.id)
    }

    pub fn local_reset_token(&self, sequence_number: u64) -> Option<StatelessResetToken> {
        self.local.get(&sequence_number).map(|entry| entry.reset_token)
    }

    pub fn peer_limit(&self) -> u64 {
        self.peer_limit
    }

    pub fn set_peer_limit(&mut self, limit: u64) {
        self.peer_limit = limit.min(LOCAL_CID_COUNT);
    }

    /// Apply a NEW_CONNECTION_ID frame from the peer.
    ///
    /// `retire_prior_to` takes effect before the new ID is stored, so a peer
    /// at our limit can replace an ID with a single frame (RFC 9000 §5.1.1).
    /// Returns the sequence numbers owed a RETIRE_CONNECTION_ID.
    pub fn on_new_connection_id(
        &mut self,
        cid: ConnectionId,
        sequence_number: u64,
        retire_prior_to: u64,
        reset_token: StatelessResetToken,
    ) -> Result<Vec<u64>> {
        if retire_prior_to > sequence_number {
            return Err(MigrationError::ProtocolViolation(format!(
                "retire_prior_to {} exceeds sequence number {}",
                retire_prior_to, sequence_number
            )));
        }

        let mut retire = self.retire_peer_prior_to(retire_prior_to);
        if self.record_peer_cid(cid, sequence_number, reset_token)?
            == PeerCidOutcome::RetireImmediately
        {
            retire.push(sequence_number);
        }
        Ok(retire)
    }

    /// Store a connection ID issued by the peer (NEW_CONNECTION_ID or preferred address)
    pub fn record_peer_cid(
        &mut self,
        cid: ConnectionId,
        sequence_number: u64,
        reset_token: StatelessResetToken,
    ) -> Result<PeerCidOutcome> {
        if sequence_number < self.peer_retire_prior_to {
            return Ok(PeerCidOutcome::RetireImmediately);
        }

        if let Some(existing) = self.peer.get(&sequence_number) {
            if existing.id == cid && existing.reset_token == Some(reset_token) {
                return Ok(PeerCidOutcome::Duplicate);
            }
            return Err(MigrationError::ProtocolViolation(format!(
                "peer reused sequence number {} for a different connection ID",
                sequence_number
            )));
        }
        if self.peer.values().any(|entry| entry.id == cid) {
            return Err(MigrationError::ProtocolViolation(format!(
                "peer issued connection ID {} twice",
                cid
            )));
        }
        // Retired entries are already gone, only IDs the peer still considers active count
        if self.peer.len() as u64 >= self.local_limit {
            return Err(MigrationError::ProtocolViolation(format!(
                "peer exceeded active_connection_id_limit of {}",
                self.local_limit
            )));
        }

        trace!("Recorded peer connection ID {} (seq {})", cid, sequence_number);
        // The current ID may have been retired before a replacement arrived
        let in_use = self.peer_current.is_none();
        self.peer.insert(sequence_number, PeerCid { id: cid, reset_token: Some(reset_token), in_use });
        if in_use {
            debug!("Using peer connection ID seq {} as destination", sequence_number);
            self.peer_current = Some(sequence_number);
        }
        Ok(PeerCidOutcome::Stored)
    }

    /// Apply a `retire_prior_to` from the peer; returns the sequence numbers to retire
    pub fn retire_peer_prior_to(&mut self, retire_prior_to: u64) -> Vec<u64> {
        if retire_prior_to <= self.peer_retire_prior_to {
            return Vec::new();
        }
        self.peer_retire_prior_to = retire_prior_to;

        let retired: Vec<u64> = self.peer.range(..retire_prior_to).map(|(seq, _)| *seq).collect();
        for seq in &retired {
            self.peer.remove(seq);
        }

        if self.peer_current.is_some_and(|current| current < retire_prior_to) {
            self.peer_current = self.reserve_peer_cid().map(|(seq, _)| seq);
        }
        retired
    }

    /// Claim an unused peer connection ID, e.g. for a new path
    pub fn reserve_peer_cid(&mut self) -> Option<(u64, ConnectionId)> {
        let (seq, entry) = self.peer.iter_mut().find(|(_, entry)| !entry.in_use)?;
        entry.in_use = true;
        Some((*seq, entry.id.clone()))
    }

    /// Stop using a peer connection ID; returns whether a RETIRE_CONNECTION_ID is owed
    pub fn retire_peer_cid(&mut self, sequence_number: u64) -> bool {
        if self.peer.remove(&sequence_number).is_none() {
            return false;
        }
        if self.peer_current == Some(sequence_number) {
            self.peer_current = None;
        }
        true
    }

    /// Make `sequence_number` the destination connection ID for the active path
    pub fn set_current_peer_cid(&mut self, sequence_number: u64) -> Result<()> {
        let entry = self
            .peer
            .get_mut(&sequence_number)
            .ok_or(MigrationError::UnknownSequence(sequence_number))?;
        entry.in_use = true;
        self.peer_current = Some(sequence_number);
        Ok(())
    }

    /// Switch the active destination connection ID to an unused one.
    ///
    /// Returns `(retired, new)` sequence numbers.
    pub fn rotate_peer_cid(&mut self) -> Result<(Option<u64>, u64)> {
        let (next, _) = self.reserve_peer_cid().ok_or(MigrationError::NoPeerConnectionId)?;
        let mut retired = None;
        if let Some(previous) = self.peer_current {
            if self.retire_peer_cid(previous) {
                retired = Some(previous);
            }
        }
        self.peer_current = Some(next);
        Ok((retired, next))
    }

    pub fn active_peer_cid(&self) -> Option<&ConnectionId> {
        self.peer_current.and_then(|seq| self.peer.get(&seq)).map(|entry| &entry.id)
    }

    pub fn active_peer_sequence(&self) -> Option<u64> {
        self.peer_current
    }

    pub fn peer_cid(&self, sequence_number: u64) -> Option<&ConnectionId> {
        self.peer.get(&sequence_number).map(|entry| &entry.id)
    }

    pub fn peer_reset_token(&self, sequence_number: u64) -> Option<StatelessResetToken> {
        self.peer.get(&sequence_number).and_then(|entry| entry.reset_token)
    }

    /// Whether `token` matches a stateless reset token of a peer connection ID
    pub fn is_peer_reset_token(&self, token: &StatelessResetToken) -> bool {
        self.peer.values().any(|entry| entry.reset_token.as_ref() == Some(token))
    }

    pub fn unused_peer_cids(&self) -> usize {
        self.peer.values().filter(|entry| !entry.in_use).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry(peer_limit: u64) -> ConnectionIdRegistry {
        ConnectionIdRegistry::new(&MigrationConfig::default(), peer_limit)
    }

    fn cid(bytes: &[u8]) -> ConnectionId {
        ConnectionId::from_slice(bytes).unwrap()
    }

    #[test]
    fn test_connection_id_length_limit() {
        assert!(ConnectionId::from_slice(&[0u8; 20]).is_ok());
        assert!(matches!(
            ConnectionId::from_slice(&[0u8; 21]),
            Err(MigrationError::ConnectionIdTooLong(21))
        ));
        assert!(ConnectionId::from_slice(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_issue_sequence_numbers_increase() {
        let mut registry = registry(8);
        let first = registry.issue().unwrap();
        let second = registry.issue().unwrap();
        assert_eq!(first.sequence_number, 0);
        assert_eq!(second.sequence_number, 1);
        assert_ne!(first.id, second.id);
        assert_eq!(first.id.len(), 8);
    }

    #[test]
    fn test_issue_beyond_peer_limit_rejected() {
        let mut registry = registry(2);
        registry.issue().unwrap();
        registry.issue().unwrap();
        assert!(matches!(registry.issue(), Err(MigrationError::CidLimitExceeded { limit: 2 })));

        // retiring frees a slot, the new ID gets a fresh sequence number
        let now = Instant::now();
        registry.retire(0, now).unwrap();
        assert_eq!(registry.issue().unwrap().sequence_number, 2);
    }

    #[test]
    fn test_resolve_through_grace_window() {
        let mut registry = registry(8);
        let now = Instant::now();
        let issued: Vec<_> = (0..6).map(|_| registry.issue().unwrap()).collect();
        let seq5 = &issued[5];
        assert_eq!(seq5.sequence_number, 5);

        registry.retire(5, now).unwrap();
        let lookup = registry.resolve(&seq5.id, now + Duration::from_millis(10)).unwrap();
        assert_eq!(lookup, CidLookup { sequence_number: 5, retired: true });

        let after = now + registry.grace;
        assert!(registry.resolve(&seq5.id, after).is_none());
        assert_eq!(registry.expire_retired(after), vec![seq5.id.clone()]);

        // a retired sequence number is never reassigned
        assert_eq!(registry.issue().unwrap().sequence_number, 6);
    }

    #[test]
    fn test_retire_unknown_sequence() {
        let mut registry = registry(4);
        registry.issue().unwrap();
        assert!(matches!(
            registry.retire(3, Instant::now()),
            Err(MigrationError::UnknownSequence(3))
        ));
    }

    #[test]
    fn test_retire_is_idempotent() {
        let mut registry = registry(4);
        let now = Instant::now();
        registry.issue().unwrap();
        registry.retire(0, now).unwrap();
        // second retire must not extend the grace window
        registry.retire(0, now + Duration::from_secs(1)).unwrap();
        assert_eq!(registry.next_expiry(), Some(now + registry.grace));
    }

    #[test]
    fn test_retire_through_and_lowest_active() {
        let mut registry = registry(8);
        let now = Instant::now();
        for _ in 0..4 {
            registry.issue().unwrap();
        }
        assert_eq!(registry.retire_through(2, now), vec![0, 1, 2]);
        assert_eq!(registry.lowest_active_sequence(), 3);
        assert_eq!(registry.active_count(), 1);
    }

    #[test]
    fn test_initial_ids() {
        let registry = registry(4).with_initial(cid(&[1; 8]), cid(&[2; 8])).unwrap();
        let lookup = registry.resolve(&cid(&[1; 8]), Instant::now()).unwrap();
        assert_eq!(lookup.sequence_number, 0);
        assert_eq!(registry.active_peer_cid(), Some(&cid(&[2; 8])));
    }

    #[test]
    fn test_record_peer_cids() {
        let mut registry = registry(4).with_initial(cid(&[1; 8]), cid(&[2; 8])).unwrap();
        let token = StatelessResetToken::new([7; 16]);

        assert_eq!(registry.record_peer_cid(cid(&[3; 8]), 1, token).unwrap(), PeerCidOutcome::Stored);
        assert_eq!(
            registry.record_peer_cid(cid(&[3; 8]), 1, token).unwrap(),
            PeerCidOutcome::Duplicate
        );
        assert!(registry.record_peer_cid(cid(&[4; 8]), 1, token).is_err());
        assert!(registry.record_peer_cid(cid(&[3; 8]), 2, token).is_err());
        assert!(registry.is_peer_reset_token(&token));
    }

    #[test]
    fn test_peer_cid_limit() {
        let config = MigrationConfig { active_connection_id_limit: 2, ..Default::default() };
        let mut registry =
            ConnectionIdRegistry::new(&config, 2).with_initial(cid(&[1; 4]), cid(&[2; 4])).unwrap();
        let token = StatelessResetToken::new([0; 16]);
        registry.record_peer_cid(cid(&[3; 4]), 1, token).unwrap();
        assert!(matches!(
            registry.record_peer_cid(cid(&[4; 4]), 2, StatelessResetToken::new([1; 16])),
            Err(MigrationError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_rotate_peer_cid() {
        let mut registry = registry(4).with_initial(cid(&[1; 8]), cid(&[2; 8])).unwrap();
        assert!(matches!(registry.rotate_peer_cid(), Err(MigrationError::NoPeerConnectionId)));

        registry.record_peer_cid(cid(&[3; 8]), 1, StatelessResetToken::new([1; 16])).unwrap();
        let (retired, next) = registry.rotate_peer_cid().unwrap();
        assert_eq!(retired, Some(0));
        assert_eq!(next, 1);
        assert_eq!(registry.active_peer_cid(), Some(&cid(&[3; 8])));
        assert!(registry.peer_cid(0).is_none());
    }

    #[test]
    fn test_retire_peer_prior_to() {
        let mut registry = registry(4).with_initial(cid(&[1; 8]), cid(&[2; 8])).unwrap();
        registry.record_peer_cid(cid(&[3; 8]), 1, StatelessResetToken::new([1; 16])).unwrap();
        registry.record_peer_cid(cid(&[4; 8]), 2, StatelessResetToken::new([2; 16])).unwrap();

        assert_eq!(registry.retire_peer_prior_to(2), vec![0, 1]);
        assert_eq!(registry.active_peer_sequence(), Some(2));
        assert!(registry.retire_peer_prior_to(1).is_empty());

        // late arrival of an already retired sequence number
        assert_eq!(
            registry.record_peer_cid(cid(&[5; 8]), 1, StatelessResetToken::new([3; 16])).unwrap(),
            PeerCidOutcome::RetireImmediately
        );
    }

    #[test]
    fn test_new_connection_id_at_limit_retires_first() {
        let mut registry = registry(4).with_initial(cid(&[1; 8]), cid(&[0x10; 8])).unwrap();
        for seq in 1..=3u8 {
            registry
                .on_new_connection_id(cid(&[0x10 + seq; 8]), seq as u64, 0, StatelessResetToken::new([seq; 16]))
                .unwrap();
        }

        // peer rotates away from seq 0 while we hold our limit of 4
        let retire = registry
            .on_new_connection_id(cid(&[0x14; 8]), 4, 1, StatelessResetToken::new([4; 16]))
            .unwrap();
        assert_eq!(retire, vec![0]);
        assert!(registry.peer_cid(0).is_none());
        assert_eq!(registry.peer_cid(4), Some(&cid(&[0x14; 8])));
        assert_eq!(registry.active_peer_sequence(), Some(1));

        // a fifth ID without retirement still exceeds the limit
        assert!(matches!(
            registry.on_new_connection_id(cid(&[0x15; 8]), 5, 1, StatelessResetToken::new([5; 16])),
            Err(MigrationError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_new_connection_id_replaces_retired_current() {
        let mut registry = registry(4).with_initial(cid(&[1; 8]), cid(&[0x10; 8])).unwrap();
        let retire = registry
            .on_new_connection_id(cid(&[0x11; 8]), 1, 1, StatelessResetToken::new([1; 16]))
            .unwrap();
        assert_eq!(retire, vec![0]);
        assert_eq!(registry.active_peer_cid(), Some(&cid(&[0x11; 8])));
        assert!(matches!(
            registry.on_new_connection_id(cid(&[0x12; 8]), 2, 3, StatelessResetToken::new([2; 16])),
            Err(MigrationError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_huge_peer_limit_is_capped() {
        let mut registry = registry((1 << 62) - 1);
        assert_eq!(registry.peer_limit(), LOCAL_CID_COUNT);
        let mut issued = 0;
        while registry.issue().is_ok() {
            issued += 1;
        }
        assert_eq!(issued, LOCAL_CID_COUNT);
    }

    #[test]
    fn test_exhausted_id_space_is_an_error() {
        let config = MigrationConfig { connection_id_length: 0, ..Default::default() };
        let mut registry = ConnectionIdRegistry::new(&config, 300);
        registry.issue().unwrap();
        assert!(matches!(registry.issue(), Err(MigrationError::ConnectionIdSpaceExhausted(0))));
    }

    #[test]
    fn test_expired_ids_remembered_in_bounded_window() {
        let mut registry = registry(2);
        let now = Instant::now();
        let first = registry.issue().unwrap();

        for round in 0..(RECENTLY_ISSUED_WINDOW as u64 + 10) {
            registry.retire(round, now).unwrap();
            registry.issue().unwrap();
            registry.expire_retired(now + registry.grace);
        }

        assert_eq!(registry.recently_issued.len(), RECENTLY_ISSUED_WINDOW);
        assert_eq!(registry.recently_issued_set.len(), RECENTLY_ISSUED_WINDOW);
        // the oldest IDs fell out of the window
        assert!(!registry.is_known(&first.id));
        let newest_expired = registry.recently_issued.back().unwrap().clone();
        assert!(registry.is_known(&newest_expired));
    }

    #[test]
    fn test_reset_token_derivation_is_stable() {
        let id = cid(&[0xab; 8]);
        let secret = b"test_secret_key_for_reset_tokens";
        let a = StatelessResetToken::derive(secret, &id).unwrap();
        let b = StatelessResetToken::derive(secret, &id).unwrap();
        assert_eq!(a, b);
        let other = StatelessResetToken::derive(secret, &cid(&[0xac; 8])).unwrap();
        assert_ne!(a, other);
    }
}
