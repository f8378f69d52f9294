//! Per-connection migration core
//!
//! [`Connection`] owns the path table, connection ID registry, validator and
//! migration controller of one QUIC connection. It performs no I/O: callers
//! feed it decoded packets and the current time, then drain the frames it
//! wants sent. Every mutation goes through `&mut self`, so whoever owns the
//! value is the single sequencer for the connection.

use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

use crate::amplification::AntiAmplificationGuard;
use crate::config::MigrationConfig;
use crate::connection_id::{
    ConnectionId, ConnectionIdRegistry, IssuedConnectionId, StatelessResetToken,
};
use crate::error::{MigrationError, Result};
use crate::events::{ConnectionEvent, MigrationHistory, MigrationTrigger};
use crate::migration::{MigrationController, MigrationDirective, MigrationState};
use crate::path::{NetworkPath, NetworkPathTable, PathId, PathKey, PathState};
use crate::quic::{Frame, PreferredAddress, TransportParameters};
use crate::validator::{ChallengeToken, PathValidator, TimeoutOutcome, ValidationOutcome};

/// Transport error code for CONNECTION_CLOSE (RFC 9000 §20.1)
pub const PROTOCOL_VIOLATION: u64 = 0x0a;

/// Sequence number of the connection ID carried in the preferred_address parameter
const PREFERRED_ADDRESS_CID_SEQUENCE: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

/// Outbound packetizer the connection hands its frames to
pub trait FrameSink {
    fn send_frame(&mut self, path: PathKey, frame: Frame);

    /// Frames of one datagram, in order
    fn send_datagram(&mut self, transmit: Transmit) {
        for frame in transmit.frames {
            self.send_frame(transmit.path, frame);
        }
    }
}

impl FrameSink for Vec<(PathKey, Frame)> {
    fn send_frame(&mut self, path: PathKey, frame: Frame) {
        self.push((path, frame));
    }
}

/// Frames to be sent together in one datagram on one path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transmit {
    pub path: PathKey,
    pub destination_cid: Option<ConnectionId>,
    pub frames: Vec<Frame>,
    /// Bytes charged against the path
    pub size: usize,
}

impl Transmit {
    fn new(path: PathKey, destination_cid: Option<ConnectionId>, frames: Vec<Frame>) -> Self {
        let size = frames.iter().map(Frame::encoded_len).sum();
        Self { path, destination_cid, frames, size }
    }
}

/// A decoded inbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingPacket {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub destination_cid: ConnectionId,
    pub packet_number: u64,
    pub frames: Vec<Frame>,
    /// Datagram size credited to the path's amplification budget
    pub size: usize,
}

impl IncomingPacket {
    pub fn new(
        local: SocketAddr,
        remote: SocketAddr,
        destination_cid: ConnectionId,
        packet_number: u64,
        frames: Vec<Frame>,
    ) -> Self {
        let size = frames.iter().map(Frame::encoded_len).sum();
        Self { local, remote, destination_cid, packet_number, frames, size }
    }

    /// Decode the frames of a decrypted packet payload
    pub fn decode(
        local: SocketAddr,
        remote: SocketAddr,
        destination_cid: ConnectionId,
        packet_number: u64,
        payload: Bytes,
    ) -> Result<Self> {
        let size = payload.len();
        let frames = Frame::decode_all(payload)?;
        Ok(Self { local, remote, destination_cid, packet_number, frames, size })
    }

    /// Override the accounted size, e.g. with the full datagram length
    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// A packet is probing when it carries only probing frames
    pub fn is_probing(&self) -> bool {
        self.frames.iter().all(Frame::is_probing)
    }

    pub fn path_key(&self) -> PathKey {
        PathKey::new(self.local, self.remote)
    }
}

/// What became of an inbound packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDisposition {
    Accepted { path: PathId },
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    UnknownConnectionId,
    Closed,
    PathLimit,
}

/// Migration state of a single QUIC connection
#[derive(Debug)]
pub struct Connection {
    side: Side,
    config: MigrationConfig,
    cids: ConnectionIdRegistry,
    paths: NetworkPathTable,
    validator: PathValidator,
    guard: AntiAmplificationGuard,
    controller: MigrationController,
    history: MigrationHistory,
    events: VecDeque<ConnectionEvent>,
    transmits: VecDeque<Transmit>,
    peer_params: TransportParameters,
    /// Server: local connection ID advertised with the preferred address
    preferred_cid: Option<IssuedConnectionId>,
    expired_cids: Vec<ConnectionId>,
    largest_packet_number: Option<u64>,
    established_at: Instant,
    last_activity: Instant,
    closed: bool,
}

impl Connection {
    /// Create the migration state of a connection whose handshake just completed
    /// on `local <-> remote`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        side: Side,
        config: MigrationConfig,
        local: SocketAddr,
        remote: SocketAddr,
        local_cid: ConnectionId,
        peer_cid: ConnectionId,
        peer_params: TransportParameters,
        now: Instant,
    ) -> Result<Self> {
        config.validate()?;
        let handshake = PathKey::new(local, remote);
        let cids = ConnectionIdRegistry::new(&config, peer_params.active_connection_id_limit)
            .with_initial(local_cid, peer_cid)?;

        let mut connection = Self {
            side,
            cids,
            paths: NetworkPathTable::new(&config, handshake, now),
            validator: PathValidator::new(&config),
            guard: AntiAmplificationGuard::new(&config),
            controller: MigrationController::new(&config),
            history: MigrationHistory::new(config.history_capacity),
            events: VecDeque::new(),
            transmits: VecDeque::new(),
            peer_params,
            preferred_cid: None,
            expired_cids: Vec::new(),
            largest_packet_number: None,
            established_at: now,
            last_activity: now,
            closed: false,
            config,
        };

        if side == Side::Server && connection.config.preferred_address.is_some() {
            connection.preferred_cid = Some(connection.cids.issue()?);
        }
        connection.issue_replacements();

        info!("Connection established on {} ({:?})", handshake, side);
        connection.events.push_back(ConnectionEvent::HandshakeCompleted { path: handshake });
        Ok(connection)
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Address pair outgoing application data should use
    pub fn active_path(&self) -> PathKey {
        self.paths.active().key()
    }

    pub fn active_path_id(&self) -> PathId {
        self.paths.active_id()
    }

    pub fn path(&self, id: PathId) -> Option<&NetworkPath> {
        self.paths.get(id)
    }

    pub fn paths(&self) -> &NetworkPathTable {
        &self.paths
    }

    pub fn connection_ids(&self) -> &ConnectionIdRegistry {
        &self.cids
    }

    pub fn migration_state(&self) -> MigrationState {
        self.controller.state()
    }

    pub fn history(&self) -> &MigrationHistory {
        &self.history
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Local connection IDs that currently route to this connection
    pub fn local_connection_ids(&self) -> Vec<ConnectionId> {
        self.cids.live_local_ids().cloned().collect()
    }

    /// Local connection IDs whose grace window ended since the last call
    pub fn drain_expired_cids(&mut self) -> Vec<ConnectionId> {
        std::mem::take(&mut self.expired_cids)
    }

    /// Transport parameters this endpoint advertises
    pub fn local_transport_parameters(&self) -> TransportParameters {
        let preferred_address = match (self.side, self.config.preferred_address, &self.preferred_cid)
        {
            (Side::Server, Some(address), Some(issued)) => {
                Some(PreferredAddress::new(address, issued.id.clone(), issued.reset_token))
            }
            _ => None,
        };
        TransportParameters {
            active_connection_id_limit: self.config.active_connection_id_limit,
            disable_active_migration: !self.config.migration_enabled,
            preferred_address,
        }
    }

    /// Entry point for every decoded packet
    pub fn on_packet_received(
        &mut self,
        packet: IncomingPacket,
        now: Instant,
    ) -> Result<PacketDisposition> {
        if self.closed {
            trace!("Dropping packet from {} on closed connection", packet.remote);
            return Ok(PacketDisposition::Dropped(DropReason::Closed));
        }
        let Some(lookup) = self.cids.resolve(&packet.destination_cid, now) else {
            trace!("Dropping packet for unknown connection ID {}", packet.destination_cid);
            return Ok(PacketDisposition::Dropped(DropReason::UnknownConnectionId));
        };

        let key = packet.path_key();
        let observed = self.paths.observe(key, packet.size, now, self.controller.candidate());
        self.report_evicted();
        let (id, created) = match observed {
            Ok(observed) => observed,
            Err(MigrationError::PathLimit(limit)) => {
                debug!("Dropping packet from {}: {} paths tracked", key, limit);
                return Ok(PacketDisposition::Dropped(DropReason::PathLimit));
            }
            Err(e) => return Err(e),
        };
        self.last_activity = now;

        let newest = self
            .largest_packet_number
            .is_none_or(|largest| packet.packet_number > largest);
        if newest {
            self.largest_packet_number = Some(packet.packet_number);
        }
        let probing = packet.is_probing();

        if let Some(path) = self.paths.get_mut(id) {
            if path.local_cid_seq.is_none_or(|seq| lookup.sequence_number > seq) {
                path.local_cid_seq = Some(lookup.sequence_number);
            }
        }

        // Only clients change address (RFC 9000 §9); a client keeps its path
        // choice when server packets show up on another tuple.
        if created {
            self.on_peer_path_created(id, now);
        } else if self.side == Side::Server && id != self.paths.active_id() && !probing && newest {
            self.on_peer_moved(id, now);
        }

        for frame in packet.frames {
            if self.closed {
                break;
            }
            if let Err(error) = self.process_frame(id, lookup.sequence_number, frame, now) {
                if error.is_fatal() {
                    warn!("Closing connection: {}", error);
                    self.close_with(PROTOCOL_VIOLATION, Some(0), &error.to_string());
                    return Err(error);
                }
                debug!("Ignoring frame on {}: {}", key, error);
            }
        }

        self.flush_path(id, now);
        Ok(PacketDisposition::Accepted { path: id })
    }

    /// Actively move to `local -> remote`, e.g. after an interface switch
    pub fn probe_path(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<PathId> {
        if self.peer_params.disable_active_migration {
            return Err(MigrationError::MigrationDisabled);
        }
        self.begin_local_migration(PathKey::new(local, remote), MigrationTrigger::LocalProbe, now)
    }

    /// Client: migrate to the server's preferred address, if it advertised one
    pub fn on_preferred_address(
        &mut self,
        local: SocketAddr,
        now: Instant,
    ) -> Result<Option<PathId>> {
        if self.side != Side::Client {
            return Ok(None);
        }
        let Some(preferred) = self.peer_params.preferred_address.clone() else {
            return Ok(None);
        };
        let Some(address) = preferred.address_for(&self.active_path().remote) else {
            return Ok(None);
        };

        let outcome = self.cids.record_peer_cid(
            preferred.connection_id,
            PREFERRED_ADDRESS_CID_SEQUENCE,
            preferred.stateless_reset_token,
        )?;
        trace!("Preferred address connection ID: {:?}", outcome);

        info!("Migrating to server preferred address {}", address);
        self.begin_local_migration(PathKey::new(local, address), MigrationTrigger::PreferredAddress, now)
            .map(Some)
    }

    /// Switch the active path to an unused peer connection ID, retiring the current one
    pub fn rotate_destination_cid(&mut self) -> Result<ConnectionId> {
        if self.closed {
            return Err(MigrationError::ConnectionClosed);
        }
        let (retired, next) = self.cids.rotate_peer_cid()?;
        let active = self.paths.active_id();
        if let Some(path) = self.paths.get_mut(active) {
            path.peer_cid_seq = Some(next);
        }
        if let Some(sequence_number) = retired {
            self.queue_on_active(vec![Frame::RetireConnectionId { sequence_number }]);
        }
        debug!("Rotated destination connection ID to seq {}", next);
        self.cids.active_peer_cid().cloned().ok_or(MigrationError::NoPeerConnectionId)
    }

    /// Whether `bytes` may be sent on `path` right now
    pub fn can_send(&self, path: PathId, bytes: u64) -> bool {
        !self.closed && self.paths.get(path).is_some_and(|path| self.guard.can_send(path, bytes))
    }

    /// Account bytes sent on `path` by a collaborator
    pub fn record_sent(&mut self, path: PathId, bytes: u64) -> Result<()> {
        let path = self.paths.get_mut(path).ok_or(MigrationError::UnknownPath(path))?;
        self.guard.try_send(path, bytes)
    }

    /// Queue application frames on the active path
    pub fn send_on_active(&mut self, frames: Vec<Frame>) -> Result<()> {
        if self.closed {
            return Err(MigrationError::ConnectionClosed);
        }
        self.queue_on_path(self.paths.active_id(), frames)
    }

    /// Earliest instant at which [`Connection::handle_timeout`] has work to do
    pub fn poll_timeout(&self) -> Option<Instant> {
        if self.closed {
            return None;
        }
        let idle = self.config.max_idle_timeout().map(|idle| self.last_activity + idle);
        [
            idle,
            self.paths.next_challenge_deadline(),
            self.cids.next_expiry(),
            self.controller.poll_timeout(),
            self.paths.next_eviction(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Run validation retries, CID expiry, migration settling and path eviction
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        if let Some(idle) = self.config.max_idle_timeout() {
            if now >= self.last_activity + idle {
                info!("Connection idle for {:?}, closing", idle);
                self.terminate();
                return;
            }
        }

        let due: Vec<PathId> = self
            .paths
            .iter()
            .filter(|path| path.challenge.is_some_and(|challenge| challenge.deadline <= now))
            .map(|path| path.id)
            .collect();
        for id in due {
            let Some(path) = self.paths.get_mut(id) else {
                continue;
            };
            if let TimeoutOutcome::Exhausted { attempts } = self.validator.on_timeout(path, now) {
                let key = path.key();
                debug!("{}", MigrationError::ValidationExhausted { path: id, attempts });
                self.events.push_back(ConnectionEvent::ValidationFailed { path: key, attempts });
                self.controller.on_validation_failed(id);
            }
        }
        self.flush_pending(now);

        let expired = self.cids.expire_retired(now);
        self.expired_cids.extend(expired);

        if let Some((path, trigger)) = self.controller.handle_timeout(now) {
            self.replay_trigger(path, trigger, now);
        }

        for path in self.paths.evict_stale(now) {
            self.on_path_evicted(path);
        }
    }

    pub fn poll_event(&mut self) -> Option<ConnectionEvent> {
        self.events.pop_front()
    }

    pub fn poll_transmit(&mut self) -> Option<Transmit> {
        self.transmits.pop_front()
    }

    /// Hand every queued datagram to `sink`, returning how many were sent
    pub fn drain_transmits<S: FrameSink + ?Sized>(&mut self, sink: &mut S) -> usize {
        let mut sent = 0;
        while let Some(transmit) = self.transmits.pop_front() {
            sink.send_datagram(transmit);
            sent += 1;
        }
        sent
    }

    /// Close the connection with an application error code
    pub fn close(&mut self, error_code: u64, reason: &str) {
        self.close_with(error_code, None, reason);
    }

    fn close_with(&mut self, error_code: u64, frame_type: Option<u64>, reason: &str) {
        if self.closed {
            return;
        }
        self.queue_on_active(vec![Frame::ConnectionClose {
            error_code,
            frame_type,
            reason: Bytes::copy_from_slice(reason.as_bytes()),
        }]);
        self.terminate();
    }

    /// Stop all migration activity; outstanding tokens and timers are discarded
    fn terminate(&mut self) {
        self.closed = true;
        self.controller.close();
        for path in self.paths.iter_mut() {
            self.validator.cancel(path);
            path.pending_response = None;
        }
        debug!("Connection closed on {}", self.paths.active().key());
    }

    fn on_peer_path_created(&mut self, id: PathId, now: Instant) {
        if let Some(path) = self.paths.get_mut(id) {
            self.guard.engage(path);
            if self.side == Side::Client {
                debug!("Server packet on untracked path {}", path.key());
                return;
            }
            if path.peer_cid_seq.is_none() {
                path.peer_cid_seq = self.cids.reserve_peer_cid().map(|(seq, _)| seq);
            }
            info!("Peer address change detected: {}", path.key());
        }
        let directive = self.controller.on_new_path(id, MigrationTrigger::PeerAddressChange);
        self.apply(directive, now);
    }

    /// Highest-numbered non-probing packet arrived on a known non-active path
    fn on_peer_moved(&mut self, id: PathId, now: Instant) {
        self.replay_trigger(id, MigrationTrigger::PeerAddressChange, now);
    }

    fn replay_trigger(&mut self, id: PathId, trigger: MigrationTrigger, now: Instant) {
        let Some(path) = self.paths.get(id) else {
            return;
        };
        if id == self.paths.active_id() {
            return;
        }
        let directive = if path.state == PathState::Validated {
            self.controller.on_validated_trigger(id, trigger)
        } else {
            self.controller.on_new_path(id, trigger)
        };
        self.apply(directive, now);
        self.flush_path(id, now);
    }

    fn begin_local_migration(
        &mut self,
        key: PathKey,
        trigger: MigrationTrigger,
        now: Instant,
    ) -> Result<PathId> {
        if self.closed {
            return Err(MigrationError::ConnectionClosed);
        }
        let has_cid = self
            .paths
            .lookup(&key)
            .and_then(|id| self.paths.get(id))
            .is_some_and(|path| path.peer_cid_seq.is_some());
        if !has_cid && self.cids.unused_peer_cids() == 0 {
            return Err(MigrationError::NoPeerConnectionId);
        }

        let inserted = self.paths.get_or_insert(key, now, self.controller.candidate());
        self.report_evicted();
        let (id, _) = inserted?;
        if id == self.paths.active_id() {
            return Ok(id);
        }
        let validated = match self.paths.get_mut(id) {
            Some(path) => {
                if path.peer_cid_seq.is_none() {
                    path.peer_cid_seq = self.cids.reserve_peer_cid().map(|(seq, _)| seq);
                }
                path.last_activity = now;
                path.state == PathState::Validated
            }
            None => return Err(MigrationError::UnknownPath(id)),
        };

        let directive = self.controller.begin_active_migration(id, trigger, validated)?;
        debug!("Probing {} ({})", key, trigger);
        self.apply(directive, now);
        self.flush_path(id, now);
        Ok(id)
    }

    fn apply(&mut self, directive: MigrationDirective, now: Instant) {
        match directive {
            MigrationDirective::None => {}
            MigrationDirective::Validate(id) => self.start_validation(id, now),
            MigrationDirective::Promote { path, trigger } => self.migrate_to(path, trigger, now),
        }
    }

    fn start_validation(&mut self, id: PathId, now: Instant) {
        let Some(path) = self.paths.get_mut(id) else {
            return;
        };
        match path.state {
            PathState::Validating | PathState::Validated => {}
            PathState::Unvalidated | PathState::Failed => {
                self.validator.begin_validation(path, now);
            }
        }
    }

    fn migrate_to(&mut self, id: PathId, trigger: MigrationTrigger, now: Instant) {
        let from = self.paths.active_id();
        let from_key = self.paths.active().key();
        let rotation = match self.paths.set_active(id, &mut self.cids, now) {
            Ok(rotation) => rotation,
            Err(error) => {
                warn!("Cannot migrate to {}: {}", id, error);
                return;
            }
        };
        let to_key = self.paths.active().key();

        let mut frames: Vec<Frame> = rotation
            .issued
            .iter()
            .map(|issued| issued.to_frame(rotation.retire_prior_to))
            .collect();
        frames.extend(
            rotation
                .retired_peer
                .iter()
                .map(|&sequence_number| Frame::RetireConnectionId { sequence_number }),
        );
        if !frames.is_empty() {
            self.queue_on_active(frames);
        }

        self.controller.on_migrated(from, id, now);
        let migration = self.history.record(
            from_key,
            to_key,
            trigger,
            now.saturating_duration_since(self.established_at),
        );
        info!("Migration #{} complete: {} -> {} ({})", migration, from_key, to_key, trigger);
        self.events.push_back(ConnectionEvent::MigrationCompleted {
            from: from_key,
            to: to_key,
            trigger,
            migration,
        });
    }

    fn process_frame(
        &mut self,
        id: PathId,
        dcid_sequence: u64,
        frame: Frame,
        now: Instant,
    ) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}
            Frame::PathChallenge { token } => {
                if let Some(path) = self.paths.get_mut(id) {
                    path.pending_response = Some(token);
                }
            }
            Frame::PathResponse { token } => self.on_path_response(id, token, now),
            Frame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => self.on_new_connection_id(
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            )?,
            Frame::RetireConnectionId { sequence_number } => {
                self.on_retire_connection_id(sequence_number, dcid_sequence, now)?
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let path = self.paths.get(id).map(NetworkPath::key).unwrap_or(self.active_path());
                self.events.push_back(ConnectionEvent::StreamDataReceived {
                    path,
                    stream_id,
                    offset,
                    data,
                    fin,
                });
            }
            Frame::ConnectionClose { error_code, reason, .. } => {
                info!(
                    "Peer closed connection (error {:#x}): {}",
                    error_code,
                    String::from_utf8_lossy(&reason)
                );
                self.terminate();
            }
        }
        Ok(())
    }

    fn on_path_response(&mut self, id: PathId, token: ChallengeToken, now: Instant) {
        let Some(path) = self.paths.get_mut(id) else {
            return;
        };
        match self.validator.on_response(path, token, now) {
            ValidationOutcome::Matched { rtt } => {
                let key = path.key();
                self.events.push_back(ConnectionEvent::PathValidated { path: key, rtt });
                let directive = self.controller.on_path_validated(id);
                self.apply(directive, now);
            }
            ValidationOutcome::Mismatched | ValidationOutcome::Unknown => {
                trace!("{}", MigrationError::StaleOrMismatchedToken(id));
            }
        }
    }

    fn on_new_connection_id(
        &mut self,
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        reset_token: StatelessResetToken,
    ) -> Result<()> {
        let retire = self.cids.on_new_connection_id(
            connection_id,
            sequence_number,
            retire_prior_to,
            reset_token,
        )?;
        for path in self.paths.iter_mut() {
            if path.peer_cid_seq.is_some_and(|seq| retire.contains(&seq)) {
                path.peer_cid_seq = None;
            }
        }
        let current = self.cids.active_peer_sequence();
        let active = self.paths.active_id();
        if let Some(path) = self.paths.get_mut(active) {
            if path.peer_cid_seq.is_none() {
                path.peer_cid_seq = current;
            }
        }

        if !retire.is_empty() {
            debug!("Retiring peer connection IDs {:?}", retire);
            self.queue_on_active(
                retire
                    .into_iter()
                    .map(|sequence_number| Frame::RetireConnectionId { sequence_number })
                    .collect(),
            );
        }
        Ok(())
    }

    fn on_retire_connection_id(
        &mut self,
        sequence_number: u64,
        dcid_sequence: u64,
        now: Instant,
    ) -> Result<()> {
        if sequence_number == dcid_sequence {
            return Err(MigrationError::ProtocolViolation(format!(
                "connection ID {} retired in a packet addressed to it",
                sequence_number
            )));
        }
        match self.cids.retire(sequence_number, now) {
            Ok(()) => {}
            Err(MigrationError::UnknownSequence(seq)) => {
                return Err(MigrationError::ProtocolViolation(format!(
                    "peer retired connection ID {} that was never issued",
                    seq
                )));
            }
            Err(e) => return Err(e),
        }
        self.issue_replacements();
        Ok(())
    }

    /// Issue local connection IDs up to the peer's limit and advertise them
    fn issue_replacements(&mut self) {
        let mut issued = Vec::new();
        while let Ok(cid) = self.cids.issue() {
            issued.push(cid);
        }
        if issued.is_empty() {
            return;
        }
        let retire_prior_to = self.cids.lowest_active_sequence();
        self.queue_on_active(issued.iter().map(|cid| cid.to_frame(retire_prior_to)).collect());
    }

    fn report_evicted(&mut self) {
        for path in self.paths.take_evicted() {
            self.on_path_evicted(path);
        }
    }

    fn on_path_evicted(&mut self, path: NetworkPath) {
        self.controller.on_path_removed(path.id);
        if let Some(seq) = path.peer_cid_seq {
            if self.cids.active_peer_sequence() != Some(seq) && self.cids.retire_peer_cid(seq) {
                self.queue_on_active(vec![Frame::RetireConnectionId { sequence_number: seq }]);
            }
        }
    }

    fn queue_on_active(&mut self, frames: Vec<Frame>) {
        if let Err(error) = self.queue_on_path(self.paths.active_id(), frames) {
            warn!("Failed to queue frames on the active path: {}", error);
        }
    }

    fn queue_on_path(&mut self, id: PathId, frames: Vec<Frame>) -> Result<()> {
        let path = self.paths.get_mut(id).ok_or(MigrationError::UnknownPath(id))?;
        let transmit = Transmit::new(path.key(), destination_cid(&self.cids, path), frames);
        self.guard.try_send(path, transmit.size as u64)?;
        self.transmits.push_back(transmit);
        Ok(())
    }

    /// Send deferred challenges and responses on every path that has one
    fn flush_pending(&mut self, now: Instant) {
        let pending: Vec<PathId> = self
            .paths
            .iter()
            .filter(|path| {
                path.pending_response.is_some()
                    || path.challenge.is_some_and(|challenge| !challenge.transmitted)
            })
            .map(|path| path.id)
            .collect();
        for id in pending {
            self.flush_path(id, now);
        }
    }

    /// Send the PATH_RESPONSE and PATH_CHALLENGE owed on `id` as far as the budget allows
    fn flush_path(&mut self, id: PathId, now: Instant) {
        if self.closed {
            return;
        }
        let Some(path) = self.paths.get_mut(id) else {
            return;
        };
        let destination = destination_cid(&self.cids, path);

        if let Some(token) = path.pending_response {
            let frame = Frame::PathResponse { token };
            match self.guard.try_send(path, frame.encoded_len() as u64) {
                Ok(()) => {
                    path.pending_response = None;
                    self.transmits
                        .push_back(Transmit::new(path.key(), destination.clone(), vec![frame]));
                }
                Err(_) => debug!("PATH_RESPONSE on {} deferred by amplification limit", path.key()),
            }
        }

        let Some(challenge) = path.challenge.filter(|challenge| !challenge.transmitted) else {
            return;
        };
        let frame = Frame::PathChallenge { token: challenge.token };
        let minimum = frame.encoded_len() as u64;
        let budget = self.guard.remaining(path);
        if budget < minimum {
            debug!("PATH_CHALLENGE on {} deferred by amplification limit", path.key());
            return;
        }

        let size = (self.config.min_probe_datagram_size as u64).min(budget).max(minimum);
        let mut frames = vec![frame];
        if size > minimum {
            frames.push(Frame::Padding { length: (size - minimum) as usize });
        }
        if self.guard.try_send(path, size).is_err() {
            return;
        }
        self.validator.on_challenge_sent(path, now);
        path.challenges_sent += 1;
        trace!("PATH_CHALLENGE {:?} on {} ({} bytes)", challenge.token, path.key(), size);
        self.transmits.push_back(Transmit::new(path.key(), destination, frames));
    }

    /// Time since the connection was established
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.established_at)
    }
}

/// Destination connection ID for packets on `path`
fn destination_cid(cids: &ConnectionIdRegistry, path: &NetworkPath) -> Option<ConnectionId> {
    path.peer_cid_seq
        .and_then(|seq| cids.peer_cid(seq))
        .or_else(|| cids.active_peer_cid())
        .cloned()
}
