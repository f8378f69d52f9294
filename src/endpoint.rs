//! Connection routing by destination connection ID
//!
//! An endpoint serves many connections on shared sockets. Packets are routed
//! by their destination connection ID, never by address, so a connection
//! keeps receiving packets after its peer moves. Each connection sits behind
//! its own lock; routing never holds more than one connection lock at a time.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::connection::{Connection, DropReason, IncomingPacket, PacketDisposition};
use crate::connection_id::ConnectionId;
use crate::error::Result;

/// Identity of a connection within an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(Uuid);

impl ConnectionHandle {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type SharedConnection = Arc<Mutex<Connection>>;

#[derive(Debug, Default)]
pub struct Endpoint {
    connections: DashMap<ConnectionHandle, SharedConnection>,
    routes: DashMap<ConnectionId, ConnectionHandle>,
}

impl Endpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and every connection ID it currently answers to
    pub fn insert(&self, connection: Connection) -> ConnectionHandle {
        let handle = ConnectionHandle::new();
        for cid in connection.local_connection_ids() {
            self.routes.insert(cid, handle);
        }
        self.connections.insert(handle, Arc::new(Mutex::new(connection)));
        debug!("Registered connection {}", handle);
        handle
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<SharedConnection> {
        self.connections.get(&handle).map(|entry| Arc::clone(entry.value()))
    }

    /// Find the connection a destination connection ID belongs to.
    ///
    /// Retired IDs resolve until their grace window ends.
    pub fn resolve(
        &self,
        cid: &ConnectionId,
        now: Instant,
    ) -> Option<(ConnectionHandle, SharedConnection)> {
        let handle = *self.routes.get(cid)?.value();
        let connection = self.get(handle)?;
        if connection.lock().connection_ids().resolve(cid, now).is_none() {
            return None;
        }
        Some((handle, connection))
    }

    /// Route one decoded packet to its connection
    pub fn handle_packet(&self, packet: IncomingPacket, now: Instant) -> Result<PacketDisposition> {
        let Some((handle, connection)) = self.resolve(&packet.destination_cid, now) else {
            trace!("No connection for {}, dropping packet from {}", packet.destination_cid, packet.remote);
            return Ok(PacketDisposition::Dropped(DropReason::UnknownConnectionId));
        };

        let mut connection = connection.lock();
        let disposition = connection.on_packet_received(packet, now);
        self.sync_routes(handle, &mut connection);
        disposition
    }

    /// Drive the timers of every connection, removing the ones that closed
    pub fn handle_timeouts(&self, now: Instant) -> Vec<ConnectionHandle> {
        let handles: Vec<ConnectionHandle> = self.connections.iter().map(|entry| *entry.key()).collect();
        let mut closed = Vec::new();

        for handle in handles {
            let Some(connection) = self.get(handle) else {
                continue;
            };
            let is_closed = {
                let mut connection = connection.lock();
                if connection.poll_timeout().is_some_and(|deadline| deadline <= now) {
                    connection.handle_timeout(now);
                }
                self.sync_routes(handle, &mut connection);
                connection.is_closed()
            };
            if is_closed {
                self.remove(handle);
                closed.push(handle);
            }
        }
        closed
    }

    /// Earliest timer across all connections
    pub fn poll_timeout(&self) -> Option<Instant> {
        self.connections.iter().filter_map(|entry| entry.value().lock().poll_timeout()).min()
    }

    pub fn remove(&self, handle: ConnectionHandle) -> Option<SharedConnection> {
        let (_, connection) = self.connections.remove(&handle)?;
        self.routes.retain(|_, owner| *owner != handle);
        debug!("Removed connection {}", handle);
        Some(connection)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Number of routable connection IDs across all connections
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    fn sync_routes(&self, handle: ConnectionHandle, connection: &mut Connection) {
        for cid in connection.drain_expired_cids() {
            self.routes.remove(&cid);
        }
        for cid in connection.local_connection_ids() {
            self.routes.entry(cid).or_insert(handle);
        }
    }
}
