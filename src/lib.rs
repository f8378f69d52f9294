// QUIC wire formats used by migration
pub mod quic;

// Errors and configuration
pub mod config;
pub mod error;

// Connection IDs, paths and validation
pub mod amplification;
pub mod connection_id;
pub mod path;
pub mod validator;

// Migration state machine and per-connection core
pub mod connection;
pub mod events;
pub mod migration;

// Routing across connections and the async driver
pub mod driver;
pub mod endpoint;

// Re-export main types
pub use config::MigrationConfig;
pub use connection::{Connection, FrameSink, IncomingPacket, PacketDisposition, Side, Transmit};
pub use connection_id::{ConnectionId, ConnectionIdRegistry, StatelessResetToken};
pub use endpoint::{ConnectionHandle, Endpoint};
pub use error::{MigrationError, Result};
pub use events::{ConnectionEvent, MigrationHistory, MigrationRecord, MigrationTrigger};
pub use path::{NetworkPath, NetworkPathTable, PathId, PathKey, PathState};

pub mod prelude {
    pub use crate::config::MigrationConfig;
    pub use crate::connection::{Connection, FrameSink, IncomingPacket, PacketDisposition, Side, Transmit};
    pub use crate::connection_id::{ConnectionId, StatelessResetToken};
    pub use crate::driver::{ChannelSink, DriverHandle};
    pub use crate::endpoint::{ConnectionHandle, Endpoint};
    pub use crate::error::{MigrationError, Result};
    pub use crate::events::{ConnectionEvent, MigrationTrigger};
    pub use crate::migration::MigrationState;
    pub use crate::path::{PathId, PathKey, PathState};
    pub use crate::quic::{Frame, TransportParameters};
}
