//! QUIC wire formats consumed by connection migration
//!
//! Frame and transport parameter encodings follow RFC 9000 §18 and §19 so the
//! migration layer interoperates with any packetizer built on the same codec.

pub mod coding;
pub mod frame;
pub mod transport_parameters;

pub use frame::{Frame, FrameType};
pub use transport_parameters::{PreferredAddress, TransportParameters};
