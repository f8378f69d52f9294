//! Migration related transport parameters (RFC 9000 §18.2)
//!
//! Only the parameters that influence connection migration are modelled:
//! `disable_active_migration`, `preferred_address` and
//! `active_connection_id_limit`. Unknown parameters are skipped on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use super::coding::{decode_varint, encode_varint, varint_len};
use crate::config::MIN_ACTIVE_CONNECTION_ID_LIMIT;
use crate::connection_id::{ConnectionId, STATELESS_RESET_TOKEN_LENGTH, StatelessResetToken};
use crate::error::CodecError;

const DISABLE_ACTIVE_MIGRATION: u64 = 0x0c;
const PREFERRED_ADDRESS: u64 = 0x0d;
const ACTIVE_CONNECTION_ID_LIMIT: u64 = 0x0e;

/// Server preferred address; the connection ID carries sequence number 1
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreferredAddress {
    pub ipv4: Option<SocketAddrV4>,
    pub ipv6: Option<SocketAddrV6>,
    pub connection_id: ConnectionId,
    pub stateless_reset_token: StatelessResetToken,
}

impl PreferredAddress {
    /// Build a preferred address advertising a single socket address
    pub fn new(
        address: SocketAddr,
        connection_id: ConnectionId,
        stateless_reset_token: StatelessResetToken,
    ) -> Self {
        let (ipv4, ipv6) = match address {
            SocketAddr::V4(addr) => (Some(addr), None),
            SocketAddr::V6(addr) => (None, Some(addr)),
        };
        Self { ipv4, ipv6, connection_id, stateless_reset_token }
    }

    /// Address to probe given the family of the current remote address
    pub fn address_for(&self, current: &SocketAddr) -> Option<SocketAddr> {
        match current {
            SocketAddr::V4(_) => self.ipv4.map(SocketAddr::V4).or(self.ipv6.map(SocketAddr::V6)),
            SocketAddr::V6(_) => self.ipv6.map(SocketAddr::V6).or(self.ipv4.map(SocketAddr::V4)),
        }
    }

    fn encoded_len(&self) -> usize {
        4 + 2 + 16 + 2 + 1 + self.connection_id.len() + STATELESS_RESET_TOKEN_LENGTH
    }

    fn encode<B: BufMut>(&self, buf: &mut B) {
        let ipv4 = self.ipv4.unwrap_or(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0));
        buf.put_slice(&ipv4.ip().octets());
        buf.put_u16(ipv4.port());
        let ipv6 = self.ipv6.unwrap_or(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, 0));
        buf.put_slice(&ipv6.ip().octets());
        buf.put_u16(ipv6.port());
        buf.put_u8(self.connection_id.len() as u8);
        buf.put_slice(self.connection_id.as_bytes());
        buf.put_slice(self.stateless_reset_token.as_bytes());
    }

    fn decode(mut value: Bytes) -> Result<Self, CodecError> {
        if value.len() < 4 + 2 + 16 + 2 + 1 {
            return Err(CodecError::UnexpectedEnd("preferred_address"));
        }
        let mut octets = [0u8; 4];
        value.copy_to_slice(&mut octets);
        let ipv4 = SocketAddrV4::new(Ipv4Addr::from(octets), value.get_u16());
        let mut octets = [0u8; 16];
        value.copy_to_slice(&mut octets);
        let ipv6 = SocketAddrV6::new(Ipv6Addr::from(octets), value.get_u16(), 0, 0);

        let cid_len = value.get_u8() as usize;
        if cid_len == 0 {
            return Err(CodecError::InvalidConnectionIdLength(cid_len));
        }
        if value.len() != cid_len + STATELESS_RESET_TOKEN_LENGTH {
            return Err(CodecError::Malformed("preferred_address length"));
        }
        let connection_id = ConnectionId::from_bytes(value.split_to(cid_len))
            .map_err(|_| CodecError::InvalidConnectionIdLength(cid_len))?;
        let mut token = [0u8; STATELESS_RESET_TOKEN_LENGTH];
        value.copy_to_slice(&mut token);

        let ipv4 = (!ipv4.ip().is_unspecified() || ipv4.port() != 0).then_some(ipv4);
        let ipv6 = (!ipv6.ip().is_unspecified() || ipv6.port() != 0).then_some(ipv6);
        if ipv4.is_none() && ipv6.is_none() {
            return Err(CodecError::Malformed("preferred_address without address"));
        }

        Ok(Self {
            ipv4,
            ipv6,
            connection_id,
            stateless_reset_token: StatelessResetToken::new(token),
        })
    }
}

/// The subset of transport parameters consumed by migration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParameters {
    pub active_connection_id_limit: u64,
    pub disable_active_migration: bool,
    pub preferred_address: Option<PreferredAddress>,
}

impl Default for TransportParameters {
    fn default() -> Self {
        Self {
            active_connection_id_limit: MIN_ACTIVE_CONNECTION_ID_LIMIT,
            disable_active_migration: false,
            preferred_address: None,
        }
    }
}

impl TransportParameters {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();

        if self.active_connection_id_limit != MIN_ACTIVE_CONNECTION_ID_LIMIT {
            encode_varint(&mut buf, ACTIVE_CONNECTION_ID_LIMIT);
            encode_varint(&mut buf, varint_len(self.active_connection_id_limit) as u64);
            encode_varint(&mut buf, self.active_connection_id_limit);
        }
        if self.disable_active_migration {
            encode_varint(&mut buf, DISABLE_ACTIVE_MIGRATION);
            encode_varint(&mut buf, 0);
        }
        if let Some(preferred) = &self.preferred_address {
            encode_varint(&mut buf, PREFERRED_ADDRESS);
            encode_varint(&mut buf, preferred.encoded_len() as u64);
            preferred.encode(&mut buf);
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, CodecError> {
        let mut params = Self::default();

        while buf.has_remaining() {
            let id = decode_varint(&mut buf)?;
            let len = decode_varint(&mut buf)? as usize;
            if buf.len() < len {
                return Err(CodecError::UnexpectedEnd("transport parameter"));
            }
            let mut value = buf.split_to(len);

            match id {
                ACTIVE_CONNECTION_ID_LIMIT => {
                    let limit = decode_varint(&mut value)?;
                    if limit < MIN_ACTIVE_CONNECTION_ID_LIMIT || value.has_remaining() {
                        return Err(CodecError::Malformed("active_connection_id_limit"));
                    }
                    params.active_connection_id_limit = limit;
                }
                DISABLE_ACTIVE_MIGRATION => {
                    if len != 0 {
                        return Err(CodecError::Malformed("disable_active_migration"));
                    }
                    params.disable_active_migration = true;
                }
                PREFERRED_ADDRESS => {
                    params.preferred_address = Some(PreferredAddress::decode(value)?);
                }
                _ => {}
            }
        }

        Ok(params)
    }
}
