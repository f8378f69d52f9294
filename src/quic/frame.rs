//! QUIC frames used by connection migration (RFC 9000 §19)

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::coding::{decode_varint, encode_varint, varint_len};
use crate::connection_id::{ConnectionId, STATELESS_RESET_TOKEN_LENGTH, StatelessResetToken};
use crate::error::CodecError;
use crate::validator::{CHALLENGE_TOKEN_LENGTH, ChallengeToken};

/// QUIC frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Padding = 0x00,
    Ping = 0x01,
    Stream = 0x08,
    NewConnectionId = 0x18,
    RetireConnectionId = 0x19,
    PathChallenge = 0x1a,
    PathResponse = 0x1b,
    ConnectionClose = 0x1c,
    ApplicationClose = 0x1d,
}

impl FrameType {
    pub fn from_u64(value: u64) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Padding),
            0x01 => Some(FrameType::Ping),
            0x08..=0x0f => Some(FrameType::Stream),
            0x18 => Some(FrameType::NewConnectionId),
            0x19 => Some(FrameType::RetireConnectionId),
            0x1a => Some(FrameType::PathChallenge),
            0x1b => Some(FrameType::PathResponse),
            0x1c => Some(FrameType::ConnectionClose),
            0x1d => Some(FrameType::ApplicationClose),
            _ => None,
        }
    }
}

const STREAM_FIN: u8 = 0x01;
const STREAM_LEN: u8 = 0x02;
const STREAM_OFF: u8 = 0x04;

/// QUIC frames
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding {
        length: usize,
    },
    Ping,
    Stream {
        stream_id: u64,
        offset: u64,
        data: Bytes,
        fin: bool,
    },
    NewConnectionId {
        sequence_number: u64,
        retire_prior_to: u64,
        connection_id: ConnectionId,
        stateless_reset_token: StatelessResetToken,
    },
    RetireConnectionId {
        sequence_number: u64,
    },
    PathChallenge {
        token: ChallengeToken,
    },
    PathResponse {
        token: ChallengeToken,
    },
    /// CONNECTION_CLOSE; `frame_type` is `None` for the application variant (0x1d)
    ConnectionClose {
        error_code: u64,
        frame_type: Option<u64>,
        reason: Bytes,
    },
}

impl Frame {
    /// Probing frames do not make a packet count as a migration of the peer (RFC 9000 §9.1)
    pub fn is_probing(&self) -> bool {
        matches!(
            self,
            Frame::Padding { .. }
                | Frame::PathChallenge { .. }
                | Frame::PathResponse { .. }
                | Frame::NewConnectionId { .. }
        )
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Padding { .. } => FrameType::Padding,
            Frame::Ping => FrameType::Ping,
            Frame::Stream { .. } => FrameType::Stream,
            Frame::NewConnectionId { .. } => FrameType::NewConnectionId,
            Frame::RetireConnectionId { .. } => FrameType::RetireConnectionId,
            Frame::PathChallenge { .. } => FrameType::PathChallenge,
            Frame::PathResponse { .. } => FrameType::PathResponse,
            Frame::ConnectionClose { frame_type: Some(_), .. } => FrameType::ConnectionClose,
            Frame::ConnectionClose { frame_type: None, .. } => FrameType::ApplicationClose,
        }
    }

    /// Number of bytes this frame occupies on the wire
    pub fn encoded_len(&self) -> usize {
        match self {
            Frame::Padding { length } => *length,
            Frame::Ping => 1,
            Frame::Stream { stream_id, offset, data, .. } => {
                let offset_len = if *offset > 0 { varint_len(*offset) } else { 0 };
                1 + varint_len(*stream_id) + offset_len + varint_len(data.len() as u64) + data.len()
            }
            Frame::NewConnectionId { sequence_number, retire_prior_to, connection_id, .. } => {
                1 + varint_len(*sequence_number)
                    + varint_len(*retire_prior_to)
                    + 1
                    + connection_id.len()
                    + STATELESS_RESET_TOKEN_LENGTH
            }
            Frame::RetireConnectionId { sequence_number } => 1 + varint_len(*sequence_number),
            Frame::PathChallenge { .. } | Frame::PathResponse { .. } => 1 + CHALLENGE_TOKEN_LENGTH,
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                1 + varint_len(*error_code)
                    + frame_type.map_or(0, varint_len)
                    + varint_len(reason.len() as u64)
                    + reason.len()
            }
        }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into<B: BufMut>(&self, buf: &mut B) {
        match self {
            Frame::Padding { length } => {
                buf.put_bytes(0, *length);
            }
            Frame::Ping => {
                buf.put_u8(FrameType::Ping as u8);
            }
            Frame::Stream { stream_id, offset, data, fin } => {
                let mut frame_type = FrameType::Stream as u8 | STREAM_LEN;
                if *fin {
                    frame_type |= STREAM_FIN;
                }
                if *offset > 0 {
                    frame_type |= STREAM_OFF;
                }
                buf.put_u8(frame_type);
                encode_varint(buf, *stream_id);
                if *offset > 0 {
                    encode_varint(buf, *offset);
                }
                encode_varint(buf, data.len() as u64);
                buf.put_slice(data);
            }
            Frame::NewConnectionId {
                sequence_number,
                retire_prior_to,
                connection_id,
                stateless_reset_token,
            } => {
                buf.put_u8(FrameType::NewConnectionId as u8);
                encode_varint(buf, *sequence_number);
                encode_varint(buf, *retire_prior_to);
                buf.put_u8(connection_id.len() as u8);
                buf.put_slice(connection_id.as_bytes());
                buf.put_slice(stateless_reset_token.as_bytes());
            }
            Frame::RetireConnectionId { sequence_number } => {
                buf.put_u8(FrameType::RetireConnectionId as u8);
                encode_varint(buf, *sequence_number);
            }
            Frame::PathChallenge { token } => {
                buf.put_u8(FrameType::PathChallenge as u8);
                buf.put_slice(token.as_bytes());
            }
            Frame::PathResponse { token } => {
                buf.put_u8(FrameType::PathResponse as u8);
                buf.put_slice(token.as_bytes());
            }
            Frame::ConnectionClose { error_code, frame_type, reason } => {
                buf.put_u8(self.frame_type() as u8);
                encode_varint(buf, *error_code);
                if let Some(frame_type) = frame_type {
                    encode_varint(buf, *frame_type);
                }
                encode_varint(buf, reason.len() as u64);
                buf.put_slice(reason);
            }
        }
    }

    /// Decode a single frame from the front of `buf`
    pub fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        let type_value = decode_varint(buf)?;
        let frame_type =
            FrameType::from_u64(type_value).ok_or(CodecError::UnknownFrameType(type_value))?;

        let frame = match frame_type {
            FrameType::Padding => {
                let mut length = 1;
                while buf.first() == Some(&0) {
                    buf.advance(1);
                    length += 1;
                }
                Frame::Padding { length }
            }
            FrameType::Ping => Frame::Ping,
            FrameType::Stream => {
                let flags = type_value as u8;
                let stream_id = decode_varint(buf)?;
                let offset = if flags & STREAM_OFF != 0 { decode_varint(buf)? } else { 0 };
                let data = if flags & STREAM_LEN != 0 {
                    let length = decode_varint(buf)? as usize;
                    take(buf, length, "STREAM data")?
                } else {
                    buf.split_to(buf.len())
                };
                Frame::Stream { stream_id, offset, data, fin: flags & STREAM_FIN != 0 }
            }
            FrameType::NewConnectionId => {
                let sequence_number = decode_varint(buf)?;
                let retire_prior_to = decode_varint(buf)?;
                if retire_prior_to > sequence_number {
                    return Err(CodecError::Malformed("NEW_CONNECTION_ID retire_prior_to"));
                }
                if !buf.has_remaining() {
                    return Err(CodecError::UnexpectedEnd("NEW_CONNECTION_ID"));
                }
                let length = buf.get_u8() as usize;
                if length == 0 {
                    return Err(CodecError::InvalidConnectionIdLength(length));
                }
                let connection_id = ConnectionId::from_bytes(take(buf, length, "connection ID")?)
                    .map_err(|_| CodecError::InvalidConnectionIdLength(length))?;
                let token = take(buf, STATELESS_RESET_TOKEN_LENGTH, "stateless reset token")?;
                let mut reset = [0u8; STATELESS_RESET_TOKEN_LENGTH];
                reset.copy_from_slice(&token);
                Frame::NewConnectionId {
                    sequence_number,
                    retire_prior_to,
                    connection_id,
                    stateless_reset_token: StatelessResetToken::new(reset),
                }
            }
            FrameType::RetireConnectionId => {
                Frame::RetireConnectionId { sequence_number: decode_varint(buf)? }
            }
            FrameType::PathChallenge => Frame::PathChallenge { token: decode_token(buf)? },
            FrameType::PathResponse => Frame::PathResponse { token: decode_token(buf)? },
            FrameType::ConnectionClose | FrameType::ApplicationClose => {
                let error_code = decode_varint(buf)?;
                let frame_type = if frame_type == FrameType::ConnectionClose {
                    Some(decode_varint(buf)?)
                } else {
                    None
                };
                let length = decode_varint(buf)? as usize;
                let reason = take(buf, length, "CONNECTION_CLOSE reason")?;
                Frame::ConnectionClose { error_code, frame_type, reason }
            }
        };

        Ok(frame)
    }

    /// Decode every frame in a packet payload
    pub fn decode_all(mut payload: Bytes) -> Result<Vec<Self>, CodecError> {
        let mut frames = Vec::new();
        while payload.has_remaining() {
            frames.push(Self::decode(&mut payload)?);
        }
        Ok(frames)
    }
}

fn take(buf: &mut Bytes, length: usize, what: &'static str) -> Result<Bytes, CodecError> {
    if buf.len() < length {
        return Err(CodecError::UnexpectedEnd(what));
    }
    Ok(buf.split_to(length))
}

fn decode_token(buf: &mut Bytes) -> Result<ChallengeToken, CodecError> {
    let bytes = take(buf, CHALLENGE_TOKEN_LENGTH, "path token")?;
    let mut token = [0u8; CHALLENGE_TOKEN_LENGTH];
    token.copy_from_slice(&bytes);
    Ok(ChallengeToken::new(token))
}
