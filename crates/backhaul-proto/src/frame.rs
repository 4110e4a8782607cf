//! Frame encoding for the control socket

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{MAX_FIELD_LEN, MAX_FRAME_SIZE};

/// Connection identifier, unique within one session while live
pub type ConnId = u64;

/// Frame type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Connect = 1,
    Data = 2,
    Error = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            1 => Ok(FrameType::Connect),
            2 => Ok(FrameType::Data),
            3 => Ok(FrameType::Error),
            _ => Err(FrameError::UnknownType(value)),
        }
    }
}

/// Frame codec errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Unknown frame type: {0}")]
    UnknownType(u8),

    #[error("Truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Field {field} too long: {len} bytes")]
    FieldTooLong { field: &'static str, len: usize },

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Unexpected {0} trailing bytes after frame")]
    TrailingBytes(usize),

    #[error("Field {0} is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

/// One unit of the multiplexing protocol.
///
/// Layout (big-endian): `type:u8 | conn_id:u64 | body` where the body is
/// - Connect: `deadline_millis:i64 | proto_len:u16 | proto | address_len:u16 | address`
/// - Data: the remaining bytes
/// - Error: the remaining bytes as UTF-8 text
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Connect {
        conn_id: ConnId,
        proto: String,
        address: String,
        deadline_millis: i64,
    },
    Data {
        conn_id: ConnId,
        payload: Bytes,
    },
    Error {
        conn_id: ConnId,
        message: String,
    },
}

impl Frame {
    /// Header size: type (1) + conn_id (8)
    pub const HEADER_SIZE: usize = 9;

    pub fn connect(
        conn_id: ConnId,
        proto: impl Into<String>,
        address: impl Into<String>,
        deadline_millis: i64,
    ) -> Self {
        Frame::Connect {
            conn_id,
            proto: proto.into(),
            address: address.into(),
            deadline_millis,
        }
    }

    pub fn data(conn_id: ConnId, payload: Bytes) -> Self {
        Frame::Data { conn_id, payload }
    }

    pub fn error(conn_id: ConnId, message: impl Into<String>) -> Self {
        Frame::Error {
            conn_id,
            message: message.into(),
        }
    }

    pub fn conn_id(&self) -> ConnId {
        match self {
            Frame::Connect { conn_id, .. }
            | Frame::Data { conn_id, .. }
            | Frame::Error { conn_id, .. } => *conn_id,
        }
    }

    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Data { .. } => FrameType::Data,
            Frame::Error { .. } => FrameType::Error,
        }
    }

    /// Number of bytes `encode` will produce
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE
            + match self {
                Frame::Connect { proto, address, .. } => 8 + 2 + proto.len() + 2 + address.len(),
                Frame::Data { payload, .. } => payload.len(),
                Frame::Error { message, .. } => message.len(),
            }
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_to(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_to(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let len = self.encoded_len();
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(len));
        }
        if let Frame::Connect { proto, address, .. } = self {
            check_field("proto", proto)?;
            check_field("address", address)?;
        }

        buf.reserve(len);
        buf.put_u8(self.frame_type() as u8);
        buf.put_u64(self.conn_id());

        match self {
            Frame::Connect {
                proto,
                address,
                deadline_millis,
                ..
            } => {
                buf.put_i64(*deadline_millis);
                buf.put_u16(proto.len() as u16);
                buf.put_slice(proto.as_bytes());
                buf.put_u16(address.len() as u16);
                buf.put_slice(address.as_bytes());
            }
            Frame::Data { payload, .. } => buf.put_slice(payload),
            Frame::Error { message, .. } => buf.put_slice(message.as_bytes()),
        }

        Ok(())
    }

    /// Decode exactly one frame from a complete message
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(buf.len()));
        }
        ensure(&buf, Self::HEADER_SIZE)?;

        let frame_type = FrameType::try_from(buf.get_u8())?;
        let conn_id = buf.get_u64();

        match frame_type {
            FrameType::Connect => {
                ensure(&buf, 8)?;
                let deadline_millis = buf.get_i64();
                let proto = read_field(&mut buf, "proto")?;
                let address = read_field(&mut buf, "address")?;
                if buf.has_remaining() {
                    return Err(FrameError::TrailingBytes(buf.remaining()));
                }
                Ok(Frame::Connect {
                    conn_id,
                    proto,
                    address,
                    deadline_millis,
                })
            }
            FrameType::Data => Ok(Frame::Data {
                conn_id,
                payload: buf,
            }),
            FrameType::Error => Ok(Frame::Error {
                conn_id,
                message: String::from_utf8_lossy(&buf).into_owned(),
            }),
        }
    }
}

fn ensure(buf: &Bytes, needed: usize) -> Result<(), FrameError> {
    if buf.remaining() < needed {
        return Err(FrameError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

fn check_field(field: &'static str, value: &str) -> Result<(), FrameError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn read_field(buf: &mut Bytes, field: &'static str) -> Result<String, FrameError> {
    ensure(buf, 2)?;
    let len = buf.get_u16() as usize;
    if len > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLong { field, len });
    }
    ensure(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| FrameError::InvalidUtf8(field))
}
