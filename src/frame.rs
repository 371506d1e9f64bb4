// Reference wire format.
//
// Request:  <opcode u8> <field>*
// Field:    <length u16 big-endian> <bytes>
// Response: <status u8> <payload>, where the payload is only present on success.

use bytes::{BufMut, Bytes, BytesMut};
use std::str::Utf8Error;
use thiserror::Error as ThisError;

use crate::connection::ConnectionError;
use crate::session::SessionId;

pub const SUCCESS: u8 = 0x01;
pub const FAILURE: u8 = 0xff;

pub const MAX_FIELD_LEN: usize = u16::MAX as usize;
pub const MAX_FIELDS: usize = u16::MAX as usize;

#[derive(Debug, ThisError)]
pub enum FrameError {
    #[error("frame error; field of {0} bytes exceeds the 65535 byte limit")]
    FieldTooLong(usize),
    #[error("frame error; {count} fields exceed the 65535 field limit")]
    TooManyFields { count: usize },
    #[error("frame error; invalid UTF-8 string")]
    InvalidUtf8(#[from] Utf8Error),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Response {
    /// Bare success status.
    Success,
    /// Success followed by a big-endian session id.
    Session(SessionId),
    /// Success followed by a single field.
    Field(Bytes),
    /// Success followed by a big-endian field count and the fields.
    Fields(Vec<Bytes>),
    Failure,
}

impl Response {
    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Failure)
    }

    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(8);

        match self {
            Response::Success => buf.put_u8(SUCCESS),
            Response::Session(session_id) => {
                buf.put_u8(SUCCESS);
                buf.put_u32(session_id.0);
            }
            Response::Field(field) => {
                buf.put_u8(SUCCESS);
                put_field(&mut buf, field)?;
            }
            Response::Fields(fields) => {
                let count = u16::try_from(fields.len())
                    .map_err(|_| FrameError::TooManyFields { count: fields.len() })?;
                buf.put_u8(SUCCESS);
                buf.put_u16(count);
                for field in fields {
                    put_field(&mut buf, field)?;
                }
            }
            Response::Failure => buf.put_u8(FAILURE),
        }

        Ok(buf.freeze())
    }
}

/// Encodes a request: the opcode followed by each field.
pub fn request(opcode: u8, fields: &[&[u8]]) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(1 + fields.iter().map(|f| 2 + f.len()).sum::<usize>());
    buf.put_u8(opcode);

    for field in fields {
        put_field(&mut buf, field)?;
    }

    Ok(buf.freeze())
}

pub fn put_field(buf: &mut BytesMut, field: &[u8]) -> Result<(), FrameError> {
    let len = u16::try_from(field.len()).map_err(|_| FrameError::FieldTooLong(field.len()))?;
    buf.put_u16(len);
    buf.put_slice(field);
    Ok(())
}
