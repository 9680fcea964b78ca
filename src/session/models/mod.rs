#![allow(unused)]

//! Typed payloads for the frame kinds that carry data, with byte-exact
//! encoding and validating decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

use crate::utils::types::UserId;

pub mod auth;
pub mod game;
pub mod history;
pub mod social;

/// Maximum username length on the wire and in the store
pub const MAX_USERNAME_LEN: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("payload ended before the declared content")]
    UnexpectedEnd,
    #[error("username length or characters invalid")]
    InvalidUsername,
    #[error("a field held an out of range value")]
    InvalidValue,
    #[error("payload carries bytes past the declared content")]
    TrailingBytes,
}

/// Whether every byte is in the `[A-Za-z0-9_-]` username alphabet.
pub fn valid_username_bytes(bytes: &[u8]) -> bool {
    !bytes.is_empty()
        && bytes.len() <= MAX_USERNAME_LEN
        && bytes
            .iter()
            .all(|byte| byte.is_ascii_alphanumeric() || *byte == b'_' || *byte == b'-')
}

pub(crate) fn take_u8(buf: &mut Bytes) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u8())
}

pub(crate) fn take_u16(buf: &mut Bytes) -> Result<u16, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u16())
}

pub(crate) fn take_u32(buf: &mut Bytes) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u32())
}

pub(crate) fn take_u64(buf: &mut Bytes) -> Result<u64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_u64())
}

pub(crate) fn take_i64(buf: &mut Bytes) -> Result<i64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.get_i64())
}

pub(crate) fn take_bytes(buf: &mut Bytes, len: usize) -> Result<Bytes, DecodeError> {
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEnd);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn take_uuid(buf: &mut Bytes) -> Result<UserId, DecodeError> {
    let raw = take_bytes(buf, 16)?;
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&raw);
    Ok(Uuid::from_bytes(bytes))
}

/// Reads a length-prefixed, charset-checked username.
pub(crate) fn take_username(buf: &mut Bytes) -> Result<String, DecodeError> {
    let len = take_u8(buf)? as usize;
    if len > MAX_USERNAME_LEN {
        return Err(DecodeError::InvalidUsername);
    }
    let raw = take_bytes(buf, len)?;
    if !valid_username_bytes(&raw) {
        return Err(DecodeError::InvalidUsername);
    }
    // Charset check guarantees ASCII
    Ok(String::from_utf8(raw.to_vec()).expect("username bytes are ascii"))
}

pub(crate) fn put_uuid(dst: &mut BytesMut, id: &UserId) {
    dst.put_slice(id.as_bytes());
}

/// Writes a user entry: 16 byte uuid, one length byte, the username.
pub(crate) fn put_user_entry(dst: &mut BytesMut, id: &UserId, username: &str) {
    put_uuid(dst, id);
    dst.put_u8(username.len() as u8);
    dst.put_slice(username.as_bytes());
}

#[cfg(test)]
mod test {
    use super::{take_username, valid_username_bytes, DecodeError};
    use bytes::Bytes;

    #[test]
    fn username_alphabet() {
        assert!(valid_username_bytes(b"alice"));
        assert!(valid_username_bytes(b"A-b_9"));
        assert!(!valid_username_bytes(b""));
        assert!(!valid_username_bytes(b"has space"));
        assert!(!valid_username_bytes(b"uni\xC3\xA9"));
        assert!(!valid_username_bytes(&[b'a'; 25]));
        assert!(valid_username_bytes(&[b'a'; 24]));
    }

    #[test]
    fn username_decode() {
        let mut buf = Bytes::from_static(&[5, b'a', b'l', b'i', b'c', b'e']);
        assert_eq!(take_username(&mut buf).unwrap(), "alice");

        let mut short = Bytes::from_static(&[5, b'a']);
        assert_eq!(take_username(&mut short), Err(DecodeError::UnexpectedEnd));

        let mut bad = Bytes::from_static(&[2, b'a', b' ']);
        assert_eq!(take_username(&mut bad), Err(DecodeError::InvalidUsername));
    }
}
