//! Login and registration payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::game::RANKED_MODES_COUNT;
use crate::session::packet::{Frame, FrameKind};
use crate::utils::hashing::HASH_LENGTH;

use super::{take_bytes, valid_username_bytes, DecodeError};

/// Credentials as sent by a client: the 32 byte client-side KDF output
/// followed by the username. Used for both login and registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRequest {
    pub hash: [u8; HASH_LENGTH],
    pub username: String,
}

impl LoginRequest {
    pub fn decode(mut payload: Bytes) -> Result<LoginRequest, DecodeError> {
        let raw_hash = take_bytes(&mut payload, HASH_LENGTH)?;
        let mut hash = [0u8; HASH_LENGTH];
        hash.copy_from_slice(&raw_hash);

        // The remainder of the payload is the username
        if !valid_username_bytes(&payload) {
            return Err(DecodeError::InvalidUsername);
        }
        let username =
            String::from_utf8(payload.to_vec()).expect("username bytes are ascii");

        Ok(LoginRequest { hash, username })
    }

    pub fn encode(&self, kind: FrameKind) -> Frame {
        let mut dst = BytesMut::with_capacity(HASH_LENGTH + self.username.len());
        dst.put_slice(&self.hash);
        dst.put_slice(self.username.as_bytes());
        Frame::new(kind, dst.freeze())
    }
}

/// Reason byte carried by a BadAuth frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthFailure {
    BadCredentials = 0,
    CurrentlyAuthenticated = 1,
    ServerError = 2,
}

impl AuthFailure {
    pub fn frame(self) -> Frame {
        Frame::new(FrameKind::BadAuth, Bytes::copy_from_slice(&[self as u8]))
    }
}

/// Reason byte carried by a BadRegistration frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RegistrationFailure {
    NotUnique = 0,
    InvalidUsername = 1,
    CurrentlyAuthenticated = 2,
    ServerError = 3,
}

impl RegistrationFailure {
    pub fn frame(self) -> Frame {
        Frame::new(
            FrameKind::BadRegistration,
            Bytes::copy_from_slice(&[self as u8]),
        )
    }
}

/// GoodAuth payload: the per-ranked-mode elo array as big-endian u32s.
pub fn encode_good_auth(elos: &[i32; RANKED_MODES_COUNT]) -> Frame {
    let mut dst = BytesMut::with_capacity(4 * RANKED_MODES_COUNT);
    for elo in elos {
        dst.put_u32(*elo as u32);
    }
    Frame::new(FrameKind::GoodAuth, dst.freeze())
}

pub fn decode_good_auth(mut payload: Bytes) -> Result<[i32; RANKED_MODES_COUNT], DecodeError> {
    if payload.len() != 4 * RANKED_MODES_COUNT {
        return Err(DecodeError::InvalidValue);
    }
    let mut elos = [0i32; RANKED_MODES_COUNT];
    for elo in elos.iter_mut() {
        *elo = super::take_u32(&mut payload)? as i32;
    }
    Ok(elos)
}

#[cfg(test)]
mod test {
    use super::{decode_good_auth, encode_good_auth, LoginRequest};
    use crate::session::models::DecodeError;
    use crate::session::packet::FrameKind;
    use bytes::Bytes;

    #[test]
    fn login_round_trip() {
        let request = LoginRequest {
            hash: [7u8; 32],
            username: "alice".to_string(),
        };
        let frame = request.encode(FrameKind::LoginRequest);
        assert_eq!(frame.kind, FrameKind::LoginRequest);
        assert_eq!(frame.payload.len(), 37);

        let decoded = LoginRequest::decode(frame.payload).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn login_rejects_bad_usernames() {
        let mut payload = vec![0u8; 32];
        payload.extend_from_slice(b"bad name");
        assert_eq!(
            LoginRequest::decode(Bytes::from(payload)),
            Err(DecodeError::InvalidUsername)
        );

        // Missing username entirely
        assert_eq!(
            LoginRequest::decode(Bytes::from(vec![0u8; 32])),
            Err(DecodeError::InvalidUsername)
        );

        // Short of a full hash
        assert_eq!(
            LoginRequest::decode(Bytes::from(vec![0u8; 16])),
            Err(DecodeError::UnexpectedEnd)
        );
    }

    #[test]
    fn good_auth_round_trip() {
        let frame = encode_good_auth(&[1516]);
        assert_eq!(frame.payload.len(), 4);
        assert_eq!(decode_good_auth(frame.payload).unwrap(), [1516]);
    }
}
