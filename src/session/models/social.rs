//! Social payloads: user lists, relation updates and text messages.

use bytes::{BufMut, Bytes, BytesMut};

use crate::session::packet::{Frame, FrameKind};
use crate::utils::types::UserId;

use super::{
    put_user_entry, put_uuid, take_bytes, take_u8, take_username, take_uuid, valid_username_bytes,
    DecodeError,
};

/// Accept value inside a RespondFriendRequest payload
pub const ACCEPT_FRIEND_REQUEST: u8 = 1;

/// Another account as exposed to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalUser {
    pub user_id: UserId,
    pub username: String,
}

/// Encodes a list of user entries under the given kind (FriendList,
/// FriendRequestList, BlockList).
pub fn encode_user_list(kind: FrameKind, users: &[ExternalUser]) -> Frame {
    let mut dst = BytesMut::new();
    for user in users {
        put_user_entry(&mut dst, &user.user_id, &user.username);
    }
    Frame::new(kind, dst.freeze())
}

pub fn decode_user_list(mut payload: Bytes) -> Result<Vec<ExternalUser>, DecodeError> {
    let mut users = Vec::new();
    while !payload.is_empty() {
        let user_id = take_uuid(&mut payload)?;
        let username = take_username(&mut payload)?;
        users.push(ExternalUser { user_id, username });
    }
    Ok(users)
}

/// Relation notifications carry one user entry without a length
/// prefix: the uuid then the username to payload end.
pub fn encode_relation_update(kind: FrameKind, user: &ExternalUser) -> Frame {
    let mut dst = BytesMut::with_capacity(16 + user.username.len());
    put_uuid(&mut dst, &user.user_id);
    dst.put_slice(user.username.as_bytes());
    Frame::new(kind, dst.freeze())
}

pub fn decode_relation_update(mut payload: Bytes) -> Result<ExternalUser, DecodeError> {
    let user_id = take_uuid(&mut payload)?;
    if !valid_username_bytes(&payload) {
        return Err(DecodeError::InvalidUsername);
    }
    let username = String::from_utf8(payload.to_vec()).expect("username bytes are ascii");
    Ok(ExternalUser { user_id, username })
}

/// Payloads that are exactly one username (SendFriendRequest,
/// BlockUser).
pub fn decode_username_payload(payload: Bytes) -> Result<String, DecodeError> {
    if !valid_username_bytes(&payload) {
        return Err(DecodeError::InvalidUsername);
    }
    Ok(String::from_utf8(payload.to_vec()).expect("username bytes are ascii"))
}

/// Payloads that are exactly one uuid (RemoveFriend, UnblockUser,
/// FriendOffline).
pub fn decode_uuid_payload(mut payload: Bytes) -> Result<UserId, DecodeError> {
    let id = take_uuid(&mut payload)?;
    if !payload.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(id)
}

pub fn encode_uuid_payload(kind: FrameKind, id: &UserId) -> Frame {
    let mut dst = BytesMut::with_capacity(16);
    put_uuid(&mut dst, id);
    Frame::new(kind, dst.freeze())
}

/// RespondFriendRequest payload: the requester uuid plus a decision
/// byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FriendDecision {
    pub user_id: UserId,
    pub accept: bool,
}

impl FriendDecision {
    pub fn decode(mut payload: Bytes) -> Result<FriendDecision, DecodeError> {
        let user_id = take_uuid(&mut payload)?;
        let accept = take_u8(&mut payload)? == ACCEPT_FRIEND_REQUEST;
        Ok(FriendDecision { user_id, accept })
    }

    pub fn encode(&self) -> Frame {
        let mut dst = BytesMut::with_capacity(17);
        put_uuid(&mut dst, &self.user_id);
        dst.put_u8(self.accept as u8);
        Frame::new(FrameKind::RespondFriendRequest, dst.freeze())
    }
}

/// Direct message: peer uuid then the text. Inbound the uuid names the
/// recipient; outbound it names the sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextMessage {
    pub user_id: UserId,
    pub text: Vec<u8>,
}

impl TextMessage {
    pub fn decode(mut payload: Bytes) -> Result<TextMessage, DecodeError> {
        let user_id = take_uuid(&mut payload)?;
        let remaining = payload.len();
        let text = take_bytes(&mut payload, remaining)?.to_vec();
        Ok(TextMessage { user_id, text })
    }

    pub fn encode(&self, kind: FrameKind) -> Frame {
        let mut dst = BytesMut::with_capacity(16 + self.text.len());
        put_uuid(&mut dst, &self.user_id);
        dst.put_slice(&self.text);
        Frame::new(kind, dst.freeze())
    }
}

/// In-match chat as delivered to other participants: sender uuid,
/// length-prefixed sender username, then the text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchMessage {
    pub user_id: UserId,
    pub sender_username: String,
    pub text: Vec<u8>,
}

impl MatchMessage {
    pub fn encode(&self) -> Frame {
        let mut dst =
            BytesMut::with_capacity(17 + self.sender_username.len() + self.text.len());
        put_user_entry(&mut dst, &self.user_id, &self.sender_username);
        dst.put_slice(&self.text);
        Frame::new(FrameKind::MatchTextMessage, dst.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<MatchMessage, DecodeError> {
        let user_id = take_uuid(&mut payload)?;
        let sender_username = take_username(&mut payload)?;
        let remaining = payload.len();
        let text = take_bytes(&mut payload, remaining)?.to_vec();
        Ok(MatchMessage {
            user_id,
            sender_username,
            text,
        })
    }
}
