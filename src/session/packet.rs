#![allow(unused)]

//! Frame layer: every message on the wire is a fixed five byte header
//! (kind + big-endian payload length) followed by the payload.
//!
//! Kind discriminants and the per-direction size rules are part of the
//! protocol and must not be reordered.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Encoder;

use crate::session::models::MAX_USERNAME_LEN;
use crate::utils::hashing::HASH_LENGTH;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 5;

/// Upper bound for payloads travelling towards the server
pub const MAX_SERVER_PAYLOAD: u32 = 3000;

/// Upper bound for payloads travelling towards the client, with a
/// single carve-out for match replay frames
pub const MAX_CLIENT_PAYLOAD: u32 = 8000;

/// Serialized size of a command payload
pub const COMMAND_SIZE: u32 = 7;

/// Enumerated frame kinds shared by both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    LoginRequest = 0,
    RegistrationRequest = 1,

    // Server messages to the client for auth/register
    Unauthorized = 2,
    AlreadyAuthorized = 3,
    GoodRegistration = 4,
    BadRegistration = 5,
    GoodAuth = 6,
    BadAuth = 7,

    // Fetch requests when the client connects
    FetchFriends = 8,
    FetchFriendRequests = 9,
    FetchBlocks = 10,

    // Server list callback kinds
    FriendList = 11,
    FriendRequestList = 12,
    BlockList = 13,

    // User requests for friending/blocking
    SendFriendRequest = 14,
    RespondFriendRequest = 15,
    RemoveFriend = 16,
    BlockUser = 17,
    UnblockUser = 18,

    // Notifications for friending/blocking
    NotifyFriendAdded = 19,
    NotifyFriendRemoved = 20,
    NotifyFriendRequest = 21,
    NotifyBlocked = 22,
    NotifyUnblocked = 23,

    // Queue related requests
    QueueMatch = 24,
    BadQueue = 25,
    CancelMatch = 26,
    ForfeitMatch = 27,
    BadCancel = 28,
    QueueDropped = 29,

    // Game related kinds
    MatchStarting = 30,
    MatchCreationError = 31,
    NoMatchFound = 32,
    MatchInProgress = 33,
    SendCommand = 34,
    StaticMatchData = 35,
    PlayerView = 36,
    FailedMove = 37,
    StaleMove = 38,
    Eliminated = 39,
    TimedOut = 40,
    Victory = 41,
    GameEnded = 42,

    // Connection management kinds
    BadMessage = 43,
    Ping = 44,
    PingResponse = 45,
    PingTimeout = 46,
    RateLimited = 47,
    Banned = 48,
    ServerFull = 49,

    // Communication
    DirectTextMessage = 50,
    MatchTextMessage = 51,
    FriendOffline = 52,

    // Match data kinds
    FetchMatchHistory = 53,
    MatchHistory = 54,
    NoNewMatches = 55,
    MatchReplayRequest = 56,
    MatchReplay = 57,
    NoReplay = 58,
}

/// One past the last valid kind
pub const MAX_FRAME_KIND: u8 = 59;

impl FrameKind {
    pub fn from_byte(value: u8) -> Option<FrameKind> {
        use FrameKind::*;
        Some(match value {
            0 => LoginRequest,
            1 => RegistrationRequest,
            2 => Unauthorized,
            3 => AlreadyAuthorized,
            4 => GoodRegistration,
            5 => BadRegistration,
            6 => GoodAuth,
            7 => BadAuth,
            8 => FetchFriends,
            9 => FetchFriendRequests,
            10 => FetchBlocks,
            11 => FriendList,
            12 => FriendRequestList,
            13 => BlockList,
            14 => SendFriendRequest,
            15 => RespondFriendRequest,
            16 => RemoveFriend,
            17 => BlockUser,
            18 => UnblockUser,
            19 => NotifyFriendAdded,
            20 => NotifyFriendRemoved,
            21 => NotifyFriendRequest,
            22 => NotifyBlocked,
            23 => NotifyUnblocked,
            24 => QueueMatch,
            25 => BadQueue,
            26 => CancelMatch,
            27 => ForfeitMatch,
            28 => BadCancel,
            29 => QueueDropped,
            30 => MatchStarting,
            31 => MatchCreationError,
            32 => NoMatchFound,
            33 => MatchInProgress,
            34 => SendCommand,
            35 => StaticMatchData,
            36 => PlayerView,
            37 => FailedMove,
            38 => StaleMove,
            39 => Eliminated,
            40 => TimedOut,
            41 => Victory,
            42 => GameEnded,
            43 => BadMessage,
            44 => Ping,
            45 => PingResponse,
            46 => PingTimeout,
            47 => RateLimited,
            48 => Banned,
            49 => ServerFull,
            50 => DirectTextMessage,
            51 => MatchTextMessage,
            52 => FriendOffline,
            53 => FetchMatchHistory,
            54 => MatchHistory,
            55 => NoNewMatches,
            56 => MatchReplayRequest,
            57 => MatchReplay,
            58 => NoReplay,
            _ => return None,
        })
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub kind: FrameKind,
    pub length: u32,
}

impl FrameHeader {
    /// Parses a header from its five wire bytes. `None` for unknown
    /// kinds; length bounds are checked per direction afterwards.
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Option<FrameHeader> {
        let kind = FrameKind::from_byte(bytes[0])?;
        let length = u32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
        Some(FrameHeader { kind, length })
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.put_u8(self.kind as u8);
        dst.put_u32(self.length);
    }

    /// Validation for frames arriving at the server.
    pub fn valid_server(&self) -> bool {
        use FrameKind::*;

        if self.length > MAX_SERVER_PAYLOAD {
            return false;
        }

        match self.kind {
            QueueMatch | CancelMatch | FetchMatchHistory => self.length == 1,
            SendCommand => self.length == COMMAND_SIZE,
            DirectTextMessage | MatchTextMessage => self.length >= 17,
            ForfeitMatch => self.length == 0,
            SendFriendRequest | BlockUser => {
                self.length >= 1 && self.length <= MAX_USERNAME_LEN as u32
            }
            RespondFriendRequest => self.length == 17,
            RemoveFriend | UnblockUser => self.length == 16,
            MatchReplayRequest => self.length == 8,
            LoginRequest | RegistrationRequest => {
                self.length > HASH_LENGTH as u32
                    && self.length <= (HASH_LENGTH + MAX_USERNAME_LEN) as u32
            }
            _ => true,
        }
    }

    /// Validation for frames arriving at a client. The server applies
    /// it in tests to everything it emits.
    pub fn valid_client(&self) -> bool {
        use FrameKind::*;

        if self.length > MAX_CLIENT_PAYLOAD && self.kind != MatchReplay {
            return false;
        }

        match self.kind {
            GoodAuth => self.length == 4 * crate::game::RANKED_MODES_COUNT as u32,
            DirectTextMessage => self.length >= 17,
            BadAuth | BadRegistration => self.length == 1,
            MatchHistory => self.length >= 1,
            _ => true,
        }
    }
}

/// A decoded frame: header kind plus payload bytes. Cloning is cheap,
/// the payload is reference counted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, payload: Bytes) -> Frame {
        Frame { kind, payload }
    }

    /// Header-only frame with an empty payload.
    pub fn empty(kind: FrameKind) -> Frame {
        Frame {
            kind,
            payload: Bytes::new(),
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            kind: self.kind,
            length: self.payload.len() as u32,
        }
    }

    pub fn write(&self, dst: &mut BytesMut) {
        dst.reserve(HEADER_SIZE + self.payload.len());
        self.header().write(dst);
        dst.extend_from_slice(&self.payload);
    }
}

/// Tokio codec for the write half of a session.
pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.write(dst);
        Ok(())
    }
}
