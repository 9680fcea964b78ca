//! Match history, replay and ban payloads.

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, TimeZone, Utc};

use crate::game::maps::MapDescriptor;
use crate::game::GameMode;
use crate::session::packet::{Frame, FrameKind};

use super::game::CommandHead;
use super::social::ExternalUser;
use super::{
    put_user_entry, take_bytes, take_i64, take_u16, take_u32, take_u64, take_u8, take_username,
    take_uuid, DecodeError,
};

/// One finished match as listed in a history response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResultRow {
    pub match_id: i64,
    pub finished_at: DateTime<Utc>,
    pub placement: u16,
    pub elo_change: i32,
}

impl MatchResultRow {
    /// Wire size: id, epoch seconds, placement, elo delta
    pub const SIZE: usize = 8 + 8 + 2 + 4;

    fn put(&self, dst: &mut BytesMut) {
        dst.put_i64(self.match_id);
        dst.put_i64(self.finished_at.timestamp());
        dst.put_u16(self.placement);
        dst.put_i32(self.elo_change);
    }

    fn take(payload: &mut Bytes) -> Result<MatchResultRow, DecodeError> {
        let match_id = take_i64(payload)?;
        let seconds = take_i64(payload)?;
        let finished_at = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or(DecodeError::InvalidValue)?;
        let placement = take_u16(payload)?;
        let elo_change = take_bytes(payload, 4).map(|raw| {
            i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])
        })?;
        Ok(MatchResultRow {
            match_id,
            finished_at,
            placement,
            elo_change,
        })
    }
}

/// MatchHistory payload: one mode byte then the rows.
pub fn encode_match_history(mode: GameMode, rows: &[MatchResultRow]) -> Frame {
    let mut dst = BytesMut::with_capacity(1 + rows.len() * MatchResultRow::SIZE);
    dst.put_u8(mode as u8);
    for row in rows {
        row.put(&mut dst);
    }
    Frame::new(FrameKind::MatchHistory, dst.freeze())
}

pub fn decode_match_history(
    mut payload: Bytes,
) -> Result<(GameMode, Vec<MatchResultRow>), DecodeError> {
    let mode = GameMode::from_byte(take_u8(&mut payload)?).ok_or(DecodeError::InvalidValue)?;

    let mut rows = Vec::new();
    while payload.len() >= MatchResultRow::SIZE {
        rows.push(MatchResultRow::take(&mut payload)?);
    }
    Ok((mode, rows))
}

/// MatchReplayRequest payload: the match id.
pub fn decode_replay_request(mut payload: Bytes) -> Result<u64, DecodeError> {
    take_u64(&mut payload)
}

pub fn encode_replay_request(match_id: u64) -> Frame {
    let mut dst = BytesMut::with_capacity(8);
    dst.put_u64(match_id);
    Frame::new(FrameKind::MatchReplayRequest, dst.freeze())
}

/// Full replay of one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchReplay {
    pub match_id: u64,
    pub initial_time_ms: u64,
    pub increment_ms: u64,
    pub descriptor: MapDescriptor,
    pub players: Vec<ExternalUser>,
    pub moves: Vec<CommandHead>,
}

impl MatchReplay {
    /// Layout: u32 turn count, u16 filename length, u64 initial time,
    /// u64 increment, u64 match id; filename; five descriptor bytes;
    /// player entries; `turn count` command heads.
    pub fn encode(&self) -> Frame {
        let mut dst = BytesMut::new();
        dst.put_u32(self.moves.len() as u32);
        dst.put_u16(self.descriptor.filename.len() as u16);
        dst.put_u64(self.initial_time_ms);
        dst.put_u64(self.increment_ms);
        dst.put_u64(self.match_id);

        dst.put_slice(self.descriptor.filename.as_bytes());
        dst.put_u8(self.descriptor.width);
        dst.put_u8(self.descriptor.height);
        dst.put_u8(self.descriptor.tanks_per_player);
        dst.put_u8(self.descriptor.num_players);
        dst.put_u8(self.descriptor.mode);

        for user in &self.players {
            put_user_entry(&mut dst, &user.user_id, &user.username);
        }

        for head in &self.moves {
            head.put(&mut dst);
        }

        Frame::new(FrameKind::MatchReplay, dst.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<MatchReplay, DecodeError> {
        let turn_count = take_u32(&mut payload)?;
        let filename_len = take_u16(&mut payload)?;
        let initial_time_ms = take_u64(&mut payload)?;
        let increment_ms = take_u64(&mut payload)?;
        let match_id = take_u64(&mut payload)?;

        let raw_name = take_bytes(&mut payload, filename_len as usize)?;
        let filename =
            String::from_utf8(raw_name.to_vec()).map_err(|_| DecodeError::InvalidValue)?;

        let width = take_u8(&mut payload)?;
        let height = take_u8(&mut payload)?;
        let tanks_per_player = take_u8(&mut payload)?;
        let num_players = take_u8(&mut payload)?;
        let mode = take_u8(&mut payload)?;

        let mut players = Vec::with_capacity(num_players as usize);
        for _ in 0..num_players {
            let user_id = take_uuid(&mut payload)?;
            let username = take_username(&mut payload)?;
            players.push(ExternalUser { user_id, username });
        }

        if payload.len() != turn_count as usize * CommandHead::SIZE {
            return Err(DecodeError::InvalidValue);
        }

        let mut moves = Vec::with_capacity(turn_count as usize);
        for _ in 0..turn_count {
            moves.push(CommandHead::take(&mut payload)?);
        }

        Ok(MatchReplay {
            match_id,
            initial_time_ms,
            increment_ms,
            descriptor: MapDescriptor {
                filename,
                width,
                height,
                tanks_per_player,
                num_players,
                mode,
            },
            players,
            moves,
        })
    }
}

/// Banned payload: until-timestamp in epoch seconds then an optional
/// reason string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanMessage {
    pub until: DateTime<Utc>,
    pub reason: String,
}

impl BanMessage {
    pub fn encode(&self) -> Frame {
        let mut dst = BytesMut::with_capacity(8 + self.reason.len());
        dst.put_i64(self.until.timestamp());
        if !self.reason.is_empty() {
            dst.put_slice(self.reason.as_bytes());
        }
        Frame::new(FrameKind::Banned, dst.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<BanMessage, DecodeError> {
        let seconds = take_i64(&mut payload)?;
        let until = Utc
            .timestamp_opt(seconds, 0)
            .single()
            .ok_or(DecodeError::InvalidValue)?;
        let reason =
            String::from_utf8(payload.to_vec()).map_err(|_| DecodeError::InvalidValue)?;
        Ok(BanMessage { until, reason })
    }
}

#[cfg(test)]
mod test {
    use super::{
        decode_match_history, decode_replay_request, encode_match_history, encode_replay_request,
        BanMessage, MatchReplay, MatchResultRow,
    };
    use crate::game::maps::MapDescriptor;
    use crate::game::GameMode;
    use crate::session::models::game::{CommandHead, CommandKind};
    use crate::session::models::social::ExternalUser;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn row(match_id: i64, placement: u16, elo_change: i32) -> MatchResultRow {
        MatchResultRow {
            match_id,
            finished_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            placement,
            elo_change,
        }
    }

    #[test]
    fn history_round_trip() {
        let rows = vec![row(1, 0, -16), row(2, 1, 16)];
        let frame = encode_match_history(GameMode::RankedTwoPlayer, &rows);
        assert_eq!(frame.payload.len(), 1 + 2 * MatchResultRow::SIZE);

        let (mode, decoded) = decode_match_history(frame.payload).unwrap();
        assert_eq!(mode, GameMode::RankedTwoPlayer);
        assert_eq!(decoded, rows);
    }

    #[test]
    fn replay_request_round_trip() {
        let frame = encode_replay_request(0xDEAD_BEEF);
        assert_eq!(decode_replay_request(frame.payload).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn replay_round_trip() {
        let replay = MatchReplay {
            match_id: 77,
            initial_time_ms: 1_200_000,
            increment_ms: 1_000,
            descriptor: MapDescriptor {
                filename: "open8.env".to_string(),
                width: 8,
                height: 8,
                tanks_per_player: 2,
                num_players: 2,
                mode: 0,
            },
            players: vec![
                ExternalUser {
                    user_id: Uuid::new_v4(),
                    username: "alice".to_string(),
                },
                ExternalUser {
                    user_id: Uuid::new_v4(),
                    username: "bob".to_string(),
                },
            ],
            moves: vec![
                CommandHead {
                    sender: 0,
                    kind: CommandKind::Place,
                    tank_id: 2,
                    payload: 0,
                    payload2: 3,
                },
                CommandHead {
                    sender: 1,
                    kind: CommandKind::Move,
                    tank_id: 2,
                    payload: 0,
                    payload2: 0,
                },
            ],
        };

        let frame = replay.encode();
        assert_eq!(MatchReplay::decode(frame.payload).unwrap(), replay);
    }

    #[test]
    fn replay_with_wrong_move_count_rejected() {
        let replay = MatchReplay {
            match_id: 1,
            initial_time_ms: 0,
            increment_ms: 0,
            descriptor: MapDescriptor {
                filename: "m.env".to_string(),
                width: 4,
                height: 4,
                tanks_per_player: 1,
                num_players: 2,
                mode: 0,
            },
            players: vec![],
            moves: vec![],
        };

        // num_players says two but no entries follow
        let mut broken = replay.clone();
        broken.descriptor.num_players = 2;
        assert!(MatchReplay::decode(broken.encode().payload).is_err());
    }

    #[test]
    fn ban_message_round_trip() {
        let message = BanMessage {
            until: Utc.timestamp_opt(1_800_000_000, 0).unwrap(),
            reason: "rude".to_string(),
        };
        let frame = message.encode();
        assert_eq!(BanMessage::decode(frame.payload).unwrap(), message);

        let silent = BanMessage {
            until: Utc.timestamp_opt(1_800_000_000, 0).unwrap(),
            reason: String::new(),
        };
        let frame = silent.encode();
        assert_eq!(frame.payload.len(), 8);
        assert_eq!(BanMessage::decode(frame.payload).unwrap(), silent);
    }
}
