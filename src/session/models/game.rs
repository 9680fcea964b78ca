//! In-match payloads: commands, player views and static match data.

use bytes::{BufMut, Bytes, BytesMut};

use crate::game::grid::{CellKind, Grid, GridCell};
use crate::game::vision::{PlayerView, VisibleTank};
use crate::game::GamePhase;
use crate::session::packet::{Frame, FrameKind};
use crate::utils::types::PlayerId;

use super::social::ExternalUser;
use super::{
    put_user_entry, take_bytes, take_i64, take_u16, take_u8, take_username, take_uuid,
    DecodeError,
};

/// Action kinds a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    Move = 0,
    RotateTank = 1,
    RotateBarrel = 2,
    Fire = 3,
    Load = 4,
    Place = 5,
    NoOp = 6,
}

impl CommandKind {
    /// Unknown bytes map to NoOp, which validation rejects.
    pub fn from_byte(value: u8) -> CommandKind {
        match value {
            0 => CommandKind::Move,
            1 => CommandKind::RotateTank,
            2 => CommandKind::RotateBarrel,
            3 => CommandKind::Fire,
            4 => CommandKind::Load,
            5 => CommandKind::Place,
            _ => CommandKind::NoOp,
        }
    }
}

/// One intended action. `sender` is overwritten server-side with the
/// seat bound to the originating session before the command can reach
/// execution, so clients cannot spoof it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub sender: PlayerId,
    pub kind: CommandKind,
    /// Doubles as the placement direction for Place commands
    pub tank_id: u8,
    /// First parameter: reverse flag, rotation sense or placement x
    pub payload: u8,
    /// Second parameter: placement y
    pub payload2: u8,
    /// Client-assigned ordering key within a turn
    pub sequence_number: u16,
}

impl Command {
    pub fn decode(mut payload: Bytes) -> Result<Command, DecodeError> {
        let sender = take_u8(&mut payload)?;
        let kind = CommandKind::from_byte(take_u8(&mut payload)?);
        let tank_id = take_u8(&mut payload)?;
        let first = take_u8(&mut payload)?;
        let second = take_u8(&mut payload)?;
        let sequence_number = take_u16(&mut payload)?;

        Ok(Command {
            sender,
            kind,
            tank_id,
            payload: first,
            payload2: second,
            sequence_number,
        })
    }

    pub fn encode(&self) -> Frame {
        let mut dst = BytesMut::with_capacity(7);
        dst.put_u8(self.sender);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.tank_id);
        dst.put_u8(self.payload);
        dst.put_u8(self.payload2);
        dst.put_u16(self.sequence_number);
        Frame::new(FrameKind::SendCommand, dst.freeze())
    }

    pub fn head(&self) -> CommandHead {
        CommandHead {
            sender: self.sender,
            kind: self.kind,
            tank_id: self.tank_id,
            payload: self.payload,
            payload2: self.payload2,
        }
    }
}

/// A command without its sequence number, as recorded in match
/// histories and replays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHead {
    pub sender: PlayerId,
    pub kind: CommandKind,
    pub tank_id: u8,
    pub payload: u8,
    pub payload2: u8,
}

impl CommandHead {
    pub const SIZE: usize = 5;

    pub(crate) fn put(&self, dst: &mut BytesMut) {
        dst.put_u8(self.sender);
        dst.put_u8(self.kind as u8);
        dst.put_u8(self.tank_id);
        dst.put_u8(self.payload);
        dst.put_u8(self.payload2);
    }

    pub(crate) fn take(payload: &mut Bytes) -> Result<CommandHead, DecodeError> {
        Ok(CommandHead {
            sender: take_u8(payload)?,
            kind: CommandKind::from_byte(take_u8(payload)?),
            tank_id: take_u8(payload)?,
            payload: take_u8(payload)?,
            payload2: take_u8(payload)?,
        })
    }
}

/// MatchStarting payload: the receiver's seat.
pub fn encode_match_starting(player_id: PlayerId) -> Frame {
    Frame::new(
        FrameKind::MatchStarting,
        Bytes::copy_from_slice(&[player_id]),
    )
}

/// Encodes a player view:
/// `n_tanks, current_player, W, H, fuel, state, n_timers`, then W*H
/// cell triples, `n_tanks` nine byte tank records and `n_timers`
/// big-endian i64 milliseconds.
pub fn encode_player_view(view: &PlayerView) -> Frame {
    let grid = &view.grid;
    let total = grid.width() as usize * grid.height() as usize;
    let mut dst =
        BytesMut::with_capacity(7 + total * 3 + view.visible_tanks.len() * 9 + view.timers_ms.len() * 8);

    dst.put_u8(view.visible_tanks.len() as u8);
    dst.put_u8(view.current_player);
    dst.put_u8(grid.width());
    dst.put_u8(grid.height());
    dst.put_u8(view.current_fuel);
    dst.put_u8(view.phase as u8);
    dst.put_u8(view.timers_ms.len() as u8);

    for cell in grid.cells() {
        dst.put_u8(cell.kind as u8);
        dst.put_u8(cell.occupant);
        dst.put_u8(cell.visible as u8);
    }

    for tank in &view.visible_tanks {
        dst.put_u8(tank.x);
        dst.put_u8(tank.y);
        dst.put_u8(tank.direction);
        dst.put_u8(tank.barrel);
        dst.put_u8(tank.tank_id);
        dst.put_u8(tank.health);
        dst.put_u8(tank.aim_focused as u8);
        dst.put_u8(tank.loaded as u8);
        dst.put_u8(tank.owner);
    }

    for timer in &view.timers_ms {
        dst.put_i64(*timer);
    }

    Frame::new(FrameKind::PlayerView, dst.freeze())
}

pub fn decode_player_view(mut payload: Bytes) -> Result<PlayerView, DecodeError> {
    let n_tanks = take_u8(&mut payload)?;
    let current_player = take_u8(&mut payload)?;
    let width = take_u8(&mut payload)?;
    let height = take_u8(&mut payload)?;
    let current_fuel = take_u8(&mut payload)?;
    let phase = GamePhase::from_byte(take_u8(&mut payload)?).ok_or(DecodeError::InvalidValue)?;
    let n_timers = take_u8(&mut payload)?;

    let total = width as usize * height as usize;
    let mut kinds = Vec::with_capacity(total);
    let mut cells = Vec::with_capacity(total);
    for _ in 0..total {
        let kind = CellKind::from_byte(take_u8(&mut payload)?).ok_or(DecodeError::InvalidValue)?;
        let occupant = take_u8(&mut payload)?;
        let visible = take_u8(&mut payload)? != 0;
        kinds.push(kind);
        cells.push((occupant, visible));
    }

    let mut grid = Grid::from_kinds(width, height, &kinds);
    for (idx, (occupant, visible)) in cells.into_iter().enumerate() {
        let x = (idx % width as usize) as u8;
        let y = (idx / width as usize) as u8;
        *grid.cell_mut(x, y) = GridCell {
            kind: kinds[idx],
            occupant,
            visible,
        };
    }

    let mut visible_tanks = Vec::with_capacity(n_tanks as usize);
    for _ in 0..n_tanks {
        visible_tanks.push(VisibleTank {
            x: take_u8(&mut payload)?,
            y: take_u8(&mut payload)?,
            direction: take_u8(&mut payload)?,
            barrel: take_u8(&mut payload)?,
            tank_id: take_u8(&mut payload)?,
            health: take_u8(&mut payload)?,
            aim_focused: take_u8(&mut payload)? != 0,
            loaded: take_u8(&mut payload)? != 0,
            owner: take_u8(&mut payload)?,
        });
    }

    let mut timers_ms = Vec::with_capacity(n_timers as usize);
    for _ in 0..n_timers {
        timers_ms.push(take_i64(&mut payload)?);
    }

    if !payload.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }

    Ok(PlayerView {
        grid,
        visible_tanks,
        timers_ms,
        current_player,
        current_fuel,
        phase,
    })
}

/// Constant per-match data sent at start and on reconnect: the player
/// list and the placement mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticMatchData {
    pub players: Vec<ExternalUser>,
    pub placement_mask: Vec<u8>,
}

impl StaticMatchData {
    pub fn encode(&self) -> Frame {
        let mut dst = BytesMut::new();
        dst.put_u8(self.players.len() as u8);
        for user in &self.players {
            put_user_entry(&mut dst, &user.user_id, &user.username);
        }
        dst.put_slice(&self.placement_mask);
        Frame::new(FrameKind::StaticMatchData, dst.freeze())
    }

    pub fn decode(mut payload: Bytes) -> Result<StaticMatchData, DecodeError> {
        let count = take_u8(&mut payload)?;

        let mut players = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let user_id = take_uuid(&mut payload)?;
            let username = take_username(&mut payload)?;
            players.push(ExternalUser { user_id, username });
        }

        // Everything after the player list is the placement mask
        let remaining = payload.len();
        let placement_mask = take_bytes(&mut payload, remaining)?.to_vec();

        Ok(StaticMatchData {
            players,
            placement_mask,
        })
    }
}
