//! Pure game model: the terrain grid, tank entities, map data and the
//! rules a match runtime validates commands against. Nothing in here
//! touches the network or the clock.

pub mod grid;
pub mod instance;
pub mod maps;
pub mod player;
pub mod tank;
pub mod vision;

/// Health every tank is placed with
pub const INITIAL_HEALTH: u8 = 3;

/// Commands a player may spend per turn during the play phase
pub const TURN_FUEL: u8 = 3;

/// Damage dealt by one shell
pub const SHELL_DAMAGE: u8 = 1;

/// Maximum shell travel in cells
pub const FIRING_DIST_ORTHOGONAL: u8 = 4;
pub const FIRING_DIST_DIAGONAL: u8 = 3;

/// Sentinel for an empty cell / unplaced tank / masked-out tile
pub const NO_OCCUPANT: u8 = u8::MAX;
pub const NO_TANK: u8 = u8::MAX;
pub const NO_PLAYER: u8 = u8::MAX;

/// Compass step vectors indexed by direction, 0 = north, +1 clockwise
pub const DIR_TO_VEC: [(i8, i8); 8] = [
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
    (-1, -1),
];

/// Lifecycle phase of a match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GamePhase {
    Setup = 0,
    Play = 1,
    Concluded = 2,
}

impl GamePhase {
    pub fn from_byte(value: u8) -> Option<GamePhase> {
        match value {
            0 => Some(GamePhase::Setup),
            1 => Some(GamePhase::Play),
            2 => Some(GamePhase::Concluded),
            _ => None,
        }
    }
}

/// Queueable game modes. Ranked modes are grouped at the end so the
/// per-mode elo array can be indexed with `ranked_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GameMode {
    ClassicTwoPlayer = 0,
    ClassicThreePlayer = 1,
    ClassicFivePlayer = 2,
    RankedTwoPlayer = 3,
}

/// Total number of modes
pub const MODE_COUNT: usize = 4;

/// First mode which is ranked
pub const RANKED_MODES_START: usize = 3;

/// Number of ranked modes (length of per-user elo arrays)
pub const RANKED_MODES_COUNT: usize = MODE_COUNT - RANKED_MODES_START;

pub const ALL_MODES: [GameMode; MODE_COUNT] = [
    GameMode::ClassicTwoPlayer,
    GameMode::ClassicThreePlayer,
    GameMode::ClassicFivePlayer,
    GameMode::RankedTwoPlayer,
];

impl GameMode {
    pub fn from_byte(value: u8) -> Option<GameMode> {
        match value {
            0 => Some(GameMode::ClassicTwoPlayer),
            1 => Some(GameMode::ClassicThreePlayer),
            2 => Some(GameMode::ClassicFivePlayer),
            3 => Some(GameMode::RankedTwoPlayer),
            _ => None,
        }
    }

    /// Number of participants a match in this mode seats
    pub fn players(&self) -> u8 {
        match self {
            GameMode::ClassicTwoPlayer | GameMode::RankedTwoPlayer => 2,
            GameMode::ClassicThreePlayer => 3,
            GameMode::ClassicFivePlayer => 5,
        }
    }

    pub fn is_ranked(&self) -> bool {
        (*self as usize) >= RANKED_MODES_START
    }

    /// Index into the per-user elo array, ranked modes only
    pub fn ranked_index(&self) -> Option<usize> {
        (*self as usize).checked_sub(RANKED_MODES_START)
    }
}
