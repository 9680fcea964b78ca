//! Map assets: the map index, per-map environment files and the
//! repository matches draw random maps from.

use std::collections::HashMap;
use std::sync::Arc;

use rand::seq::SliceRandom;
use thiserror::Error;

use crate::utils::assets;

use super::grid::CellKind;
use super::{GameMode, MODE_COUNT, NO_TANK};

/// Static description of one map, as carried in match results and
/// replays: environment file name, dimensions, tanks per player,
/// player count and the mode the map belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MapDescriptor {
    pub filename: String,
    pub width: u8,
    pub height: u8,
    pub tanks_per_player: u8,
    pub num_players: u8,
    pub mode: u8,
}

/// A fully loaded map: descriptor plus terrain and placement mask.
#[derive(Debug, Clone)]
pub struct GameMap {
    pub descriptor: MapDescriptor,
    pub kinds: Vec<CellKind>,
    /// One byte per tile naming the sole seat allowed to place there,
    /// `NO_PLAYER` elsewhere
    pub mask: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum MapError {
    #[error("map index {0} could not be resolved")]
    MissingIndex(String),
    #[error("failed to read {0}: {1}")]
    Io(String, std::io::Error),
    #[error("map index line {0} is malformed")]
    MalformedIndex(usize),
    #[error("map {0} has out of range dimensions or counts")]
    InvalidValues(String),
    #[error("map {0} player count does not match its mode")]
    PlayerCountMismatch(String),
    #[error("map {0} would exhaust the tank id space")]
    TooManyTanks(String),
    #[error("environment file {0} could not be resolved")]
    MissingEnvironment(String),
    #[error("environment file {0} has the wrong size")]
    SizeMismatch(String),
    #[error("environment file {0} contains an invalid terrain byte")]
    InvalidTerrain(String),
}

/// All maps known to the server, grouped by mode.
pub struct MapRepository {
    by_mode: HashMap<u8, Vec<Arc<GameMap>>>,
}

impl MapRepository {
    /// Parses the map index asset (`name W H tanks players mode` per
    /// entry, whitespace separated) and loads every referenced
    /// environment file. Any inconsistency fails startup.
    pub fn load(index_asset: &str) -> Result<MapRepository, MapError> {
        let index_path = assets::resolve(index_asset)
            .ok_or_else(|| MapError::MissingIndex(index_asset.to_string()))?;
        let index = std::fs::read_to_string(&index_path)
            .map_err(|err| MapError::Io(index_asset.to_string(), err))?;

        let mut by_mode: HashMap<u8, Vec<Arc<GameMap>>> = HashMap::new();

        let fields: Vec<&str> = index.split_whitespace().collect();
        if fields.len() % 6 != 0 {
            return Err(MapError::MalformedIndex(fields.len() / 6));
        }

        for (entry, chunk) in fields.chunks_exact(6).enumerate() {
            let name = chunk[0].to_string();
            let numbers: Vec<u16> = chunk[1..]
                .iter()
                .map(|field| field.parse::<u16>())
                .collect::<Result<_, _>>()
                .map_err(|_| MapError::MalformedIndex(entry))?;
            let (width, height, tanks, players, mode) = (
                numbers[0], numbers[1], numbers[2], numbers[3], numbers[4],
            );

            // Dimensions of 255 would defeat the unsigned wrap checks
            if !(1..255).contains(&width)
                || !(1..255).contains(&height)
                || !(1..255).contains(&tanks)
                || !(1..255).contains(&players)
                || mode >= MODE_COUNT as u16
            {
                return Err(MapError::InvalidValues(name));
            }

            let game_mode = GameMode::from_byte(mode as u8)
                .ok_or_else(|| MapError::InvalidValues(name.clone()))?;
            if game_mode.players() != players as u8 {
                return Err(MapError::PlayerCountMismatch(name));
            }

            if players * tanks >= NO_TANK as u16 {
                return Err(MapError::TooManyTanks(name));
            }

            let descriptor = MapDescriptor {
                filename: name,
                width: width as u8,
                height: height as u8,
                tanks_per_player: tanks as u8,
                num_players: players as u8,
                mode: mode as u8,
            };

            let map = load_environment(descriptor)?;
            by_mode
                .entry(map.descriptor.mode)
                .or_default()
                .push(Arc::new(map));
        }

        Ok(MapRepository { by_mode })
    }

    /// Repository built from already loaded maps, used by tests and
    /// embedded setups.
    pub fn from_maps(maps: Vec<GameMap>) -> MapRepository {
        let mut by_mode: HashMap<u8, Vec<Arc<GameMap>>> = HashMap::new();
        for map in maps {
            by_mode
                .entry(map.descriptor.mode)
                .or_default()
                .push(Arc::new(map));
        }
        MapRepository { by_mode }
    }

    /// Uniformly random map for the mode, if the mode has any.
    pub fn random_map(&self, mode: GameMode) -> Option<Arc<GameMap>> {
        self.by_mode
            .get(&(mode as u8))?
            .choose(&mut rand::thread_rng())
            .cloned()
    }

    pub fn count_for(&self, mode: GameMode) -> usize {
        self.by_mode.get(&(mode as u8)).map_or(0, Vec::len)
    }
}

/// Reads one environment file: W*H ASCII terrain digits followed by
/// W*H raw placement mask bytes.
fn load_environment(descriptor: MapDescriptor) -> Result<GameMap, MapError> {
    let asset_name = format!("envs/{}", descriptor.filename);
    let path = assets::resolve(&asset_name)
        .ok_or_else(|| MapError::MissingEnvironment(asset_name.clone()))?;
    let raw = std::fs::read(&path).map_err(|err| MapError::Io(asset_name.clone(), err))?;

    let total = descriptor.width as usize * descriptor.height as usize;
    if raw.len() != total * 2 {
        return Err(MapError::SizeMismatch(asset_name));
    }

    let kinds: Vec<CellKind> = raw[..total]
        .iter()
        .map(|byte| CellKind::from_byte(byte.wrapping_sub(b'0')))
        .collect::<Option<_>>()
        .ok_or(MapError::InvalidTerrain(asset_name))?;

    let mask = raw[total..].to_vec();

    Ok(GameMap {
        descriptor,
        kinds,
        mask,
    })
}

#[cfg(test)]
pub(crate) mod test_maps {
    use super::{GameMap, MapDescriptor};
    use crate::game::grid::CellKind;
    use crate::game::{GameMode, NO_PLAYER};

    /// Open 8x8 two player map: player 0 places on the left column,
    /// player 1 on the right.
    pub fn open_two_player(mode: GameMode) -> GameMap {
        let width = 8u8;
        let height = 8u8;
        let total = width as usize * height as usize;

        let mut mask = vec![NO_PLAYER; total];
        for y in 0..height as usize {
            mask[y * width as usize] = 0;
            mask[y * width as usize + width as usize - 1] = 1;
        }

        GameMap {
            descriptor: MapDescriptor {
                filename: "open8.env".to_string(),
                width,
                height,
                tanks_per_player: 2,
                num_players: 2,
                mode: mode as u8,
            },
            kinds: vec![CellKind::Open; total],
            mask,
        }
    }
}
