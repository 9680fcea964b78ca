//! One match's authoritative game state and the rules applied to it.

use super::grid::Grid;
use super::maps::GameMap;
use super::player::PlayerSlot;
use super::tank::Tank;
use super::{
    DIR_TO_VEC, FIRING_DIST_DIAGONAL, FIRING_DIST_ORTHOGONAL, NO_OCCUPANT, SHELL_DAMAGE,
};

/// Owns the grid, the tank table and the per-seat placement records
/// for a single match.
pub struct GameInstance {
    pub(crate) num_players: u8,
    pub(crate) tanks_per_player: u8,
    pub(crate) grid: Grid,
    pub(crate) placement_mask: Vec<u8>,
    pub(crate) tanks: Vec<Tank>,
    pub(crate) players: Vec<PlayerSlot>,
}

impl GameInstance {
    pub fn new(map: &GameMap) -> GameInstance {
        let descriptor = &map.descriptor;
        let tank_count = descriptor.num_players as usize * descriptor.tanks_per_player as usize;

        GameInstance {
            num_players: descriptor.num_players,
            tanks_per_player: descriptor.tanks_per_player,
            grid: Grid::from_kinds(descriptor.width, descriptor.height, &map.kinds),
            placement_mask: map.mask.clone(),
            tanks: vec![Tank::default(); tank_count],
            players: (0..descriptor.num_players)
                .map(|_| PlayerSlot::new(descriptor.tanks_per_player))
                .collect(),
        }
    }

    #[inline]
    pub fn tanks_per_player(&self) -> u8 {
        self.tanks_per_player
    }

    #[inline]
    pub fn tank_count(&self) -> u8 {
        (self.tanks.len()) as u8
    }

    #[inline]
    pub fn tank(&self, id: u8) -> &Tank {
        &self.tanks[id as usize]
    }

    #[inline]
    pub fn player(&self, id: u8) -> &PlayerSlot {
        &self.players[id as usize]
    }

    pub fn placement_mask(&self) -> &[u8] {
        &self.placement_mask
    }

    /// Attempts to move a tank one cell along its body direction, or
    /// the opposite direction when `reverse` is set. Returns whether
    /// the move committed.
    pub fn move_tank(&mut self, id: u8, reverse: bool) -> bool {
        let tank = self.tanks[id as usize];
        let dir = if reverse {
            (tank.direction + 4) % 8
        } else {
            tank.direction
        };

        let (dx, dy) = DIR_TO_VEC[dir as usize];
        let nx = tank.x.wrapping_add(dx as u8);
        let ny = tank.y.wrapping_add(dy as u8);

        if !self.grid.contains(nx, ny) {
            return false;
        }

        let target = self.grid.cell(nx, ny);
        if target.occupied() || target.kind.blocks() {
            return false;
        }

        // No slipping between two diagonal blockers: when both cells
        // adjacent along the diagonal are terrain the gap is closed
        if dx != 0 && dy != 0 {
            let side_a = self.grid.cell(nx, tank.y);
            let side_b = self.grid.cell(tank.x, ny);
            if side_a.kind.blocks() && side_b.kind.blocks() {
                return false;
            }
        }

        self.grid.set_occupant(tank.x, tank.y, NO_OCCUPANT);
        self.grid.set_occupant(nx, ny, id);
        let tank = &mut self.tanks[id as usize];
        tank.x = nx;
        tank.y = ny;
        true
    }

    /// Rotates the body one step; 0 selects clockwise.
    pub fn rotate_tank(&mut self, id: u8, dir: u8) {
        let tank = &mut self.tanks[id as usize];
        if dir == 0 {
            tank.turn_clockwise();
        } else {
            tank.turn_counter_clockwise();
        }
    }

    /// Rotates the barrel one step; 0 selects clockwise.
    pub fn rotate_barrel(&mut self, id: u8, dir: u8) {
        let tank = &mut self.tanks[id as usize];
        if dir == 0 {
            tank.barrel_clockwise();
        } else {
            tank.barrel_counter_clockwise();
        }
    }

    /// Fires along the barrel direction. The shell is spent whether or
    /// not anything is hit. Returns whether an occupant was hit.
    pub fn fire_tank(&mut self, id: u8) -> bool {
        let tank = self.tanks[id as usize];
        let (dx, dy) = DIR_TO_VEC[tank.barrel as usize];

        let range = if dx != 0 && dy != 0 {
            FIRING_DIST_DIAGONAL
        } else {
            FIRING_DIST_ORTHOGONAL
        };

        self.tanks[id as usize].loaded = false;

        let mut x = tank.x;
        let mut y = tank.y;
        for _ in 0..range {
            x = x.wrapping_add(dx as u8);
            y = y.wrapping_add(dy as u8);

            if !self.grid.contains(x, y) {
                return false;
            }

            let cell = self.grid.cell(x, y);
            if cell.kind.blocks() {
                return false;
            }

            if cell.occupied() {
                let victim_id = cell.occupant;
                let victim = &mut self.tanks[victim_id as usize];
                victim.deal_damage(SHELL_DAMAGE);

                if !victim.alive() {
                    let (vx, vy) = (victim.x, victim.y);
                    self.grid.set_occupant(vx, vy, NO_OCCUPANT);
                }
                return true;
            }
        }

        false
    }

    pub fn load_tank(&mut self, id: u8) {
        self.tanks[id as usize].loaded = true;
    }

    /// Whether `player` may place a tank at (x, y): the tile is inside
    /// the grid, stamped for this seat, not terrain and unoccupied.
    pub fn check_placement(&self, x: u8, y: u8, player: u8) -> bool {
        if !self.grid.contains(x, y) {
            return false;
        }

        let idx = self.grid.idx(x, y);
        if self.placement_mask[idx] != player {
            return false;
        }

        let cell = self.grid.cell(x, y);
        !cell.kind.blocks() && !cell.occupied()
    }

    /// Commits a placement the caller has validated, allocating the
    /// seat's next tank id. Returns the new tank's id.
    pub fn place_tank(&mut self, x: u8, y: u8, player: u8, barrel: u8) -> u8 {
        let slot = &mut self.players[player as usize];
        let tank_id = slot.tanks_placed + player * self.tanks_per_player;

        self.tanks[tank_id as usize] = Tank::placed(x, y, player, barrel);
        self.grid.set_occupant(x, y, tank_id);
        slot.record_placement(tank_id);

        tank_id
    }

    /// Kills every tank a seat has placed and clears their occupancy,
    /// used when the seat is eliminated.
    pub fn destroy_player_tanks(&mut self, player: u8) {
        let ids: Vec<u8> = self.players[player as usize].placed_tanks().to_vec();
        for id in ids {
            let tank = &mut self.tanks[id as usize];
            tank.health = 0;
            let (x, y) = (tank.x, tank.y);
            if self.grid.cell(x, y).occupant == id {
                self.grid.set_occupant(x, y, NO_OCCUPANT);
            }
        }
    }
}
