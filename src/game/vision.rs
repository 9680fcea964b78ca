//! Fog-of-war computation.
//!
//! Each live tank projects a bundle of rays around its barrel
//! direction. Orthogonal aims use seven rays with rational slopes
//! forming a cone three cells wide at distance two; diagonal aims use
//! nine parametric rays stepped at half-cell resolution. All arithmetic
//! is f32: the tables were tuned against f32 rounding (notably
//! 1/3 * 3 rounding to exactly 1.0) and the resulting visibility
//! bitmaps are pinned by the fixtures below.

use super::grid::Grid;
use super::instance::GameInstance;
use super::tank::Tank;
use super::{GamePhase, NO_OCCUPANT, NO_TANK};

/// Slopes of the seven rays for an east aim; mirrored for the other
/// orthogonal directions.
const ORTHO_SLOPES: [f32; 7] = [1.0, 0.5, 1.0 / 3.0, 0.0, -1.0 / 3.0, -0.5, -1.0];

/// Per-ray maximum range matching `ORTHO_SLOPES`.
const ORTHO_RANGES: [u8; 7] = [2, 2, 3, 4, 3, 2, 2];

/// Slope vectors of the nine rays for a south-east aim.
const DIAG_SLOPES: [(f32, f32); 9] = [
    (0.0, 1.0),
    (1.0, 3.0),
    (1.0, 2.0),
    (2.0, 3.0),
    (1.0, 1.0),
    (3.0, 2.0),
    (2.0, 1.0),
    (3.0, 1.0),
    (1.0, 0.0),
];

/// Precomputed L2 norms of `DIAG_SLOPES`.
const DIAG_NORMS: [f32; 9] = [
    1.0, 3.162_277_7, 2.236_068, 3.605_551_3, 1.414_213_6, 3.605_551_3, 2.236_068, 3.162_277_7,
    1.0,
];

/// Per-ray maximum range matching `DIAG_SLOPES`.
const DIAG_RANGES: [f32; 9] = [2.0, 1.0, 1.0, 1.0, 3.0, 1.0, 1.0, 1.0, 2.0];

/// Fractional offsets within (0.5 - EPS, 0.5 + EPS) graze the cell
/// boundary and skip the terrain test, keeping the cone edges
/// permissive.
const GRAZE_EPS: f32 = 1e-3;

/// Tank state exposed to a player's client, one record per tank
/// standing on a visible cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibleTank {
    pub x: u8,
    pub y: u8,
    pub direction: u8,
    pub barrel: u8,
    pub tank_id: u8,
    pub health: u8,
    pub aim_focused: bool,
    pub loaded: bool,
    pub owner: u8,
}

impl VisibleTank {
    fn from_tank(tank_id: u8, tank: &Tank) -> VisibleTank {
        VisibleTank {
            x: tank.x,
            y: tank.y,
            direction: tank.direction,
            barrel: tank.barrel,
            tank_id,
            health: tank.health,
            aim_focused: tank.aim_focused,
            loaded: tank.loaded,
            owner: tank.owner,
        }
    }
}

/// Per-player rendered state at one point in time. The grid slice and
/// tank list come from vision; the cursor, fuel, phase and clocks are
/// filled in by the match runtime before broadcast.
#[derive(Debug, Clone)]
pub struct PlayerView {
    pub grid: Grid,
    pub visible_tanks: Vec<VisibleTank>,
    pub timers_ms: Vec<i64>,
    pub current_player: u8,
    pub current_fuel: u8,
    pub phase: GamePhase,
}

impl GameInstance {
    /// Computes the fog-of-war view for one player. Pure with respect
    /// to the instance: repeated calls return equal views. Also
    /// returns the player's live tank count, which drives implicit
    /// elimination.
    pub fn compute_view(&self, player: u8) -> (PlayerView, u8) {
        let mut view = self.grid.fogged();
        let mut live_tanks = 0u8;

        for &tank_id in self.players[player as usize].owned() {
            if tank_id == NO_TANK {
                continue;
            }

            let tank = &self.tanks[tank_id as usize];
            if !tank.alive() {
                continue;
            }
            live_tanks += 1;

            let own = view.cell_mut(tank.x, tank.y);
            own.occupant = tank_id;
            own.visible = true;

            // Focused aim is declared but its pattern is not defined
            // yet; a focused tank sees only its own cell
            if tank.aim_focused {
                continue;
            }

            if tank.barrel % 2 == 0 {
                self.orthogonal_rays(&mut view, tank);
            } else {
                for r in 0..9 {
                    self.cast_ray(
                        &mut view,
                        (tank.x, tank.y),
                        DIAG_SLOPES[r],
                        DIAG_NORMS[r],
                        DIAG_RANGES[r],
                        tank.barrel,
                    );
                }
            }
        }

        let visible_tanks = view
            .cells()
            .iter()
            .filter(|cell| cell.occupant != NO_OCCUPANT)
            .map(|cell| VisibleTank::from_tank(cell.occupant, &self.tanks[cell.occupant as usize]))
            .collect();

        (
            PlayerView {
                grid: view,
                visible_tanks,
                timers_ms: Vec::new(),
                current_player: 0,
                current_fuel: 0,
                phase: GamePhase::Setup,
            },
            live_tanks,
        )
    }

    /// Seven-ray cone for orthogonal aims. East is the base case;
    /// west flips the march sign, north and south swap the primary
    /// axis to y and negate every slope except the centre ray.
    fn orthogonal_rays(&self, view: &mut Grid, tank: &Tank) {
        for r in 0..7 {
            let mut m = ORTHO_SLOPES[r];
            let max_range = ORTHO_RANGES[r];

            let mut primary = tank.x;
            let mut secondary = tank.y;
            let mut primary_is_y = false;
            let mut p_bound = self.grid.width() as i32 - 1;
            let mut s_bound = self.grid.height() as i32 - 1;
            let mut sign = 1i32;

            match tank.barrel {
                6 => sign = -1,
                0 | 4 => {
                    sign = if tank.barrel == 0 { -1 } else { 1 };
                    primary_is_y = true;
                    primary = tank.y;
                    secondary = tank.x;
                    p_bound = self.grid.height() as i32 - 1;
                    s_bound = self.grid.width() as i32 - 1;
                    if r != 3 {
                        m = -m;
                    }
                }
                _ => {}
            }

            for dx in 1..=max_range as i32 {
                let p = primary as i32 + sign * dx;
                if p < 0 || p > p_bound {
                    break;
                }

                let sec = secondary as f32 + m * dx as f32;
                if sec < 0.0 {
                    break;
                }

                let sec_int = sec.floor() as i32;
                let frac = sec - sec_int as f32;

                if frac > 0.5 + GRAZE_EPS {
                    let neighbour = sec_int + 1;
                    if neighbour > s_bound {
                        break;
                    }
                    let (cx, cy) = if primary_is_y {
                        (neighbour, p)
                    } else {
                        (p, neighbour)
                    };
                    if self.grid.cell(cx as u8, cy as u8).kind.blocks() {
                        break;
                    }
                } else if frac < 0.5 - GRAZE_EPS {
                    if sec_int > s_bound {
                        break;
                    }
                    let (cx, cy) = if primary_is_y {
                        (sec_int, p)
                    } else {
                        (p, sec_int)
                    };
                    if self.grid.cell(cx as u8, cy as u8).kind.blocks() {
                        break;
                    }
                } else {
                    // Grazing the half-grid line: neither neighbour is
                    // tested and nothing is marked
                    continue;
                }

                // The ray contributes a cell only where it crosses the
                // centre line of that cell
                if frac.abs() < GRAZE_EPS {
                    let (cx, cy) = if primary_is_y {
                        (sec_int as u8, p as u8)
                    } else {
                        (p as u8, sec_int as u8)
                    };
                    let cell = view.cell_mut(cx, cy);
                    cell.visible = true;
                    cell.occupant = self.grid.cell(cx, cy).occupant;
                }
            }
        }
    }

    /// Parametric ray r(t) = start + t * slope, stepped at
    /// 0.5 / |slope| so every traversed cell is sampled at least once.
    /// Slopes are laid out for south-east; the other diagonals flip
    /// the axis signs.
    fn cast_ray(
        &self,
        view: &mut Grid,
        start: (u8, u8),
        slope: (f32, f32),
        size: f32,
        max_range: f32,
        dir: u8,
    ) {
        let (x_sign, y_sign): (f32, f32) = match dir % 8 {
            1 => (1.0, -1.0),
            5 => (-1.0, 1.0),
            7 => (-1.0, -1.0),
            _ => (1.0, 1.0),
        };

        let dt = 0.5 / size;
        let x0 = start.0 as f32;
        let y0 = start.1 as f32;

        let mut t = dt;
        while t <= max_range {
            let xt = x0 + t * (x_sign * slope.0);
            let yt = y0 + t * (y_sign * slope.1);

            if xt < 0.0 || yt < 0.0 {
                break;
            }

            let mut cx = xt.floor() as i32;
            let mut cy = yt.floor() as i32;

            // Snap to the closest cell centre
            if xt - cx as f32 > 0.5 {
                cx += 1;
            }
            if yt - cy as f32 > 0.5 {
                cy += 1;
            }

            if cx > self.grid.width() as i32 - 1 || cy > self.grid.height() as i32 - 1 {
                break;
            }

            if self.grid.cell(cx as u8, cy as u8).kind.blocks() {
                break;
            }

            let cell = view.cell_mut(cx as u8, cy as u8);
            cell.visible = true;
            cell.occupant = self.grid.cell(cx as u8, cy as u8).occupant;

            t += dt;
        }
    }
}
