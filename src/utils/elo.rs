//! Rating updates for ranked matches.
//!
//! Standard Elo generalised to N players: placements are normalised to
//! scores in [0, 1], expected scores are averaged over all pairwise
//! matchups and the K factor is scaled with log2 of the player count.

/// Rating given to a freshly registered account.
pub const DEFAULT_ELO: i32 = 1500;

/// K factor for a two player match.
pub const K_TWO_PLAYERS: i32 = 32;

/// Ratings are clamped so they never fall below this floor.
pub const ELO_FLOOR: i32 = 500;

/// Rating difference (in units of 400) beyond which the expected score
/// is treated as 0 or 1 outright. 7.0 corresponds to 1 : 10^7 odds.
const ELO_DIFF_UPPER: f64 = 7.0;
const ELO_DIFF_LOWER: f64 = -7.0;

/// Computes updated ratings for a finished match.
///
/// `initial` and `placement` are both indexed by player id. Placements
/// run from 0 (first eliminated) to N - 1 (survivor). Returns the new
/// ratings, also indexed by player id.
pub fn elo_updates(initial: &[i32], placement: &[u8]) -> Vec<i32> {
    let n = placement.len();

    // A walkover cannot move ratings
    if n <= 1 || initial.len() != n {
        return initial.to_vec();
    }

    // S_i = placement_i / (N - 1)
    let normalized: Vec<f64> = placement
        .iter()
        .map(|p| f64::from(*p) / (n as f64 - 1.0))
        .collect();

    // E_i = 1/(N-1) * sum_j (1 / (1 + 10^((R_j - R_i) / 400)))
    let mut expected = vec![0.0f64; n];
    for i in 0..n {
        for j in 0..n {
            if i == j {
                continue;
            }

            let diff = f64::from(initial[j] - initial[i]) / 400.0;

            expected[i] += if diff > ELO_DIFF_UPPER {
                0.0
            } else if diff < ELO_DIFF_LOWER {
                1.0
            } else {
                1.0 / (1.0 + 10f64.powf(diff))
            };
        }

        expected[i] /= n as f64 - 1.0;
    }

    let k_scaled = f64::from(K_TWO_PLAYERS) * (n as f64).log2();

    (0..n)
        .map(|i| {
            let delta = k_scaled * (normalized[i] - expected[i]);
            let updated = (f64::from(initial[i]) + delta).round() as i32;
            updated.max(ELO_FLOOR)
        })
        .collect()
}
