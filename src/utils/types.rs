use uuid::Uuid;

/// Monotonically allocated connection identifier
pub type SessionId = u64;
/// Server-local identifier for a live match
pub type MatchId = u64;
/// Seat index within a match, in `[0, N)`
pub type PlayerId = u8;
/// Index into a match's tank table
pub type TankId = u8;
/// Persistent account identifier
pub type UserId = Uuid;
