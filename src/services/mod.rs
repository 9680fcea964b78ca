pub mod bans;
pub mod game;
pub mod matchmaking;
pub mod store;
pub mod users;
