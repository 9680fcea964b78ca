pub mod assets;
pub mod elo;
pub mod hashing;
pub mod tls;
pub mod types;
