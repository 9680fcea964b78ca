use log::LevelFilter;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::{env, fs::read_to_string, path::Path};

/// The server version extracted from the Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable key to load the config from
const CONFIG_ENV_KEY: &str = "SF_CONFIG_JSON";

pub fn load_config() -> Option<Config> {
    // Attempt to load the config from the env
    if let Ok(env) = env::var(CONFIG_ENV_KEY) {
        let config: Config = match serde_json::from_str(&env) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("Failed to load env config (Using default): {:?}", err);
                return None;
            }
        };
        return Some(config);
    }

    // Attempt to load the config from disk
    let file = Path::new("config.json");
    if !file.exists() {
        return None;
    }

    let data = match read_to_string(file) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using defaults): {:?}", err);
            return None;
        }
    };

    let config: Config = match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using default): {:?}", err);
            return None;
        }
    };

    Some(config)
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: IpAddr,
    pub port: u16,
    pub logging: LevelFilter,
    pub max_sessions: usize,
    /// Asset names resolved through the data directory
    pub certificate: String,
    pub private_key: String,
    pub map_index: String,
    /// Accounts created in the in-memory store at startup
    pub seed_users: Vec<SeedUser>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 49656,
            logging: LevelFilter::Info,
            max_sessions: crate::server::DEFAULT_MAX_SESSIONS,
            certificate: "certs/server-cert.pem".to_string(),
            private_key: "certs/server-key.pem".to_string(),
            map_index: "mapfile.txt".to_string(),
            seed_users: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
pub struct SeedUser {
    pub username: String,
    pub password: String,
}
