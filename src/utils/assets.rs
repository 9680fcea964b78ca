//! Resolution of data files (map index, environments, TLS material)
//! against the platform user-data directory.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Environment variable that overrides the data directory entirely
pub const DATA_DIR_ENV: &str = "STEELFOG_DATA";

/// Directory name under the OS data location
const APP_DIR_NAME: &str = "steelfog-server";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("required assets are missing: {0:?}")]
    Missing(Vec<String>),
}

/// Candidate directories in resolution order: env override, the OS
/// standard data location, then the working directory for development
/// builds run straight out of the repository.
fn search_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::with_capacity(3);

    if let Ok(path) = env::var(DATA_DIR_ENV) {
        dirs.push(PathBuf::from(path));
    }

    if let Some(data) = dirs::data_dir() {
        dirs.push(data.join(APP_DIR_NAME));
    }

    if cfg!(debug_assertions) {
        if let Ok(cwd) = env::current_dir() {
            dirs.push(cwd);
        }
    }

    dirs
}

/// Resolves a relative asset name to the first existing path.
pub fn resolve(name: &str) -> Option<PathBuf> {
    search_dirs()
        .into_iter()
        .map(|dir| dir.join(name))
        .find(|path| path.is_file())
}

/// Startup check that every required asset is present.
pub fn ensure_present(names: &[&str]) -> Result<(), AssetError> {
    let missing: Vec<String> = names
        .iter()
        .filter(|name| resolve(name).is_none())
        .map(|name| name.to_string())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(AssetError::Missing(missing))
    }
}

#[cfg(test)]
mod test {
    use super::{ensure_present, resolve, DATA_DIR_ENV};

    #[test]
    fn env_override_wins() {
        let dir = std::env::temp_dir().join("steelfog-asset-test");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("probe.txt"), b"x").unwrap();

        std::env::set_var(DATA_DIR_ENV, &dir);
        let found = resolve("probe.txt");
        std::env::remove_var(DATA_DIR_ENV);

        assert_eq!(found, Some(dir.join("probe.txt")));
    }

    #[test]
    fn missing_assets_reported() {
        let err = ensure_present(&["definitely-not-a-real-asset.bin"]).unwrap_err();
        let super::AssetError::Missing(names) = err;
        assert_eq!(names, vec!["definitely-not-a-real-asset.bin".to_string()]);
    }
}
