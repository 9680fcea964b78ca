//! Password key derivation.
//!
//! Clients never send plain passwords: they derive a 32 byte Argon2id
//! hash with a fixed, embedded salt before transmitting. The server
//! derives the stored value by running the same KDF a second time over
//! that hash with a per-account random salt.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use thiserror::Error;

/// Size of a derived hash on the wire and in the store
pub const HASH_LENGTH: usize = 32;
/// Size of the per-account server salt
pub const SALT_LENGTH: usize = 16;

const ARGON2_TIME: u32 = 4;
const ARGON2_MEMORY: u32 = 65536;
const ARGON2_PARALLEL: u32 = 1;

/// Salt embedded in every client. It only forces attackers observing
/// the wire to precompute tables specific to this protocol.
pub const GLOBAL_CLIENT_SALT: [u8; SALT_LENGTH] = [
    0x71, 0x3B, 0xD4, 0x5B, 0xF0, 0xA3, 0x19, 0x70, 0xE2, 0xDB, 0xD7, 0xF8, 0x1B, 0x2B, 0x84,
    0xEA,
];

#[derive(Debug, Error)]
pub enum HashError {
    #[error("invalid argon2 parameters: {0}")]
    Params(argon2::Error),
    #[error("failed to derive hash: {0}")]
    Derive(argon2::Error),
}

fn kdf() -> Result<Argon2<'static>, HashError> {
    let params = Params::new(
        ARGON2_MEMORY,
        ARGON2_TIME,
        ARGON2_PARALLEL,
        Some(HASH_LENGTH),
    )
    .map_err(HashError::Params)?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Derives the 32 byte output for `input` under `salt`.
pub fn derive(input: &[u8], salt: &[u8]) -> Result<[u8; HASH_LENGTH], HashError> {
    let mut output = [0u8; HASH_LENGTH];
    kdf()?
        .hash_password_into(input, salt, &mut output)
        .map_err(HashError::Derive)?;
    Ok(output)
}

/// Client-side derivation of the wire hash from a plain password.
///
/// The server never calls this for live traffic; it exists for seeded
/// accounts and tests which must produce what a real client would send.
pub fn client_hash(password: &str) -> Result<[u8; HASH_LENGTH], HashError> {
    derive(password.as_bytes(), &GLOBAL_CLIENT_SALT)
}

/// Generates a fresh per-account salt.
pub fn generate_salt() -> [u8; SALT_LENGTH] {
    let mut salt = [0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Re-derives the stored value from a wire hash and compares it with
/// the stored hash in constant time.
pub fn verify(wire_hash: &[u8], salt: &[u8], stored: &[u8; HASH_LENGTH]) -> bool {
    match derive(wire_hash, salt) {
        Ok(derived) => ring::constant_time::verify_slices_are_equal(&derived, stored).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod test {
    use super::{client_hash, derive, generate_salt, verify};

    #[test]
    fn round_trip() {
        let wire = client_hash("hunter2").unwrap();
        let salt = generate_salt();
        let stored = derive(&wire, &salt).unwrap();

        assert!(verify(&wire, &salt, &stored));
    }

    #[test]
    fn wrong_password_rejected() {
        let salt = generate_salt();
        let stored = derive(&client_hash("hunter2").unwrap(), &salt).unwrap();
        let other = client_hash("hunter3").unwrap();

        assert!(!verify(&other, &salt, &stored));
    }

    #[test]
    fn salts_differ() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
