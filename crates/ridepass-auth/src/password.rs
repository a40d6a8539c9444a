//! Password hashing
//!
//! Credentials are stored as PHC strings of the form
//! `$argon2id$v=19$m=65536,t=1,p=4$<salt>$<hash>`, so the parameters used for
//! any stored hash travel with it and remain verifiable after an upgrade.

use argon2::password_hash::{PasswordHash, PasswordHasher as _, PasswordVerifier as _, SaltString};
use argon2::{ARGON2ID_IDENT, Algorithm, Argon2, Params, Version};
use rand::{RngCore, rngs::OsRng};

use crate::error::AuthError;

/// Memory cost in KiB
pub const MEMORY_COST_KIB: u32 = 64 * 1024;
pub const TIME_COST: u32 = 1;
pub const PARALLELISM: u32 = 4;
/// Derived key length in bytes
pub const OUTPUT_LEN: usize = 32;
pub const SALT_LEN: usize = 16;

/// Argon2id hasher with explicit cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PasswordHasher {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Default for PasswordHasher {
    fn default() -> Self {
        Self::new()
    }
}

impl PasswordHasher {
    /// Production parameters
    pub fn new() -> Self {
        Self {
            memory_kib: MEMORY_COST_KIB,
            iterations: TIME_COST,
            parallelism: PARALLELISM,
        }
    }

    /// Custom cost parameters, validated up front
    pub fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Result<Self, AuthError> {
        let hasher = Self {
            memory_kib,
            iterations,
            parallelism,
        };
        hasher.argon2()?;
        Ok(hasher)
    }

    fn params(&self) -> Result<Params, AuthError> {
        Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(OUTPUT_LEN),
        )
        .map_err(|e| AuthError::Config(format!("argon2 parameters: {}", e)))
    }

    fn argon2(&self) -> Result<Argon2<'static>, AuthError> {
        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params()?))
    }

    /// Hash a plaintext password with a fresh random salt
    pub fn hash(&self, plaintext: &str) -> Result<String, AuthError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let salt =
            SaltString::encode_b64(&salt).map_err(|e| AuthError::PasswordHash(e.to_string()))?;

        let hash = self
            .argon2()?
            .hash_password(plaintext.as_bytes(), &salt)
            .map_err(|e| AuthError::PasswordHash(e.to_string()))?;

        Ok(hash.to_string())
    }

    /// Verify a plaintext password against a stored hash
    ///
    /// Parameters and salt are taken from `encoded`, not from `self`, and the
    /// comparison is constant time. Anything malformed simply fails.
    pub fn verify(&self, plaintext: &str, encoded: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(encoded) else {
            return false;
        };
        if parsed.algorithm != ARGON2ID_IDENT {
            return false;
        }
        Argon2::default()
            .verify_password(plaintext.as_bytes(), &parsed)
            .is_ok()
    }

    /// Whether a stored hash was produced with parameters other than ours
    pub fn needs_rehash(&self, encoded: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(encoded) else {
            return true;
        };
        if parsed.algorithm != ARGON2ID_IDENT || parsed.version != Some(Version::V0x13 as u32) {
            return true;
        }
        match Params::try_from(&parsed) {
            Ok(params) => {
                params.m_cost() != self.memory_kib
                    || params.t_cost() != self.iterations
                    || params.p_cost() != self.parallelism
                    || parsed.hash.map(|h| h.len()) != Some(OUTPUT_LEN)
            }
            Err(_) => true,
        }
    }
}

/// Hash a password with the production parameters
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    PasswordHasher::new().hash(password)
}

/// Verify a password against a stored hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    PasswordHasher::new().verify(password, hash)
}
