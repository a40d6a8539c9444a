//! Opaque token material for the refresh and verification ledgers

use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// Entropy of a freshly minted plaintext, in bytes
pub const TOKEN_BYTES: usize = 32;

/// Generate a new high-entropy plaintext token, hex encoded
///
/// The plaintext is handed to the caller once and never persisted.
pub fn generate_plaintext() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut buf);
    hex::encode(buf)
}

/// One-way hash of a plaintext token, as stored in the ledgers
pub fn hash_token(plaintext: &str) -> String {
    hex::encode(Sha256::digest(plaintext.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_plaintext() {
        let a = generate_plaintext();
        let b = generate_plaintext();

        assert_ne!(a, b);
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_token() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_ne!(hash_token("abc"), hash_token("abd"));
    }
}
