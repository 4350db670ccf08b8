//! Master-password key derivation
//!
//! PBKDF2-HMAC-SHA256 with a per-database random salt. The iteration count
//! is persisted next to the salt so databases created under an older default
//! stay openable if the default is ever raised.

use crate::{Error, Result};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use zeroize::Zeroizing;

/// Derived key length in bytes
pub const KEY_LEN: usize = 32;

/// Salt length in bytes
pub const SALT_LEN: usize = 32;

/// Minimum accepted salt length
pub const MIN_SALT_LEN: usize = 16;

/// Minimum accepted PBKDF2 iteration count
pub const MIN_ITERATIONS: u32 = 100_000;

/// Key derivation parameters stored alongside the salt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    /// PBKDF2 iteration count
    pub iterations: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            iterations: MIN_ITERATIONS,
        }
    }
}

/// Generate a fresh random salt.
///
/// Called exactly once per new database; an existing database keeps its salt
/// for life, including across password changes.
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    salt
}

/// Derive a 256-bit encryption key from the master password and salt.
///
/// Deterministic: the same password, salt, and parameters always produce the
/// same key. The password and derived key are never logged or persisted.
pub fn derive_key(password: &str, salt: &[u8], params: &KdfParams) -> Result<Zeroizing<[u8; KEY_LEN]>> {
    if password.is_empty() {
        return Err(Error::Validation("Master password cannot be empty".to_string()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(Error::Validation(format!(
            "Salt must be at least {} bytes, got {}",
            MIN_SALT_LEN,
            salt.len()
        )));
    }
    if params.iterations < MIN_ITERATIONS {
        return Err(Error::Validation(format!(
            "Iteration count {} below minimum {}",
            params.iterations, MIN_ITERATIONS
        )));
    }

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, params.iterations, &mut *key);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let salt = generate_salt();
        let key1 = derive_key("correct horse battery", &salt, &KdfParams::default()).unwrap();
        let key2 = derive_key("correct horse battery", &salt, &KdfParams::default()).unwrap();
        assert_eq!(*key1, *key2);
        assert!(key1.iter().any(|&b| b != 0));
    }

    #[test]
    fn test_different_password_different_key() {
        let salt = generate_salt();
        let key1 = derive_key("password-one", &salt, &KdfParams::default()).unwrap();
        let key2 = derive_key("password-two", &salt, &KdfParams::default()).unwrap();
        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_different_salt_different_key() {
        let key1 = derive_key("same password", &generate_salt(), &KdfParams::default()).unwrap();
        let key2 = derive_key("same password", &generate_salt(), &KdfParams::default()).unwrap();
        assert_ne!(*key1, *key2);
    }

    #[test]
    fn test_empty_password_rejected() {
        let salt = generate_salt();
        assert!(derive_key("", &salt, &KdfParams::default()).is_err());
    }

    #[test]
    fn test_short_salt_rejected() {
        let short = [0u8; MIN_SALT_LEN - 1];
        assert!(derive_key("password", &short, &KdfParams::default()).is_err());

        let min = [7u8; MIN_SALT_LEN];
        assert!(derive_key("password", &min, &KdfParams::default()).is_ok());
    }

    #[test]
    fn test_weak_iteration_count_rejected() {
        let salt = generate_salt();
        let weak = KdfParams { iterations: 1_000 };
        assert!(derive_key("password", &salt, &weak).is_err());
    }

    #[test]
    fn test_iteration_count_changes_key() {
        let salt = generate_salt();
        let key1 = derive_key("password", &salt, &KdfParams { iterations: 100_000 }).unwrap();
        let key2 = derive_key("password", &salt, &KdfParams { iterations: 200_000 }).unwrap();
        assert_ne!(*key1, *key2);
    }
}
