//! AES-256-GCM encryption of the master seed.
//!
//! The decryption secret is split into two separately configured parts: a
//! 32-byte symmetric key and a 12-byte IV. Both are supplied as hex.
//!
//! # Wire format
//! ```text
//! ciphertext (32 bytes) || auth_tag (16 bytes)
//! ```

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WalletError;
use crate::keys::Seed;

const KEY_LEN: usize = 32;
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Encrypted seed length: 32-byte seed plus the GCM tag.
pub const ENCRYPTED_SEED_LEN: usize = 32 + TAG_LEN;

/// The two-part seed decryption secret.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SeedSecret {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SeedSecret {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Parse the key and IV from their hex encodings.
    pub fn from_hex(key_hex: &str, iv_hex: &str) -> Result<Self, WalletError> {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        hex::decode_to_slice(key_hex.trim(), &mut key)
            .map_err(|e| WalletError::InvalidSeedSecret(format!("key: {e}")))?;
        hex::decode_to_slice(iv_hex.trim(), &mut iv)
            .map_err(|e| WalletError::InvalidSeedSecret(format!("iv: {e}")))?;
        Ok(Self { key, iv })
    }

    fn cipher(&self) -> Result<Aes256Gcm, WalletError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| WalletError::Encryption(e.to_string()))
    }
}

impl fmt::Debug for SeedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SeedSecret([REDACTED])")
    }
}

/// Encrypt a master seed under `secret`.
pub fn encrypt_seed(seed: &Seed, secret: &SeedSecret) -> Result<Vec<u8>, WalletError> {
    secret
        .cipher()?
        .encrypt(Nonce::from_slice(&secret.iv), seed.as_bytes().as_slice())
        .map_err(|e| WalletError::Encryption(e.to_string()))
}

/// Decrypt a master seed produced by [`encrypt_seed`].
///
/// Returns [`WalletError::Decryption`] when the secret is wrong or the
/// ciphertext was tampered with.
pub fn decrypt_seed(encrypted: &[u8], secret: &SeedSecret) -> Result<Seed, WalletError> {
    if encrypted.len() != ENCRYPTED_SEED_LEN {
        return Err(WalletError::InvalidSeedSecret(format!(
            "encrypted seed must be {ENCRYPTED_SEED_LEN} bytes, got {}",
            encrypted.len()
        )));
    }
    let mut plain = secret
        .cipher()?
        .decrypt(Nonce::from_slice(&secret.iv), encrypted)
        .map_err(|_| WalletError::Decryption)?;

    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&plain);
    plain.zeroize();
    Ok(Seed::from_bytes(bytes))
}
