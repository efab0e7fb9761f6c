//! Seed management and deterministic per-index wallet derivation.
//!
//! Uses BLAKE3 keyed derivation to produce Ed25519 keypairs from a 32-byte
//! master seed. Every settlement action gets its own wallet at a sequence
//! index; nothing derived here is cached or persisted.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use bazaar_core::address::{Address, Network};
use bazaar_core::crypto::KeyPair;

use crate::encryption::{SeedSecret, decrypt_seed};
use crate::error::WalletError;

/// BLAKE3 KDF context for child key derivation.
const KDF_CONTEXT: &str = "bazaar-wallet-key-derivation-v1";

/// A 32-byte master seed.
///
/// Secret material is zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct Seed {
    bytes: [u8; 32],
}

impl Seed {
    /// Generate a random seed from the OS cryptographic RNG.
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    /// Raw seed bytes. Handle with care.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }
}

impl Clone for Seed {
    fn clone(&self) -> Self {
        Self { bytes: self.bytes }
    }
}

impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Seed").field("bytes", &"[REDACTED]").finish()
    }
}

/// A wallet derived at one index. Lives only as long as the call using it.
#[derive(Clone)]
pub struct WalletAccount {
    pub index: u32,
    pub address: Address,
    pub keypair: KeyPair,
}

impl fmt::Debug for WalletAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletAccount")
            .field("index", &self.index)
            .field("address", &self.address.to_string())
            .finish_non_exhaustive()
    }
}

/// Pure function from (master seed, index) to a wallet account.
///
/// Cheap to clone; holds only the seed and the network.
#[derive(Clone)]
pub struct WalletDeriver {
    seed: Seed,
    network: Network,
}

impl WalletDeriver {
    pub fn new(seed: Seed, network: Network) -> Self {
        Self { seed, network }
    }

    /// Build a deriver from the encrypted master seed and its two-part secret.
    pub fn from_encrypted(
        encrypted_seed: &[u8],
        secret: &SeedSecret,
        network: Network,
    ) -> Result<Self, WalletError> {
        let seed = decrypt_seed(encrypted_seed, secret)?;
        Ok(Self::new(seed, network))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Derive the wallet at `index`. Same seed and index give the same account.
    pub fn wallet_account_at_index(&self, index: u32) -> WalletAccount {
        let keypair = derive_child_keypair(&self.seed, index);
        let address = Address::from_public_key(&keypair.public_key(), self.network);
        WalletAccount { index, address, keypair }
    }
}

impl fmt::Debug for WalletDeriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletDeriver")
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// Derive a child keypair from a seed and index using BLAKE3 KDF.
fn derive_child_keypair(seed: &Seed, index: u32) -> KeyPair {
    let mut ikm = [0u8; 36];
    ikm[..32].copy_from_slice(seed.as_bytes());
    ikm[32..].copy_from_slice(&index.to_le_bytes());
    let derived = blake3::derive_key(KDF_CONTEXT, &ikm);
    ikm.zeroize();
    KeyPair::from_secret_bytes(derived)
}
