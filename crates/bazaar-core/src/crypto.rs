//! Ed25519 cryptographic operations for the Bazaar ledger.
//!
//! Provides key generation, transaction signing, and signature verification
//! for both pay-to-pubkey-hash and pay-to-script-hash inputs.
//!
//! # Signing scheme
//!
//! Transaction inputs are signed using a **sighash** that commits to:
//! - Transaction version and lock_time
//! - All input outpoints (txid + index)
//! - All outputs (value + lock kind + lock hash)
//! - The index of the input being signed
//!
//! Signatures, public keys and redeem scripts are excluded from the sighash
//! so inputs can be signed independently in any order.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::error::CryptoError;
use crate::script::{parse_standard_redeem_script, script_hash};
use crate::types::{Hash256, LockScript, Transaction};

/// Ed25519 keypair for signing transactions.
///
/// The secret key is zeroized on drop by ed25519-dalek.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: self.signing_key.verifying_key(),
        }
    }

    /// Raw secret key bytes. Handle with care.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    /// Sign a message, returning the raw 64-byte Ed25519 signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.secret_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

/// Ed25519 public key for verifying signatures and deriving addresses.
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: ed25519_dalek::VerifyingKey,
}

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        let vk = ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self { verifying_key: vk })
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// BLAKE3 hash of the key, as committed to by a pubkey-hash lock.
    pub fn pubkey_hash(&self) -> Hash256 {
        pubkey_hash(&self.to_bytes())
    }

    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        self.verifying_key
            .verify(message, &sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.to_bytes()))
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.to_bytes()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.to_bytes() == other.to_bytes()
    }
}

impl Eq for PublicKey {}

impl std::hash::Hash for PublicKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.to_bytes().hash(state);
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.to_bytes()))
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(&s, &mut bytes).map_err(serde::de::Error::custom)?;
        Self::from_bytes(&bytes).map_err(serde::de::Error::custom)
    }
}

/// BLAKE3 pubkey hash from raw public key bytes.
pub fn pubkey_hash(pubkey_bytes: &[u8; 32]) -> Hash256 {
    Hash256(blake3::hash(pubkey_bytes).into())
}

/// Compute the signing hash (sighash) for a transaction input.
pub fn signing_hash(tx: &Transaction, input_index: usize) -> Result<Hash256, CryptoError> {
    check_index(tx, input_index)?;

    let mut hasher = blake3::Hasher::new();
    hasher.update(&tx.version.to_le_bytes());

    hasher.update(&(tx.inputs.len() as u64).to_le_bytes());
    for input in &tx.inputs {
        hasher.update(input.previous_output.txid.as_bytes());
        hasher.update(&input.previous_output.index.to_le_bytes());
    }

    hasher.update(&(tx.outputs.len() as u64).to_le_bytes());
    for output in &tx.outputs {
        hasher.update(&output.value.to_le_bytes());
        let kind: u8 = if output.lock.is_script_hash() { 1 } else { 0 };
        hasher.update(&[kind]);
        hasher.update(output.lock.hash().as_bytes());
    }

    hasher.update(&tx.lock_time.to_le_bytes());
    hasher.update(&(input_index as u64).to_le_bytes());

    Ok(Hash256(hasher.finalize().into()))
}

fn check_index(tx: &Transaction, input_index: usize) -> Result<(), CryptoError> {
    if input_index >= tx.inputs.len() {
        return Err(CryptoError::InputIndexOutOfBounds {
            index: input_index,
            len: tx.inputs.len(),
        });
    }
    Ok(())
}

/// Sign a transaction input in place.
///
/// Writes the signature and public key into the input. A redeem script
/// already attached to the input is left untouched.
pub fn sign_transaction_input(
    tx: &mut Transaction,
    input_index: usize,
    keypair: &KeyPair,
) -> Result<(), CryptoError> {
    let sighash = signing_hash(tx, input_index)?;
    let signature = keypair.sign(sighash.as_bytes());

    let input = &mut tx.inputs[input_index];
    input.signature = signature.to_vec();
    input.public_key = keypair.public_key().to_bytes().to_vec();
    Ok(())
}

/// Verify a transaction input against the lock of the output it spends.
///
/// For a pubkey-hash lock the input's public key must hash to the lock.
/// For a script-hash lock the input's redeem script must hash to the lock,
/// be standard, and name the signing key in its first push.
pub fn verify_transaction_input(
    tx: &Transaction,
    input_index: usize,
    lock: &LockScript,
) -> Result<(), CryptoError> {
    check_index(tx, input_index)?;
    let input = &tx.inputs[input_index];

    let pk_bytes: [u8; 32] = input
        .public_key
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;

    match lock {
        LockScript::PubkeyHash(expected) => {
            if pubkey_hash(&pk_bytes) != *expected {
                return Err(CryptoError::PubkeyHashMismatch);
            }
        }
        LockScript::ScriptHash(expected) => {
            if script_hash(&input.redeem_script) != *expected {
                return Err(CryptoError::ScriptHashMismatch);
            }
            let redeem = parse_standard_redeem_script(&input.redeem_script)?;
            if redeem.public_key != pk_bytes {
                return Err(CryptoError::PubkeyHashMismatch);
            }
        }
    }

    let pk = PublicKey::from_bytes(&pk_bytes)?;
    let sig_bytes: [u8; 64] = input
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;

    let sighash = signing_hash(tx, input_index)?;
    pk.verify(sighash.as_bytes(), &sig_bytes)
}
