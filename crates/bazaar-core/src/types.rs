//! Core ledger types: transactions, lock scripts, UTXOs.
//!
//! All monetary values are in minor units (1 coin = 10^8 minor units).
//! All numeric fields use u64 per protocol convention.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::constants::{
    COINBASE_MATURITY, INPUT_MASS, MASS_PER_SCRIPT_BYTE, MAX_INPUTS, MAX_OUTPUTS, MAX_TX_MASS,
    OUTPUT_MASS, SIG_OP_MASS, TX_BASE_MASS, USER_TX_MATURITY,
};
use crate::error::TransactionError;

/// A 32-byte hash value.
///
/// Used for transaction IDs, pubkey hashes, and redeem-script hashes (all BLAKE3).
/// Serializes as a lowercase hex string in human-readable formats.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash (32 zero bytes).
    pub const ZERO: Self = Self([0u8; 32]);

    /// Create a Hash256 from a byte array.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl FromStr for Hash256 {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 32];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Serialize for Hash256 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Hash256 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Reference to a specific output of a previous transaction.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
    bincode::Encode, bincode::Decode,
)]
pub struct OutPoint {
    /// Transaction ID containing the referenced output.
    pub txid: Hash256,
    /// Index of the output within the transaction.
    pub index: u64,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

/// Spending condition attached to an output.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash,
    bincode::Encode, bincode::Decode,
)]
#[serde(tag = "kind", content = "hash", rename_all = "snake_case")]
pub enum LockScript {
    /// Spendable by the Ed25519 key whose BLAKE3 hash this is.
    PubkeyHash(Hash256),
    /// Spendable by a redeem script whose BLAKE3 hash this is.
    ScriptHash(Hash256),
}

impl LockScript {
    /// The hash committed to by this lock.
    pub fn hash(&self) -> Hash256 {
        match self {
            LockScript::PubkeyHash(h) | LockScript::ScriptHash(h) => *h,
        }
    }

    /// Whether spending requires a redeem script.
    pub fn is_script_hash(&self) -> bool {
        matches!(self, LockScript::ScriptHash(_))
    }
}

/// A transaction input, spending a previous output.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxInput {
    /// The outpoint being spent.
    pub previous_output: OutPoint,
    /// Ed25519 signature (64 bytes). Empty until signed.
    pub signature: Vec<u8>,
    /// Ed25519 public key (32 bytes). Empty until signed.
    pub public_key: Vec<u8>,
    /// Redeem script revealed when spending a script-hash output, empty otherwise.
    pub redeem_script: Vec<u8>,
}

impl TxInput {
    /// An unsigned input spending `previous_output`.
    pub fn unsigned(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            signature: vec![],
            public_key: vec![],
            redeem_script: vec![],
        }
    }
}

/// A transaction output, creating a new UTXO.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct TxOutput {
    /// Value in minor units.
    pub value: u64,
    /// Spending condition.
    pub lock: LockScript,
}

/// A transaction transferring value between locks.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    /// Protocol version.
    pub version: u64,
    /// Inputs consuming previous outputs.
    pub inputs: Vec<TxInput>,
    /// New outputs created by this transaction.
    pub outputs: Vec<TxOutput>,
    /// Block height before which this tx is invalid.
    pub lock_time: u64,
}

impl Transaction {
    /// Compute the transaction ID (BLAKE3 hash of the canonical encoding).
    ///
    /// Uses bincode with standard config for deterministic serialization.
    pub fn txid(&self) -> Result<Hash256, TransactionError> {
        let encoded = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| TransactionError::Serialization(e.to_string()))?;
        Ok(Hash256(blake3::hash(&encoded).into()))
    }

    /// Sum of all output values. Returns None on overflow.
    pub fn total_output_value(&self) -> Option<u64> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, out| acc.checked_add(out.value))
    }

    /// Mass of this transaction.
    ///
    /// Depends only on the number of inputs and outputs and on the redeem
    /// scripts carried by inputs, so signing does not change it.
    pub fn mass(&self) -> u64 {
        let inputs: u64 = self
            .inputs
            .iter()
            .map(|i| INPUT_MASS + SIG_OP_MASS + i.redeem_script.len() as u64 * MASS_PER_SCRIPT_BYTE)
            .sum();
        TX_BASE_MASS + inputs + self.outputs.len() as u64 * OUTPUT_MASS
    }

    /// Check structural standardness rules the node enforces at submission.
    pub fn check_standard(&self) -> Result<(), TransactionError> {
        if self.inputs.is_empty() || self.outputs.is_empty() {
            return Err(TransactionError::EmptyInputsOrOutputs);
        }
        if self.inputs.len() > MAX_INPUTS {
            return Err(TransactionError::TooManyInputs(self.inputs.len()));
        }
        if self.outputs.len() > MAX_OUTPUTS {
            return Err(TransactionError::TooManyOutputs(self.outputs.len()));
        }
        if let Some(i) = self.outputs.iter().position(|o| o.value == 0) {
            return Err(TransactionError::ZeroValueOutput(i));
        }
        self.total_output_value()
            .ok_or(TransactionError::ValueOverflow)?;
        let mass = self.mass();
        if mass > MAX_TX_MASS {
            return Err(TransactionError::MassTooHigh { mass, max: MAX_TX_MASS });
        }
        Ok(())
    }
}

/// An entry in the unspent transaction output set.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq,
    bincode::Encode, bincode::Decode,
)]
pub struct UtxoEntry {
    /// The unspent output.
    pub output: TxOutput,
    /// Height at which the creating transaction was accepted.
    pub block_height: u64,
    /// Whether this output is from a coinbase transaction.
    pub is_coinbase: bool,
}

impl UtxoEntry {
    /// Check if this UTXO counts as mature balance at `current_height`.
    ///
    /// Coinbase outputs require [`COINBASE_MATURITY`] confirmations, regular
    /// outputs [`USER_TX_MATURITY`].
    pub fn is_mature(&self, current_height: u64) -> bool {
        let depth = if self.is_coinbase {
            COINBASE_MATURITY
        } else {
            USER_TX_MATURITY
        };
        current_height.saturating_sub(self.block_height) >= depth
    }
}
