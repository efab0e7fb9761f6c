//! Error types for the Bazaar ledger primitives.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("empty inputs or outputs")] EmptyInputsOrOutputs,
    #[error("value overflow")] ValueOverflow,
    #[error("serialization: {0}")] Serialization(String),
    #[error("zero-value output at index {0}")] ZeroValueOutput(usize),
    #[error("too many inputs: {0}")] TooManyInputs(usize),
    #[error("too many outputs: {0}")] TooManyOutputs(usize),
    #[error("mass {mass} exceeds standard limit {max}")] MassTooHigh { mass: u64, max: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid public key bytes")] InvalidPublicKey,
    #[error("invalid signature bytes")] InvalidSignature,
    #[error("signature verification failed")] VerificationFailed,
    #[error("pubkey hash does not match expected")] PubkeyHashMismatch,
    #[error("redeem script does not match script hash")] ScriptHashMismatch,
    #[error("input index out of bounds: {index} >= {len}")] InputIndexOutOfBounds { index: usize, len: usize },
    #[error(transparent)] Script(#[from] ScriptError),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScriptError {
    #[error("truncated push at offset {0}")] TruncatedPush(usize),
    #[error("push of {0} bytes exceeds element limit")] ElementTooLarge(usize),
    #[error("unknown opcode 0x{0:02x}")] UnknownOpcode(u8),
    #[error("unbalanced conditional")] UnbalancedConditional,
    #[error("non-standard redeem script: {0}")] NonStandard(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid HRP")] InvalidHrp,
    #[error("invalid length")] InvalidLength,
    #[error("invalid checksum")] InvalidChecksum,
    #[error("invalid character: {0}")] InvalidCharacter(char),
    #[error("invalid version: {0}")] InvalidVersion(u8),
    #[error("invalid padding bits")] InvalidPadding,
    #[error("unknown network: {0}")] UnknownNetwork(String),
    #[error("missing separator")] MissingSeparator,
    #[error("mixed case")] MixedCase,
}

/// Failures talking to the remote ledger node.
///
/// Every variant is transient from the caller's point of view: nothing is
/// broadcast until connectivity has been confirmed, so retrying is safe.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("not connected to ledger node")] NotConnected,
    #[error("connect failed: {0}")] ConnectFailed(String),
    #[error("ledger node unhealthy: synced={synced}, utxo_index={utxo_index}")] Unhealthy { synced: bool, utxo_index: bool },
    #[error("{operation} timed out after {secs}s")] Timeout { operation: &'static str, secs: u64 },
    #[error("rpc: {0}")] Rpc(String),
    #[error("transaction rejected: {0}")] Rejected(String),
    #[error("subscription: {0}")] Subscription(String),
    #[error("no confirmation for {txid} within {secs}s")] ConfirmationTimeout { txid: String, secs: u64 },
    #[error("balance tracker for {address} did not start within {secs}s")] ProcessorStartTimeout { address: String, secs: u64 },
    #[error("balance tracker stopped: {0}")] TrackerStopped(String),
}
