//! Wallet error types.

use bazaar_core::error::{CryptoError, ScriptError, TransactionError};
use thiserror::Error;

/// Errors that can occur in wallet operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    /// Insufficient funds to cover the transaction amount plus fees.
    #[error("insufficient funds: have {have}, need {need}")]
    InsufficientFunds {
        /// Available value in minor units.
        have: u64,
        /// Required value in minor units.
        need: u64,
    },

    /// No UTXOs available for spending.
    #[error("no UTXOs available")]
    NoUtxos,

    /// Invalid monetary amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The priority fee the network asks for exceeds the caller's ceiling.
    #[error("priority fee too high: required {required}, max {max}")]
    PriorityFeeTooHigh { required: u64, max: u64 },

    /// The commit anchor output is not in the supplied UTXO set.
    #[error("commit anchor not found: {0}")]
    AnchorNotFound(String),

    /// Seed decryption secret is malformed.
    #[error("invalid seed secret: {0}")]
    InvalidSeedSecret(String),

    /// Encryption failure.
    #[error("encryption: {0}")]
    Encryption(String),

    /// Decryption failure (wrong key/IV or tampered ciphertext).
    #[error("decryption failed")]
    Decryption,

    /// Transaction build error.
    #[error("build error: {0}")]
    BuildError(String),

    /// Protocol payload could not be encoded or decoded.
    #[error("payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_insufficient_funds() {
        let e = WalletError::InsufficientFunds { have: 100, need: 200 };
        assert_eq!(e.to_string(), "insufficient funds: have 100, need 200");
    }

    #[test]
    fn display_priority_fee_too_high() {
        let e = WalletError::PriorityFeeTooHigh { required: 5_000, max: 1_000 };
        assert_eq!(e.to_string(), "priority fee too high: required 5000, max 1000");
    }

    #[test]
    fn from_transaction_error() {
        let wallet: WalletError = TransactionError::EmptyInputsOrOutputs.into();
        assert_eq!(
            wallet,
            WalletError::Transaction(TransactionError::EmptyInputsOrOutputs)
        );
    }

    #[test]
    fn from_script_error() {
        let wallet: WalletError = ScriptError::ElementTooLarge(600).into();
        assert!(matches!(wallet, WalletError::Script(_)));
    }
}
