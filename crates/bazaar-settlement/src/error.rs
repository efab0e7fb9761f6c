//! Settlement error types.
//!
//! Every variant belongs to exactly one [`ErrorKind`], which tells callers
//! whether to retry, surface the message, or wait for the process to come
//! back.

use std::fmt;

use bazaar_core::error::LedgerError;
use bazaar_wallet::WalletError;
use thiserror::Error;

use crate::model::TransactionRecord;

/// Which side of an inventory check ran out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantityScope {
    Pool,
    Wallet,
}

impl fmt::Display for QuantityScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuantityScope::Pool => f.write_str("pool"),
            QuantityScope::Wallet => f.write_str("wallet"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettlementError {
    // --- connectivity ---
    #[error(transparent)] Ledger(#[from] LedgerError),

    // --- precondition ---
    #[error("amount mismatch: have {have}, need {need}")] AmountMismatch { have: u64, need: u64 },
    #[error("priority fee too high: required {required}, max {max}")] PriorityFeeTooHigh { required: u64, max: u64 },
    #[error("invalid amount: {0}")] InvalidAmount(String),
    #[error("illegal transition {from} -> {to}")] IllegalTransition { from: String, to: String },
    #[error("action {0} already has on-chain progress and cannot be cancelled")] CancelAfterProgress(String),
    #[error(transparent)] Wallet(WalletError),

    // --- concurrency / state ---
    #[error("{entity} {id} not found")] NotFound { entity: &'static str, id: String },
    #[error("invalid status for update: {id} is {current}, required {required}")] InvalidStatusForUpdate { id: String, current: String, required: String },
    #[error("not enough available quantity ({scope})")] NotEnoughAvailable { scope: QuantityScope },
    #[error("storage contention: {0}")] Contention(String),
    #[error("job {0} is already running")] AlreadyRunning(&'static str),

    // --- fatal ---
    #[error("step {step} already recorded as {existing}")] StepAlreadyRecorded { step: String, existing: String },
    #[error("node accepted {actual}, expected {expected}")] TxidMismatch { expected: String, actual: String },
    #[error("storage: {0}")] Storage(String),
    #[error("codec: {0}")] Codec(String),
    #[error("config: {0}")] Config(String),
    #[error("{0}")] Unexpected(String),

    // --- shutdown ---
    #[error("shutting down, retry later")] ShuttingDown,
}

/// The five failure classes callers act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connectivity,
    Precondition,
    Concurrency,
    Fatal,
    Shutdown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Connectivity | ErrorKind::Concurrency | ErrorKind::Shutdown)
    }
}

impl SettlementError {
    pub fn kind(&self) -> ErrorKind {
        use SettlementError::*;
        match self {
            Ledger(LedgerError::Rejected(_)) => ErrorKind::Fatal,
            Ledger(LedgerError::TrackerStopped(_)) => ErrorKind::Fatal,
            Ledger(_) => ErrorKind::Connectivity,
            AmountMismatch { .. }
            | PriorityFeeTooHigh { .. }
            | InvalidAmount(_)
            | IllegalTransition { .. }
            | CancelAfterProgress(_) => ErrorKind::Precondition,
            Wallet(w) => match w {
                WalletError::InsufficientFunds { .. }
                | WalletError::NoUtxos
                | WalletError::InvalidAmount(_)
                | WalletError::PriorityFeeTooHigh { .. } => ErrorKind::Precondition,
                _ => ErrorKind::Fatal,
            },
            NotFound { .. }
            | InvalidStatusForUpdate { .. }
            | NotEnoughAvailable { .. }
            | Contention(_)
            | AlreadyRunning(_) => ErrorKind::Concurrency,
            StepAlreadyRecorded { .. }
            | TxidMismatch { .. }
            | Storage(_)
            | Codec(_)
            | Config(_)
            | Unexpected(_) => ErrorKind::Fatal,
            ShuttingDown => ErrorKind::Shutdown,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Expected under contention; not worth an application-level log line.
    pub fn is_expected_contention(&self) -> bool {
        matches!(
            self,
            SettlementError::InvalidStatusForUpdate { .. } | SettlementError::NotEnoughAvailable { .. }
        )
    }
}

impl From<WalletError> for SettlementError {
    fn from(e: WalletError) -> Self {
        match e {
            WalletError::PriorityFeeTooHigh { required, max } => {
                SettlementError::PriorityFeeTooHigh { required, max }
            }
            WalletError::InsufficientFunds { have, need } => SettlementError::AmountMismatch { have, need },
            other => SettlementError::Wallet(other),
        }
    }
}

impl From<rocksdb::Error> for SettlementError {
    fn from(e: rocksdb::Error) -> Self {
        match e.kind() {
            rocksdb::ErrorKind::Busy | rocksdb::ErrorKind::TimedOut | rocksdb::ErrorKind::TryAgain => {
                SettlementError::Contention(e.to_string())
            }
            _ => SettlementError::Storage(e.to_string()),
        }
    }
}

/// A failed action together with the steps that did complete.
///
/// `partial` is the recovery checkpoint: resuming from it never repeats a
/// recorded step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("action failed after {} recorded steps: {error}", .partial.len())]
pub struct ActionError {
    #[source]
    pub error: SettlementError,
    pub partial: TransactionRecord,
}

impl ActionError {
    pub fn new(error: impl Into<SettlementError>, partial: TransactionRecord) -> Self {
        Self { error: error.into(), partial }
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }
}
