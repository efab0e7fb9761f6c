//! Persisted documents and their status enums.
//!
//! Documents are stored bincode-encoded (serde path). Every write bumps
//! `version` and `updated_at`; `version` is the compare-and-swap counter.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use bazaar_core::address::Address;
use bazaar_core::types::{Hash256, Transaction};

use crate::error::SettlementError;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Created,
    AwaitingDeposit,
    Ready,
    InProgress,
    Completed,
    Failed,
    Cancelling,
    Cancelled,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Created => "created",
            ActionStatus::AwaitingDeposit => "awaiting_deposit",
            ActionStatus::Ready => "ready",
            ActionStatus::InProgress => "in_progress",
            ActionStatus::Completed => "completed",
            ActionStatus::Failed => "failed",
            ActionStatus::Cancelling => "cancelling",
            ActionStatus::Cancelled => "cancelled",
        }
    }

    /// Terminal statuses only accept audit-metadata updates.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ActionStatus::Completed | ActionStatus::Cancelled)
    }

    /// Whether an action is driving on-chain steps in this status.
    pub fn is_running(&self) -> bool {
        matches!(self, ActionStatus::InProgress | ActionStatus::Cancelling)
    }

    pub fn can_transition_to(&self, next: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, next),
            (Created, AwaitingDeposit)
                | (AwaitingDeposit, Ready)
                | (Ready, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Failed, InProgress)
                | (Failed, Cancelling)
                | (Created | AwaitingDeposit | Ready, Cancelling)
                | (Created | AwaitingDeposit | Ready, Cancelled)
                | (Cancelling, Cancelled)
                | (Cancelling, Failed)
        )
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which plan an action's record belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionMode {
    #[default]
    Settle,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub to: Address,
    /// Token amount.
    pub amount: u64,
}

/// What an action settles. Monetary values are minor units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionParams {
    /// `token_amount` of `tick` moves from the order wallet to `buyer`;
    /// `price` is paid out to `seller` net of commission.
    Sell {
        tick: String,
        token_amount: u64,
        price: u64,
        seller: Address,
        buyer: Address,
    },
    /// `count` mints of `tick` to `recipient`; leftovers go to `refund`.
    MintBatch {
        tick: String,
        count: u32,
        recipient: Address,
        refund: Address,
    },
    /// Token transfers out of the treasury wallet.
    WithdrawBatch { tick: String, withdrawals: Vec<Withdrawal> },
}

impl ActionParams {
    pub fn label(&self) -> &'static str {
        match self {
            ActionParams::Sell { .. } => "sell",
            ActionParams::MintBatch { .. } => "mint_batch",
            ActionParams::WithdrawBatch { .. } => "withdraw_batch",
        }
    }

    pub fn validate(&self) -> Result<(), SettlementError> {
        let invalid = |m: &str| Err(SettlementError::InvalidAmount(m.to_string()));
        match self {
            ActionParams::Sell { tick, token_amount, price, .. } => {
                if tick.is_empty() {
                    return invalid("empty tick");
                }
                if *token_amount == 0 || *price == 0 {
                    return invalid("sell amounts must be non-zero");
                }
            }
            ActionParams::MintBatch { tick, count, .. } => {
                if tick.is_empty() {
                    return invalid("empty tick");
                }
                if *count == 0 {
                    return invalid("mint count must be non-zero");
                }
            }
            ActionParams::WithdrawBatch { tick, withdrawals } => {
                if tick.is_empty() {
                    return invalid("empty tick");
                }
                if withdrawals.is_empty() {
                    return invalid("no withdrawals");
                }
                if withdrawals.iter().any(|w| w.amount == 0) {
                    return invalid("withdrawal amount must be non-zero");
                }
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Transaction record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Commit,
    Reveal,
    Payout,
    Stipend,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Commit => "commit",
            StepKind::Reveal => "reveal",
            StepKind::Payout => "payout",
            StepKind::Stipend => "stipend",
        }
    }
}

/// Position of a step in a plan: its kind and the slot among steps of
/// that kind. Batches use one commit/reveal slot per item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId {
    pub kind: StepKind,
    pub slot: u32,
}

impl StepId {
    pub const fn new(kind: StepKind, slot: u32) -> Self {
        Self { kind, slot }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind.as_str(), self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedStep {
    pub step: StepId,
    pub txid: Hash256,
}

/// A signed step transaction that was handed to the ledger but not yet
/// seen confirmed. Resubmitted as-is on resume, never rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedStep {
    pub step: StepId,
    pub txid: Hash256,
    pub tx: Transaction,
    /// Address whose UTXO change confirms the transaction.
    pub watch: Address,
    /// The step sweeps the action wallet.
    pub drains: bool,
}

/// Append-only map of step to transaction id, in completion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    steps: Vec<RecordedStep>,
    #[serde(default)]
    in_flight: Option<SubmittedStep>,
}

impl TransactionRecord {
    pub fn get(&self, step: &StepId) -> Option<Hash256> {
        self.steps.iter().find(|s| s.step == *step).map(|s| s.txid)
    }

    pub fn contains(&self, step: &StepId) -> bool {
        self.get(step).is_some()
    }

    /// Record `txid` for `step`.
    ///
    /// Returns `Ok(false)` if the same id is already recorded. A different
    /// id for a recorded step is refused.
    pub fn record(&mut self, step: StepId, txid: Hash256) -> Result<bool, SettlementError> {
        match self.get(&step) {
            Some(existing) if existing == txid => Ok(false),
            Some(existing) => Err(SettlementError::StepAlreadyRecorded {
                step: step.to_string(),
                existing: existing.to_string(),
            }),
            None => {
                if self.in_flight.as_ref().is_some_and(|s| s.step == step) {
                    self.in_flight = None;
                }
                self.steps.push(RecordedStep { step, txid });
                Ok(true)
            }
        }
    }

    /// The step submitted but not yet confirmed, if any.
    pub fn in_flight(&self) -> Option<&SubmittedStep> {
        self.in_flight.as_ref()
    }

    /// Mark `submitted` as handed to the ledger.
    ///
    /// Returns `Ok(false)` if the same transaction is already in flight.
    /// A step that is recorded, or in flight with another txid, is refused.
    pub fn begin_step(&mut self, submitted: SubmittedStep) -> Result<bool, SettlementError> {
        if let Some(existing) = self.get(&submitted.step) {
            return Err(SettlementError::StepAlreadyRecorded {
                step: submitted.step.to_string(),
                existing: existing.to_string(),
            });
        }
        match &self.in_flight {
            Some(current) if current.step == submitted.step && current.txid == submitted.txid => Ok(false),
            Some(current) if current.step == submitted.step => Err(SettlementError::StepAlreadyRecorded {
                step: submitted.step.to_string(),
                existing: current.txid.to_string(),
            }),
            _ => {
                self.in_flight = Some(submitted);
                Ok(true)
            }
        }
    }

    /// Number of confirmed steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Nothing confirmed and nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.in_flight.is_none()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RecordedStep> {
        self.steps.iter()
    }

    pub fn txids(&self) -> Vec<Hash256> {
        self.steps.iter().map(|s| s.txid).collect()
    }
}

/// A settlement action and its progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingAction {
    pub id: String,
    pub params: ActionParams,
    pub status: ActionStatus,
    pub mode: ActionMode,
    pub record: TransactionRecord,
    /// Index of the derived wallet that holds this action's funds.
    pub wallet_index: u32,
    pub last_error: Option<String>,
    /// Audit notes, writable in any status.
    pub notes: Vec<String>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Side fields applied together with a status transition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusExtra {
    pub last_error: Option<String>,
    pub note: Option<String>,
    pub mode: Option<ActionMode>,
}

impl StatusExtra {
    pub fn error(message: impl Into<String>) -> Self {
        Self { last_error: Some(message.into()), ..Self::default() }
    }

    pub fn note(message: impl Into<String>) -> Self {
        Self { note: Some(message.into()), ..Self::default() }
    }
}

// ---------------------------------------------------------------------------
// Sale rounds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Active,
    NoUnitsLeft,
    Closed,
}

/// An inventory pool for one sale round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleRound {
    pub id: String,
    pub round_number: u32,
    pub total_units: u64,
    pub available_units: u64,
    pub min_units_per_order: u64,
    pub max_units_per_wallet: Option<u64>,
    pub status: RoundStatus,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Reserved,
    Completed,
    Cancelled,
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReservationStatus::Reserved => "reserved",
            ReservationStatus::Completed => "completed",
            ReservationStatus::Cancelled => "cancelled",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: String,
    pub round_id: String,
    pub wallet: Address,
    pub units: u64,
    pub status: ReservationStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for opening a sale round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRound {
    pub round_number: u32,
    pub total_units: u64,
    pub min_units_per_order: u64,
    pub max_units_per_wallet: Option<u64>,
}
