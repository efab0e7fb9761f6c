//! Resumable multi-step on-chain actions.
//!
//! An [`ActionPlan`] is a fixed, ordered list of steps. [`Orchestrator::run_action`]
//! walks it, skipping every step already present in the resume record. Each
//! signed transaction is reported to a [`ProgressSink`] before broadcast and
//! again once it confirms. Re-running with the persisted record therefore
//! continues at the first unfinished step, resends a transaction that was
//! broadcast but never seen confirmed, and never builds a second one for it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use bazaar_core::address::{Address, Network};
use bazaar_core::constants::{COMMIT_ANCHOR_AMOUNT, DUST_THRESHOLD};
use bazaar_core::types::Hash256;
use bazaar_ledger::{BalanceTracker, LedgerConnection, SubscriptionRegistry, UtxoWatcher};
use bazaar_wallet::{CommitEnvelope, ProtocolOp, TransactionBuilder, WalletAccount, WalletError, negotiate};

use crate::commission::CommissionPolicy;
use crate::error::{ActionError, SettlementError};
use crate::model::{ActionMode, ActionParams, StepId, StepKind, SubmittedStep, TransactionRecord};
use crate::state_machine::StateMachine;

/// Fee headroom reserved per remaining step in the balance precondition.
pub const STEP_FEE_RESERVE: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    /// Pay the anchor to the envelope address of `op`.
    Commit { op: ProtocolOp },
    /// Spend the anchor created by step `commit`.
    Reveal { op: ProtocolOp, commit: StepId },
    /// Pay each recipient; change stays in the action wallet.
    Payout { recipients: Vec<(Address, u64)> },
    /// Sweep everything left in the action wallet to `to`.
    Stipend { to: Address },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub id: StepId,
    pub action: StepAction,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionPlan {
    pub steps: Vec<PlannedStep>,
}

impl ActionPlan {
    pub fn for_action(params: &ActionParams, mode: ActionMode, commission: &CommissionPolicy) -> Self {
        let mut plan = ActionPlan::default();
        match (params, mode) {
            (ActionParams::Sell { tick, token_amount, price, seller, buyer }, ActionMode::Settle) => {
                plan.push_envelope(0, ProtocolOp::transfer(tick, *token_amount, buyer));
                let (seller_share, fee) = commission.split(*price);
                let mut recipients = Vec::with_capacity(2);
                if seller_share > 0 {
                    recipients.push((seller.clone(), seller_share));
                }
                if let (Some(treasury), true) = (&commission.treasury, fee > 0) {
                    recipients.push((treasury.clone(), fee));
                }
                plan.push(StepKind::Payout, 0, StepAction::Payout { recipients });
                plan.push(StepKind::Stipend, 0, StepAction::Stipend { to: buyer.clone() });
            }
            // Same slots as the sale, different payee: the tokens go back.
            (ActionParams::Sell { tick, token_amount, seller, .. }, ActionMode::Cancel) => {
                plan.push_envelope(0, ProtocolOp::transfer(tick, *token_amount, seller));
                plan.push(StepKind::Stipend, 0, StepAction::Stipend { to: seller.clone() });
            }
            (ActionParams::MintBatch { tick, count, recipient, refund }, ActionMode::Settle) => {
                for slot in 0..*count {
                    plan.push_envelope(slot, ProtocolOp::mint(tick, recipient));
                }
                plan.push(StepKind::Stipend, 0, StepAction::Stipend { to: refund.clone() });
            }
            (ActionParams::MintBatch { refund, .. }, ActionMode::Cancel) => {
                plan.push(StepKind::Stipend, 0, StepAction::Stipend { to: refund.clone() });
            }
            (ActionParams::WithdrawBatch { tick, withdrawals }, ActionMode::Settle) => {
                for (slot, w) in (0u32..).zip(withdrawals) {
                    plan.push_envelope(slot, ProtocolOp::transfer(tick, w.amount, &w.to));
                }
            }
            // Nothing left the treasury yet.
            (ActionParams::WithdrawBatch { .. }, ActionMode::Cancel) => {}
        }
        plan
    }

    fn push(&mut self, kind: StepKind, slot: u32, action: StepAction) {
        self.steps.push(PlannedStep { id: StepId::new(kind, slot), action });
    }

    fn push_envelope(&mut self, slot: u32, op: ProtocolOp) {
        let commit = StepId::new(StepKind::Commit, slot);
        self.push(StepKind::Commit, slot, StepAction::Commit { op: op.clone() });
        self.push(StepKind::Reveal, slot, StepAction::Reveal { op, commit });
    }

    pub fn remaining<'a>(&'a self, record: &'a TransactionRecord) -> impl Iterator<Item = &'a PlannedStep> + 'a {
        self.steps.iter().filter(move |s| !record.contains(&s.id))
    }

    pub fn is_complete(&self, record: &TransactionRecord) -> bool {
        self.remaining(record).next().is_none()
    }

    /// Minimum wallet balance needed to finish the unrecorded steps.
    ///
    /// One anchor is enough for any number of commits since each reveal
    /// returns it as change before the next commit. An in-flight step is
    /// already paid for.
    pub fn required_balance(&self, record: &TransactionRecord) -> u64 {
        let in_flight = record.in_flight().map(|s| s.step);
        let mut need = 0u64;
        let mut anchor = false;
        for step in self.remaining(record).filter(|s| Some(s.id) != in_flight) {
            need = need.saturating_add(STEP_FEE_RESERVE);
            match &step.action {
                StepAction::Commit { .. } => anchor = true,
                StepAction::Reveal { op, .. } => need = need.saturating_add(op.protocol_fee()),
                StepAction::Payout { recipients } => {
                    need = recipients.iter().fold(need, |acc, (_, v)| acc.saturating_add(*v));
                }
                StepAction::Stipend { .. } => need = need.saturating_add(DUST_THRESHOLD),
            }
        }
        if anchor {
            need = need.saturating_add(COMMIT_ANCHOR_AMOUNT);
        }
        need
    }
}

/// Receives each step as it is broadcast and as it completes. An error
/// stops the action at that point.
#[async_trait]
pub trait ProgressSink: Send + Sync {
    /// Called with the signed transaction before it is submitted.
    async fn step_submitted(
        &self,
        _submitted: &SubmittedStep,
        _record: &TransactionRecord,
    ) -> Result<(), SettlementError> {
        Ok(())
    }

    async fn step_completed(
        &self,
        step: StepId,
        txid: Hash256,
        record: &TransactionRecord,
    ) -> Result<(), SettlementError>;
}

/// Persists each step onto the action document.
pub struct StoreProgress {
    machine: Arc<StateMachine>,
    action_id: String,
}

impl StoreProgress {
    pub fn new(machine: Arc<StateMachine>, action_id: impl Into<String>) -> Self {
        Self { machine, action_id: action_id.into() }
    }
}

#[async_trait]
impl ProgressSink for StoreProgress {
    async fn step_submitted(
        &self,
        submitted: &SubmittedStep,
        _record: &TransactionRecord,
    ) -> Result<(), SettlementError> {
        self.machine.record_submitted(&self.action_id, submitted.clone())?;
        Ok(())
    }

    async fn step_completed(
        &self,
        step: StepId,
        txid: Hash256,
        _record: &TransactionRecord,
    ) -> Result<(), SettlementError> {
        self.machine.record_step(&self.action_id, step, txid)?;
        Ok(())
    }
}

/// Discards progress. For callers that persist the returned record themselves.
pub struct NoProgress;

#[async_trait]
impl ProgressSink for NoProgress {
    async fn step_completed(&self, _: StepId, _: Hash256, _: &TransactionRecord) -> Result<(), SettlementError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub network: Network,
    /// Priority fee ceiling per transaction; `None` pays no priority fee.
    pub max_priority_fee: Option<u64>,
    pub commission: CommissionPolicy,
}

pub struct Orchestrator {
    connection: Arc<LedgerConnection>,
    registry: Arc<SubscriptionRegistry>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    pub fn new(
        connection: Arc<LedgerConnection>,
        registry: Arc<SubscriptionRegistry>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self { connection, registry, settings }
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn plan(&self, params: &ActionParams, mode: ActionMode) -> ActionPlan {
        ActionPlan::for_action(params, mode, &self.settings.commission)
    }

    /// Drive `plan` from `account`, resuming after the steps in `resume`.
    ///
    /// On failure the error carries the record as it stood, including every
    /// step that completed before the failure.
    pub async fn run_action(
        &self,
        plan: &ActionPlan,
        account: &WalletAccount,
        resume: TransactionRecord,
        sink: &dyn ProgressSink,
    ) -> Result<TransactionRecord, ActionError> {
        let mut record = resume;
        if plan.is_complete(&record) {
            return Ok(record);
        }
        if let Err(e) = self.connection.wait_for_connection().await {
            return Err(ActionError::new(e, record));
        }

        let rpc = self.connection.rpc().clone();
        let mut tracker = match BalanceTracker::open(
            rpc,
            self.registry.clone(),
            account.address.clone(),
            self.connection.config(),
        )
        .await
        {
            Ok(t) => t,
            Err(e) => return Err(ActionError::new(e, record)),
        };

        let outcome = self.drive(plan, account, &mut record, &tracker, sink).await;
        tracker.dispose().await;
        match outcome {
            Ok(()) => Ok(record),
            Err(error) => {
                warn!(address = %account.address, steps = record.len(), %error, "action stopped");
                Err(ActionError::new(error, record))
            }
        }
    }

    async fn drive(
        &self,
        plan: &ActionPlan,
        account: &WalletAccount,
        record: &mut TransactionRecord,
        tracker: &BalanceTracker,
        sink: &dyn ProgressSink,
    ) -> Result<(), SettlementError> {
        let balance = tracker.balance();
        let have = balance.mature.saturating_add(balance.pending);
        let need = plan.required_balance(record);
        if have < need {
            return Err(SettlementError::AmountMismatch { have, need });
        }

        for step in &plan.steps {
            if record.contains(&step.id) {
                debug!(step = %step.id, "already recorded, skipping");
                continue;
            }
            self.connection.wait_for_connection().await?;

            let unconfirmed = record.in_flight().filter(|s| s.step == step.id).cloned();
            let (submitted, resend) = match unconfirmed {
                Some(submitted) => {
                    info!(step = %step.id, txid = %submitted.txid, "resending unconfirmed step");
                    (submitted, true)
                }
                None => {
                    tracker.wait_for_pending_utxo_to_finish().await?;
                    let submitted = self.prepare_step(step, account, record).await?;
                    record.begin_step(submitted.clone())?;
                    sink.step_submitted(&submitted, record).await?;
                    (submitted, false)
                }
            };

            self.confirm(&submitted, resend).await?;
            let txid = submitted.txid;
            record.record(step.id, txid)?;
            sink.step_completed(step.id, txid, record).await?;
            info!(step = %step.id, %txid, address = %account.address, "step completed");
        }
        Ok(())
    }

    /// Build and sign the transaction for `step`.
    async fn prepare_step(
        &self,
        step: &PlannedStep,
        account: &WalletAccount,
        record: &TransactionRecord,
    ) -> Result<SubmittedStep, SettlementError> {
        let rpc = self.connection.rpc().clone();
        let utxos = rpc.utxos_by_addresses(std::slice::from_ref(&account.address)).await?;
        let network = self.settings.network;
        let public_key = account.keypair.public_key();

        let (builder, drains) = match &step.action {
            StepAction::Commit { op } => {
                let envelope = CommitEnvelope::new(&public_key, op.clone(), network)?;
                (envelope.commit_builder(), false)
            }
            StepAction::Reveal { op, commit } => {
                let envelope = CommitEnvelope::new(&public_key, op.clone(), network)?;
                let commit_txid = record.get(commit).ok_or_else(|| {
                    SettlementError::Unexpected(format!("{} has no recorded {commit}", step.id))
                })?;
                let anchors = rpc.utxos_by_addresses(std::slice::from_ref(&envelope.address)).await?;
                let anchor = envelope.find_anchor(&anchors, &commit_txid)?;
                (envelope.reveal_builder(anchor), false)
            }
            StepAction::Payout { recipients } => {
                let mut b = TransactionBuilder::new();
                for (address, amount) in recipients {
                    b.add_recipient(address.clone(), *amount);
                }
                (b, false)
            }
            StepAction::Stipend { to } => {
                let mut b = TransactionBuilder::new();
                b.sweep_to(to.clone());
                (b, true)
            }
        };

        let estimate = rpc.fee_estimate().await?;
        let (unsigned, quote) =
            negotiate(&builder, &utxos, &account.address, &estimate, self.settings.max_priority_fee)?;
        debug!(
            step = %step.id,
            fee = unsigned.fee,
            mass = quote.mass,
            priority_fee = quote.priority_fee,
            "fee negotiated"
        );
        let tx = TransactionBuilder::sign(unsigned, &account.keypair)?;
        let expected = tx.txid().map_err(WalletError::from)?;

        // A draining step creates nothing at the wallet; any change there means
        // the sweep landed.
        let watch_address = if drains {
            account.address.clone()
        } else {
            let first = tx
                .outputs
                .first()
                .ok_or_else(|| SettlementError::Unexpected(format!("{} built without outputs", step.id)))?;
            Address::from_lock(first.lock, network)
        };
        Ok(SubmittedStep { step: step.id, txid: expected, tx, watch: watch_address, drains })
    }

    /// Submit `submitted` and wait for it to confirm.
    ///
    /// When resending, a refused submit is not fatal: the earlier broadcast
    /// may already have landed, which the watcher sees.
    async fn confirm(&self, submitted: &SubmittedStep, resend: bool) -> Result<(), SettlementError> {
        let rpc = self.connection.rpc().clone();
        let mut watcher = UtxoWatcher::new(
            rpc.clone(),
            self.registry.clone(),
            submitted.watch.clone(),
            submitted.txid,
            self.connection.config().confirmation_timeout(),
        )
        .wallet_should_be_empty(submitted.drains);
        watcher.register_event_handlers().await?;

        match rpc.submit_transaction(&submitted.tx).await {
            Ok(accepted) if accepted != submitted.txid => {
                watcher.dispose().await;
                return Err(SettlementError::TxidMismatch {
                    expected: submitted.txid.to_string(),
                    actual: accepted.to_string(),
                });
            }
            Ok(_) => {}
            Err(error) if resend => {
                debug!(step = %submitted.step, txid = %submitted.txid, %error, "resend refused, watching");
            }
            Err(error) => {
                watcher.dispose().await;
                return Err(error.into());
            }
        }
        debug!(step = %submitted.step, txid = %submitted.txid, "submitted, awaiting confirmation");
        watcher.wait_for_transaction_completion().await?;
        Ok(())
    }
}
