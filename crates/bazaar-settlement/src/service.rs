//! Settlement facade used by request handlers and the daemon.
//!
//! Claims an action through a guarded status transition, drives its plan
//! with the store as progress sink, and finalizes it. Concurrent callers on
//! the same action are serialized only by those transitions.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use bazaar_core::address::Address;
use bazaar_ledger::{LedgerConnection, SubscriptionRegistry};
use bazaar_wallet::{WalletAccount, WalletDeriver};

use crate::error::{ActionError, SettlementError};
use crate::lifecycle::{ActionTracker, JobLock};
use crate::model::{
    ActionMode, ActionParams, ActionStatus, NewRound, PendingAction, Reservation, SaleRound, StatusExtra,
    TransactionRecord,
};
use crate::orchestrator::{Orchestrator, OrchestratorSettings, ProgressSink, StoreProgress};
use crate::state_machine::StateMachine;
use crate::store::SettlementStore;

/// Wallet that funds withdrawals.
pub const TREASURY_WALLET_INDEX: u32 = 0;
const FIRST_ACTION_WALLET_INDEX: u32 = 1;

/// Outcome of one [`SettlementService::resume_failed`] pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeReport {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Left alone because the wallet cannot cover the remaining steps.
    pub parked: usize,
}

pub struct SettlementService {
    machine: Arc<StateMachine>,
    orchestrator: Orchestrator,
    connection: Arc<LedgerConnection>,
    registry: Arc<SubscriptionRegistry>,
    deriver: WalletDeriver,
    actions: Arc<ActionTracker>,
    resume_job: JobLock,
}

impl SettlementService {
    pub fn new(
        store: Arc<SettlementStore>,
        connection: Arc<LedgerConnection>,
        registry: Arc<SubscriptionRegistry>,
        deriver: WalletDeriver,
        settings: OrchestratorSettings,
    ) -> Self {
        let orchestrator = Orchestrator::new(connection.clone(), registry.clone(), settings);
        Self {
            machine: Arc::new(StateMachine::new(store)),
            orchestrator,
            connection,
            registry,
            deriver,
            actions: ActionTracker::new(),
            resume_job: JobLock::new("resume-failed"),
        }
    }

    pub fn state_machine(&self) -> &Arc<StateMachine> {
        &self.machine
    }

    pub fn action_tracker(&self) -> &Arc<ActionTracker> {
        &self.actions
    }

    // ------------------------------------------------------------------
    // Core operations
    // ------------------------------------------------------------------

    pub fn reserve_inventory(
        &self,
        round_id: &str,
        quantity: u64,
        wallet: &Address,
    ) -> Result<(SaleRound, Reservation), SettlementError> {
        self.machine.reserve_inventory(round_id, quantity, wallet)
    }

    pub fn transition_status(
        &self,
        id: &str,
        new: ActionStatus,
        required: ActionStatus,
        extra: StatusExtra,
    ) -> Result<PendingAction, SettlementError> {
        self.machine.transition_status(id, new, required, extra)
    }

    /// Run `params` from `account`, resuming after `resume`.
    ///
    /// Refused with [`SettlementError::ShuttingDown`] once shutdown began.
    pub async fn run_action(
        &self,
        params: &ActionParams,
        mode: ActionMode,
        account: &WalletAccount,
        resume: TransactionRecord,
        on_progress: &dyn ProgressSink,
    ) -> Result<TransactionRecord, ActionError> {
        let _inflight = match self.actions.begin(format!("wallet-{}", account.index)) {
            Ok(guard) => guard,
            Err(e) => return Err(ActionError::new(e, resume)),
        };
        let plan = self.orchestrator.plan(params, mode);
        self.orchestrator.run_action(&plan, account, resume, on_progress).await
    }

    pub fn get_wallet_account(&self, index: u32) -> WalletAccount {
        self.deriver.wallet_account_at_index(index)
    }

    pub async fn get_wallet_balance(&self, address: &Address) -> Result<u64, SettlementError> {
        Ok(self.connection.get_wallet_balance(address).await?)
    }

    // ------------------------------------------------------------------
    // Action lifecycle
    // ------------------------------------------------------------------

    /// Create an action with its own derived wallet.
    ///
    /// Withdrawals are paid from the treasury wallet; everything else gets a
    /// fresh index.
    pub fn create_action(&self, params: ActionParams) -> Result<PendingAction, SettlementError> {
        params.validate()?;
        let index = match params {
            ActionParams::WithdrawBatch { .. } => TREASURY_WALLET_INDEX,
            _ => self.machine.store().next_wallet_index(FIRST_ACTION_WALLET_INDEX)?,
        };
        self.machine.create_action(params, index)
    }

    /// Address the action's funds must be deposited to.
    pub fn deposit_address(&self, action_id: &str) -> Result<Address, SettlementError> {
        let action = self.machine.get_action(action_id)?;
        Ok(self.get_wallet_account(action.wallet_index).address)
    }

    /// Mark a deposit-awaiting action ready once its wallet covers the plan.
    pub async fn confirm_deposit(&self, action_id: &str) -> Result<PendingAction, SettlementError> {
        let action = self.machine.get_action(action_id)?;
        let plan = self.orchestrator.plan(&action.params, ActionMode::Settle);
        let need = plan.required_balance(&action.record);
        let have = self.get_wallet_balance(&self.deposit_address(action_id)?).await?;
        if have < need {
            return Err(SettlementError::AmountMismatch { have, need });
        }
        self.machine.transition_status(
            action_id,
            ActionStatus::Ready,
            ActionStatus::AwaitingDeposit,
            StatusExtra::default(),
        )
    }

    /// Claim a ready or failed action and drive it to completion.
    pub async fn settle(&self, action_id: &str) -> Result<PendingAction, SettlementError> {
        let _inflight = self.actions.begin(action_id)?;
        let action = self.machine.get_action(action_id)?;
        if action.mode == ActionMode::Cancel {
            return Err(SettlementError::IllegalTransition {
                from: format!("{} (cancel)", action.status),
                to: ActionStatus::InProgress.to_string(),
            });
        }
        let required = match action.status {
            ActionStatus::Ready | ActionStatus::Failed => action.status,
            other => {
                return Err(SettlementError::InvalidStatusForUpdate {
                    id: action_id.to_string(),
                    current: other.to_string(),
                    required: "ready|failed".to_string(),
                });
            }
        };
        let claimed = self.machine.transition_status(
            action_id,
            ActionStatus::InProgress,
            required,
            StatusExtra::default(),
        )?;
        self.drive(claimed, ActionStatus::InProgress, ActionStatus::Completed).await
    }

    /// Cancel an action that has no settle progress on chain.
    ///
    /// A sale returns the tokens to the seller; a mint batch refunds its
    /// wallet. A cancel that itself failed can be retried.
    pub async fn cancel(&self, action_id: &str) -> Result<PendingAction, SettlementError> {
        let _inflight = self.actions.begin(action_id)?;
        let action = self.machine.get_action(action_id)?;
        if action.status.is_terminal() || action.status.is_running() {
            return Err(SettlementError::IllegalTransition {
                from: action.status.to_string(),
                to: ActionStatus::Cancelling.to_string(),
            });
        }
        if action.mode == ActionMode::Settle && !action.record.is_empty() {
            return Err(SettlementError::CancelAfterProgress(action_id.to_string()));
        }

        let plan = self.orchestrator.plan(&action.params, ActionMode::Cancel);
        let to_cancel = StatusExtra { mode: Some(ActionMode::Cancel), ..StatusExtra::default() };
        let mut nothing_to_return = action.record.is_empty() && plan.steps.is_empty();
        if action.record.is_empty() && !nothing_to_return {
            let wallet = self.get_wallet_account(action.wallet_index).address;
            nothing_to_return = self.get_wallet_balance(&wallet).await? == 0;
        }
        if nothing_to_return {
            return self.close_cancelled(&action, to_cancel);
        }
        let claimed =
            self.machine
                .transition_status(action_id, ActionStatus::Cancelling, action.status, to_cancel)?;
        self.drive(claimed, ActionStatus::Cancelling, ActionStatus::Cancelled).await
    }

    /// Cancel without broadcasting. A failed action passes through
    /// `Cancelling` since it cannot go to `Cancelled` directly.
    fn close_cancelled(
        &self,
        action: &PendingAction,
        to_cancel: StatusExtra,
    ) -> Result<PendingAction, SettlementError> {
        let cancelled = if action.status.can_transition_to(ActionStatus::Cancelled) {
            self.machine
                .transition_status(&action.id, ActionStatus::Cancelled, action.status, to_cancel)?
        } else {
            self.machine
                .transition_status(&action.id, ActionStatus::Cancelling, action.status, to_cancel)?;
            self.machine.transition_status(
                &action.id,
                ActionStatus::Cancelled,
                ActionStatus::Cancelling,
                StatusExtra::default(),
            )?
        };
        info!(action_id = %action.id, "action cancelled, nothing to return");
        Ok(cancelled)
    }

    async fn drive(
        &self,
        action: PendingAction,
        running: ActionStatus,
        done: ActionStatus,
    ) -> Result<PendingAction, SettlementError> {
        let account = self.get_wallet_account(action.wallet_index);
        let plan = self.orchestrator.plan(&action.params, action.mode);
        let sink = StoreProgress::new(self.machine.clone(), action.id.clone());

        match self.orchestrator.run_action(&plan, &account, action.record.clone(), &sink).await {
            Ok(_) => {
                let finished = self.machine.transition_status(&action.id, done, running, StatusExtra::default())?;
                info!(action_id = %action.id, status = %finished.status, steps = finished.record.len(), "action finished");
                Ok(finished)
            }
            Err(failure) => {
                self.persist_partial(&action.id, &failure.partial);
                if failure.error.is_expected_contention() {
                    debug!(action_id = %action.id, error = %failure.error, "action deferred");
                } else {
                    warn!(action_id = %action.id, error = %failure.error, kind = ?failure.kind(), "action failed");
                }
                self.machine.transition_status(
                    &action.id,
                    ActionStatus::Failed,
                    running,
                    StatusExtra::error(failure.error.to_string()),
                )?;
                Err(failure.error)
            }
        }
    }

    /// Make sure every step in `partial` is on the document. Steps normally
    /// land through the sink already; this covers a sink that failed.
    fn persist_partial(&self, action_id: &str, partial: &TransactionRecord) {
        for step in partial.iter() {
            if let Err(e) = self.machine.record_step(action_id, step.step, step.txid) {
                warn!(action_id, step = %step.step, error = %e, "could not persist completed step");
            }
        }
    }

    /// Retry every failed action in the mode it failed in.
    ///
    /// Actions whose wallet cannot cover the remaining steps are parked
    /// until a deposit changes that.
    pub async fn resume_failed(&self) -> Result<ResumeReport, SettlementError> {
        let mut report = ResumeReport::default();
        for action in self.machine.list_actions(Some(ActionStatus::Failed))? {
            if self.actions.is_closing() {
                break;
            }
            match self.can_resume(&action).await {
                Ok(true) => {}
                Ok(false) => {
                    debug!(action_id = %action.id, "wallet cannot cover remaining steps, parked");
                    report.parked += 1;
                    continue;
                }
                Err(e) => {
                    debug!(action_id = %action.id, error = %e, "resume precheck failed");
                    report.failed += 1;
                    continue;
                }
            }
            let outcome = match action.mode {
                ActionMode::Settle => self.settle(&action.id).await,
                ActionMode::Cancel => self.cancel(&action.id).await,
            };
            match outcome {
                Ok(_) => report.completed += 1,
                Err(SettlementError::ShuttingDown) => break,
                Err(e) if e.is_expected_contention() => report.skipped += 1,
                Err(e) => {
                    debug!(action_id = %action.id, error = %e, "resume attempt failed");
                    report.failed += 1;
                }
            }
        }
        if report != ResumeReport::default() {
            info!(
                completed = report.completed,
                failed = report.failed,
                skipped = report.skipped,
                parked = report.parked,
                "resume pass"
            );
        }
        Ok(report)
    }

    async fn can_resume(&self, action: &PendingAction) -> Result<bool, SettlementError> {
        let plan = self.orchestrator.plan(&action.params, action.mode);
        let need = plan.required_balance(&action.record);
        if need == 0 {
            return Ok(true);
        }
        let have = self.get_wallet_balance(&self.get_wallet_account(action.wallet_index).address).await?;
        // An empty cancel closes without transactions.
        if action.mode == ActionMode::Cancel && action.record.is_empty() && have == 0 {
            return Ok(true);
        }
        Ok(have >= need)
    }

    /// Run [`resume_failed`](Self::resume_failed) every `every` until
    /// shutdown begins. A pass already running when shutdown starts holds
    /// its in-flight guard, so [`shutdown`](Self::shutdown) waits for it.
    pub async fn run_resume_job(self: Arc<Self>, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.actions.closed() => return,
                _ = ticker.tick() => {}
            }
            let Ok(_job) = self.resume_job.try_acquire() else {
                debug!("resume pass still running, skipping tick");
                continue;
            };
            if let Err(e) = self.resume_failed().await {
                warn!(error = %e, "resume pass failed");
            }
        }
    }

    /// Mark actions left running by a previous process as failed so the
    /// resume job picks them up. Call once at boot, before any work starts.
    pub fn recover_interrupted(&self) -> Result<usize, SettlementError> {
        let mut recovered = 0;
        for status in [ActionStatus::InProgress, ActionStatus::Cancelling] {
            for action in self.machine.list_actions(Some(status))? {
                self.machine.transition_status(
                    &action.id,
                    ActionStatus::Failed,
                    status,
                    StatusExtra::error("interrupted by restart"),
                )?;
                info!(action_id = %action.id, steps = action.record.len(), "recovered interrupted action");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    // ------------------------------------------------------------------
    // Sale rounds
    // ------------------------------------------------------------------

    pub fn create_round(&self, round: NewRound) -> Result<SaleRound, SettlementError> {
        self.machine.create_round(round)
    }

    pub fn cancel_reservation(&self, reservation_id: &str) -> Result<(SaleRound, Reservation), SettlementError> {
        self.machine.cancel_reservation(reservation_id)
    }

    pub fn complete_reservation(&self, reservation_id: &str) -> Result<Reservation, SettlementError> {
        self.machine.complete_reservation(reservation_id)
    }

    /// Refuse new work, wait up to `grace` for in-flight actions, then
    /// release every ledger subscription.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        let drained = self.actions.shutdown(grace).await;
        self.registry.teardown().await;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commission::CommissionPolicy;
    use crate::model::{StepId, StepKind, Withdrawal};
    use bazaar_core::address::Network;
    use bazaar_core::constants::{COIN, USER_TX_MATURITY};
    use bazaar_core::traits::LedgerRpc;
    use bazaar_core::types::Hash256;
    use bazaar_ledger::LedgerConfig;
    use bazaar_ledger::testing::SimLedger;
    use bazaar_wallet::Seed;

    const NET: Network = Network::Testnet;

    struct Harness {
        sim: Arc<SimLedger>,
        service: Arc<SettlementService>,
        _dir: tempfile::TempDir,
    }

    fn party(tag: u8) -> Address {
        Address::from_pubkey_hash(Hash256([tag; 32]), NET)
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SettlementStore::open(dir.path().join("settlement")).unwrap());
        let sim = Arc::new(SimLedger::new(NET));
        let rpc: Arc<dyn LedgerRpc> = sim.clone();
        let connection = Arc::new(LedgerConnection::new(rpc.clone(), LedgerConfig::for_network(NET)));
        let registry = Arc::new(SubscriptionRegistry::new(rpc));
        let settings = OrchestratorSettings {
            network: NET,
            max_priority_fee: None,
            commission: CommissionPolicy { rate_bps: 100, minimum: 1_000, treasury: Some(party(0xEE)) },
        };
        let deriver = WalletDeriver::new(Seed::from_bytes([3; 32]), NET);
        let service = Arc::new(SettlementService::new(store, connection, registry, deriver, settings));
        Harness { sim, service, _dir: dir }
    }

    fn sell() -> ActionParams {
        ActionParams::Sell { tick: "abc".into(), token_amount: 10, price: 2 * COIN, seller: party(1), buyer: party(2) }
    }

    async fn funded_ready(h: &Harness, params: ActionParams, amount: u64) -> PendingAction {
        let action = h.service.create_action(params).unwrap();
        h.service
            .transition_status(&action.id, ActionStatus::AwaitingDeposit, ActionStatus::Created, StatusExtra::default())
            .unwrap();
        h.sim.fund(&h.service.deposit_address(&action.id).unwrap(), amount);
        h.service.confirm_deposit(&action.id).await.unwrap()
    }

    #[test]
    fn wallet_indices_are_per_action_except_withdrawals() {
        let h = harness();
        let a = h.service.create_action(sell()).unwrap();
        let b = h.service.create_action(sell()).unwrap();
        let w = h
            .service
            .create_action(ActionParams::WithdrawBatch {
                tick: "abc".into(),
                withdrawals: vec![Withdrawal { to: party(5), amount: 1 }],
            })
            .unwrap();
        assert_eq!((a.wallet_index, b.wallet_index, w.wallet_index), (1, 2, TREASURY_WALLET_INDEX));
        assert_ne!(h.service.deposit_address(&a.id).unwrap(), h.service.deposit_address(&b.id).unwrap());
    }

    #[tokio::test]
    async fn confirm_deposit_requires_enough_funds() {
        let h = harness();
        let action = h.service.create_action(sell()).unwrap();
        h.service
            .transition_status(&action.id, ActionStatus::AwaitingDeposit, ActionStatus::Created, StatusExtra::default())
            .unwrap();
        h.sim.fund(&h.service.deposit_address(&action.id).unwrap(), COIN);
        assert!(matches!(
            h.service.confirm_deposit(&action.id).await,
            Err(SettlementError::AmountMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn settle_completes_and_persists_record() {
        let h = harness();
        let action = funded_ready(&h, sell(), 3 * COIN).await;
        let done = h.service.settle(&action.id).await.unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
        assert_eq!(done.record.len(), 4);
        assert_eq!(done.record.txids(), h.sim.submitted());
        assert!(done.last_error.is_none());

        // Completed actions cannot be claimed again.
        assert!(matches!(
            h.service.settle(&action.id).await,
            Err(SettlementError::InvalidStatusForUpdate { .. })
        ));
    }

    #[tokio::test]
    async fn failed_settle_keeps_partial_and_resumes() {
        let h = harness();
        let action = funded_ready(&h, sell(), 3 * COIN).await;
        h.sim.reject_next_submits(1);

        let err = h.service.settle(&action.id).await.unwrap_err();
        assert!(matches!(err, SettlementError::Ledger(_)));
        let failed = h.service.state_machine().get_action(&action.id).unwrap();
        assert_eq!(failed.status, ActionStatus::Failed);
        assert!(failed.last_error.is_some());
        assert_eq!(failed.record.len(), 0);
        let pending = failed.record.in_flight().unwrap();
        assert_eq!(pending.step, StepId::new(StepKind::Commit, 0));

        let report = h.service.resume_failed().await.unwrap();
        assert_eq!(report, ResumeReport { completed: 1, ..ResumeReport::default() });
        let done = h.service.state_machine().get_action(&action.id).unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
        assert_eq!(done.record.get(&pending.step), Some(pending.txid));
        assert_eq!(done.record.txids(), h.sim.submitted());
    }

    #[tokio::test]
    async fn underfunded_failure_is_parked_until_funded() {
        let h = harness();
        let action = h.service.create_action(sell()).unwrap();
        for (from, to) in [
            (ActionStatus::Created, ActionStatus::AwaitingDeposit),
            (ActionStatus::AwaitingDeposit, ActionStatus::Ready),
        ] {
            h.service.transition_status(&action.id, to, from, StatusExtra::default()).unwrap();
        }
        assert!(matches!(
            h.service.settle(&action.id).await,
            Err(SettlementError::AmountMismatch { have: 0, .. })
        ));
        let failed = h.service.state_machine().get_action(&action.id).unwrap();

        let report = h.service.resume_failed().await.unwrap();
        assert_eq!(report, ResumeReport { parked: 1, ..ResumeReport::default() });
        assert_eq!(h.sim.submit_count(), 0);
        assert_eq!(h.service.state_machine().get_action(&action.id).unwrap().version, failed.version);

        h.sim.fund(&h.service.deposit_address(&action.id).unwrap(), 3 * COIN);
        let report = h.service.resume_failed().await.unwrap();
        assert_eq!(report, ResumeReport { completed: 1, ..ResumeReport::default() });
    }

    #[tokio::test]
    async fn cancel_without_progress_returns_tokens() {
        let h = harness();
        let action = funded_ready(&h, sell(), 3 * COIN).await;
        let cancelled = h.service.cancel(&action.id).await.unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert_eq!(cancelled.mode, ActionMode::Cancel);
        assert!(cancelled.record.contains(&StepId::new(StepKind::Stipend, 0)));
        assert!(h.sim.balance_of(&party(1)) > 0);
        assert_eq!(h.sim.balance_of(&party(2)), 0);
    }

    #[tokio::test]
    async fn cancel_unfunded_sale_needs_no_transactions() {
        let h = harness();
        let created = h.service.create_action(sell()).unwrap();
        let cancelled = h.service.cancel(&created.id).await.unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert_eq!(cancelled.mode, ActionMode::Cancel);

        let awaiting = h.service.create_action(sell()).unwrap();
        h.service
            .transition_status(&awaiting.id, ActionStatus::AwaitingDeposit, ActionStatus::Created, StatusExtra::default())
            .unwrap();
        assert_eq!(h.service.cancel(&awaiting.id).await.unwrap().status, ActionStatus::Cancelled);
        assert_eq!(h.sim.submit_count(), 0);
        assert!(h.service.state_machine().list_actions(Some(ActionStatus::Failed)).unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_unfunded_cancel_closes_through_cancelling() {
        let h = harness();
        let action = h.service.create_action(sell()).unwrap();
        h.service
            .transition_status(&action.id, ActionStatus::AwaitingDeposit, ActionStatus::Created, StatusExtra::default())
            .unwrap();
        h.service
            .transition_status(&action.id, ActionStatus::Cancelling, ActionStatus::AwaitingDeposit, StatusExtra {
                mode: Some(ActionMode::Cancel),
                ..StatusExtra::default()
            })
            .unwrap();
        h.service
            .transition_status(&action.id, ActionStatus::Failed, ActionStatus::Cancelling, StatusExtra::error("left over"))
            .unwrap();

        let report = h.service.resume_failed().await.unwrap();
        assert_eq!(report, ResumeReport { completed: 1, ..ResumeReport::default() });
        let closed = h.service.state_machine().get_action(&action.id).unwrap();
        assert_eq!(closed.status, ActionStatus::Cancelled);
        assert_eq!(h.sim.submit_count(), 0);
    }

    #[tokio::test]
    async fn cancel_after_settle_progress_is_refused() {
        let h = harness();
        let action = funded_ready(&h, sell(), 3 * COIN).await;
        h.service
            .transition_status(&action.id, ActionStatus::InProgress, ActionStatus::Ready, StatusExtra::default())
            .unwrap();
        h.service
            .state_machine()
            .record_step(&action.id, StepId::new(StepKind::Commit, 0), Hash256([1; 32]))
            .unwrap();
        h.service
            .transition_status(&action.id, ActionStatus::Failed, ActionStatus::InProgress, StatusExtra::default())
            .unwrap();
        assert_eq!(
            h.service.cancel(&action.id).await.unwrap_err(),
            SettlementError::CancelAfterProgress(action.id.clone())
        );
    }

    #[tokio::test]
    async fn withdraw_cancel_needs_no_transactions() {
        let h = harness();
        let action = h
            .service
            .create_action(ActionParams::WithdrawBatch {
                tick: "abc".into(),
                withdrawals: vec![Withdrawal { to: party(5), amount: 1 }],
            })
            .unwrap();
        let cancelled = h.service.cancel(&action.id).await.unwrap();
        assert_eq!(cancelled.status, ActionStatus::Cancelled);
        assert_eq!(h.sim.submit_count(), 0);
    }

    #[test]
    fn recover_marks_running_actions_failed() {
        let h = harness();
        let a = h.service.create_action(sell()).unwrap();
        for (from, to) in [
            (ActionStatus::Created, ActionStatus::AwaitingDeposit),
            (ActionStatus::AwaitingDeposit, ActionStatus::Ready),
            (ActionStatus::Ready, ActionStatus::InProgress),
        ] {
            h.service.transition_status(&a.id, to, from, StatusExtra::default()).unwrap();
        }
        assert_eq!(h.service.recover_interrupted().unwrap(), 1);
        let a = h.service.state_machine().get_action(&a.id).unwrap();
        assert_eq!(a.status, ActionStatus::Failed);
        assert_eq!(a.last_error.as_deref(), Some("interrupted by restart"));
        assert_eq!(h.service.recover_interrupted().unwrap(), 0);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_settlements() {
        let h = harness();
        let action = funded_ready(&h, sell(), 3 * COIN).await;
        assert!(h.service.shutdown(Duration::from_secs(1)).await);
        assert_eq!(h.service.settle(&action.id).await.unwrap_err(), SettlementError::ShuttingDown);
        let still = h.service.state_machine().get_action(&action.id).unwrap();
        assert_eq!(still.status, ActionStatus::Ready);
    }

    #[tokio::test]
    async fn shutdown_waits_for_running_resume_job() {
        let h = harness();
        let action = funded_ready(&h, sell(), 3 * COIN).await;
        h.sim.reject_next_submits(1);
        assert!(h.service.settle(&action.id).await.is_err());

        // Confirmations stop maturing, so the resumed action parks mid-run.
        h.sim.set_blocks_per_submit(0);
        let job = tokio::spawn(h.service.clone().run_resume_job(Duration::from_millis(10)));
        tokio::time::timeout(Duration::from_secs(5), async {
            while h.sim.submit_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let shutdown = tokio::spawn({
            let service = h.service.clone();
            async move { service.shutdown(Duration::from_secs(60)).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());
        assert_eq!(h.service.action_tracker().inflight(), vec![action.id.clone()]);

        h.sim.set_blocks_per_submit(USER_TX_MATURITY);
        h.sim.mine(USER_TX_MATURITY);
        assert!(shutdown.await.unwrap());
        tokio::time::timeout(Duration::from_secs(5), job).await.unwrap().unwrap();
        let done = h.service.state_machine().get_action(&action.id).unwrap();
        assert_eq!(done.status, ActionStatus::Completed);
    }
}
