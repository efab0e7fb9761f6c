//! Crash/resume equivalence for multi-step actions.
//!
//! A run interrupted right after any persisted step, or stalled on a
//! broadcast that never confirmed, then resumed from the stored record by a
//! fresh process, must end with exactly the transaction ids of an
//! uninterrupted run and must not broadcast anything twice.

use std::sync::Arc;

use async_trait::async_trait;
use bazaar_core::constants::COIN;
use bazaar_core::error::LedgerError;
use bazaar_core::types::Hash256;
use bazaar_ledger::testing::SimLedger;
use bazaar_settlement::model::{StepId, SubmittedStep};
use bazaar_settlement::orchestrator::{NoProgress, ProgressSink};
use bazaar_settlement::{ActionMode, ActionParams, SettlementError, StoreProgress, TransactionRecord};
use bazaar_tests::helpers::*;

const PRICE: u64 = 3 * COIN;
const WALLET: u32 = 7;

async fn uninterrupted(params: &ActionParams, deposit: u64) -> Vec<Hash256> {
    let env = LedgerEnv::new();
    env.sim.fund(&account(WALLET).address, deposit);
    let orchestrator = env.orchestrator(None);
    let plan = orchestrator.plan(params, ActionMode::Settle);
    let record = orchestrator
        .run_action(&plan, &account(WALLET), TransactionRecord::default(), &NoProgress)
        .await
        .unwrap();
    record.txids()
}

async fn crash_then_resume(params: &ActionParams, deposit: u64, crash_after: usize) -> (Vec<Hash256>, Vec<Hash256>) {
    let (machine, _dir) = temp_machine();
    let action = running_action(&machine, params.clone(), WALLET);

    let env = LedgerEnv::new();
    env.sim.fund(&account(WALLET).address, deposit);
    let first = env.orchestrator(None);
    let plan = first.plan(params, ActionMode::Settle);
    let crash = CrashAfter { machine: machine.clone(), action_id: action.id.clone(), after: crash_after };
    let err = first
        .run_action(&plan, &account(WALLET), TransactionRecord::default(), &crash)
        .await
        .unwrap_err();
    assert_eq!(err.error, SettlementError::Unexpected("simulated crash".into()));
    assert_eq!(err.partial.len(), crash_after);
    drop(first);

    // New process: new connection and registry, same node, same store.
    let restarted = LedgerEnv::attach(env.sim.clone());
    let orchestrator = restarted.orchestrator(None);
    let stored = machine.get_action(&action.id).unwrap().record;
    assert_eq!(stored, err.partial);

    let sink = StoreProgress::new(machine.clone(), action.id.clone());
    let record = orchestrator.run_action(&plan, &account(WALLET), stored, &sink).await.unwrap();
    assert_eq!(machine.get_action(&action.id).unwrap().record, record);
    (record.txids(), env.sim.submitted())
}

#[tokio::test]
async fn sell_resume_from_every_step_matches_uninterrupted() {
    let params = sell(PRICE);
    let deposit = sale_deposit(PRICE);
    let expected = uninterrupted(&params, deposit).await;
    assert_eq!(expected.len(), 4);

    for crash_after in 1..expected.len() {
        let (resumed, broadcast) = crash_then_resume(&params, deposit, crash_after).await;
        assert_eq!(resumed, expected, "crash after {crash_after} steps");
        assert_eq!(broadcast, expected, "duplicate broadcast after crash at {crash_after}");
    }
}

#[tokio::test]
async fn mint_batch_resume_matches_uninterrupted() {
    let params = ActionParams::MintBatch { tick: "bzr".into(), count: 3, recipient: party(3), refund: party(4) };
    let deposit = 5 * COIN;
    let expected = uninterrupted(&params, deposit).await;
    assert_eq!(expected.len(), 7);

    for crash_after in [1, 2, 5, 6] {
        let (resumed, broadcast) = crash_then_resume(&params, deposit, crash_after).await;
        assert_eq!(resumed, expected, "crash after {crash_after} steps");
        assert_eq!(broadcast, expected);
    }
}

#[tokio::test]
async fn completed_record_resumes_to_itself_without_network() {
    let params = sell(PRICE);
    let env = LedgerEnv::new();
    env.sim.fund(&account(WALLET).address, sale_deposit(PRICE));
    let orchestrator = env.orchestrator(None);
    let plan = orchestrator.plan(&params, ActionMode::Settle);
    let record = orchestrator
        .run_action(&plan, &account(WALLET), TransactionRecord::default(), &NoProgress)
        .await
        .unwrap();

    env.sim.disconnect();
    let again = orchestrator.run_action(&plan, &account(WALLET), record.clone(), &NoProgress).await.unwrap();
    assert_eq!(again, record);
}

/// Persists like the store sink, then stops the node from confirming once
/// `after` steps are recorded.
struct StallAfter {
    store: StoreProgress,
    sim: Arc<SimLedger>,
    after: usize,
}

#[async_trait]
impl ProgressSink for StallAfter {
    async fn step_submitted(
        &self,
        submitted: &SubmittedStep,
        record: &TransactionRecord,
    ) -> Result<(), SettlementError> {
        self.store.step_submitted(submitted, record).await
    }

    async fn step_completed(
        &self,
        step: StepId,
        txid: Hash256,
        record: &TransactionRecord,
    ) -> Result<(), SettlementError> {
        self.store.step_completed(step, txid, record).await?;
        if record.len() >= self.after {
            self.sim.hold_confirmations(true);
        }
        Ok(())
    }
}

async fn stall_then_resume(params: &ActionParams, deposit: u64, after: usize) -> (Vec<Hash256>, Vec<Hash256>) {
    let (machine, _dir) = temp_machine();
    let action = running_action(&machine, params.clone(), WALLET);

    let env = LedgerEnv::new();
    env.sim.fund(&account(WALLET).address, deposit);
    let first = env.orchestrator(None);
    let plan = first.plan(params, ActionMode::Settle);
    let sink = StallAfter {
        store: StoreProgress::new(machine.clone(), action.id.clone()),
        sim: env.sim.clone(),
        after,
    };
    let err = first
        .run_action(&plan, &account(WALLET), TransactionRecord::default(), &sink)
        .await
        .unwrap_err();
    assert!(matches!(err.error, SettlementError::Ledger(LedgerError::ConfirmationTimeout { .. })));
    assert_eq!(err.partial.len(), after);
    let stalled = err.partial.in_flight().expect("unconfirmed step kept").clone();
    assert_eq!(stalled.step, plan.steps[after].id);
    drop(first);

    let stored = machine.get_action(&action.id).unwrap().record;
    assert_eq!(stored, err.partial);

    // The broadcast lands while nobody is watching.
    env.sim.release_held();

    let restarted = LedgerEnv::attach(env.sim.clone());
    let orchestrator = restarted.orchestrator(None);
    let sink = StoreProgress::new(machine.clone(), action.id.clone());
    let record = orchestrator.run_action(&plan, &account(WALLET), stored, &sink).await.unwrap();
    assert_eq!(record.get(&stalled.step), Some(stalled.txid));
    assert!(record.in_flight().is_none());
    assert_eq!(machine.get_action(&action.id).unwrap().record, record);
    (record.txids(), env.sim.submitted())
}

#[tokio::test(start_paused = true)]
async fn unconfirmed_step_is_resent_not_rebuilt() {
    let params = sell(PRICE);
    let deposit = sale_deposit(PRICE);
    let expected = uninterrupted(&params, deposit).await;

    // Stall on the reveal, the payout and the final sweep in turn.
    for after in 1..expected.len() {
        let (resumed, broadcast) = stall_then_resume(&params, deposit, after).await;
        assert_eq!(resumed, expected, "stalled after {after} steps");
        assert_eq!(broadcast, expected, "extra broadcast after stall at {after}");
    }
}
