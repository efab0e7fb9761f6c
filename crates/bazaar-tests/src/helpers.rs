//! Shared test helpers: a simulated ledger wired to the settlement stack.

use std::sync::Arc;

use async_trait::async_trait;
use bazaar_core::address::{Address, Network};
use bazaar_core::constants::COIN;
use bazaar_core::traits::LedgerRpc;
use bazaar_core::types::Hash256;
use bazaar_ledger::testing::SimLedger;
use bazaar_ledger::{LedgerConfig, LedgerConnection, SubscriptionRegistry};
use bazaar_settlement::model::{StepId, SubmittedStep};
use bazaar_settlement::orchestrator::ProgressSink;
use bazaar_settlement::{
    ActionParams, ActionStatus, CommissionPolicy, Orchestrator, OrchestratorSettings, PendingAction,
    SettlementError, SettlementStore, StateMachine, TransactionRecord,
};
use bazaar_wallet::{Seed, WalletAccount, WalletDeriver};

pub const NET: Network = Network::Testnet;

/// Deterministic third-party address.
pub fn party(tag: u8) -> Address {
    Address::from_pubkey_hash(Hash256([tag; 32]), NET)
}

pub fn treasury() -> Address {
    party(0xEE)
}

pub fn deriver() -> WalletDeriver {
    WalletDeriver::new(Seed::from_bytes([0x42; 32]), NET)
}

pub fn account(index: u32) -> WalletAccount {
    deriver().wallet_account_at_index(index)
}

pub fn commission() -> CommissionPolicy {
    CommissionPolicy { rate_bps: 250, minimum: 50_000, treasury: Some(treasury()) }
}

pub fn settings(max_priority_fee: Option<u64>) -> OrchestratorSettings {
    OrchestratorSettings { network: NET, max_priority_fee, commission: commission() }
}

pub fn sell(price: u64) -> ActionParams {
    ActionParams::Sell {
        tick: "bzr".into(),
        token_amount: 21_000,
        price,
        seller: party(1),
        buyer: party(2),
    }
}

/// A simulated node plus the connection and registry a process would hold.
pub struct LedgerEnv {
    pub sim: Arc<SimLedger>,
    pub connection: Arc<LedgerConnection>,
    pub registry: Arc<SubscriptionRegistry>,
}

impl LedgerEnv {
    pub fn new() -> Self {
        Self::attach(Arc::new(SimLedger::new(NET)))
    }

    /// Fresh connection and registry over an existing node, as after a
    /// process restart.
    pub fn attach(sim: Arc<SimLedger>) -> Self {
        let rpc: Arc<dyn LedgerRpc> = sim.clone();
        Self {
            connection: Arc::new(LedgerConnection::new(rpc.clone(), LedgerConfig::for_network(NET))),
            registry: Arc::new(SubscriptionRegistry::new(rpc)),
            sim,
        }
    }

    pub fn orchestrator(&self, max_priority_fee: Option<u64>) -> Orchestrator {
        Orchestrator::new(self.connection.clone(), self.registry.clone(), settings(max_priority_fee))
    }
}

impl Default for LedgerEnv {
    fn default() -> Self {
        Self::new()
    }
}

pub fn temp_machine() -> (Arc<StateMachine>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SettlementStore::open(dir.path().join("settlement")).unwrap();
    (Arc::new(StateMachine::new(Arc::new(store))), dir)
}

/// Create an action and walk it to `InProgress`.
pub fn running_action(machine: &StateMachine, params: ActionParams, wallet_index: u32) -> PendingAction {
    let action = machine.create_action(params, wallet_index).unwrap();
    let mut current = action;
    for (from, to) in [
        (ActionStatus::Created, ActionStatus::AwaitingDeposit),
        (ActionStatus::AwaitingDeposit, ActionStatus::Ready),
        (ActionStatus::Ready, ActionStatus::InProgress),
    ] {
        current = machine.transition_status(&current.id, to, from, Default::default()).unwrap();
    }
    current
}

/// Persists each step, then fails once `after` steps are recorded, as if
/// the process died right after the write.
pub struct CrashAfter {
    pub machine: Arc<StateMachine>,
    pub action_id: String,
    pub after: usize,
}

#[async_trait]
impl ProgressSink for CrashAfter {
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
        record: &TransactionRecord,
    ) -> Result<(), SettlementError> {
        self.machine.record_step(&self.action_id, step, txid)?;
        if record.len() >= self.after {
            return Err(SettlementError::Unexpected("simulated crash".into()));
        }
        Ok(())
    }
}

/// Enough to cover a sale of `price` with room for fees.
pub fn sale_deposit(price: u64) -> u64 {
    price + COIN
}
