//! Priority fee ceiling: over-budget fees fail before anything is broadcast.

use std::sync::Arc;

use bazaar_core::constants::COIN;
use bazaar_core::traits::FeeEstimate;
use bazaar_settlement::orchestrator::NoProgress;
use bazaar_settlement::{
    ActionMode, ActionStatus, ErrorKind, SettlementError, SettlementService, SettlementStore, TransactionRecord,
};
use bazaar_tests::helpers::*;
use bazaar_wallet::{TransactionBuilder, WalletError, negotiate};

fn expensive() -> FeeEstimate {
    FeeEstimate { priority_feerate: 5_000, normal_feerate: 1, low_feerate: 1 }
}

#[test]
fn builder_refuses_priority_fee_above_ceiling() {
    let env = LedgerEnv::new();
    let payer = account(3);
    env.sim.fund(&payer.address, 2 * COIN);
    let utxos = env.sim.utxos_of(&payer.address);

    let mut builder = TransactionBuilder::new();
    builder.add_recipient(party(9), COIN);
    let err = negotiate(&builder, &utxos, &payer.address, &expensive(), Some(1_000)).unwrap_err();
    let WalletError::PriorityFeeTooHigh { required, max } = err else {
        panic!("expected fee ceiling error, got {err:?}");
    };
    assert!(required > max);
    assert_eq!(max, 1_000);
}

#[tokio::test]
async fn orchestrator_broadcasts_nothing_over_ceiling() {
    let env = LedgerEnv::new();
    env.sim.fund(&account(3).address, 5 * COIN);
    env.sim.set_fee_estimate(expensive());

    let orchestrator = env.orchestrator(Some(1_000));
    let plan = orchestrator.plan(&sell(2 * COIN), ActionMode::Settle);
    let err = orchestrator
        .run_action(&plan, &account(3), TransactionRecord::default(), &NoProgress)
        .await
        .unwrap_err();

    assert!(matches!(err.error, SettlementError::PriorityFeeTooHigh { max: 1_000, .. }));
    assert_eq!(err.kind(), ErrorKind::Precondition);
    assert!(err.partial.is_empty());
    assert_eq!(env.sim.submit_count(), 0);
    assert!(env.registry.active_addresses().await.is_empty());
}

#[tokio::test]
async fn ceiling_hit_mid_action_keeps_earlier_steps() {
    let env = LedgerEnv::new();
    env.sim.fund(&account(3).address, 5 * COIN);
    let orchestrator = env.orchestrator(Some(1_000));
    let plan = orchestrator.plan(&sell(2 * COIN), ActionMode::Settle);

    struct RaiseFees(Arc<bazaar_ledger::testing::SimLedger>);
    #[async_trait::async_trait]
    impl bazaar_settlement::ProgressSink for RaiseFees {
        async fn step_completed(
            &self,
            _: bazaar_settlement::StepId,
            _: bazaar_core::types::Hash256,
            _: &TransactionRecord,
        ) -> Result<(), SettlementError> {
            self.0.set_fee_estimate(expensive());
            Ok(())
        }
    }

    let err = orchestrator
        .run_action(&plan, &account(3), TransactionRecord::default(), &RaiseFees(env.sim.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err.error, SettlementError::PriorityFeeTooHigh { .. }));
    assert_eq!(err.partial.len(), 1);
    assert_eq!(env.sim.submit_count(), 1);
}

#[tokio::test]
async fn service_records_fee_failure_on_action() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SettlementStore::open(dir.path().join("settlement")).unwrap());
    let env = LedgerEnv::new();
    env.sim.set_fee_estimate(expensive());
    let service = SettlementService::new(
        store,
        env.connection.clone(),
        env.registry.clone(),
        deriver(),
        settings(Some(1_000)),
    );

    let action = service.create_action(sell(2 * COIN)).unwrap();
    service
        .transition_status(&action.id, ActionStatus::AwaitingDeposit, ActionStatus::Created, Default::default())
        .unwrap();
    env.sim.fund(&service.deposit_address(&action.id).unwrap(), 5 * COIN);
    service.confirm_deposit(&action.id).await.unwrap();

    let err = service.settle(&action.id).await.unwrap_err();
    assert!(matches!(err, SettlementError::PriorityFeeTooHigh { .. }));
    let stored = service.state_machine().get_action(&action.id).unwrap();
    assert_eq!(stored.status, ActionStatus::Failed);
    assert!(stored.last_error.unwrap().contains("priority fee too high"));
    assert_eq!(env.sim.submit_count(), 0);
}
