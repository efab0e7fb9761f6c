//! Trait interfaces between crates.
//!
//! - [`LedgerRpc`] is the remote ledger node as seen by the settlement
//!   engine. `bazaar-ledger` implements it over WebSocket JSON-RPC and
//!   provides an in-process simulator for tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::address::Address;
use crate::error::LedgerError;
use crate::types::{Hash256, OutPoint, Transaction, UtxoEntry};

/// Node status reported by `getServerInfo`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
    pub is_synced: bool,
    pub has_utxo_index: bool,
    pub virtual_height: u64,
    pub server_version: String,
}

/// An unspent output owned by an address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoRecord {
    pub address: Address,
    pub outpoint: OutPoint,
    pub entry: UtxoEntry,
}

impl UtxoRecord {
    pub fn value(&self) -> u64 {
        self.entry.output.value
    }
}

/// A change to the UTXO set of one address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxosChanged {
    pub address: Address,
    pub added: Vec<UtxoRecord>,
    pub removed: Vec<OutPoint>,
}

/// Fee rates in minor units per mass unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeEstimate {
    pub priority_feerate: u64,
    pub normal_feerate: u64,
    pub low_feerate: u64,
}

/// Notification pushed by the node to every subscriber of [`LedgerRpc::events`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LedgerEvent {
    UtxosChanged(UtxosChanged),
    VirtualHeightChanged(u64),
}

/// Remote ledger node.
///
/// UTXO-change notifications are delivered to every receiver returned by
/// [`events`](Self::events), but only for addresses with an active
/// subscription. Subscriptions are not reference counted here; callers
/// that share addresses go through a registry.
#[async_trait]
pub trait LedgerRpc: Send + Sync {
    /// Open (or reopen) the transport.
    async fn connect(&self) -> Result<(), LedgerError>;

    fn is_connected(&self) -> bool;

    async fn server_info(&self) -> Result<ServerInfo, LedgerError>;

    async fn utxos_by_addresses(&self, addresses: &[Address]) -> Result<Vec<UtxoRecord>, LedgerError>;

    async fn fee_estimate(&self) -> Result<FeeEstimate, LedgerError>;

    /// Submit a signed transaction, returning the id the node accepted it under.
    async fn submit_transaction(&self, tx: &Transaction) -> Result<Hash256, LedgerError>;

    async fn subscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError>;

    async fn unsubscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError>;

    /// A fresh receiver of node notifications.
    ///
    /// Only events sent after this call are observed, so take the receiver
    /// before subscribing or submitting.
    fn events(&self) -> broadcast::Receiver<LedgerEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Network;
    use crate::types::{LockScript, TxOutput};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    // ------------------------------------------------------------------
    // Mock: LedgerRpc
    // ------------------------------------------------------------------

    struct MockLedger {
        connected: AtomicBool,
        utxos: Vec<UtxoRecord>,
        subscribed: Mutex<Vec<Address>>,
        events: broadcast::Sender<LedgerEvent>,
    }

    impl MockLedger {
        fn new(utxos: Vec<UtxoRecord>) -> Self {
            Self {
                connected: AtomicBool::new(false),
                utxos,
                subscribed: Mutex::new(Vec::new()),
                events: broadcast::channel(16).0,
            }
        }
    }

    #[async_trait]
    impl LedgerRpc for MockLedger {
        async fn connect(&self) -> Result<(), LedgerError> {
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn server_info(&self) -> Result<ServerInfo, LedgerError> {
            Ok(ServerInfo {
                is_synced: true,
                has_utxo_index: true,
                virtual_height: 42,
                server_version: "mock".into(),
            })
        }

        async fn utxos_by_addresses(&self, addresses: &[Address]) -> Result<Vec<UtxoRecord>, LedgerError> {
            Ok(self
                .utxos
                .iter()
                .filter(|u| addresses.contains(&u.address))
                .cloned()
                .collect())
        }

        async fn fee_estimate(&self) -> Result<FeeEstimate, LedgerError> {
            Ok(FeeEstimate { priority_feerate: 3, normal_feerate: 2, low_feerate: 1 })
        }

        async fn submit_transaction(&self, tx: &Transaction) -> Result<Hash256, LedgerError> {
            tx.txid().map_err(|e| LedgerError::Rejected(e.to_string()))
        }

        async fn subscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError> {
            self.subscribed.lock().unwrap().extend_from_slice(addresses);
            Ok(())
        }

        async fn unsubscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError> {
            self.subscribed.lock().unwrap().retain(|a| !addresses.contains(a));
            Ok(())
        }

        fn events(&self) -> broadcast::Receiver<LedgerEvent> {
            self.events.subscribe()
        }
    }

    fn record(address: &Address, value: u64) -> UtxoRecord {
        UtxoRecord {
            address: address.clone(),
            outpoint: OutPoint { txid: Hash256([1; 32]), index: 0 },
            entry: UtxoEntry {
                output: TxOutput { value, lock: address.lock_script() },
                block_height: 1,
                is_coinbase: false,
            },
        }
    }

    #[tokio::test]
    async fn mock_ledger_is_object_safe() {
        let addr = Address::from_lock(LockScript::PubkeyHash(Hash256([9; 32])), Network::Testnet);
        let ledger: Box<dyn LedgerRpc> = Box::new(MockLedger::new(vec![record(&addr, 500)]));
        assert!(!ledger.is_connected());
        ledger.connect().await.unwrap();
        assert!(ledger.is_connected());

        let utxos = ledger.utxos_by_addresses(std::slice::from_ref(&addr)).await.unwrap();
        assert_eq!(utxos.len(), 1);
        assert_eq!(utxos[0].value(), 500);
    }

    #[tokio::test]
    async fn subscriptions_are_tracked() {
        let addr = Address::from_pubkey_hash(Hash256([3; 32]), Network::Mainnet);
        let ledger = MockLedger::new(vec![]);
        ledger.subscribe_utxos_changed(std::slice::from_ref(&addr)).await.unwrap();
        assert_eq!(ledger.subscribed.lock().unwrap().len(), 1);
        ledger.unsubscribe_utxos_changed(std::slice::from_ref(&addr)).await.unwrap();
        assert!(ledger.subscribed.lock().unwrap().is_empty());
    }

    #[test]
    fn server_info_wire_names() {
        let json = serde_json::to_value(ServerInfo {
            is_synced: true,
            has_utxo_index: false,
            virtual_height: 7,
            server_version: "1.0".into(),
        })
        .unwrap();
        assert_eq!(json["isSynced"], true);
        assert_eq!(json["hasUtxoIndex"], false);
        assert_eq!(json["virtualHeight"], 7);
    }
}
