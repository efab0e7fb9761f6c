//! WebSocket JSON-RPC client for the ledger node.
//!
//! Requests go through `ClientT`. UTXO-change notifications arrive on one
//! subscription per address, each drained by a forwarder task into the
//! shared broadcast channel handed out by [`LedgerRpc::events`].

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use jsonrpsee::core::ClientError;
use jsonrpsee::core::client::{ClientT, Subscription, SubscriptionClientT};
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::ws_client::{WsClient, WsClientBuilder};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bazaar_core::address::Address;
use bazaar_core::error::LedgerError;
use bazaar_core::traits::{FeeEstimate, LedgerEvent, LedgerRpc, ServerInfo, UtxoRecord, UtxosChanged};
use bazaar_core::types::{Hash256, Transaction};

use crate::config::LedgerConfig;

pub struct WsLedgerClient {
    config: LedgerConfig,
    client: RwLock<Option<Arc<WsClient>>>,
    utxo_forwarders: DashMap<Address, JoinHandle<()>>,
    height_forwarder: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<LedgerEvent>,
}

impl WsLedgerClient {
    pub fn new(config: LedgerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            client: RwLock::new(None),
            utxo_forwarders: DashMap::new(),
            height_forwarder: Mutex::new(None),
            events,
        }
    }

    fn client(&self) -> Result<Arc<WsClient>, LedgerError> {
        self.client
            .read()
            .as_ref()
            .filter(|c| c.is_connected())
            .cloned()
            .ok_or(LedgerError::NotConnected)
    }

    fn stop_forwarders(&self) {
        if let Some(task) = self.height_forwarder.lock().take() {
            task.abort();
        }
        let addresses: Vec<Address> = self.utxo_forwarders.iter().map(|e| e.key().clone()).collect();
        for address in addresses {
            if let Some((_, task)) = self.utxo_forwarders.remove(&address) {
                task.abort();
            }
        }
    }
}

impl Drop for WsLedgerClient {
    fn drop(&mut self) {
        self.stop_forwarders();
    }
}

fn params<T: Serialize>(value: T) -> Result<ArrayParams, LedgerError> {
    let mut p = ArrayParams::new();
    p.insert(value).map_err(|e| LedgerError::Rpc(e.to_string()))?;
    Ok(p)
}

fn rpc_error(method: &str, e: ClientError) -> LedgerError {
    match e {
        ClientError::RestartNeeded(_) => LedgerError::NotConnected,
        ClientError::RequestTimeout => LedgerError::Rpc(format!("{method}: request timed out")),
        other => LedgerError::Rpc(format!("{method}: {other}")),
    }
}

/// Hex of the canonical bincode encoding, as `submitTransaction` expects.
pub fn encode_transaction(tx: &Transaction) -> Result<String, LedgerError> {
    let bytes = bincode::encode_to_vec(tx, bincode::config::standard())
        .map_err(|e| LedgerError::Rejected(format!("encode: {e}")))?;
    Ok(hex::encode(bytes))
}

async fn forward_utxo_changes(
    address: Address,
    mut sub: Subscription<UtxosChanged>,
    events: broadcast::Sender<LedgerEvent>,
) {
    while let Some(item) = sub.next().await {
        match item {
            Ok(change) => {
                let _ = events.send(LedgerEvent::UtxosChanged(change));
            }
            Err(e) => warn!(%address, error = %e, "malformed utxo notification"),
        }
    }
    debug!(%address, "utxo subscription ended");
}

async fn forward_heights(mut sub: Subscription<u64>, events: broadcast::Sender<LedgerEvent>) {
    while let Some(item) = sub.next().await {
        match item {
            Ok(height) => {
                let _ = events.send(LedgerEvent::VirtualHeightChanged(height));
            }
            Err(e) => warn!(error = %e, "malformed height notification"),
        }
    }
    info!("virtual height subscription ended");
}

#[async_trait]
impl LedgerRpc for WsLedgerClient {
    async fn connect(&self) -> Result<(), LedgerError> {
        self.stop_forwarders();
        let client = WsClientBuilder::default()
            .connection_timeout(self.config.connect_timeout())
            .build(&self.config.url)
            .await
            .map_err(|e| LedgerError::ConnectFailed(e.to_string()))?;
        let client = Arc::new(client);

        let heights: Subscription<u64> = client
            .subscribe(
                "subscribeVirtualHeightChanged",
                ArrayParams::new(),
                "unsubscribeVirtualHeightChanged",
            )
            .await
            .map_err(|e| rpc_error("subscribeVirtualHeightChanged", e))?;
        *self.height_forwarder.lock() = Some(tokio::spawn(forward_heights(heights, self.events.clone())));

        *self.client.write() = Some(client);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.read().as_ref().is_some_and(|c| c.is_connected())
    }

    async fn server_info(&self) -> Result<ServerInfo, LedgerError> {
        self.client()?
            .request("getServerInfo", ArrayParams::new())
            .await
            .map_err(|e| rpc_error("getServerInfo", e))
    }

    async fn utxos_by_addresses(&self, addresses: &[Address]) -> Result<Vec<UtxoRecord>, LedgerError> {
        let encoded: Vec<String> = addresses.iter().map(Address::encode).collect();
        self.client()?
            .request("getUtxosByAddresses", params(encoded)?)
            .await
            .map_err(|e| rpc_error("getUtxosByAddresses", e))
    }

    async fn fee_estimate(&self) -> Result<FeeEstimate, LedgerError> {
        self.client()?
            .request("getFeeEstimate", ArrayParams::new())
            .await
            .map_err(|e| rpc_error("getFeeEstimate", e))
    }

    async fn submit_transaction(&self, tx: &Transaction) -> Result<Hash256, LedgerError> {
        let client = self.client()?;
        let txid: String = client
            .request("submitTransaction", params(encode_transaction(tx)?)?)
            .await
            .map_err(|e| match e {
                ClientError::Call(obj) => LedgerError::Rejected(obj.message().to_string()),
                other => rpc_error("submitTransaction", other),
            })?;
        txid.parse()
            .map_err(|e| LedgerError::Rpc(format!("submitTransaction returned bad txid {txid}: {e}")))
    }

    async fn subscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError> {
        let client = self.client()?;
        for address in addresses {
            if self.utxo_forwarders.contains_key(address) {
                continue;
            }
            let sub: Subscription<UtxosChanged> = client
                .subscribe(
                    "subscribeUtxosChanged",
                    params(vec![address.encode()])?,
                    "unsubscribeUtxosChanged",
                )
                .await
                .map_err(|e| rpc_error("subscribeUtxosChanged", e))?;
            let task = tokio::spawn(forward_utxo_changes(address.clone(), sub, self.events.clone()));
            if let Some(stale) = self.utxo_forwarders.insert(address.clone(), task) {
                stale.abort();
            }
        }
        Ok(())
    }

    async fn unsubscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError> {
        // Dropping the subscription inside the aborted task sends the
        // unsubscribe call.
        for address in addresses {
            if let Some((_, task)) = self.utxo_forwarders.remove(address) {
                task.abort();
            }
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_core::address::Network;
    use bazaar_core::types::{LockScript, OutPoint, TxInput, TxOutput};

    #[tokio::test]
    async fn requests_fail_before_connect() {
        let client = WsLedgerClient::new(LedgerConfig::for_network(Network::Testnet));
        assert!(!client.is_connected());
        assert_eq!(client.fee_estimate().await.unwrap_err(), LedgerError::NotConnected);
        assert_eq!(client.server_info().await.unwrap_err(), LedgerError::NotConnected);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_is_noop() {
        let client = WsLedgerClient::new(LedgerConfig::for_network(Network::Testnet));
        let addr = Address::from_pubkey_hash(Hash256([1; 32]), Network::Testnet);
        client.unsubscribe_utxos_changed(&[addr]).await.unwrap();
    }

    #[test]
    fn encoded_transaction_decodes() {
        let tx = Transaction {
            version: 1,
            inputs: vec![TxInput::unsigned(OutPoint { txid: Hash256([3; 32]), index: 1 })],
            outputs: vec![TxOutput { value: 500, lock: LockScript::PubkeyHash(Hash256([4; 32])) }],
            lock_time: 0,
        };
        let bytes = hex::decode(encode_transaction(&tx).unwrap()).unwrap();
        let (decoded, _): (Transaction, usize) =
            bincode::decode_from_slice(&bytes, bincode::config::standard()).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn restart_needed_maps_to_not_connected() {
        let e = ClientError::RestartNeeded(Arc::new(ClientError::Custom("gone".into())));
        assert_eq!(rpc_error("x", e), LedgerError::NotConnected);
    }
}
