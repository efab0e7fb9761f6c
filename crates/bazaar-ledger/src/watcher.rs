//! One-shot confirmation watcher for a submitted transaction.
//!
//! Bound to an address and the id of the transaction expected to create a
//! UTXO there. The notification receiver is taken before the address is
//! subscribed, so registering before submitting never misses the event.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use bazaar_core::address::Address;
use bazaar_core::error::LedgerError;
use bazaar_core::traits::{LedgerEvent, LedgerRpc};
use bazaar_core::types::Hash256;

use crate::registry::SubscriptionRegistry;

pub struct UtxoWatcher {
    rpc: Arc<dyn LedgerRpc>,
    registry: Arc<SubscriptionRegistry>,
    address: Address,
    expected_txid: Hash256,
    wallet_should_be_empty: bool,
    timeout: Duration,
    events: Option<broadcast::Receiver<LedgerEvent>>,
    attached: bool,
}

impl UtxoWatcher {
    pub fn new(
        rpc: Arc<dyn LedgerRpc>,
        registry: Arc<SubscriptionRegistry>,
        address: Address,
        expected_txid: Hash256,
        timeout: Duration,
    ) -> Self {
        Self {
            rpc,
            registry,
            address,
            expected_txid,
            wallet_should_be_empty: false,
            timeout,
            events: None,
            attached: false,
        }
    }

    /// Complete on any change to the address instead of a matching UTXO.
    ///
    /// Used when the transaction drains the address and creates nothing there.
    pub fn wallet_should_be_empty(mut self, flag: bool) -> Self {
        self.wallet_should_be_empty = flag;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn register_event_handlers(&mut self) -> Result<(), LedgerError> {
        if self.attached {
            return Ok(());
        }
        self.events = Some(self.rpc.events());
        if let Err(e) = self.registry.attach(&self.address).await {
            self.events = None;
            return Err(e);
        }
        self.attached = true;
        Ok(())
    }

    /// Wait for the expected transaction, then dispose.
    ///
    /// On timeout the watcher is disposed before the error is returned.
    pub async fn wait_for_transaction_completion(&mut self) -> Result<(), LedgerError> {
        let Some(events) = self.events.take() else {
            return Err(LedgerError::Subscription("watcher not registered".into()));
        };

        let outcome = match tokio::time::timeout(self.timeout, self.wait(events)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(address = %self.address, txid = %self.expected_txid, "confirmation timed out");
                Err(LedgerError::ConfirmationTimeout {
                    txid: self.expected_txid.to_string(),
                    secs: self.timeout.as_secs(),
                })
            }
        };
        self.dispose().await;
        outcome
    }

    async fn wait(&self, mut events: broadcast::Receiver<LedgerEvent>) -> Result<(), LedgerError> {
        // Covers a transaction that confirmed before this watcher registered,
        // e.g. when resuming an interrupted action.
        if self.already_complete().await? {
            return Ok(());
        }
        loop {
            match events.recv().await {
                Ok(LedgerEvent::UtxosChanged(change)) if change.address == self.address => {
                    if self.wallet_should_be_empty {
                        return Ok(());
                    }
                    if change.added.iter().any(|u| u.outpoint.txid == self.expected_txid) {
                        debug!(address = %self.address, txid = %self.expected_txid, "transaction confirmed");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, address = %self.address, "event stream lagged, querying directly");
                    if self.already_complete().await? {
                        return Ok(());
                    }
                }
                Err(RecvError::Closed) => {
                    return Err(LedgerError::Subscription("event stream closed".into()));
                }
            }
        }
    }

    async fn already_complete(&self) -> Result<bool, LedgerError> {
        let utxos = self
            .rpc
            .utxos_by_addresses(std::slice::from_ref(&self.address))
            .await?;
        if self.wallet_should_be_empty {
            return Ok(utxos.is_empty());
        }
        Ok(utxos.iter().any(|u| u.outpoint.txid == self.expected_txid))
    }

    /// Release the shared subscription. Safe to call more than once.
    pub async fn dispose(&mut self) {
        self.events = None;
        if !self.attached {
            return;
        }
        self.attached = false;
        if let Err(e) = self.registry.detach(&self.address).await {
            warn!(address = %self.address, error = %e, "watcher detach failed");
        }
    }
}

impl Drop for UtxoWatcher {
    fn drop(&mut self) {
        if !self.attached {
            return;
        }
        let registry = self.registry.clone();
        let address = self.address.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = registry.detach(&address).await {
                        warn!(%address, error = %e, "watcher detach on drop failed");
                    }
                });
            }
            Err(_) => warn!(%address, "watcher dropped outside a runtime; subscription leaked"),
        }
    }
}
