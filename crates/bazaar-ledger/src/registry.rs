//! Reference-counted UTXO-change subscriptions.
//!
//! Watchers and balance trackers on the same address share one node
//! subscription. The node is subscribed when the first holder attaches and
//! unsubscribed when the last one detaches. One registry is created per
//! process, handed to everything that subscribes, and torn down at shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use bazaar_core::address::Address;
use bazaar_core::error::LedgerError;
use bazaar_core::traits::LedgerRpc;

pub struct SubscriptionRegistry {
    rpc: Arc<dyn LedgerRpc>,
    counts: Mutex<HashMap<Address, usize>>,
}

impl SubscriptionRegistry {
    pub fn new(rpc: Arc<dyn LedgerRpc>) -> Self {
        Self {
            rpc,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Add a holder for `address`, subscribing at the node if it is the first.
    ///
    /// The count is only incremented once the subscription succeeded.
    pub async fn attach(&self, address: &Address) -> Result<(), LedgerError> {
        let mut counts = self.counts.lock().await;
        let current = counts.get(address).copied().unwrap_or(0);
        if current == 0 {
            self.rpc
                .subscribe_utxos_changed(std::slice::from_ref(address))
                .await?;
            debug!(%address, "subscribed to utxo changes");
        }
        counts.insert(address.clone(), current + 1);
        Ok(())
    }

    /// Release a holder for `address`, unsubscribing when it was the last.
    ///
    /// Detaching an address with no holders is a no-op.
    pub async fn detach(&self, address: &Address) -> Result<(), LedgerError> {
        let mut counts = self.counts.lock().await;
        let Some(count) = counts.get_mut(address) else {
            debug!(%address, "detach without holders");
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        counts.remove(address);
        debug!(%address, "unsubscribing from utxo changes");
        self.rpc
            .unsubscribe_utxos_changed(std::slice::from_ref(address))
            .await
    }

    pub async fn subscriber_count(&self, address: &Address) -> usize {
        self.counts.lock().await.get(address).copied().unwrap_or(0)
    }

    pub async fn active_addresses(&self) -> Vec<Address> {
        self.counts.lock().await.keys().cloned().collect()
    }

    /// Drop every remaining subscription.
    pub async fn teardown(&self) {
        let addresses: Vec<Address> = {
            let mut counts = self.counts.lock().await;
            counts.drain().map(|(address, _)| address).collect()
        };
        if addresses.is_empty() {
            return;
        }
        if let Err(e) = self.rpc.unsubscribe_utxos_changed(&addresses).await {
            warn!(error = %e, count = addresses.len(), "teardown unsubscribe failed");
        }
    }
}
