//! Connection manager: one healthy connection to the ledger node.
//!
//! Concurrent callers of [`LedgerConnection::wait_for_connection`] share a
//! single in-flight attempt. An attempt is healthy only when the transport
//! is up, the node is synced, and it serves a UTXO index.

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bazaar_core::address::Address;
use bazaar_core::error::LedgerError;
use bazaar_core::traits::LedgerRpc;

use crate::config::LedgerConfig;

type ConnectFuture = Shared<BoxFuture<'static, Result<(), LedgerError>>>;

pub struct LedgerConnection {
    rpc: Arc<dyn LedgerRpc>,
    config: LedgerConfig,
    inflight: Mutex<Option<ConnectFuture>>,
}

impl LedgerConnection {
    pub fn new(rpc: Arc<dyn LedgerRpc>, config: LedgerConfig) -> Self {
        Self {
            rpc,
            config,
            inflight: Mutex::new(None),
        }
    }

    pub fn rpc(&self) -> &Arc<dyn LedgerRpc> {
        &self.rpc
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Resolve once the node is connected and healthy.
    ///
    /// Failures are always retryable by the caller.
    pub async fn wait_for_connection(&self) -> Result<(), LedgerError> {
        let attempt = {
            let mut slot = self.inflight.lock();
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    let fresh = establish(self.rpc.clone(), self.config.clone())
                        .boxed()
                        .shared();
                    *slot = Some(fresh.clone());
                    fresh
                }
            }
        };

        let result = attempt.clone().await;

        let mut slot = self.inflight.lock();
        if slot.as_ref().is_some_and(|current| current.ptr_eq(&attempt)) {
            *slot = None;
        }
        result
    }

    /// Sum of all UTXO values currently held by `address`.
    pub async fn get_wallet_balance(&self, address: &Address) -> Result<u64, LedgerError> {
        self.wait_for_connection().await?;
        let utxos = self
            .rpc
            .utxos_by_addresses(std::slice::from_ref(address))
            .await?;
        Ok(utxos.iter().fold(0u64, |acc, u| acc.saturating_add(u.value())))
    }
}

async fn establish(rpc: Arc<dyn LedgerRpc>, config: LedgerConfig) -> Result<(), LedgerError> {
    if !rpc.is_connected() {
        debug!(url = %config.url, "connecting to ledger node");
        timeout(config.connect_timeout(), rpc.connect())
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: "connect",
                secs: config.connect_timeout_secs,
            })??;
        info!(url = %config.url, "connected to ledger node");
    }

    let info = match timeout(config.probe_timeout(), rpc.server_info()).await {
        Ok(info) => info?,
        Err(_) => {
            warn!(secs = config.probe_timeout_secs, "ledger health probe timed out");
            return Err(LedgerError::Unhealthy {
                synced: false,
                utxo_index: false,
            });
        }
    };

    if !info.is_synced || !info.has_utxo_index {
        warn!(
            synced = info.is_synced,
            utxo_index = info.has_utxo_index,
            "ledger node unhealthy"
        );
        return Err(LedgerError::Unhealthy {
            synced: info.is_synced,
            utxo_index: info.has_utxo_index,
        });
    }
    Ok(())
}
