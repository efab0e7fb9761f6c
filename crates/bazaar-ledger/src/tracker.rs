//! Live mature/pending balance of one address.
//!
//! A tracker owns a background processor fed by the node's UTXO-change and
//! virtual-height notifications. It is opened for the lifetime of one scoped
//! operation and disposed exactly once.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bazaar_core::address::Address;
use bazaar_core::error::LedgerError;
use bazaar_core::traits::{LedgerEvent, LedgerRpc, UtxosChanged};
use bazaar_core::types::{OutPoint, UtxoEntry};

use crate::config::LedgerConfig;
use crate::registry::SubscriptionRegistry;

/// Balance split by maturity, in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    pub mature: u64,
    pub pending: u64,
}

#[derive(Debug, Clone, Default)]
struct TrackerState {
    started: bool,
    /// Set when pending value is seen, cleared by the next zero-pending update.
    pending_outstanding: bool,
    balance: Balance,
    failed: Option<String>,
}

pub struct BalanceTracker {
    registry: Arc<SubscriptionRegistry>,
    address: Address,
    config: LedgerConfig,
    state: watch::Receiver<TrackerState>,
    task: Option<JoinHandle<()>>,
    attached: bool,
}

impl std::fmt::Debug for BalanceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalanceTracker")
            .field("address", &self.address)
            .field("attached", &self.attached)
            .finish_non_exhaustive()
    }
}

impl BalanceTracker {
    /// Start tracking `address` and wait for the processor to report in.
    ///
    /// If the processor does not start within the configured bound the
    /// tracker disposes itself and the open fails.
    pub async fn open(
        rpc: Arc<dyn LedgerRpc>,
        registry: Arc<SubscriptionRegistry>,
        address: Address,
        config: &LedgerConfig,
    ) -> Result<Self, LedgerError> {
        let events = rpc.events();
        registry.attach(&address).await?;

        let (tx, rx) = watch::channel(TrackerState::default());
        let task = tokio::spawn(run_processor(rpc, address.clone(), events, tx));

        let mut tracker = Self {
            registry,
            address,
            config: config.clone(),
            state: rx,
            task: Some(task),
            attached: true,
        };
        if let Err(e) = tracker.wait_started().await {
            tracker.dispose().await;
            return Err(e);
        }
        Ok(tracker)
    }

    async fn wait_started(&mut self) -> Result<(), LedgerError> {
        let bound = self.config.processor_start_timeout();
        let outcome = {
            let mut rx = self.state.clone();
            let waited = match timeout(bound, rx.wait_for(|s| s.started || s.failed.is_some())).await {
                Ok(Ok(state)) => Ok(state.failed.clone()),
                Ok(Err(_)) => Ok(Some("processor exited".to_string())),
                Err(_) => Err(()),
            };
            waited
        };
        match outcome {
            Ok(None) => {
                debug!(address = %self.address, "balance tracker started");
                Ok(())
            }
            Ok(Some(reason)) => Err(LedgerError::TrackerStopped(reason)),
            Err(()) => {
                warn!(address = %self.address, secs = bound.as_secs(), "balance tracker did not start");
                Err(LedgerError::ProcessorStartTimeout {
                    address: self.address.to_string(),
                    secs: bound.as_secs(),
                })
            }
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn balance(&self) -> Balance {
        self.state.borrow().balance
    }

    /// Resolve once no pending value is outstanding.
    ///
    /// Returns immediately unless pending value was seen without a later
    /// zero-pending update. Bounded by the confirmation timeout.
    pub async fn wait_for_pending_utxo_to_finish(&self) -> Result<(), LedgerError> {
        let bound = self.config.confirmation_timeout();
        let mut rx = self.state.clone();
        let outcome = match timeout(bound, rx.wait_for(|s| !s.pending_outstanding || s.failed.is_some())).await {
            Ok(Ok(state)) => Ok(state.failed.clone()),
            Ok(Err(_)) => Ok(Some("processor exited".to_string())),
            Err(_) => Err(()),
        };
        match outcome {
            Ok(None) => Ok(()),
            Ok(Some(reason)) => Err(LedgerError::TrackerStopped(reason)),
            Err(()) => Err(LedgerError::Timeout {
                operation: "pending utxo maturity",
                secs: bound.as_secs(),
            }),
        }
    }

    /// Stop the processor and release the subscription. Safe to call twice.
    pub async fn dispose(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if !self.attached {
            return;
        }
        self.attached = false;
        if let Err(e) = self.registry.detach(&self.address).await {
            warn!(address = %self.address, error = %e, "tracker detach failed");
        }
    }
}

impl Drop for BalanceTracker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if !self.attached {
            return;
        }
        let registry = self.registry.clone();
        let address = self.address.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = registry.detach(&address).await {
                    warn!(%address, error = %e, "tracker detach on drop failed");
                }
            });
        }
    }
}

/// The processor's view of one address.
struct AddressView {
    height: u64,
    utxos: BTreeMap<OutPoint, UtxoEntry>,
}

impl AddressView {
    async fn fetch(rpc: &dyn LedgerRpc, address: &Address) -> Result<Self, LedgerError> {
        let info = rpc.server_info().await?;
        let records = rpc.utxos_by_addresses(std::slice::from_ref(address)).await?;
        Ok(Self {
            height: info.virtual_height,
            utxos: records.into_iter().map(|r| (r.outpoint, r.entry)).collect(),
        })
    }

    fn apply(&mut self, change: UtxosChanged) {
        for op in &change.removed {
            self.utxos.remove(op);
        }
        for record in change.added {
            self.utxos.insert(record.outpoint, record.entry);
        }
    }

    fn balance(&self) -> Balance {
        self.utxos.values().fold(Balance::default(), |mut b, entry| {
            if entry.is_mature(self.height) {
                b.mature = b.mature.saturating_add(entry.output.value);
            } else {
                b.pending = b.pending.saturating_add(entry.output.value);
            }
            b
        })
    }
}

fn publish(tx: &watch::Sender<TrackerState>, view: &AddressView) {
    let balance = view.balance();
    tx.send_modify(|s| {
        s.started = true;
        s.balance = balance;
        s.pending_outstanding = balance.pending > 0;
    });
}

async fn run_processor(
    rpc: Arc<dyn LedgerRpc>,
    address: Address,
    mut events: broadcast::Receiver<LedgerEvent>,
    tx: watch::Sender<TrackerState>,
) {
    let mut view = match AddressView::fetch(rpc.as_ref(), &address).await {
        Ok(view) => view,
        Err(e) => {
            warn!(%address, error = %e, "balance processor failed to start");
            tx.send_modify(|s| s.failed = Some(e.to_string()));
            return;
        }
    };
    publish(&tx, &view);

    loop {
        match events.recv().await {
            Ok(LedgerEvent::UtxosChanged(change)) if change.address == address => {
                view.apply(change);
                publish(&tx, &view);
            }
            Ok(LedgerEvent::VirtualHeightChanged(height)) => {
                view.height = view.height.max(height);
                publish(&tx, &view);
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(%address, skipped, "balance processor lagged, refetching");
                match AddressView::fetch(rpc.as_ref(), &address).await {
                    Ok(fresh) => {
                        view = fresh;
                        publish(&tx, &view);
                    }
                    Err(e) => {
                        tx.send_modify(|s| s.failed = Some(e.to_string()));
                        return;
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!(%address, "event stream closed, balance processor stopping");
                tx.send_modify(|s| s.failed = Some("event stream closed".to_string()));
                return;
            }
        }
    }
}
