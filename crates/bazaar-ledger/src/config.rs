//! Ledger connection settings.
//!
//! Every wait on the remote node has its own bound so a stalled node can
//! never hold a settlement task forever.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use bazaar_core::address::Network;

/// Configuration for talking to one ledger node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// WebSocket JSON-RPC endpoint.
    pub url: String,
    pub connect_timeout_secs: u64,
    /// Health probe bound; a probe that times out counts as unhealthy.
    pub probe_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub processor_start_timeout_secs: u64,
    /// Capacity of the notification fan-out channel.
    pub event_buffer: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self::for_network(Network::Mainnet)
    }
}

impl LedgerConfig {
    /// Defaults pointing at a local node for `network`.
    pub fn for_network(network: Network) -> Self {
        Self {
            url: format!("ws://127.0.0.1:{}", network.default_rpc_port()),
            connect_timeout_secs: 20,
            probe_timeout_secs: 5,
            confirmation_timeout_secs: 120,
            processor_start_timeout_secs: 120,
            event_buffer: 1024,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn processor_start_timeout(&self) -> Duration {
        Duration::from_secs(self.processor_start_timeout_secs)
    }
}
