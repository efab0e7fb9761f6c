//! # bazaar-ledger: talking to the ledger node.
//!
//! Everything here sits on top of the [`LedgerRpc`](bazaar_core::traits::LedgerRpc)
//! trait, so settlement code runs unchanged against the WebSocket client
//! or the in-process simulator.
//!
//! # Modules
//!
//! - [`config`]: `LedgerConfig` endpoint and timeouts
//! - [`connection`]: Healthy-connection manager with shared connect attempts
//! - [`registry`]: Reference-counted per-address subscriptions
//! - [`watcher`]: One-shot transaction confirmation watcher
//! - [`tracker`]: Live mature/pending balance of an address
//! - [`rpc`]: jsonrpsee WebSocket `LedgerRpc` client
//! - `testing`: `SimLedger` (tests and the `testing` feature only)

pub mod config;
pub mod connection;
pub mod registry;
pub mod rpc;
pub mod tracker;
pub mod watcher;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::LedgerConfig;
pub use connection::LedgerConnection;
pub use registry::SubscriptionRegistry;
pub use rpc::WsLedgerClient;
pub use tracker::{Balance, BalanceTracker};
pub use watcher::UtxoWatcher;
