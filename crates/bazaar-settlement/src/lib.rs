//! # bazaar-settlement: inventory, order state and on-chain settlement.
//!
//! Everything that must survive a restart lives in the RocksDB-backed
//! [`store`]; every change to it goes through the guarded transitions of
//! [`state_machine`]. The [`orchestrator`] drives the on-chain steps of an
//! action and records each one as it confirms, so an interrupted action
//! resumes where it stopped.
//!
//! # Modules
//!
//! - [`error`]: `SettlementError`, `ErrorKind`, `ActionError`
//! - [`model`]: Persisted documents and status enums
//! - [`store`]: RocksDB document store with locking transactions
//! - [`state_machine`]: Guarded status transitions and inventory reservation
//! - [`commission`]: Commission policy and amount formatting
//! - [`orchestrator`]: Action plans and the resumable step runner
//! - [`lifecycle`]: In-flight action tracking and the job overlap guard
//! - [`config`]: `SettlementConfig` loading
//! - [`service`]: `SettlementService` facade

pub mod commission;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod orchestrator;
pub mod service;
pub mod state_machine;
pub mod store;

pub use commission::CommissionPolicy;
pub use config::SettlementConfig;
pub use error::{ActionError, ErrorKind, QuantityScope, SettlementError};
pub use lifecycle::{ActionTracker, JobLock};
pub use model::{ActionMode, ActionParams, ActionStatus, PendingAction, StepId, StepKind, TransactionRecord};
pub use orchestrator::{ActionPlan, Orchestrator, OrchestratorSettings, ProgressSink, StoreProgress};
pub use service::SettlementService;
pub use state_machine::StateMachine;
pub use store::SettlementStore;
