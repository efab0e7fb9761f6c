//! # bazaar-core
//! Ledger primitives shared by the Bazaar settlement engine: transactions,
//! addresses, redeem scripts, signing, and the remote-ledger trait.

pub mod address;
pub mod constants;
pub mod crypto;
pub mod error;
pub mod script;
pub mod traits;
pub mod types;
