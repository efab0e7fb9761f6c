//! # bazaar-wallet: settlement wallets and transaction construction.
//!
//! Derives a fresh wallet per settlement action from an encrypted master
//! seed, builds and signs transactions against a live UTXO set, negotiates
//! priority fees under a caller ceiling, and encodes token operations into
//! commit/reveal envelopes.
//!
//! # Modules
//!
//! - [`error`]: `WalletError` enum
//! - [`keys`]: Seed, WalletDeriver, BLAKE3-based key derivation
//! - [`encryption`]: AES-256-GCM master seed encryption
//! - [`coin_selection`]: Largest-first UTXO selection
//! - [`builder`]: Transaction builder with signing
//! - [`fees`]: Priority fee negotiation
//! - [`envelope`]: Commit/reveal protocol envelopes

pub mod builder;
pub mod coin_selection;
pub mod encryption;
pub mod envelope;
pub mod error;
pub mod fees;
pub mod keys;

pub use builder::{ForcedInput, Recipient, TransactionBuilder, UnsignedTransaction};
pub use coin_selection::{CoinSelection, CoinSelector};
pub use encryption::{SeedSecret, decrypt_seed, encrypt_seed};
pub use envelope::{CommitEnvelope, ProtocolOp, decode_envelope};
pub use error::WalletError;
pub use fees::{FeeQuote, negotiate};
pub use keys::{Seed, WalletAccount, WalletDeriver};
