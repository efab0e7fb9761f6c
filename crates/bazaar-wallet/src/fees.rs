//! Priority fee negotiation against a caller-supplied ceiling.
//!
//! A zero-priority trial transaction is built first to learn the mass and
//! the fee it already pays. The network's priority fee rate times that mass
//! is what the node wants; the shortfall becomes the priority fee. If the
//! shortfall exceeds the ceiling the build fails before anything is signed,
//! so nothing can be broadcast.

use bazaar_core::address::Address;
use bazaar_core::traits::{FeeEstimate, UtxoRecord};

use crate::builder::{TransactionBuilder, UnsignedTransaction};
use crate::error::WalletError;

/// Outcome of a negotiation. Ephemeral; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    /// Fee of the zero-priority trial transaction.
    pub original_fee: u64,
    /// Mass of the trial transaction.
    pub mass: u64,
    /// Priority fee the final transaction pays.
    pub priority_fee: u64,
    /// Caller ceiling, if any.
    pub max_fee: Option<u64>,
}

/// Build `builder` with a priority fee derived from `estimate`.
///
/// Without a ceiling the transaction is built at zero priority fee.
pub fn negotiate(
    builder: &TransactionBuilder,
    utxos: &[UtxoRecord],
    change_address: &Address,
    estimate: &FeeEstimate,
    max_priority_fee: Option<u64>,
) -> Result<(UnsignedTransaction, FeeQuote), WalletError> {
    let mut trial_builder = builder.clone();
    trial_builder.set_priority_fee(0);
    let trial = trial_builder.build(utxos, change_address)?;

    let Some(max) = max_priority_fee else {
        let quote = FeeQuote {
            original_fee: trial.fee,
            mass: trial.mass,
            priority_fee: 0,
            max_fee: None,
        };
        return Ok((trial, quote));
    };

    let required = required_priority_fee(trial.fee, trial.mass, estimate);
    if required > max {
        tracing::debug!(required, max, mass = trial.mass, "priority fee above ceiling");
        return Err(WalletError::PriorityFeeTooHigh { required, max });
    }

    let quote = FeeQuote {
        original_fee: trial.fee,
        mass: trial.mass,
        priority_fee: required,
        max_fee: Some(max),
    };
    if required == 0 {
        return Ok((trial, quote));
    }

    let mut final_builder = builder.clone();
    final_builder.set_priority_fee(required);
    let unsigned = final_builder.build(utxos, change_address)?;
    Ok((unsigned, quote))
}

/// Priority fee needed on top of `original_fee` to reach the network's
/// priority rate for a transaction of `mass`.
pub fn required_priority_fee(original_fee: u64, mass: u64, estimate: &FeeEstimate) -> u64 {
    estimate
        .priority_feerate
        .saturating_mul(mass)
        .saturating_sub(original_fee)
}
