//! Largest-first coin selection.
//!
//! Spends the biggest outputs first so that settlement wallets, which are
//! swept at the end of every action, are drained with the fewest inputs.

use bazaar_core::traits::UtxoRecord;

use crate::error::WalletError;

/// Result of coin selection.
#[derive(Debug, Clone, Default)]
pub struct CoinSelection {
    /// Selected UTXOs, largest first.
    pub selected: Vec<UtxoRecord>,
    /// Total value of `selected`.
    pub total: u64,
    /// Fee for a transaction spending the selection (with change).
    pub fee: u64,
}

pub struct CoinSelector;

impl CoinSelector {
    /// Select UTXOs until `funded + selected >= target + fee_for(selected.len())`.
    ///
    /// `funded` is value already contributed by inputs the caller forces into
    /// the transaction. `fee_for(n)` is the fee of the transaction with `n`
    /// selected inputs; it must be non-decreasing in `n`.
    pub fn select(
        utxos: &[UtxoRecord],
        target: u64,
        funded: u64,
        fee_for: impl Fn(usize) -> u64,
    ) -> Result<CoinSelection, WalletError> {
        let fee = fee_for(0);
        if funded >= target.saturating_add(fee) {
            return Ok(CoinSelection { selected: Vec::new(), total: 0, fee });
        }
        if utxos.is_empty() {
            return Err(WalletError::NoUtxos);
        }

        let mut candidates: Vec<&UtxoRecord> = utxos.iter().collect();
        candidates.sort_by(|a, b| {
            b.value()
                .cmp(&a.value())
                .then_with(|| a.outpoint.cmp(&b.outpoint))
        });

        let mut selection = CoinSelection::default();
        for utxo in candidates {
            selection.selected.push(utxo.clone());
            selection.total = selection.total.saturating_add(utxo.value());
            selection.fee = fee_for(selection.selected.len());

            let needed = target.saturating_add(selection.fee);
            if funded.saturating_add(selection.total) >= needed {
                return Ok(selection);
            }
        }

        Err(WalletError::InsufficientFunds {
            have: funded.saturating_add(selection.total),
            need: target.saturating_add(selection.fee),
        })
    }

    /// Select every UTXO, for sweeping a wallet empty.
    pub fn select_all(utxos: &[UtxoRecord], fee_for: impl Fn(usize) -> u64) -> CoinSelection {
        let mut selected = utxos.to_vec();
        selected.sort_by(|a, b| a.outpoint.cmp(&b.outpoint));
        let total = selected.iter().fold(0u64, |acc, u| acc.saturating_add(u.value()));
        let fee = fee_for(selected.len());
        CoinSelection { selected, total, fee }
    }
}
