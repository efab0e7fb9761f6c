//! Commission on settled sales.
//!
//! All arithmetic is integer minor units. `format_amount` is the only place
//! a display-unit string is produced.

use serde::{Deserialize, Serialize};

use bazaar_core::address::Address;
use bazaar_core::constants::{BPS_PRECISION, COIN};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionPolicy {
    /// Percentage in basis points (1 bps = 0.01%).
    pub rate_bps: u64,
    /// Floor in minor units.
    pub minimum: u64,
    /// Where commission is paid. `None` keeps the whole price with the seller.
    pub treasury: Option<Address>,
}

impl CommissionPolicy {
    /// `max(amount * rate, minimum)`, never more than `amount`.
    pub fn commission(&self, amount: u64) -> u64 {
        if self.treasury.is_none() {
            return 0;
        }
        let pct = (amount as u128 * self.rate_bps as u128 / BPS_PRECISION as u128) as u64;
        pct.max(self.minimum).min(amount)
    }

    /// Split `price` into (seller share, commission).
    pub fn split(&self, price: u64) -> (u64, u64) {
        let commission = self.commission(price);
        (price - commission, commission)
    }
}

/// Render minor units as a display amount, e.g. `150000000` -> `"1.5"`.
pub fn format_amount(minor: u64) -> String {
    let whole = minor / COIN;
    let frac = minor % COIN;
    if frac == 0 {
        return whole.to_string();
    }
    let digits = format!("{frac:08}");
    format!("{whole}.{}", digits.trim_end_matches('0'))
}
