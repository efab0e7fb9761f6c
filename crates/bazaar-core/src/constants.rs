//! Protocol constants. All monetary values are in minor units (1 coin = 10^8 minor units).

/// Minor units per display coin.
pub const COIN: u64 = 100_000_000;

/// Basis-point denominator used by commission math.
pub const BPS_PRECISION: u64 = 10_000;

pub const MAX_INPUTS: usize = 1000;
pub const MAX_OUTPUTS: usize = 1000;

/// Confirmations before a coinbase output counts as mature balance.
pub const COINBASE_MATURITY: u64 = 100;

/// Confirmations before a regular output counts as mature balance.
///
/// Younger outputs are reported as pending by the balance tracker.
pub const USER_TX_MATURITY: u64 = 10;

// --- Transaction mass ---
//
// Mass is the size metric fees are charged against. It is computed from the
// transaction shape rather than its serialized bytes so that an unsigned
// candidate and its signed form have the same mass.

pub const TX_BASE_MASS: u64 = 100;
pub const INPUT_MASS: u64 = 150;
pub const OUTPUT_MASS: u64 = 50;
pub const SIG_OP_MASS: u64 = 1_000;
pub const MASS_PER_SCRIPT_BYTE: u64 = 1;

/// Standardness ceiling: the node rejects transactions heavier than this.
pub const MAX_TX_MASS: u64 = 100_000;

/// Minimum relay fee rate in minor units per mass unit.
pub const MIN_RELAY_FEERATE: u64 = 1;

/// Outputs below this value are folded into the fee instead of created.
pub const DUST_THRESHOLD: u64 = 1_000;

// --- Commit/reveal protocol ---

/// Value locked in the pay-to-script-hash anchor by a commit transaction.
pub const COMMIT_ANCHOR_AMOUNT: u64 = 30_000_000;

/// Protocol marker pushed into every envelope, ahead of the JSON payload.
pub const PROTOCOL_MARKER: &[u8] = b"bzr";

/// Value of the `p` field in the JSON payload.
pub const PROTOCOL_ID: &str = "bzr-20";

/// Fee the indexer requires a mint reveal to burn.
pub const MINT_PROTOCOL_FEE: u64 = COIN;

/// Largest single push accepted by the script parser.
pub const MAX_SCRIPT_ELEMENT_SIZE: usize = 520;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coin_is_ten_to_the_eighth() {
        assert_eq!(COIN, 10u64.pow(8));
    }

    #[test]
    fn anchor_is_above_dust() {
        assert!(COMMIT_ANCHOR_AMOUNT > DUST_THRESHOLD);
    }

    #[test]
    fn single_input_tx_fits_under_mass_ceiling() {
        let mass = TX_BASE_MASS + INPUT_MASS + SIG_OP_MASS + 2 * OUTPUT_MASS;
        assert!(mass < MAX_TX_MASS);
    }
}
