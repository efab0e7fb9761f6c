//! Transaction builder with mass-based fees and signing.
//!
//! Provides a builder pattern for constructing transactions:
//! 1. Add recipients, forced inputs (commit anchors) and extra fees
//! 2. Build an unsigned transaction from the sender's UTXO set
//! 3. Sign all inputs with the sender's keypair
//!
//! Fee = mass × fee rate + protocol fee + priority fee. Change below the
//! dust threshold is left to the fee rather than created as an output.

use bazaar_core::address::Address;
use bazaar_core::constants::{
    DUST_THRESHOLD, INPUT_MASS, MASS_PER_SCRIPT_BYTE, MIN_RELAY_FEERATE, OUTPUT_MASS, SIG_OP_MASS,
    TX_BASE_MASS,
};
use bazaar_core::crypto::{KeyPair, sign_transaction_input};
use bazaar_core::traits::UtxoRecord;
use bazaar_core::types::{Transaction, TxInput, TxOutput};

use crate::coin_selection::CoinSelector;
use crate::error::WalletError;

/// A transaction recipient: address and amount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub address: Address,
    /// Amount in minor units.
    pub amount: u64,
}

/// An input that must be spent, with the redeem script that unlocks it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForcedInput {
    pub utxo: UtxoRecord,
    /// Empty for pay-to-pubkey-hash outputs.
    pub redeem_script: Vec<u8>,
}

/// An unsigned transaction ready for signing.
#[derive(Debug, Clone)]
pub struct UnsignedTransaction {
    /// The transaction with empty signatures.
    pub tx: Transaction,
    /// Total fee paid (inputs minus outputs), including folded dust.
    pub fee: u64,
    /// Transaction mass; unchanged by signing.
    pub mass: u64,
    /// Priority fee included in `fee`.
    pub priority_fee: u64,
}

/// Builder for constructing and signing transactions.
///
/// # Example
/// ```ignore
/// let unsigned = TransactionBuilder::new()
///     .add_recipient(buyer, 5 * COIN)
///     .build(&utxos, &change)?;
/// let signed = TransactionBuilder::sign(unsigned, &account.keypair)?;
/// ```
#[derive(Debug, Clone)]
pub struct TransactionBuilder {
    recipients: Vec<Recipient>,
    forced: Vec<ForcedInput>,
    sweep_to: Option<Address>,
    fee_rate: u64,
    protocol_fee: u64,
    priority_fee: u64,
    lock_time: u64,
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            recipients: Vec::new(),
            forced: Vec::new(),
            sweep_to: None,
            fee_rate: MIN_RELAY_FEERATE,
            protocol_fee: 0,
            priority_fee: 0,
            lock_time: 0,
        }
    }

    pub fn add_recipient(&mut self, address: Address, amount: u64) -> &mut Self {
        self.recipients.push(Recipient { address, amount });
        self
    }

    /// Spend `input` first, regardless of coin selection.
    pub fn add_forced_input(&mut self, input: ForcedInput) -> &mut Self {
        self.forced.push(input);
        self
    }

    /// Spend every available UTXO and send whatever remains after the
    /// recipients and fees to `address`.
    pub fn sweep_to(&mut self, address: Address) -> &mut Self {
        self.sweep_to = Some(address);
        self
    }

    /// Override the mass fee rate (default: [`MIN_RELAY_FEERATE`]).
    pub fn set_fee_rate(&mut self, rate: u64) -> &mut Self {
        self.fee_rate = rate;
        self
    }

    /// Fee burned for the indexer on top of the mass fee.
    pub fn set_protocol_fee(&mut self, fee: u64) -> &mut Self {
        self.protocol_fee = fee;
        self
    }

    pub fn set_priority_fee(&mut self, fee: u64) -> &mut Self {
        self.priority_fee = fee;
        self
    }

    pub fn priority_fee(&self) -> u64 {
        self.priority_fee
    }

    pub fn set_lock_time(&mut self, lock_time: u64) -> &mut Self {
        self.lock_time = lock_time;
        self
    }

    /// Build an unsigned transaction from `utxos`, returning change to
    /// `change_address`.
    ///
    /// UTXOs that are also forced inputs are not selected twice.
    pub fn build(
        &self,
        utxos: &[UtxoRecord],
        change_address: &Address,
    ) -> Result<UnsignedTransaction, WalletError> {
        if self.recipients.is_empty() && self.forced.is_empty() && self.sweep_to.is_none() {
            return Err(WalletError::BuildError("no recipients".into()));
        }

        let mut total_send: u64 = 0;
        for r in &self.recipients {
            if r.amount == 0 {
                return Err(WalletError::InvalidAmount("recipient amount is zero".into()));
            }
            total_send = total_send
                .checked_add(r.amount)
                .ok_or_else(|| WalletError::InvalidAmount("total amount overflow".into()))?;
        }

        let mut forced_value: u64 = 0;
        let mut forced_mass: u64 = 0;
        for f in &self.forced {
            forced_value = forced_value
                .checked_add(f.utxo.value())
                .ok_or_else(|| WalletError::InvalidAmount("forced input overflow".into()))?;
            forced_mass += INPUT_MASS + SIG_OP_MASS + f.redeem_script.len() as u64 * MASS_PER_SCRIPT_BYTE;
        }

        // Assume a change output; dropping it later only lowers the mass.
        let fixed_mass =
            TX_BASE_MASS + (self.recipients.len() as u64 + 1) * OUTPUT_MASS + forced_mass;
        let extra_fee = self.protocol_fee.saturating_add(self.priority_fee);
        let fee_rate = self.fee_rate;
        let fee_for = |n: usize| {
            let mass = fixed_mass + n as u64 * (INPUT_MASS + SIG_OP_MASS);
            mass.saturating_mul(fee_rate).saturating_add(extra_fee)
        };

        let available: Vec<UtxoRecord> = utxos
            .iter()
            .filter(|u| !self.forced.iter().any(|f| f.utxo.outpoint == u.outpoint))
            .cloned()
            .collect();

        let selection = if self.sweep_to.is_some() {
            CoinSelector::select_all(&available, fee_for)
        } else {
            CoinSelector::select(&available, total_send, forced_value, fee_for)?
        };

        let total_in = forced_value
            .checked_add(selection.total)
            .ok_or_else(|| WalletError::InvalidAmount("input value overflow".into()))?;
        let need = total_send.saturating_add(selection.fee);
        let remaining = total_in
            .checked_sub(need)
            .ok_or(WalletError::InsufficientFunds { have: total_in, need })?;

        let mut inputs = Vec::with_capacity(self.forced.len() + selection.selected.len());
        for f in &self.forced {
            let mut input = TxInput::unsigned(f.utxo.outpoint.clone());
            input.redeem_script = f.redeem_script.clone();
            inputs.push(input);
        }
        for u in &selection.selected {
            inputs.push(TxInput::unsigned(u.outpoint.clone()));
        }

        let mut outputs: Vec<TxOutput> = self
            .recipients
            .iter()
            .map(|r| TxOutput { value: r.amount, lock: r.address.lock_script() })
            .collect();

        match &self.sweep_to {
            Some(dest) => {
                if remaining < DUST_THRESHOLD {
                    return Err(WalletError::InsufficientFunds {
                        have: total_in,
                        need: need.saturating_add(DUST_THRESHOLD),
                    });
                }
                outputs.push(TxOutput { value: remaining, lock: dest.lock_script() });
            }
            None if remaining >= DUST_THRESHOLD => {
                outputs.push(TxOutput { value: remaining, lock: change_address.lock_script() });
            }
            None => {}
        }

        let tx = Transaction {
            version: 1,
            inputs,
            outputs,
            lock_time: self.lock_time,
        };
        tx.check_standard()?;

        let total_out = tx.total_output_value().unwrap_or(total_in);
        Ok(UnsignedTransaction {
            fee: total_in - total_out,
            mass: tx.mass(),
            priority_fee: self.priority_fee,
            tx,
        })
    }

    /// Sign every input with `keypair`.
    ///
    /// Settlement wallets hold a single key, so all inputs (including
    /// script-hash anchors committed to the same key) share it.
    pub fn sign(unsigned: UnsignedTransaction, keypair: &KeyPair) -> Result<Transaction, WalletError> {
        let mut tx = unsigned.tx;
        for i in 0..tx.inputs.len() {
            sign_transaction_input(&mut tx, i, keypair)?;
        }
        Ok(tx)
    }
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
