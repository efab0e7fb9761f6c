//! Commit/reveal envelopes for token protocol operations.
//!
//! A commit transaction pays [`COMMIT_ANCHOR_AMOUNT`] to the script-hash
//! address of a redeem script that carries the operation as JSON inside an
//! `OP_FALSE OP_IF ... OP_ENDIF` envelope. The reveal transaction spends that
//! anchor, publishing the script and with it the operation.

use serde::{Deserialize, Serialize};

use bazaar_core::address::{Address, Network};
use bazaar_core::constants::{
    COMMIT_ANCHOR_AMOUNT, MAX_SCRIPT_ELEMENT_SIZE, MINT_PROTOCOL_FEE, PROTOCOL_ID, PROTOCOL_MARKER,
};
use bazaar_core::crypto::PublicKey;
use bazaar_core::script::{
    OP_CHECKSIG, OP_ENDIF, OP_FALSE, OP_IF, ScriptBuilder, parse_standard_redeem_script,
    script_hash,
};
use bazaar_core::traits::UtxoRecord;
use bazaar_core::types::{Hash256, OutPoint};

use crate::builder::{ForcedInput, TransactionBuilder};
use crate::error::WalletError;

/// Output index of the anchor in a commit transaction.
pub const ANCHOR_OUTPUT_INDEX: u64 = 0;

/// A token operation carried in an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ProtocolOp {
    Transfer { tick: String, amt: String, to: String },
    Mint { tick: String, to: String },
}

impl ProtocolOp {
    pub fn transfer(tick: &str, amount: u64, to: &Address) -> Self {
        ProtocolOp::Transfer {
            tick: tick.to_lowercase(),
            amt: amount.to_string(),
            to: to.to_string(),
        }
    }

    pub fn mint(tick: &str, to: &Address) -> Self {
        ProtocolOp::Mint { tick: tick.to_lowercase(), to: to.to_string() }
    }

    /// Fee the reveal must burn for the indexer to accept the operation.
    pub fn protocol_fee(&self) -> u64 {
        match self {
            ProtocolOp::Mint { .. } => MINT_PROTOCOL_FEE,
            ProtocolOp::Transfer { .. } => 0,
        }
    }

    /// JSON payload: `{"p":"bzr-20","op":...,...}`.
    pub fn to_payload(&self) -> Result<Vec<u8>, WalletError> {
        #[derive(Serialize)]
        struct Payload<'a> {
            p: &'static str,
            #[serde(flatten)]
            op: &'a ProtocolOp,
        }
        serde_json::to_vec(&Payload { p: PROTOCOL_ID, op: self })
            .map_err(|e| WalletError::Payload(e.to_string()))
    }

    pub fn from_payload(bytes: &[u8]) -> Result<Self, WalletError> {
        #[derive(Deserialize)]
        struct Payload {
            p: String,
            #[serde(flatten)]
            op: ProtocolOp,
        }
        let payload: Payload =
            serde_json::from_slice(bytes).map_err(|e| WalletError::Payload(e.to_string()))?;
        if payload.p != PROTOCOL_ID {
            return Err(WalletError::Payload(format!("unknown protocol {}", payload.p)));
        }
        Ok(payload.op)
    }
}

/// A redeem script for one operation and the address committing to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEnvelope {
    pub redeem_script: Vec<u8>,
    pub script_hash: Hash256,
    pub address: Address,
    pub op: ProtocolOp,
}

impl CommitEnvelope {
    /// `<sender> OP_CHECKSIG OP_FALSE OP_IF <marker> <payload...> OP_ENDIF`
    pub fn new(sender: &PublicKey, op: ProtocolOp, network: Network) -> Result<Self, WalletError> {
        let payload = op.to_payload()?;

        let mut b = ScriptBuilder::new();
        b.add_data(&sender.to_bytes())?;
        b.add_op(OP_CHECKSIG).add_op(OP_FALSE).add_op(OP_IF);
        b.add_data(PROTOCOL_MARKER)?;
        for chunk in payload.chunks(MAX_SCRIPT_ELEMENT_SIZE) {
            b.add_data(chunk)?;
        }
        b.add_op(OP_ENDIF);

        let redeem_script = b.into_script();
        let script_hash = script_hash(&redeem_script);
        Ok(Self {
            address: Address::from_script_hash(script_hash, network),
            script_hash,
            redeem_script,
            op,
        })
    }

    /// Builder for the commit transaction: the anchor goes to output 0.
    pub fn commit_builder(&self) -> TransactionBuilder {
        let mut b = TransactionBuilder::new();
        b.add_recipient(self.address.clone(), COMMIT_ANCHOR_AMOUNT);
        b
    }

    /// Builder for the reveal transaction spending `anchor`.
    ///
    /// Change (including the anchor value) returns to the change address
    /// passed to `build`.
    pub fn reveal_builder(&self, anchor: UtxoRecord) -> TransactionBuilder {
        let mut b = TransactionBuilder::new();
        b.add_forced_input(ForcedInput { utxo: anchor, redeem_script: self.redeem_script.clone() })
            .set_protocol_fee(self.op.protocol_fee());
        b
    }

    /// Find the anchor created by commit `commit_txid` among `utxos`.
    pub fn find_anchor(&self, utxos: &[UtxoRecord], commit_txid: &Hash256) -> Result<UtxoRecord, WalletError> {
        let outpoint = OutPoint { txid: *commit_txid, index: ANCHOR_OUTPUT_INDEX };
        utxos
            .iter()
            .find(|u| u.outpoint == outpoint && u.address == self.address)
            .cloned()
            .ok_or_else(|| WalletError::AnchorNotFound(outpoint.to_string()))
    }
}

/// Recover the operation from a revealed redeem script.
pub fn decode_envelope(redeem_script: &[u8]) -> Result<ProtocolOp, WalletError> {
    let parsed = parse_standard_redeem_script(redeem_script)?;
    let Some((marker, chunks)) = parsed.envelope.split_first() else {
        return Err(WalletError::Payload("empty envelope".into()));
    };
    if marker.as_slice() != PROTOCOL_MARKER {
        return Err(WalletError::Payload("missing protocol marker".into()));
    }
    ProtocolOp::from_payload(&chunks.concat())
}
