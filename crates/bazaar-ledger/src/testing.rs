//! In-process ledger node for tests.
//!
//! Validates signatures and relay fees like a real node, applies accepted
//! transactions immediately, notifies subscribed addresses, then advances
//! the virtual height. Faults (hangs, unhealthy status, dropped
//! notifications, rejected submits) can be injected per test.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;
use tokio::sync::broadcast;

use bazaar_core::address::{Address, Network};
use bazaar_core::constants::{MIN_RELAY_FEERATE, USER_TX_MATURITY};
use bazaar_core::crypto::verify_transaction_input;
use bazaar_core::error::LedgerError;
use bazaar_core::traits::{FeeEstimate, LedgerEvent, LedgerRpc, ServerInfo, UtxoRecord, UtxosChanged};
use bazaar_core::types::{Hash256, OutPoint, Transaction, TxOutput, UtxoEntry};

const EVENT_CAPACITY: usize = 256;
const INITIAL_HEIGHT: u64 = 100;

struct SimState {
    connected: bool,
    synced: bool,
    utxo_index: bool,
    height: u64,
    blocks_per_submit: u64,
    utxos: BTreeMap<OutPoint, (Address, UtxoEntry)>,
    subscribed: HashSet<Address>,
    accepted: HashSet<Hash256>,
    submitted: Vec<Hash256>,
    fee_estimate: FeeEstimate,
    connect_hang: bool,
    connect_delay: Option<Duration>,
    probe_hang: bool,
    drop_notifications: bool,
    reject_submits: usize,
    hold_confirmations: bool,
    held: Vec<(Hash256, Transaction)>,
    fund_counter: u64,
    connect_calls: usize,
    subscribe_calls: usize,
    unsubscribe_calls: usize,
}

pub struct SimLedger {
    network: Network,
    state: Mutex<SimState>,
    events: broadcast::Sender<LedgerEvent>,
}

impl SimLedger {
    pub fn new(network: Network) -> Self {
        Self {
            network,
            state: Mutex::new(SimState {
                connected: false,
                synced: true,
                utxo_index: true,
                height: INITIAL_HEIGHT,
                blocks_per_submit: USER_TX_MATURITY,
                utxos: BTreeMap::new(),
                subscribed: HashSet::new(),
                accepted: HashSet::new(),
                submitted: Vec::new(),
                fee_estimate: FeeEstimate {
                    priority_feerate: MIN_RELAY_FEERATE,
                    normal_feerate: MIN_RELAY_FEERATE,
                    low_feerate: MIN_RELAY_FEERATE,
                },
                connect_hang: false,
                connect_delay: None,
                probe_hang: false,
                drop_notifications: false,
                reject_submits: 0,
                hold_confirmations: false,
                held: Vec::new(),
                fund_counter: 0,
                connect_calls: 0,
                subscribe_calls: 0,
                unsubscribe_calls: 0,
            }),
            events: broadcast::channel(EVENT_CAPACITY).0,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Drop the transport. Subscriptions are lost with it.
    pub fn disconnect(&self) {
        let mut s = self.state.lock();
        s.connected = false;
        s.subscribed.clear();
    }

    pub fn set_health(&self, synced: bool, utxo_index: bool) {
        let mut s = self.state.lock();
        s.synced = synced;
        s.utxo_index = utxo_index;
    }

    pub fn set_probe_hang(&self, hang: bool) {
        self.state.lock().probe_hang = hang;
    }

    pub fn set_connect_hang(&self, hang: bool) {
        self.state.lock().connect_hang = hang;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    /// Accept transactions but never emit UTXO-change notifications.
    pub fn set_drop_notifications(&self, drop: bool) {
        self.state.lock().drop_notifications = drop;
    }

    pub fn set_fee_estimate(&self, estimate: FeeEstimate) {
        self.state.lock().fee_estimate = estimate;
    }

    pub fn set_blocks_per_submit(&self, blocks: u64) {
        self.state.lock().blocks_per_submit = blocks;
    }

    /// Reject the next `count` submissions.
    pub fn reject_next_submits(&self, count: usize) {
        self.state.lock().reject_submits = count;
    }

    /// Accept submissions without confirming them until
    /// [`release_held`](Self::release_held).
    pub fn hold_confirmations(&self, hold: bool) {
        self.state.lock().hold_confirmations = hold;
    }

    /// Confirm every held transaction, in submission order.
    pub fn release_held(&self) {
        let mut s = self.state.lock();
        s.hold_confirmations = false;
        for (txid, tx) in std::mem::take(&mut s.held) {
            self.confirm_locked(&mut s, &tx, txid);
        }
    }

    pub fn held_count(&self) -> usize {
        self.state.lock().held.len()
    }

    /// Create a mature UTXO of `value` at `address`.
    pub fn fund(&self, address: &Address, value: u64) -> OutPoint {
        let (record, notify) = {
            let mut s = self.state.lock();
            s.fund_counter += 1;
            let mut txid = [0xFB; 32];
            txid[..8].copy_from_slice(&s.fund_counter.to_le_bytes());
            let outpoint = OutPoint { txid: Hash256(txid), index: 0 };
            let entry = UtxoEntry {
                output: TxOutput { value, lock: address.lock_script() },
                block_height: s.height.saturating_sub(USER_TX_MATURITY),
                is_coinbase: false,
            };
            s.utxos.insert(outpoint.clone(), (address.clone(), entry.clone()));
            let notify = s.subscribed.contains(address) && !s.drop_notifications;
            (UtxoRecord { address: address.clone(), outpoint, entry }, notify)
        };
        let outpoint = record.outpoint.clone();
        if notify {
            let _ = self.events.send(LedgerEvent::UtxosChanged(UtxosChanged {
                address: address.clone(),
                added: vec![record],
                removed: vec![],
            }));
        }
        outpoint
    }

    /// Advance the virtual height by `blocks`.
    pub fn mine(&self, blocks: u64) {
        let height = {
            let mut s = self.state.lock();
            s.height += blocks;
            s.height
        };
        let _ = self.events.send(LedgerEvent::VirtualHeightChanged(height));
    }

    /// Emit `count` height notifications without moving the height.
    pub fn flood_height_events(&self, count: usize) {
        let height = self.state.lock().height;
        for _ in 0..count {
            let _ = self.events.send(LedgerEvent::VirtualHeightChanged(height));
        }
    }

    pub fn height(&self) -> u64 {
        self.state.lock().height
    }

    /// Ids of accepted transactions in submission order.
    pub fn submitted(&self) -> Vec<Hash256> {
        self.state.lock().submitted.clone()
    }

    pub fn submit_count(&self) -> usize {
        self.state.lock().submitted.len()
    }

    pub fn connect_calls(&self) -> usize {
        self.state.lock().connect_calls
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state.lock().subscribe_calls
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.state.lock().unsubscribe_calls
    }

    pub fn is_subscribed(&self, address: &Address) -> bool {
        self.state.lock().subscribed.contains(address)
    }

    pub fn balance_of(&self, address: &Address) -> u64 {
        self.state
            .lock()
            .utxos
            .values()
            .filter(|(a, _)| a == address)
            .map(|(_, e)| e.output.value)
            .sum()
    }

    pub fn utxos_of(&self, address: &Address) -> Vec<UtxoRecord> {
        collect_utxos(&self.state.lock(), std::slice::from_ref(address))
    }

    fn apply(&self, tx: &Transaction) -> Result<Hash256, LedgerError> {
        let txid = tx.txid().map_err(|e| LedgerError::Rejected(e.to_string()))?;
        let mut s = self.state.lock();
        if !s.connected {
            return Err(LedgerError::NotConnected);
        }
        if s.accepted.contains(&txid) || s.held.iter().any(|(id, _)| *id == txid) {
            return Ok(txid);
        }
        if s.reject_submits > 0 {
            s.reject_submits -= 1;
            return Err(LedgerError::Rejected("injected rejection".into()));
        }
        tx.check_standard()
            .map_err(|e| LedgerError::Rejected(e.to_string()))?;

        let mut seen = BTreeSet::new();
        let mut input_total = 0u64;
        for (i, input) in tx.inputs.iter().enumerate() {
            let op = &input.previous_output;
            if !seen.insert(op.clone()) {
                return Err(LedgerError::Rejected(format!("duplicate input {op}")));
            }
            let Some((_, entry)) = s.utxos.get(op) else {
                return Err(LedgerError::Rejected(format!("missing input {op}")));
            };
            verify_transaction_input(tx, i, &entry.output.lock)
                .map_err(|e| LedgerError::Rejected(format!("input {i}: {e}")))?;
            input_total = input_total.saturating_add(entry.output.value);
        }
        let output_total = tx
            .total_output_value()
            .ok_or_else(|| LedgerError::Rejected("output overflow".into()))?;
        let fee = input_total
            .checked_sub(output_total)
            .ok_or_else(|| LedgerError::Rejected("outputs exceed inputs".into()))?;
        let min_fee = tx.mass().saturating_mul(MIN_RELAY_FEERATE);
        if fee < min_fee {
            return Err(LedgerError::Rejected(format!("fee {fee} below relay minimum {min_fee}")));
        }

        s.submitted.push(txid);
        if s.hold_confirmations {
            s.held.push((txid, tx.clone()));
            return Ok(txid);
        }
        self.confirm_locked(&mut s, tx, txid);
        Ok(txid)
    }

    /// Spend the inputs of an accepted `tx`, add its outputs and notify.
    fn confirm_locked(&self, s: &mut SimState, tx: &Transaction, txid: Hash256) {
        let mut changes: HashMap<Address, UtxosChanged> = HashMap::new();
        for input in &tx.inputs {
            if let Some((address, _)) = s.utxos.remove(&input.previous_output) {
                changes
                    .entry(address.clone())
                    .or_insert_with(|| empty_change(&address))
                    .removed
                    .push(input.previous_output.clone());
            }
        }
        let height = s.height;
        for (index, output) in tx.outputs.iter().enumerate() {
            let address = Address::from_lock(output.lock, self.network);
            let outpoint = OutPoint { txid, index: index as u64 };
            let entry = UtxoEntry { output: output.clone(), block_height: height, is_coinbase: false };
            s.utxos.insert(outpoint.clone(), (address.clone(), entry.clone()));
            changes
                .entry(address.clone())
                .or_insert_with(|| empty_change(&address))
                .added
                .push(UtxoRecord { address, outpoint, entry });
        }
        s.accepted.insert(txid);
        s.height += s.blocks_per_submit;
        let new_height = s.height;

        if !s.drop_notifications {
            let mut changed: Vec<_> = changes
                .into_values()
                .filter(|c| s.subscribed.contains(&c.address))
                .collect();
            changed.sort_by(|a, b| a.address.to_string().cmp(&b.address.to_string()));
            for change in changed {
                let _ = self.events.send(LedgerEvent::UtxosChanged(change));
            }
        }
        let _ = self.events.send(LedgerEvent::VirtualHeightChanged(new_height));
    }
}

fn empty_change(address: &Address) -> UtxosChanged {
    UtxosChanged { address: address.clone(), added: vec![], removed: vec![] }
}

fn collect_utxos(s: &SimState, addresses: &[Address]) -> Vec<UtxoRecord> {
    s.utxos
        .iter()
        .filter(|(_, (a, _))| addresses.contains(a))
        .map(|(op, (a, e))| UtxoRecord { address: a.clone(), outpoint: op.clone(), entry: e.clone() })
        .collect()
}

#[async_trait]
impl LedgerRpc for SimLedger {
    async fn connect(&self) -> Result<(), LedgerError> {
        let (hang, delay) = {
            let mut s = self.state.lock();
            s.connect_calls += 1;
            (s.connect_hang, s.connect_delay)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.state.lock().connected = true;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    async fn server_info(&self) -> Result<ServerInfo, LedgerError> {
        let hang = self.state.lock().probe_hang;
        if hang {
            std::future::pending::<()>().await;
        }
        let s = self.state.lock();
        if !s.connected {
            return Err(LedgerError::NotConnected);
        }
        Ok(ServerInfo {
            is_synced: s.synced,
            has_utxo_index: s.utxo_index,
            virtual_height: s.height,
            server_version: "sim".into(),
        })
    }

    async fn utxos_by_addresses(&self, addresses: &[Address]) -> Result<Vec<UtxoRecord>, LedgerError> {
        let s = self.state.lock();
        if !s.connected {
            return Err(LedgerError::NotConnected);
        }
        Ok(collect_utxos(&s, addresses))
    }

    async fn fee_estimate(&self) -> Result<FeeEstimate, LedgerError> {
        let s = self.state.lock();
        if !s.connected {
            return Err(LedgerError::NotConnected);
        }
        Ok(s.fee_estimate)
    }

    async fn submit_transaction(&self, tx: &Transaction) -> Result<Hash256, LedgerError> {
        self.apply(tx)
    }

    async fn subscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError> {
        let mut s = self.state.lock();
        if !s.connected {
            return Err(LedgerError::NotConnected);
        }
        s.subscribe_calls += 1;
        s.subscribed.extend(addresses.iter().cloned());
        Ok(())
    }

    async fn unsubscribe_utxos_changed(&self, addresses: &[Address]) -> Result<(), LedgerError> {
        let mut s = self.state.lock();
        s.unsubscribe_calls += 1;
        for address in addresses {
            s.subscribed.remove(address);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<LedgerEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bazaar_core::constants::COIN;
    use bazaar_core::crypto::{KeyPair, sign_transaction_input};
    use bazaar_core::types::TxInput;

    async fn connected() -> SimLedger {
        let sim = SimLedger::new(Network::Testnet);
        sim.connect().await.unwrap();
        sim
    }

    fn spend(kp: &KeyPair, from: OutPoint, to: &Address, value: u64) -> Transaction {
        let mut tx = Transaction {
            version: 1,
            inputs: vec![TxInput::unsigned(from)],
            outputs: vec![TxOutput { value, lock: to.lock_script() }],
            lock_time: 0,
        };
        sign_transaction_input(&mut tx, 0, kp).unwrap();
        tx
    }

    #[tokio::test]
    async fn accepts_valid_spend_and_moves_value() {
        let sim = connected().await;
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let from = Address::from_public_key(&kp.public_key(), Network::Testnet);
        let to = Address::from_pubkey_hash(Hash256([2; 32]), Network::Testnet);
        let op = sim.fund(&from, COIN);

        let h0 = sim.height();
        sim.submit_transaction(&spend(&kp, op, &to, COIN - 1_000)).await.unwrap();
        assert_eq!(sim.balance_of(&from), 0);
        assert_eq!(sim.balance_of(&to), COIN - 1_000);
        assert_eq!(sim.height(), h0 + USER_TX_MATURITY);
    }

    #[tokio::test]
    async fn rejects_wrong_signer() {
        let sim = connected().await;
        let owner = KeyPair::from_secret_bytes([1; 32]);
        let thief = KeyPair::from_secret_bytes([3; 32]);
        let from = Address::from_public_key(&owner.public_key(), Network::Testnet);
        let op = sim.fund(&from, COIN);
        let err = sim.submit_transaction(&spend(&thief, op, &from, COIN - 1_000)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn rejects_fee_below_relay_minimum() {
        let sim = connected().await;
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let from = Address::from_public_key(&kp.public_key(), Network::Testnet);
        let op = sim.fund(&from, COIN);
        let err = sim.submit_transaction(&spend(&kp, op, &from, COIN)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
    }

    #[tokio::test]
    async fn resubmitting_accepted_tx_is_idempotent() {
        let sim = connected().await;
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let from = Address::from_public_key(&kp.public_key(), Network::Testnet);
        let op = sim.fund(&from, COIN);
        let tx = spend(&kp, op, &from, COIN - 1_000);
        let a = sim.submit_transaction(&tx).await.unwrap();
        let b = sim.submit_transaction(&tx).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(sim.submit_count(), 1);
    }

    #[tokio::test]
    async fn held_tx_confirms_only_on_release() {
        let sim = connected().await;
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let from = Address::from_public_key(&kp.public_key(), Network::Testnet);
        let to = Address::from_pubkey_hash(Hash256([2; 32]), Network::Testnet);
        let op = sim.fund(&from, COIN);
        let tx = spend(&kp, op, &to, COIN - 1_000);

        sim.hold_confirmations(true);
        let txid = sim.submit_transaction(&tx).await.unwrap();
        assert_eq!(sim.submit_transaction(&tx).await.unwrap(), txid);
        assert_eq!(sim.held_count(), 1);
        assert_eq!(sim.submitted(), vec![txid]);
        assert_eq!(sim.balance_of(&to), 0);

        sim.release_held();
        assert_eq!(sim.held_count(), 0);
        assert_eq!(sim.balance_of(&to), COIN - 1_000);
        assert_eq!(sim.submit_transaction(&tx).await.unwrap(), txid);
        assert_eq!(sim.submitted(), vec![txid]);
    }

    #[tokio::test]
    async fn notifies_only_subscribed_addresses() {
        let sim = connected().await;
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let from = Address::from_public_key(&kp.public_key(), Network::Testnet);
        let to = Address::from_pubkey_hash(Hash256([2; 32]), Network::Testnet);
        let op = sim.fund(&from, COIN);

        let mut rx = sim.events();
        sim.subscribe_utxos_changed(std::slice::from_ref(&to)).await.unwrap();
        sim.submit_transaction(&spend(&kp, op, &to, COIN - 1_000)).await.unwrap();

        match rx.recv().await.unwrap() {
            LedgerEvent::UtxosChanged(c) => assert_eq!(c.address, to),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), LedgerEvent::VirtualHeightChanged(_)));
    }

    #[tokio::test]
    async fn injected_rejection_is_consumed() {
        let sim = connected().await;
        let kp = KeyPair::from_secret_bytes([1; 32]);
        let from = Address::from_public_key(&kp.public_key(), Network::Testnet);
        let op = sim.fund(&from, COIN);
        let tx = spend(&kp, op, &from, COIN - 1_000);
        sim.reject_next_submits(1);
        assert!(sim.submit_transaction(&tx).await.is_err());
        assert!(sim.submit_transaction(&tx).await.is_ok());
    }

    #[tokio::test]
    async fn requires_connection() {
        let sim = SimLedger::new(Network::Testnet);
        assert_eq!(sim.fee_estimate().await.unwrap_err(), LedgerError::NotConnected);
    }
}
