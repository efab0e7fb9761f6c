//! RocksDB-backed document store.
//!
//! A pessimistic `TransactionDB`: every read-modify-write goes through a
//! [`StoreTxn`] that locks the keys it reads with `get_for_update`, so
//! concurrent writers on the same document serialize and a dropped,
//! uncommitted transaction leaves nothing behind.

use std::path::Path;

use rocksdb::{Direction, IteratorMode, Options, TransactionDB, TransactionDBOptions};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::SettlementError;

// --- Key prefixes ---

const PREFIX_ACTION: &str = "action/";
const PREFIX_ROUND: &str = "round/";
const PREFIX_RESERVATION: &str = "reservation/";
const PREFIX_WALLET_UNITS: &str = "wallet_units/";

const META_NEXT_WALLET_INDEX: &[u8] = b"meta/next_wallet_index";

/// How long a writer waits for a row lock before giving up with `Busy`.
const LOCK_TIMEOUT_MS: i64 = 2_000;

pub fn action_key(id: &str) -> Vec<u8> {
    format!("{PREFIX_ACTION}{id}").into_bytes()
}

pub fn round_key(id: &str) -> Vec<u8> {
    format!("{PREFIX_ROUND}{id}").into_bytes()
}

pub fn reservation_key(id: &str) -> Vec<u8> {
    format!("{PREFIX_RESERVATION}{id}").into_bytes()
}

/// Units held by `wallet` in `round_id`, across non-cancelled reservations.
pub fn wallet_units_key(round_id: &str, wallet: &str) -> Vec<u8> {
    format!("{PREFIX_WALLET_UNITS}{round_id}/{wallet}").into_bytes()
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SettlementError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| SettlementError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SettlementError> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| SettlementError::Codec(e.to_string()))?;
    Ok(value)
}

pub struct SettlementStore {
    db: TransactionDB,
}

impl SettlementStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettlementError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let mut txn_opts = TransactionDBOptions::default();
        txn_opts.set_txn_lock_timeout(LOCK_TIMEOUT_MS);

        let db = TransactionDB::open(&opts, &txn_opts, path.as_ref())?;
        Ok(Self { db })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, SettlementError> {
        match self.db.get(key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every document under `prefix`, in key order.
    pub fn scan<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>, SettlementError> {
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix.as_bytes(), Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix.as_bytes()) {
                break;
            }
            out.push(decode(&value)?);
        }
        Ok(out)
    }

    pub fn actions<T: DeserializeOwned>(&self) -> Result<Vec<T>, SettlementError> {
        self.scan(PREFIX_ACTION)
    }

    pub fn reservations<T: DeserializeOwned>(&self) -> Result<Vec<T>, SettlementError> {
        self.scan(PREFIX_RESERVATION)
    }

    pub fn transaction(&self) -> StoreTxn<'_> {
        StoreTxn { txn: self.db.transaction() }
    }

    /// Allocate the next wallet index, starting at `first`.
    pub fn next_wallet_index(&self, first: u32) -> Result<u32, SettlementError> {
        let txn = self.transaction();
        let next = txn.get_for_update::<u32>(META_NEXT_WALLET_INDEX)?.unwrap_or(first).max(first);
        let bumped = next
            .checked_add(1)
            .ok_or_else(|| SettlementError::Storage("wallet index space exhausted".into()))?;
        txn.put(META_NEXT_WALLET_INDEX, &bumped)?;
        txn.commit()?;
        Ok(next)
    }
}

/// A multi-document transaction. Dropping it without [`commit`](Self::commit)
/// rolls back.
pub struct StoreTxn<'a> {
    txn: rocksdb::Transaction<'a, TransactionDB>,
}

impl StoreTxn<'_> {
    /// Read `key` and hold an exclusive lock on it until commit.
    pub fn get_for_update<T: DeserializeOwned>(&self, key: &[u8]) -> Result<Option<T>, SettlementError> {
        match self.txn.get_for_update(key, true)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), SettlementError> {
        self.txn.put(key, encode(value)?)?;
        Ok(())
    }

    pub fn commit(self) -> Result<(), SettlementError> {
        self.txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u64,
    }

    fn temp_store() -> (SettlementStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SettlementStore::open(dir.path().join("settlement")).unwrap();
        (store, dir)
    }

    #[test]
    fn committed_write_is_visible() {
        let (store, _dir) = temp_store();
        let txn = store.transaction();
        txn.put(&action_key("a"), &Doc { name: "a".into(), count: 1 }).unwrap();
        txn.commit().unwrap();
        let doc: Doc = store.get(&action_key("a")).unwrap().unwrap();
        assert_eq!(doc.count, 1);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let (store, _dir) = temp_store();
        {
            let txn = store.transaction();
            txn.put(&action_key("a"), &Doc { name: "a".into(), count: 1 }).unwrap();
        }
        assert!(store.get::<Doc>(&action_key("a")).unwrap().is_none());
    }

    #[test]
    fn scan_stays_within_prefix() {
        let (store, _dir) = temp_store();
        let txn = store.transaction();
        txn.put(&action_key("a"), &Doc { name: "a".into(), count: 1 }).unwrap();
        txn.put(&action_key("b"), &Doc { name: "b".into(), count: 2 }).unwrap();
        txn.put(&round_key("r"), &Doc { name: "r".into(), count: 3 }).unwrap();
        txn.commit().unwrap();

        let actions: Vec<Doc> = store.actions().unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].name, "a");
    }

    #[test]
    fn wallet_indices_are_unique_and_start_at_first() {
        let (store, _dir) = temp_store();
        assert_eq!(store.next_wallet_index(1).unwrap(), 1);
        assert_eq!(store.next_wallet_index(1).unwrap(), 2);
        assert_eq!(store.next_wallet_index(1).unwrap(), 3);
    }

    #[test]
    fn reopen_preserves_documents() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SettlementStore::open(dir.path()).unwrap();
            let txn = store.transaction();
            txn.put(&round_key("r"), &Doc { name: "r".into(), count: 9 }).unwrap();
            txn.commit().unwrap();
        }
        let store = SettlementStore::open(dir.path()).unwrap();
        let doc: Doc = store.get(&round_key("r")).unwrap().unwrap();
        assert_eq!(doc.count, 9);
    }

    #[test]
    fn wallet_units_key_is_scoped_by_round() {
        assert_ne!(wallet_units_key("r1", "w"), wallet_units_key("r2", "w"));
    }
}
