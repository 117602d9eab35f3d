//! Redb-backed durable broker.
//!
//! Keys and lists survive process restarts, which makes this backend suitable
//! for single-node deployments and for crash-recovery tests. Pub/sub is
//! in-process only: it reaches other handles of the same `RedbBroker`, not
//! other processes.

use std::{
    fmt::Display,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::{Broker, BrokerError, Hub, Published};

/// Table: kv
/// Key: broker key
/// Value: expiry (8 bytes BE, `u64::MAX` = none) followed by the value bytes
const KV: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Table: lists
/// Key: broker key
/// Value: CBOR-encoded `StoredList`
const LISTS: TableDefinition<&str, &[u8]> = TableDefinition::new("lists");

const NO_EXPIRY: u64 = u64::MAX;
const INBOX_CAPACITY: usize = 10_000;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredList {
    items: Vec<Vec<u8>>,
    expires_at_ms: Option<u64>,
}

fn io(e: impl Display) -> BrokerError {
    BrokerError::Io(e.to_string())
}

fn encode_value(value: &[u8], expires_at_ms: Option<u64>) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + value.len());
    buf.extend_from_slice(&expires_at_ms.unwrap_or(NO_EXPIRY).to_be_bytes());
    buf.extend_from_slice(value);
    buf
}

/// Split a stored value into (expiry, bytes).
fn decode_value(raw: &[u8]) -> Result<(u64, &[u8]), BrokerError> {
    let (expiry, value) = raw
        .split_first_chunk::<8>()
        .ok_or_else(|| BrokerError::Serialization("kv value shorter than expiry".to_string()))?;
    Ok((u64::from_be_bytes(*expiry), value))
}

fn decode_list(raw: &[u8]) -> Result<StoredList, BrokerError> {
    ciborium::from_reader(raw).map_err(|e| BrokerError::Serialization(e.to_string()))
}

fn encode_list(list: &StoredList) -> Result<Vec<u8>, BrokerError> {
    let mut buf = Vec::new();
    ciborium::into_writer(list, &mut buf).map_err(|e| BrokerError::Serialization(e.to_string()))?;
    Ok(buf)
}

/// Durable broker backed by Redb.
///
/// Thread-safe through Redb's internal locking. Clone is cheap (Arc).
#[derive(Clone)]
pub struct RedbBroker {
    db: Arc<Database>,
    hub: Arc<Mutex<Hub>>,
}

impl RedbBroker {
    /// Open or create a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Io` if the database cannot be opened or created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BrokerError> {
        let db = Database::create(path.as_ref()).map_err(io)?;

        let txn = db.begin_write().map_err(io)?;
        {
            let _ = txn.open_table(KV).map_err(io)?;
            let _ = txn.open_table(LISTS).map_err(io)?;
        }
        txn.commit().map_err(io)?;

        Ok(Self { db: Arc::new(db), hub: Arc::new(Mutex::new(Hub::new(INBOX_CAPACITY))) })
    }

    fn hub(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for RedbBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBroker").finish_non_exhaustive()
    }
}

impl Broker for RedbBroker {
    fn get(&self, key: &str, now_ms: u64) -> Result<Option<Vec<u8>>, BrokerError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KV).map_err(io)?;

        match table.get(key).map_err(io)? {
            Some(raw) => {
                let (expiry, value) = decode_value(raw.value())?;
                if now_ms < expiry { Ok(Some(value.to_vec())) } else { Ok(None) }
            },
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, value: &[u8], expires_at_ms: Option<u64>) -> Result<(), BrokerError> {
        let txn = self.db.begin_write().map_err(io)?;
        {
            let mut table = txn.open_table(KV).map_err(io)?;
            let encoded = encode_value(value, expires_at_ms);
            table.insert(key, encoded.as_slice()).map_err(io)?;
        }
        txn.commit().map_err(io)
    }

    fn delete(&self, key: &str) -> Result<bool, BrokerError> {
        let txn = self.db.begin_write().map_err(io)?;
        let existed = {
            let mut kv = txn.open_table(KV).map_err(io)?;
            let mut lists = txn.open_table(LISTS).map_err(io)?;
            let in_kv = kv.remove(key).map_err(io)?.is_some();
            let in_lists = lists.remove(key).map_err(io)?.is_some();
            in_kv || in_lists
        };
        txn.commit().map_err(io)?;
        Ok(existed)
    }

    fn keys(&self, prefix: &str, now_ms: u64) -> Result<Vec<String>, BrokerError> {
        let txn = self.db.begin_read().map_err(io)?;
        let table = txn.open_table(KV).map_err(io)?;

        let mut keys = Vec::new();
        for entry in table.range(prefix..).map_err(io)? {
            let (key, raw) = entry.map_err(io)?;
            let key = key.value();
            if !key.starts_with(prefix) {
                break;
            }
            let (expiry, _) = decode_value(raw.value())?;
            if now_ms < expiry {
                keys.push(key.to_string());
            }
        }
        Ok(keys)
    }

    fn push(
        &self,
        key: &str,
        value: &[u8],
        max_len: usize,
        expires_at_ms: Option<u64>,
    ) -> Result<usize, BrokerError> {
        let txn = self.db.begin_write().map_err(io)?;
        let len = {
            let mut table = txn.open_table(LISTS).map_err(io)?;
            let existing = table.get(key).map_err(io)?.map(|raw| decode_list(raw.value()));
            let mut list = existing.transpose()?.unwrap_or_default();

            list.items.push(value.to_vec());
            let excess = list.items.len().saturating_sub(max_len.max(1));
            list.items.drain(..excess);
            list.expires_at_ms = expires_at_ms;

            let encoded = encode_list(&list)?;
            table.insert(key, encoded.as_slice()).map_err(io)?;
            list.items.len()
        };
        txn.commit().map_err(io)?;
        Ok(len)
    }

    fn drain(&self, key: &str, now_ms: u64) -> Result<Vec<Vec<u8>>, BrokerError> {
        let txn = self.db.begin_write().map_err(io)?;
        let items = {
            let mut table = txn.open_table(LISTS).map_err(io)?;
            let removed = table.remove(key).map_err(io)?.map(|raw| decode_list(raw.value()));
            match removed.transpose()? {
                Some(list) if list.expires_at_ms.is_none_or(|at| now_ms < at) => list.items,
                _ => Vec::new(),
            }
        };
        txn.commit().map_err(io)?;
        Ok(items)
    }

    fn publish(&self, channel: &str, payload: &[u8]) -> Result<usize, BrokerError> {
        Ok(self.hub().publish(channel, payload))
    }

    fn subscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError> {
        self.hub().subscribe(subscriber, pattern);
        Ok(())
    }

    fn unsubscribe(&self, subscriber: &str, pattern: &str) -> Result<(), BrokerError> {
        self.hub().unsubscribe(subscriber, pattern);
        Ok(())
    }

    fn poll(&self, subscriber: &str, max: usize) -> Result<Vec<Published>, BrokerError> {
        Ok(self.hub().poll(subscriber, max))
    }

    fn ping(&self) -> Result<(), BrokerError> {
        self.db.begin_read().map(|_| ()).map_err(io)
    }
}
