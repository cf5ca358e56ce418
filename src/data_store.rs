//! The pluggable history of sequenced payloads, queried on replay.

use std::sync::RwLock;

use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;

use crate::error::SoupError;
use crate::fields::SequenceNumber;

/// Maps assigned sequence numbers to persisted payloads.
///
/// The owning session calls `set` exactly once per sequence number, in
/// monotonically increasing order, before that number is broadcast. `get` is
/// called concurrently with `set` (and with other `get`s) during replay, so
/// implementations must be safe for that.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    /// The payload previously stored for `seq_num`, or
    /// [`SoupError::NotFound`] if that number was never set.
    async fn get(&self, seq_num: SequenceNumber) -> Result<Bytes, SoupError>;

    /// Stores the payload for `seq_num`.
    async fn set(&self, seq_num: SequenceNumber, payload: Bytes) -> Result<(), SoupError>;
}

/// An append-only in-memory store. It relies on the session's set-in-order
/// contract: the n-th `set` call is assumed to carry sequence number
/// `start + n`.
pub struct VecDataStore {
    start: u64,
    data: RwLock<Vec<Bytes>>,
}

impl VecDataStore {
    /// `start` is the first sequence number this store will hold, i.e. the
    /// session's configured start plus one.
    pub fn new(start: u64) -> VecDataStore {
        VecDataStore {
            start,
            data: RwLock::new(Vec::new()),
        }
    }
}

#[async_trait]
impl DataStore for VecDataStore {
    async fn get(&self, seq_num: SequenceNumber) -> Result<Bytes, SoupError> {
        let n = seq_num.to_u64_checked().ok_or(SoupError::NotFound)?;
        if n < self.start {
            return Err(SoupError::NotFound);
        }
        let idx = (n - self.start) as usize;
        self.data
            .read()
            .unwrap()
            .get(idx)
            .cloned()
            .ok_or(SoupError::NotFound)
    }

    async fn set(&self, _seq_num: SequenceNumber, payload: Bytes) -> Result<(), SoupError> {
        self.data.write().unwrap().push(payload);
        Ok(())
    }
}

/// A hash-map backed store that rejects duplicate sequence numbers.
pub struct MapDataStore {
    data: RwLock<FxHashMap<SequenceNumber, Bytes>>,
}

impl MapDataStore {
    pub fn new() -> MapDataStore {
        MapDataStore {
            data: RwLock::new(FxHashMap::default()),
        }
    }
}

impl Default for MapDataStore {
    fn default() -> MapDataStore {
        MapDataStore::new()
    }
}

#[async_trait]
impl DataStore for MapDataStore {
    async fn get(&self, seq_num: SequenceNumber) -> Result<Bytes, SoupError> {
        self.data
            .read()
            .unwrap()
            .get(&seq_num)
            .cloned()
            .ok_or(SoupError::NotFound)
    }

    async fn set(&self, seq_num: SequenceNumber, payload: Bytes) -> Result<(), SoupError> {
        use std::collections::hash_map::Entry;
        match self.data.write().unwrap().entry(seq_num) {
            Entry::Occupied(_) => Err(SoupError::Duplicate),
            Entry::Vacant(e) => {
                e.insert(payload);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_store_indexing() {
        let store = VecDataStore::new(3);
        store.set(SequenceNumber::from_u64(3), Bytes::from_static(b"a")).await.unwrap();
        store.set(SequenceNumber::from_u64(4), Bytes::from_static(b"b")).await.unwrap();

        assert_eq!(store.get(SequenceNumber::from_u64(3)).await.unwrap(), "a");
        assert_eq!(store.get(SequenceNumber::from_u64(4)).await.unwrap(), "b");
        assert!(matches!(
            store.get(SequenceNumber::from_u64(2)).await,
            Err(SoupError::NotFound)
        ));
        assert!(matches!(
            store.get(SequenceNumber::from_u64(5)).await,
            Err(SoupError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_vec_store_unparsable_sequence_number() {
        let store = VecDataStore::new(1);
        store.set(SequenceNumber::from_u64(1), Bytes::from_static(b"a")).await.unwrap();
        let garbage = SequenceNumber::from_bytes_trunc(b"x");
        assert!(matches!(store.get(garbage).await, Err(SoupError::NotFound)));
    }

    #[tokio::test]
    async fn test_map_store_rejects_duplicates() {
        let store = MapDataStore::new();
        let seq = SequenceNumber::from_u64(7);
        store.set(seq, Bytes::from_static(b"a")).await.unwrap();
        assert!(matches!(
            store.set(seq, Bytes::from_static(b"b")).await,
            Err(SoupError::Duplicate)
        ));
        assert_eq!(store.get(seq).await.unwrap(), "a");
        assert!(matches!(
            store.get(SequenceNumber::from_u64(8)).await,
            Err(SoupError::NotFound)
        ));
    }
}
