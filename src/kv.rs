use std::collections::BTreeMap;

use parking_lot::RwLock;

/// Key namespaces sharing one backend. Every persisted key starts with one
/// of these bytes.
pub mod column {
    /// Trie nodes, content-addressed by Keccak-256.
    pub const TRIE: u8 = b'T';
    /// Account metadata (reserved).
    pub const ACCOUNT: u8 = b'A';
    /// Contract code, content-addressed by Keccak-256.
    pub const CODE: u8 = b'C';
    /// Block by big-endian number.
    pub const BLOCK: u8 = b'B';
    /// Block number by block hash.
    pub const HASH: u8 = b'H';
    /// Receipt by transaction hash.
    pub const RECEIPT: u8 = b'R';
    /// Log index posting lists.
    pub const LOGS: u8 = b'L';
    /// Meta pointers: `latest`, `state_root`.
    pub const META: u8 = b'M';
}

pub fn key(column: u8, suffix: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + suffix.len());
    key.push(column);
    key.extend_from_slice(suffix);
    key
}

/// Writes applied atomically by [`KvBackend::put_batch`].
#[derive(Debug, Default)]
pub struct WriteBatch {
    pub(crate) writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.writes.push((key, Some(value)));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.writes.push((key, None));
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }
}

/// Ordered byte-keyed store with atomic multi-key batches. The trie and the
/// blockchain share one backend, namespaced by [`column`] prefixes.
pub trait KvBackend: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Apply all writes of the batch, or none of them.
    fn put_batch(&self, batch: WriteBatch);

    /// All `(key, value)` pairs whose key starts with `prefix`, in key order.
    fn iterate(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)>;
}

/// In-memory backend: an ordered map behind a lock. Batch atomicity holds
/// because the whole batch is applied under one write guard.
#[derive(Default)]
pub struct MemoryKv {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryKv {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn put_batch(&self, batch: WriteBatch) {
        let mut map = self.map.write();
        for (key, value) in batch.writes {
            match value {
                Some(value) => {
                    map.insert(key, value);
                }
                None => {
                    map.remove(&key);
                }
            }
        }
    }

    fn iterate(&self, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.map
            .read()
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}
