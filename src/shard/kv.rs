//! Durable key-value abstraction backing a shard.
//!
//! The storage engine proper is out of scope; a shard only needs string keys
//! to JSON blobs with prefix listing and atomic multi-key batches. `MemoryKv`
//! is the in-process implementation used by nodes and tests alike.

use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Put { key: String, value: String },
    Delete { key: String },
}

pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: String);
    fn delete(&self, key: &str) -> bool;
    /// All entries whose key starts with `prefix`, in key order.
    fn list_prefix(&self, prefix: &str) -> Vec<(String, String)>;
    /// Applies every operation or none; readers never see a partial batch.
    fn write_batch(&self, ops: Vec<BatchOp>);
}

#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<BTreeMap<String, String>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KvStore for MemoryKv {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().get(key).cloned()
    }

    fn put(&self, key: &str, value: String) {
        self.entries.write().insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    fn list_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        self.entries
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }

    fn write_batch(&self, ops: Vec<BatchOp>) {
        let mut entries = self.entries.write();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => {
                    entries.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    entries.remove(&key);
                }
            }
        }
    }
}
