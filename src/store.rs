//! In-memory data store with thread-safe access
//!
//! Two independent keyspaces, each behind its own lock: a flat string map and
//! a map of named hashes. Operations touching both namespaces always lock the
//! string map first.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// One item of a store snapshot, used by log compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    String { key: String, value: String },
    Hash { name: String, fields: BTreeMap<String, String> },
}

/// Trait defining the operations command handlers may perform on the store
pub trait Store: Send + Sync {
    /// Get a value from the string keyspace
    fn get(&self, key: &str) -> Option<String>;

    /// Set a value in the string keyspace, overwriting any previous value
    fn set(&self, key: String, value: String);

    /// Remove every named key from both keyspaces; returns how many names
    /// removed something
    fn delete(&self, keys: &[String]) -> usize;

    /// Get one field of a hash
    fn hget(&self, hash: &str, field: &str) -> Option<String>;

    /// Set one field of a hash, creating the hash if needed
    fn hset(&self, hash: String, field: String, value: String);

    /// All `(field, value)` pairs of a hash ordered by field, or `None` if the
    /// hash does not exist
    fn hgetall(&self, hash: &str) -> Option<Vec<(String, String)>>;

    /// Remove fields from a hash; returns the number removed
    fn hdel(&self, hash: &str, fields: &[String]) -> usize;

    /// Keys matching `pattern`; hash fields are reported as `hash:field`
    fn keys(&self, pattern: &str) -> Vec<String>;

    /// Consistent copy of both keyspaces
    fn snapshot(&self) -> Vec<Entry>;

    /// Number of string keys plus number of hashes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `*` matches everything; any other pattern matches keys containing it.
pub fn matches_pattern(pattern: &str, key: &str) -> bool {
    pattern == "*" || key.contains(pattern)
}

type HashSpace = HashMap<String, HashMap<String, String>>;

/// Thread-safe in-memory key-value store
#[derive(Clone, Default)]
pub struct MemoryStore {
    strings: Arc<RwLock<HashMap<String, String>>>,
    hashes: Arc<RwLock<HashSpace>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.strings.read().get(key).cloned()
    }

    fn set(&self, key: String, value: String) {
        self.strings.write().insert(key, value);
    }

    fn delete(&self, keys: &[String]) -> usize {
        let mut strings = self.strings.write();
        let mut hashes = self.hashes.write();

        keys.iter()
            .filter(|key| {
                let removed_string = strings.remove(key.as_str()).is_some();
                let removed_hash = hashes.remove(key.as_str()).is_some();
                removed_string || removed_hash
            })
            .count()
    }

    fn hget(&self, hash: &str, field: &str) -> Option<String> {
        self.hashes.read().get(hash)?.get(field).cloned()
    }

    fn hset(&self, hash: String, field: String, value: String) {
        self.hashes
            .write()
            .entry(hash)
            .or_default()
            .insert(field, value);
    }

    fn hgetall(&self, hash: &str) -> Option<Vec<(String, String)>> {
        let hashes = self.hashes.read();
        let fields = hashes.get(hash)?;
        let mut pairs: Vec<_> = fields
            .iter()
            .map(|(f, v)| (f.clone(), v.clone()))
            .collect();
        pairs.sort();
        Some(pairs)
    }

    fn hdel(&self, hash: &str, fields: &[String]) -> usize {
        let mut hashes = self.hashes.write();
        let Some(existing) = hashes.get_mut(hash) else {
            return 0;
        };

        let removed = fields
            .iter()
            .filter(|field| existing.remove(field.as_str()).is_some())
            .count();

        // An empty hash is indistinguishable from a missing one.
        if existing.is_empty() {
            hashes.remove(hash);
        }
        removed
    }

    fn keys(&self, pattern: &str) -> Vec<String> {
        let strings = self.strings.read();
        let hashes = self.hashes.read();

        let mut keys: Vec<String> = strings
            .keys()
            .filter(|key| matches_pattern(pattern, key))
            .cloned()
            .collect();

        for (name, fields) in hashes.iter() {
            keys.extend(
                fields
                    .keys()
                    .map(|field| format!("{}:{}", name, field))
                    .filter(|key| matches_pattern(pattern, key)),
            );
        }

        keys.sort();
        keys
    }

    fn snapshot(&self) -> Vec<Entry> {
        let strings = self.strings.read();
        let hashes = self.hashes.read();

        let mut entries: Vec<Entry> = strings
            .iter()
            .map(|(key, value)| Entry::String {
                key: key.clone(),
                value: value.clone(),
            })
            .collect();

        entries.extend(
            hashes
                .iter()
                .filter(|(_, fields)| !fields.is_empty())
                .map(|(name, fields)| Entry::Hash {
                    name: name.clone(),
                    fields: fields.iter().map(|(f, v)| (f.clone(), v.clone())).collect(),
                }),
        );
        entries
    }

    fn len(&self) -> usize {
        let strings = self.strings.read();
        let hashes = self.hashes.read();
        strings.len() + hashes.len()
    }
}
