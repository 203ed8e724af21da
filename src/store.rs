//! Content-addressed snapshot store
//!
//! Immutable key/value trees identified by their BLAKE3 content hash.
//! Identical trees are stored once. Trees are handed out as `Arc`s so
//! `as_of` views stay valid for as long as a caller holds them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::hlc::Hlc;
use crate::merge::Entries;

/// Hex-encoded BLAKE3 digest.
pub type ContentHash = String;

/// Hash of a key/value tree. Keys are visited in order, so equal maps
/// always hash equal.
pub fn tree_hash(entries: &Entries) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    for (key, value) in entries {
        hasher.update(&(key.len() as u64).to_le_bytes());
        hasher.update(key.as_bytes());
        hasher.update(&(value.len() as u64).to_le_bytes());
        hasher.update(value.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Commit identity: tree, parents (in order), causal stamp and message.
pub fn commit_hash(tree: &str, parents: &[String], hlc: Hlc, message: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"tree ");
    hasher.update(tree.as_bytes());
    for parent in parents {
        hasher.update(b"\nparent ");
        hasher.update(parent.as_bytes());
    }
    hasher.update(b"\nhlc ");
    hasher.update(&hlc.physical.to_le_bytes());
    hasher.update(&hlc.logical.to_le_bytes());
    hasher.update(b"\n\n");
    hasher.update(message.as_bytes());
    hasher.finalize().to_hex().to_string()
}

/// Entry maps keyed by their BLAKE3 digest; identical maps share one allocation.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    trees: HashMap<ContentHash, Arc<Entries>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an entry map. Storing an equal map again is a no-op.
    pub fn store(&mut self, entries: Entries) -> ContentHash {
        let hash = tree_hash(&entries);
        self.trees
            .entry(hash.clone())
            .or_insert_with(|| Arc::new(entries));
        hash
    }

    /// Shared handle to the map behind `hash`, if interned.
    pub fn get(&self, hash: &str) -> Option<Arc<Entries>> {
        self.trees.get(hash).cloned()
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.trees.contains_key(hash)
    }

    /// Distinct trees stored
    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}
