//! Key-level diff and 3-way merge
//!
//! Used by the in-memory reference adapter. Patches from two lineages are
//! computed against their common ancestor; edits to different keys merge
//! cleanly, identical edits to the same key auto-resolve, and anything
//! else on the same key is a conflict.

use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::types::Conflict;

/// Key/value state of one snapshot.
pub type Entries = BTreeMap<String, String>;

/// Edit of a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EntryOp {
    Insert {
        key: String,
        value: String,
    },
    Delete {
        key: String,
        old_value: String,
    },
    Update {
        key: String,
        old_value: String,
        new_value: String,
    },
}

impl EntryOp {
    pub fn key(&self) -> &str {
        match self {
            EntryOp::Insert { key, .. } => key,
            EntryOp::Delete { key, .. } => key,
            EntryOp::Update { key, .. } => key,
        }
    }

    /// Value of the key after the op.
    pub fn new_value(&self) -> Option<&str> {
        match self {
            EntryOp::Insert { value, .. } => Some(value),
            EntryOp::Delete { .. } => None,
            EntryOp::Update { new_value, .. } => Some(new_value),
        }
    }

    /// Value of the key before the op.
    pub fn old_value(&self) -> Option<&str> {
        match self {
            EntryOp::Insert { .. } => None,
            EntryOp::Delete { old_value, .. } => Some(old_value),
            EntryOp::Update { old_value, .. } => Some(old_value),
        }
    }

    /// Op turning `before` into `after` for `key`, if they differ.
    pub fn between(key: &str, before: Option<&str>, after: Option<&str>) -> Option<EntryOp> {
        let key = key.to_owned();
        match (before, after) {
            (None, Some(v)) => Some(EntryOp::Insert {
                key,
                value: v.to_owned(),
            }),
            (Some(o), None) => Some(EntryOp::Delete {
                key,
                old_value: o.to_owned(),
            }),
            (Some(o), Some(n)) if o != n => Some(EntryOp::Update {
                key,
                old_value: o.to_owned(),
                new_value: n.to_owned(),
            }),
            _ => None,
        }
    }
}

/// Ops that transform `old` into `new`, ordered by key.
pub fn diff_entries(old: &Entries, new: &Entries) -> Vec<EntryOp> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter_map(|k| {
            EntryOp::between(k, old.get(k).map(String::as_str), new.get(k).map(String::as_str))
        })
        .collect()
}

/// Apply ops in order.
pub fn apply_ops(entries: &mut Entries, ops: &[EntryOp]) {
    for op in ops {
        match op.new_value() {
            Some(v) => {
                entries.insert(op.key().to_owned(), v.to_owned());
            }
            None => {
                entries.remove(op.key());
            }
        }
    }
}

/// Automatic resolution for conflicting keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Keep the current branch's value.
    Ours,
    /// Take the merged-in value.
    Theirs,
}

impl FromStr for MergeStrategy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ours" => Ok(MergeStrategy::Ours),
            "theirs" => Ok(MergeStrategy::Theirs),
            other => Err(ProtocolError::unsupported(format!("merge strategy {other}"))),
        }
    }
}

/// One key both sides changed differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict {
    pub key: String,
    pub base: Option<String>,
    pub ours: Option<String>,
    pub theirs: Option<String>,
}

impl KeyConflict {
    pub fn to_conflict(&self) -> Conflict {
        Conflict::at_key(
            &self.key,
            self.base.as_deref(),
            self.ours.as_deref(),
            self.theirs.as_deref(),
        )
    }
}

/// Outcome of reconciling two entry maps against their base.
#[derive(Debug, Clone, Default)]
pub struct MergeResult {
    /// Ops to apply onto the base.
    pub merged_ops: Vec<EntryOp>,
    /// Keys that need resolution.
    pub conflicts: Vec<KeyConflict>,
}

impl MergeResult {
    /// No key was changed incompatibly on both sides.
    pub fn is_clean(&self) -> bool {
        self.conflicts.is_empty()
    }

    pub fn protocol_conflicts(&self) -> Vec<Conflict> {
        self.conflicts.iter().map(KeyConflict::to_conflict).collect()
    }

    /// All ops onto the base, with conflicts settled by `strategy`.
    pub fn resolve(mut self, strategy: MergeStrategy) -> Vec<EntryOp> {
        for c in std::mem::take(&mut self.conflicts) {
            let chosen = match strategy {
                MergeStrategy::Ours => c.ours.as_deref(),
                MergeStrategy::Theirs => c.theirs.as_deref(),
            };
            if let Some(op) = EntryOp::between(&c.key, c.base.as_deref(), chosen) {
                self.merged_ops.push(op);
            }
        }
        self.merged_ops
    }
}

/// Merge two patches made against the same base.
///
/// `patch_a` is ours, `patch_b` theirs. Edits to disjoint keys are
/// combined; identical edits to one key auto-resolve.
pub fn merge_patches(patch_a: &[EntryOp], patch_b: &[EntryOp]) -> MergeResult {
    let by_key_a: BTreeMap<&str, &EntryOp> = patch_a.iter().map(|op| (op.key(), op)).collect();
    let by_key_b: BTreeMap<&str, &EntryOp> = patch_b.iter().map(|op| (op.key(), op)).collect();

    let mut result = MergeResult::default();

    for op in patch_a {
        if !by_key_b.contains_key(op.key()) {
            result.merged_ops.push(op.clone());
        }
    }
    for op in patch_b {
        if !by_key_a.contains_key(op.key()) {
            result.merged_ops.push(op.clone());
        }
    }

    for (key, op_a) in &by_key_a {
        let Some(op_b) = by_key_b.get(key) else {
            continue;
        };
        if op_a.new_value() == op_b.new_value() {
            result.merged_ops.push((*op_a).clone());
        } else {
            result.conflicts.push(KeyConflict {
                key: (*key).to_owned(),
                base: op_a.old_value().map(str::to_owned),
                ours: op_a.new_value().map(str::to_owned),
                theirs: op_b.new_value().map(str::to_owned),
            });
        }
    }

    result
}

/// Three-way merge of whole states.
pub fn three_way(base: &Entries, ours: &Entries, theirs: &Entries) -> MergeResult {
    merge_patches(&diff_entries(base, ours), &diff_entries(base, theirs))
}
