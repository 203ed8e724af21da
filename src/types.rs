//! Cross-system value types
//!
//! Immutable values exchanged across the adapter boundary. Wire shapes use
//! kebab-case keys and `null` for absent optionals.

use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hlc::Hlc;

/// Opaque snapshot identifier in the backing engine's native format.
pub type SnapshotId = String;

/// Opaque value: conflict path segments, conflict sides, diff deltas.
pub type Opaque = Value;

// ── SnapshotRef ────────────────────────────────────────────────────────

/// Universal reference to a point-in-time snapshot.
///
/// Equality and hashing consider only `(system_id, snapshot_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotRef {
    pub system_id: String,
    pub snapshot_id: SnapshotId,
    #[serde(default)]
    pub parent_ids: BTreeSet<SnapshotId>,
    #[serde(default)]
    pub hlc: Option<Hlc>,
    #[serde(default)]
    pub content_hash: Option<String>,
}

impl SnapshotRef {
    pub fn new(system_id: impl Into<String>, snapshot_id: impl Into<SnapshotId>) -> Self {
        Self {
            system_id: system_id.into(),
            snapshot_id: snapshot_id.into(),
            parent_ids: BTreeSet::new(),
            hlc: None,
            content_hash: None,
        }
    }

    pub fn with_parents<I, S>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SnapshotId>,
    {
        self.parent_ids = parents.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_hlc(mut self, hlc: Hlc) -> Self {
        self.hlc = Some(hlc);
        self
    }

    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// No parents.
    pub fn is_root(&self) -> bool {
        self.parent_ids.is_empty()
    }

    /// Two or more parents.
    pub fn is_merge(&self) -> bool {
        self.parent_ids.len() >= 2
    }
}

impl PartialEq for SnapshotRef {
    fn eq(&self, other: &Self) -> bool {
        self.system_id == other.system_id && self.snapshot_id == other.snapshot_id
    }
}

impl Eq for SnapshotRef {}

impl Hash for SnapshotRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.system_id.hash(state);
        self.snapshot_id.hash(state);
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.system_id, self.snapshot_id)
    }
}

// ── Capabilities ───────────────────────────────────────────────────────

/// Optional protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Layer {
    Snapshot,
    Branch,
    Graph,
    Merge,
    Overlay,
    Watch,
}

impl Layer {
    pub const ALL: [Layer; 6] = [
        Layer::Snapshot,
        Layer::Branch,
        Layer::Graph,
        Layer::Merge,
        Layer::Overlay,
        Layer::Watch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Snapshot => "snapshotable",
            Layer::Branch => "branchable",
            Layer::Graph => "graphable",
            Layer::Merge => "mergeable",
            Layer::Overlay => "overlayable",
            Layer::Watch => "watchable",
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layers a system instance supports. Fixed per instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub snapshotable: bool,
    #[serde(default)]
    pub branchable: bool,
    #[serde(default)]
    pub graphable: bool,
    #[serde(default)]
    pub mergeable: bool,
    #[serde(default)]
    pub overlayable: bool,
    #[serde(default)]
    pub watchable: bool,
}

impl Capabilities {
    /// Every layer supported.
    pub const fn full() -> Self {
        Self {
            snapshotable: true,
            branchable: true,
            graphable: true,
            mergeable: true,
            overlayable: true,
            watchable: true,
        }
    }

    /// Only the foundational snapshot layer.
    pub const fn snapshot_only() -> Self {
        Self {
            snapshotable: true,
            branchable: false,
            graphable: false,
            mergeable: false,
            overlayable: false,
            watchable: false,
        }
    }

    pub fn supports(&self, layer: Layer) -> bool {
        match layer {
            Layer::Snapshot => self.snapshotable,
            Layer::Branch => self.branchable,
            Layer::Graph => self.graphable,
            Layer::Merge => self.mergeable,
            Layer::Overlay => self.overlayable,
            Layer::Watch => self.watchable,
        }
    }

    /// Copy with one layer switched on or off.
    pub fn with(mut self, layer: Layer, enabled: bool) -> Self {
        let bit = match layer {
            Layer::Snapshot => &mut self.snapshotable,
            Layer::Branch => &mut self.branchable,
            Layer::Graph => &mut self.graphable,
            Layer::Merge => &mut self.mergeable,
            Layer::Overlay => &mut self.overlayable,
            Layer::Watch => &mut self.watchable,
        };
        *bit = enabled;
        self
    }

    /// Supported layers in declaration order.
    pub fn layers(&self) -> Vec<Layer> {
        Layer::ALL
            .into_iter()
            .filter(|l| self.supports(*l))
            .collect()
    }
}

// ── Conflict ───────────────────────────────────────────────────────────

/// One location where a merge could not auto-resolve.
///
/// `path` addressing is system specific: an entity/attribute pair, a file
/// path, a dataset path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub path: Vec<Opaque>,
    #[serde(default)]
    pub base: Option<Opaque>,
    #[serde(default)]
    pub ours: Option<Opaque>,
    #[serde(default)]
    pub theirs: Option<Opaque>,
}

impl Conflict {
    /// Conflict on a single string-keyed location.
    pub fn at_key(
        key: &str,
        base: Option<&str>,
        ours: Option<&str>,
        theirs: Option<&str>,
    ) -> Self {
        let side = |v: Option<&str>| v.map(|s| Value::String(s.to_owned()));
        Self {
            path: vec![Value::String(key.to_owned())],
            base: side(base),
            ours: side(ours),
            theirs: side(theirs),
        }
    }
}

// ── SnapshotMeta ───────────────────────────────────────────────────────

/// Metadata returned by `snapshot_meta` and `commit_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SnapshotMeta {
    pub snapshot_id: SnapshotId,
    pub parent_ids: BTreeSet<SnapshotId>,
    pub author: String,
    #[serde(rename = "timestamp")]
    pub timestamp_ms: i64,
    pub message: String,
}

/// Full DAG returned by the optional `commit_graph` operation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitGraph {
    /// Snapshot ids, newest first.
    pub nodes: Vec<SnapshotId>,
    /// `(child, parent)` pairs.
    pub edges: Vec<(SnapshotId, SnapshotId)>,
    /// Branch name to head id.
    pub branches: Vec<(String, SnapshotId)>,
}
