//! Capability layers
//!
//! Six independently adoptable layers on top of [`SystemIdentity`]:
//!
//! | Layer | Trait | Capability bit |
//! |-------|-------|----------------|
//! | Snapshot | [`Snapshotable`] | `snapshotable` (required by all others) |
//! | Branch | [`Branchable`] | `branchable` |
//! | Graph | [`Graphable`] | `graphable` |
//! | Merge | [`Mergeable`] | `mergeable` |
//! | Overlay | [`Overlayable`] | `overlayable` |
//! | Watch | [`Watchable`] | `watchable` |
//!
//! An adapter implements only the traits for the layers it supports and
//! reports them through [`SystemIdentity::capabilities`]. [`System`] is the
//! dynamic query surface the conformance harness and polymorphic clients
//! use.
//!
//! Mutating operations take `&self`: a system handle is a shared reference
//! to engine state, so every clone of a handle observes every mutation.

use std::collections::BTreeSet;

use crate::error::{ProtocolError, Result};
use crate::overlay::{Overlay, OverlayMode};
use crate::types::{
    Capabilities, CommitGraph, Conflict, Layer, Opaque, SnapshotId, SnapshotMeta, SnapshotRef,
};
use crate::watch::{WatchCallback, WatchId, WatchOpts};

/// System identification and capability advertisement.
pub trait SystemIdentity {
    /// Unique per instance.
    fn system_id(&self) -> String;

    /// Engine tag: "git", "memory", "zfs", ...
    fn system_type(&self) -> String;

    fn capabilities(&self) -> Capabilities;
}

/// Point-in-time immutable snapshots.
pub trait Snapshotable {
    /// Read-only view returned by `as_of`.
    type View;

    /// Current snapshot.
    fn snapshot_id(&self) -> Result<SnapshotId>;

    /// Parents of `snap_id`, or of the current snapshot when `None`.
    fn parent_ids(&self, snap_id: Option<&str>) -> Result<BTreeSet<SnapshotId>>;

    /// View that stays valid regardless of later mutation.
    fn as_of(&self, snap_id: &str) -> Result<Self::View>;

    fn snapshot_meta(&self, snap_id: &str) -> Result<SnapshotMeta>;

    /// Wire reference for `snap_id` (current snapshot when `None`).
    fn snapshot_ref(&self, snap_id: Option<&str>) -> Result<SnapshotRef>
    where
        Self: SystemIdentity,
    {
        let id = match snap_id {
            Some(id) => id.to_owned(),
            None => self.snapshot_id()?,
        };
        let meta = self.snapshot_meta(&id)?;
        Ok(SnapshotRef::new(self.system_id(), id).with_parents(meta.parent_ids))
    }
}

/// Named mutable references to snapshots.
pub trait Branchable {
    fn branches(&self) -> Result<BTreeSet<String>>;

    fn current_branch(&self) -> Result<String>;

    /// Create `name` at `from_ref` (branch or snapshot) or the current
    /// state. Does not switch the current branch.
    fn branch(&self, name: &str, from_ref: Option<&str>) -> Result<()>;

    /// Fails with `InvalidState` when `name` is the current branch.
    fn delete_branch(&self, name: &str) -> Result<()>;

    /// Switch to `name`, positioned at its head.
    fn checkout(&self, name: &str) -> Result<()>;
}

/// History and DAG traversal.
pub trait Graphable {
    /// Newest first; `since` excludes that ref and its ancestors.
    fn history(&self, limit: Option<usize>, since: Option<&str>) -> Result<Vec<SnapshotId>>;

    /// Transitive parents, excluding `snap_id`.
    fn ancestors(&self, snap_id: &str) -> Result<BTreeSet<SnapshotId>>;

    /// Strict: a snapshot is not its own ancestor.
    fn is_ancestor(&self, a: &str, b: &str) -> Result<bool>;

    /// Most recent common ancestor; `NotFound` for disjoint histories.
    fn common_ancestor(&self, a: &str, b: &str) -> Result<SnapshotId>;

    fn commit_graph(&self) -> Result<CommitGraph> {
        Err(ProtocolError::unsupported("commit_graph"))
    }

    /// Native commit metadata. Use [`commit_info`] to get the
    /// snapshot-layer fallback.
    fn commit_info(&self, _snap_id: &str) -> Result<SnapshotMeta> {
        Err(ProtocolError::unsupported("commit_info"))
    }
}

/// Combining lineages.
pub trait Mergeable {
    /// Three-way merge `source` into the current branch. `strategy` is an
    /// adapter-specific string.
    fn merge(&self, source: &str, strategy: Option<&str>, message: Option<&str>) -> Result<()>;

    /// Non-mutating dry run; empty means merging `a` into `b` succeeds
    /// automatically.
    fn conflicts(&self, a: &str, b: &str) -> Result<Vec<Conflict>>;

    /// Inspection-only delta from `a` to `b`.
    fn diff(&self, a: &str, b: &str) -> Result<Opaque>;
}

/// Isolated live forks of this system. See [`crate::overlay`].
pub trait Overlayable {
    /// Isolated writes staged in an overlay.
    type Delta: Default;
    /// Parent state returned by `peek_parent`.
    type View;

    fn overlay(&self, mode: OverlayMode) -> Result<Overlay<Self::Delta>>;

    /// Gated overlays only; re-reads the parent head keeping local writes.
    fn advance(&self, overlay: &mut Overlay<Self::Delta>) -> Result<()>;

    /// Parent state at the overlay's observation point.
    fn peek_parent(&self, overlay: &Overlay<Self::Delta>) -> Result<Self::View>;

    fn base_ref(&self, overlay: &Overlay<Self::Delta>) -> Result<SnapshotRef>;

    fn overlay_writes(&self, overlay: &Overlay<Self::Delta>) -> Result<Self::Delta>;

    /// Push local writes into the parent. Terminal on success.
    fn merge_down(&self, overlay: &mut Overlay<Self::Delta>) -> Result<()>;

    /// Abandon local writes. Terminal; the parent is untouched.
    fn discard(&self, overlay: &mut Overlay<Self::Delta>) -> Result<()>;
}

/// State change notification.
pub trait Watchable {
    fn watch(&self, callback: WatchCallback, opts: WatchOpts) -> Result<WatchId>;

    fn unwatch(&self, watch_id: &WatchId) -> Result<()>;
}

/// Dynamic capability query over a snapshotable system.
///
/// The `as_*` accessors expose the layer implementations; the matching
/// `require_*` methods also honour the capability bit and report
/// `Unsupported` when either is missing.
pub trait System: SystemIdentity + Snapshotable {
    fn as_branchable(&self) -> Option<&dyn Branchable> {
        None
    }

    fn as_graphable(&self) -> Option<&dyn Graphable> {
        None
    }

    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        None
    }

    fn as_watchable(&self) -> Option<&dyn Watchable> {
        None
    }

    fn require_branchable(&self) -> Result<&dyn Branchable> {
        gated(self.capabilities(), Layer::Branch, self.as_branchable())
    }

    fn require_graphable(&self) -> Result<&dyn Graphable> {
        gated(self.capabilities(), Layer::Graph, self.as_graphable())
    }

    fn require_mergeable(&self) -> Result<&dyn Mergeable> {
        gated(self.capabilities(), Layer::Merge, self.as_mergeable())
    }

    fn require_watchable(&self) -> Result<&dyn Watchable> {
        gated(self.capabilities(), Layer::Watch, self.as_watchable())
    }
}

fn gated<T: ?Sized>(caps: Capabilities, layer: Layer, imp: Option<&T>) -> Result<&T> {
    require_layer(&caps, layer)?;
    imp.ok_or_else(|| ProtocolError::unsupported(format!("{layer} advertised but not implemented")))
}

/// `Unsupported` unless `caps` has the bit for `layer`.
pub fn require_layer(caps: &Capabilities, layer: Layer) -> Result<()> {
    if caps.supports(layer) {
        Ok(())
    } else {
        Err(ProtocolError::unsupported(layer.as_str()))
    }
}

/// Commit metadata with the one sanctioned cross-layer fallback.
///
/// Routes through the graph layer's native `commit_info`; if that is
/// unsupported and the same instance is snapshotable, answers with
/// `snapshot_meta`. Otherwise `Unsupported`.
pub fn commit_info<S: System + ?Sized>(system: &S, snap_id: &str) -> Result<SnapshotMeta> {
    let graph = system.require_graphable()?;
    match graph.commit_info(snap_id) {
        Err(err) if err.is_unsupported() && system.capabilities().snapshotable => {
            tracing::debug!(snap_id, "commit_info falling back to snapshot_meta");
            system.snapshot_meta(snap_id)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Snapshot + graph layers only, with a switchable snapshot bit.
    struct GraphOnly {
        snapshot_bit: bool,
    }

    impl SystemIdentity for GraphOnly {
        fn system_id(&self) -> String {
            "graph-only:1".into()
        }
        fn system_type(&self) -> String {
            "graph-only".into()
        }
        fn capabilities(&self) -> Capabilities {
            Capabilities::snapshot_only()
                .with(Layer::Snapshot, self.snapshot_bit)
                .with(Layer::Graph, true)
                .with(Layer::Merge, true)
        }
    }

    impl Snapshotable for GraphOnly {
        type View = ();
        fn snapshot_id(&self) -> Result<SnapshotId> {
            Ok("s1".into())
        }
        fn parent_ids(&self, _snap_id: Option<&str>) -> Result<BTreeSet<SnapshotId>> {
            Ok(BTreeSet::new())
        }
        fn as_of(&self, _snap_id: &str) -> Result<()> {
            Ok(())
        }
        fn snapshot_meta(&self, snap_id: &str) -> Result<SnapshotMeta> {
            Ok(SnapshotMeta {
                snapshot_id: snap_id.into(),
                parent_ids: BTreeSet::new(),
                author: "graph-only".into(),
                timestamp_ms: 0,
                message: "root".into(),
            })
        }
    }

    impl Graphable for GraphOnly {
        fn history(&self, _: Option<usize>, _: Option<&str>) -> Result<Vec<SnapshotId>> {
            Ok(vec!["s1".into()])
        }
        fn ancestors(&self, _: &str) -> Result<BTreeSet<SnapshotId>> {
            Ok(BTreeSet::new())
        }
        fn is_ancestor(&self, _: &str, _: &str) -> Result<bool> {
            Ok(false)
        }
        fn common_ancestor(&self, a: &str, _: &str) -> Result<SnapshotId> {
            Ok(a.into())
        }
    }

    impl System for GraphOnly {
        fn as_graphable(&self) -> Option<&dyn Graphable> {
            Some(self)
        }
    }

    #[test]
    fn test_commit_info_falls_back_to_snapshot_meta() {
        let sys = GraphOnly { snapshot_bit: true };
        let meta = commit_info(&sys, "s1").unwrap();
        assert_eq!(meta.message, "root");
    }

    #[test]
    fn test_commit_info_without_snapshot_layer_is_unsupported() {
        let sys = GraphOnly {
            snapshot_bit: false,
        };
        assert!(commit_info(&sys, "s1").unwrap_err().is_unsupported());
    }

    #[test]
    fn test_commit_graph_defaults_to_unsupported() {
        let sys = GraphOnly { snapshot_bit: true };
        assert!(sys.commit_graph().unwrap_err().is_unsupported());
    }

    #[test]
    fn test_cleared_bit_is_unsupported() {
        let sys = GraphOnly { snapshot_bit: true };
        assert!(matches!(sys.require_branchable(), Err(e) if e.is_unsupported()));
        assert!(sys.require_graphable().is_ok());
    }

    #[test]
    fn test_advertised_but_missing_layer_is_unsupported() {
        let sys = GraphOnly { snapshot_bit: true };
        let Err(err) = sys.require_mergeable() else {
            panic!("mergeable layer should be unavailable");
        };
        assert!(err.to_string().contains("mergeable advertised but not implemented"));
    }

    #[test]
    fn test_default_snapshot_ref_uses_meta() {
        let sys = GraphOnly { snapshot_bit: true };
        let r = sys.snapshot_ref(None).unwrap();
        assert_eq!(r.system_id, "graph-only:1");
        assert_eq!(r.snapshot_id, "s1");
        assert!(r.is_root());
    }
}
