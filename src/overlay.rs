//! Overlay state machine
//!
//! An overlay is an isolated, mutable fork of a live parent system. Its
//! consistency mode is fixed at creation:
//!
//! | Mode | Observation point |
//! |------|-------------------|
//! | `Frozen` | parent snapshot pinned at creation |
//! | `Following` | parent's current head at call time |
//! | `Gated` | parent snapshot at creation or last `advance` |
//!
//! Lifecycle: `Active` until `merge_down` (writes pushed to the parent) or
//! `discard` (writes dropped). Both are terminal: every later operation
//! fails with `InvalidState`.
//!
//! The creator owns the [`Overlay`]. The parent keeps an
//! [`OverlayRegistry`] of bookkeeping entries; the overlay holds only a
//! `Weak` link back to it and deregisters on terminal transition or drop.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};
use crate::hlc::Hlc;
use crate::types::{SnapshotId, SnapshotRef};

/// Consistency mode, fixed for the overlay's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayMode {
    Frozen,
    Following,
    #[default]
    Gated,
}

impl OverlayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverlayMode::Frozen => "frozen",
            OverlayMode::Following => "following",
            OverlayMode::Gated => "gated",
        }
    }
}

impl fmt::Display for OverlayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OverlayMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "frozen" => Ok(OverlayMode::Frozen),
            "following" => Ok(OverlayMode::Following),
            "gated" => Ok(OverlayMode::Gated),
            other => Err(ProtocolError::unsupported(format!("overlay mode {other}"))),
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OverlayStatus {
    Active,
    MergedDown,
    Discarded,
}

impl fmt::Display for OverlayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OverlayStatus::Active => "active",
            OverlayStatus::MergedDown => "merged down",
            OverlayStatus::Discarded => "discarded",
        })
    }
}

// ── Registry ───────────────────────────────────────────────────────────

/// Parent-side bookkeeping for one live overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayEntry {
    pub overlay_id: String,
    pub mode: OverlayMode,
    pub base_snapshot: SnapshotId,
    pub created_at: Hlc,
}

type Entries = Mutex<BTreeMap<String, OverlayEntry>>;

/// Registry of live overlays, owned by the parent system.
#[derive(Debug, Clone, Default)]
pub struct OverlayRegistry {
    entries: Arc<Entries>,
}

impl OverlayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register an overlay forked at `base`.
    pub fn open<D: Default>(&self, mode: OverlayMode, base: SnapshotRef) -> Overlay<D> {
        let overlay_id = uuid::Uuid::new_v4().to_string();
        let created_at = Hlc::now();
        self.entries.lock().insert(
            overlay_id.clone(),
            OverlayEntry {
                overlay_id: overlay_id.clone(),
                mode,
                base_snapshot: base.snapshot_id.clone(),
                created_at,
            },
        );
        tracing::debug!(overlay_id = %overlay_id, mode = %mode, base = %base, "overlay opened");

        Overlay {
            overlay_id,
            parent: Arc::downgrade(&self.entries),
            mode,
            base_snapshot: base,
            local_writes: D::default(),
            created_at,
            status: OverlayStatus::Active,
        }
    }

    /// Snapshot of live entries, ordered by id.
    pub fn active(&self) -> Vec<OverlayEntry> {
        self.entries.lock().values().cloned().collect()
    }

    pub fn get(&self, overlay_id: &str) -> Option<OverlayEntry> {
        self.entries.lock().get(overlay_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// True if `overlay` was opened through this registry.
    pub fn owns<D>(&self, overlay: &Overlay<D>) -> bool {
        std::ptr::eq(overlay.parent.as_ptr(), Arc::as_ptr(&self.entries))
    }
}

// ── Overlay ────────────────────────────────────────────────────────────

/// Live fork of a parent system. `D` is the adapter's write delta.
#[derive(Debug)]
pub struct Overlay<D> {
    overlay_id: String,
    parent: Weak<Entries>,
    mode: OverlayMode,
    base_snapshot: SnapshotRef,
    local_writes: D,
    created_at: Hlc,
    status: OverlayStatus,
}

/// Wire shape of an overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct OverlaySummary {
    pub overlay_id: String,
    pub mode: OverlayMode,
    pub base_snapshot: SnapshotRef,
    pub created_at: Hlc,
}

impl<D> Overlay<D> {
    pub fn id(&self) -> &str {
        &self.overlay_id
    }

    pub fn mode(&self) -> OverlayMode {
        self.mode
    }

    pub fn status(&self) -> OverlayStatus {
        self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status != OverlayStatus::Active
    }

    /// Snapshot the overlay forked from (or last advanced to).
    pub fn base_snapshot(&self) -> &SnapshotRef {
        &self.base_snapshot
    }

    pub fn local_writes(&self) -> &D {
        &self.local_writes
    }

    pub fn created_at(&self) -> Hlc {
        self.created_at
    }

    /// `InvalidState` once merged down or discarded.
    pub fn ensure_active(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(ProtocolError::invalid_state(format!(
                "overlay {} is {}",
                self.overlay_id, self.status
            )));
        }
        Ok(())
    }

    /// Parent snapshot the overlay currently observes. `current_head` is
    /// consulted only in `Following` mode.
    pub fn observation_point<F>(&self, current_head: F) -> Result<SnapshotRef>
    where
        F: FnOnce() -> Result<SnapshotRef>,
    {
        self.ensure_active()?;
        match self.mode {
            OverlayMode::Following => current_head(),
            OverlayMode::Frozen | OverlayMode::Gated => Ok(self.base_snapshot.clone()),
        }
    }

    /// Move a gated overlay's base to `head`, keeping local writes.
    pub fn advance_to(&mut self, head: SnapshotRef) -> Result<()> {
        self.ensure_active()?;
        if self.mode != OverlayMode::Gated {
            return Err(ProtocolError::invalid_state(format!(
                "advance requires a gated overlay, {} is {}",
                self.overlay_id, self.mode
            )));
        }
        if let Some(entries) = self.parent.upgrade() {
            if let Some(entry) = entries.lock().get_mut(&self.overlay_id) {
                entry.base_snapshot = head.snapshot_id.clone();
            }
        }
        tracing::debug!(overlay_id = %self.overlay_id, base = %head, "overlay advanced");
        self.base_snapshot = head;
        Ok(())
    }

    /// The overlay's own write path.
    pub fn stage<R, F>(&mut self, write: F) -> Result<R>
    where
        F: FnOnce(&mut D) -> R,
    {
        self.ensure_active()?;
        Ok(write(&mut self.local_writes))
    }

    /// Transition to `MergedDown` after the adapter applied the writes.
    pub fn mark_merged(&mut self) -> Result<()>
    where
        D: Default,
    {
        self.ensure_active()?;
        self.local_writes = D::default();
        self.status = OverlayStatus::MergedDown;
        self.deregister();
        tracing::info!(overlay_id = %self.overlay_id, "overlay merged down");
        Ok(())
    }

    /// Transition to `Discarded`, dropping local writes.
    pub fn abandon(&mut self) -> Result<()>
    where
        D: Default,
    {
        self.ensure_active()?;
        self.local_writes = D::default();
        self.status = OverlayStatus::Discarded;
        self.deregister();
        tracing::info!(overlay_id = %self.overlay_id, "overlay discarded");
        Ok(())
    }

    pub fn summary(&self) -> OverlaySummary {
        OverlaySummary {
            overlay_id: self.overlay_id.clone(),
            mode: self.mode,
            base_snapshot: self.base_snapshot.clone(),
            created_at: self.created_at,
        }
    }

    fn deregister(&self) {
        if let Some(entries) = self.parent.upgrade() {
            entries.lock().remove(&self.overlay_id);
        }
    }
}

impl<D> Drop for Overlay<D> {
    fn drop(&mut self) {
        self.deregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    type Writes = BTreeMap<String, String>;

    fn base(id: &str) -> SnapshotRef {
        SnapshotRef::new("parent", id)
    }

    #[test]
    fn test_open_registers_entry() {
        let registry = OverlayRegistry::new();
        let overlay: Overlay<Writes> = registry.open(OverlayMode::Gated, base("s1"));
        assert_eq!(registry.len(), 1);
        let entry = registry.get(overlay.id()).unwrap();
        assert_eq!(entry.base_snapshot, "s1");
        assert_eq!(entry.mode, OverlayMode::Gated);
        assert!(registry.owns(&overlay));
        assert!(overlay.local_writes().is_empty());
    }

    #[test]
    fn test_frozen_observes_pinned_base() {
        let registry = OverlayRegistry::new();
        let overlay: Overlay<Writes> = registry.open(OverlayMode::Frozen, base("s1"));
        let seen = overlay.observation_point(|| Ok(base("s9"))).unwrap();
        assert_eq!(seen.snapshot_id, "s1");
    }

    #[test]
    fn test_following_observes_current_head() {
        let registry = OverlayRegistry::new();
        let overlay: Overlay<Writes> = registry.open(OverlayMode::Following, base("s1"));
        let seen = overlay.observation_point(|| Ok(base("s9"))).unwrap();
        assert_eq!(seen.snapshot_id, "s9");
    }

    #[test]
    fn test_advance_only_in_gated_mode() {
        let registry = OverlayRegistry::new();
        let mut frozen: Overlay<Writes> = registry.open(OverlayMode::Frozen, base("s1"));
        assert!(matches!(
            frozen.advance_to(base("s2")),
            Err(ProtocolError::InvalidState { .. })
        ));

        let mut gated: Overlay<Writes> = registry.open(OverlayMode::Gated, base("s1"));
        gated
            .stage(|w| w.insert("k".into(), "v".into()))
            .unwrap();
        gated.advance_to(base("s2")).unwrap();
        assert_eq!(gated.base_snapshot().snapshot_id, "s2");
        assert_eq!(gated.local_writes().get("k").map(String::as_str), Some("v"));
        assert_eq!(registry.get(gated.id()).unwrap().base_snapshot, "s2");
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let registry = OverlayRegistry::new();
        let mut overlay: Overlay<Writes> = registry.open(OverlayMode::Gated, base("s1"));
        overlay.mark_merged().unwrap();
        assert_eq!(overlay.status(), OverlayStatus::MergedDown);
        assert!(registry.is_empty());

        assert!(overlay.ensure_active().is_err());
        assert!(overlay.stage(|_| ()).is_err());
        assert!(overlay.advance_to(base("s2")).is_err());
        assert!(overlay.observation_point(|| Ok(base("s2"))).is_err());
        assert!(overlay.abandon().is_err());
        assert!(overlay.mark_merged().is_err());
    }

    #[test]
    fn test_abandon_drops_writes() {
        let registry = OverlayRegistry::new();
        let mut overlay: Overlay<Writes> = registry.open(OverlayMode::Frozen, base("s1"));
        overlay.stage(|w| w.insert("a".into(), "1".into())).unwrap();
        overlay.abandon().unwrap();
        assert_eq!(overlay.status(), OverlayStatus::Discarded);
        assert!(overlay.local_writes().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = OverlayRegistry::new();
        {
            let _overlay: Overlay<Writes> = registry.open(OverlayMode::Frozen, base("s1"));
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overlay_outlives_parent_registry() {
        let registry = OverlayRegistry::new();
        let mut overlay: Overlay<Writes> = registry.open(OverlayMode::Gated, base("s1"));
        drop(registry);
        overlay.advance_to(base("s2")).unwrap();
        overlay.abandon().unwrap();
    }

    #[test]
    fn test_foreign_registry_does_not_own() {
        let a = OverlayRegistry::new();
        let b = OverlayRegistry::new();
        let overlay: Overlay<Writes> = a.open(OverlayMode::Gated, base("s1"));
        assert!(!b.owns(&overlay));
    }

    #[test]
    fn test_mode_parsing_and_wire_shape() {
        assert_eq!("following".parse::<OverlayMode>().unwrap(), OverlayMode::Following);
        assert!("sideways".parse::<OverlayMode>().unwrap_err().is_unsupported());

        let registry = OverlayRegistry::new();
        let overlay: Overlay<Writes> = registry.open(OverlayMode::Frozen, base("s1"));
        let json = serde_json::to_value(overlay.summary()).unwrap();
        assert_eq!(json["mode"], "frozen");
        assert_eq!(json["base-snapshot"]["snapshot-id"], "s1");
        assert_eq!(json["overlay-id"], overlay.id());
        assert!(json["created-at"]["physical"].is_i64());
    }
}
