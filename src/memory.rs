//! In-memory reference adapter
//!
//! A key/value engine that implements every capability layer. Commits are
//! immutable trees in a content-addressed [`SnapshotStore`]; branches are
//! movable pointers; uncommitted writes are staged on the handle's shared
//! state and folded into the next commit.
//!
//! [`MemorySystem`] is a cheap handle: clones share one repository, one
//! overlay registry and one watcher set. [`MemoryFixture`] wires it into
//! the conformance harness.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::ProtocolConfig;
use crate::error::{ProtocolError, Result};
use crate::graph::{self, CommitDag};
use crate::harness::Fixture;
use crate::hlc::{Hlc, HlcClock};
use crate::merge::{apply_ops, diff_entries, three_way, Entries, MergeResult, MergeStrategy};
use crate::overlay::{Overlay, OverlayMode, OverlayRegistry};
use crate::protocol::{
    require_layer, Branchable, Graphable, Mergeable, Overlayable, Snapshotable, System,
    SystemIdentity, Watchable,
};
use crate::store::{commit_hash, ContentHash, SnapshotStore};
use crate::types::{
    Capabilities, CommitGraph, Conflict, Layer, Opaque, SnapshotId, SnapshotMeta, SnapshotRef,
};
use crate::watch::{WatchCallback, WatchEvent, WatchEventKind, WatchId, WatchOpts, WatchRegistry};

/// Pending changes: `Some` sets a key, `None` deletes it.
pub type EntryDelta = BTreeMap<String, Option<String>>;

fn apply_delta(entries: &mut Entries, delta: &EntryDelta) {
    for (key, value) in delta {
        match value {
            Some(v) => {
                entries.insert(key.clone(), v.clone());
            }
            None => {
                entries.remove(key);
            }
        }
    }
}

/// A commit in the history DAG
#[derive(Debug, Clone)]
pub struct Commit {
    pub id: SnapshotId,
    /// First parent is the branch the commit was made on.
    pub parents: Vec<SnapshotId>,
    pub tree: ContentHash,
    pub message: String,
    pub author: String,
    pub hlc: Hlc,
}

/// Read-only view of one snapshot.
#[derive(Debug, Clone)]
pub struct MemoryView {
    snapshot: SnapshotRef,
    entries: Arc<Entries>,
}

impl MemoryView {
    pub fn snapshot(&self) -> &SnapshotRef {
        &self.snapshot
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ── Repository ─────────────────────────────────────────────────────────

/// Branches, commits and staged writes behind one lock.
#[derive(Debug)]
struct Repository {
    store: SnapshotStore,
    commits: BTreeMap<SnapshotId, Commit>,
    branches: BTreeMap<String, SnapshotId>,
    current_branch: String,
    staged: EntryDelta,
}

impl Repository {
    /// Repository with one empty root commit on `default_branch`.
    fn new(default_branch: &str, author: &str, hlc: Hlc) -> Self {
        let mut repo = Self {
            store: SnapshotStore::new(),
            commits: BTreeMap::new(),
            branches: BTreeMap::new(),
            current_branch: default_branch.to_owned(),
            staged: EntryDelta::new(),
        };
        repo.record(Entries::new(), Vec::new(), "initial commit", author, hlc);
        repo
    }

    fn head_hash(&self) -> Result<SnapshotId> {
        self.branches
            .get(&self.current_branch)
            .cloned()
            .ok_or_else(|| ProtocolError::not_found(format!("branch {}", self.current_branch)))
    }

    fn get_commit(&self, id: &str) -> Result<&Commit> {
        self.commits
            .get(id)
            .ok_or_else(|| ProtocolError::not_found(id))
    }

    /// Branch name or snapshot id to snapshot id.
    fn resolve(&self, reference: &str) -> Result<SnapshotId> {
        if let Some(head) = self.branches.get(reference) {
            return Ok(head.clone());
        }
        self.get_commit(reference).map(|c| c.id.clone())
    }

    fn tree_of(&self, id: &str) -> Result<Arc<Entries>> {
        let commit = self.get_commit(id)?;
        self.store
            .get(&commit.tree)
            .ok_or_else(|| ProtocolError::not_found(format!("tree {}", commit.tree)))
    }

    /// Head tree with staged writes folded in.
    fn working_tree(&self) -> Result<Entries> {
        let mut entries = (*self.tree_of(&self.head_hash()?)?).clone();
        apply_delta(&mut entries, &self.staged);
        Ok(entries)
    }

    /// Store `entries` as a new commit and advance the current branch.
    fn record(
        &mut self,
        entries: Entries,
        parents: Vec<SnapshotId>,
        message: &str,
        author: &str,
        hlc: Hlc,
    ) -> SnapshotId {
        let tree = self.store.store(entries);
        let id = commit_hash(&tree, &parents, hlc, message);
        self.commits.insert(
            id.clone(),
            Commit {
                id: id.clone(),
                parents,
                tree,
                message: message.to_owned(),
                author: author.to_owned(),
                hlc,
            },
        );
        self.branches.insert(self.current_branch.clone(), id.clone());
        id
    }

    /// Three-way merge of two commits' trees against their merge base.
    /// Disjoint histories merge against an empty base.
    fn merge_trees(&self, ours: &str, theirs: &str) -> Result<(Arc<Entries>, MergeResult)> {
        let base = match graph::common_ancestor(self, ours, theirs) {
            Ok(base) => self.tree_of(&base)?,
            Err(ProtocolError::NotFound { .. }) => Arc::new(Entries::new()),
            Err(e) => return Err(e),
        };
        let ours_tree = self.tree_of(ours)?;
        let theirs_tree = self.tree_of(theirs)?;
        let result = three_way(&base, &ours_tree, &theirs_tree);
        Ok((base, result))
    }

    fn meta(&self, id: &str) -> Result<SnapshotMeta> {
        let commit = self.get_commit(id)?;
        Ok(SnapshotMeta {
            snapshot_id: commit.id.clone(),
            parent_ids: commit.parents.iter().cloned().collect(),
            author: commit.author.clone(),
            timestamp_ms: commit.hlc.physical,
            message: commit.message.clone(),
        })
    }
}

impl CommitDag for Repository {
    type Key = Hlc;

    fn parents_of(&self, id: &str) -> Option<&[SnapshotId]> {
        self.commits.get(id).map(|c| c.parents.as_slice())
    }

    fn recency(&self, id: &str) -> Hlc {
        self.commits.get(id).map_or(Hlc::new(0, 0), |c| c.hlc)
    }
}

// ── MemorySystem ───────────────────────────────────────────────────────

/// Handle to an in-memory copy-on-write system.
#[derive(Debug, Clone)]
pub struct MemorySystem {
    system_id: Arc<str>,
    capabilities: Capabilities,
    config: Arc<ProtocolConfig>,
    repo: Arc<RwLock<Repository>>,
    clock: Arc<HlcClock>,
    overlays: OverlayRegistry,
    watchers: WatchRegistry,
}

impl Default for MemorySystem {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySystem {
    pub fn new() -> Self {
        Self::with_config(ProtocolConfig::default())
    }

    pub fn with_config(config: ProtocolConfig) -> Self {
        let clock = HlcClock::new();
        let repo = Repository::new(&config.default_branch, &config.author, clock.tick());
        let system_id = format!("memory:{}", uuid::Uuid::new_v4());
        tracing::debug!(system_id = %system_id, branch = %config.default_branch, "memory system created");
        Self {
            system_id: system_id.into(),
            capabilities: Capabilities::full(),
            config: Arc::new(config),
            repo: Arc::new(RwLock::new(repo)),
            clock: Arc::new(clock),
            overlays: OverlayRegistry::new(),
            watchers: WatchRegistry::new(),
        }
    }

    /// Advertise only `capabilities`. Operations of a cleared layer fail
    /// `Unsupported`.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn overlays(&self) -> &OverlayRegistry {
        &self.overlays
    }

    fn gate(&self, layer: Layer) -> Result<()> {
        require_layer(&self.capabilities, layer)
    }

    // ── working state ──

    /// Stage `key = value` for the next commit.
    pub fn write(&self, key: &str, value: &str) {
        self.repo
            .write()
            .staged
            .insert(key.to_owned(), Some(value.to_owned()));
    }

    /// Stage removal of `key`. `NotFound` if the working state lacks it.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut repo = self.repo.write();
        if !repo.working_tree()?.contains_key(key) {
            return Err(ProtocolError::not_found(format!("entry {key}")));
        }
        repo.staged.insert(key.to_owned(), None);
        Ok(())
    }

    /// Working value of `key`: staged first, then the head snapshot.
    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let repo = self.repo.read();
        if let Some(staged) = repo.staged.get(key) {
            return Ok(staged.clone());
        }
        Ok(repo.tree_of(&repo.head_hash()?)?.get(key).cloned())
    }

    /// Number of entries in the working state.
    pub fn count(&self) -> Result<usize> {
        Ok(self.repo.read().working_tree()?.len())
    }

    pub fn has_staged_changes(&self) -> bool {
        !self.repo.read().staged.is_empty()
    }

    /// Commit staged writes on the current branch.
    pub fn commit(&self, message: &str) -> Result<SnapshotId> {
        let (id, branch) = {
            let mut repo = self.repo.write();
            let entries = repo.working_tree()?;
            let parent = repo.head_hash()?;
            let id = repo.record(entries, vec![parent], message, &self.config.author, self.clock.tick());
            repo.staged.clear();
            let branch = repo.current_branch.clone();
            self.watchers.enqueue(WatchEvent::new(
                WatchEventKind::Commit,
                Some(id.clone()),
                Some(branch.clone()),
            ));
            (id, branch)
        };
        self.watchers.flush();
        tracing::info!(system_id = %self.system_id, snapshot_id = %id, branch = %branch, "commit");
        Ok(id)
    }

    fn view(&self, repo: &Repository, id: &str) -> Result<MemoryView> {
        Ok(MemoryView {
            snapshot: self.ref_for(repo, id)?,
            entries: repo.tree_of(id)?,
        })
    }

    fn ref_for(&self, repo: &Repository, id: &str) -> Result<SnapshotRef> {
        let commit = repo.get_commit(id)?;
        Ok(SnapshotRef::new(&*self.system_id, commit.id.clone())
            .with_parents(commit.parents.iter().cloned())
            .with_hlc(commit.hlc)
            .with_content_hash(commit.tree.clone()))
    }

    fn head_ref(&self) -> Result<SnapshotRef> {
        let repo = self.repo.read();
        self.ref_for(&repo, &repo.head_hash()?)
    }

    // ── overlay write path ──

    /// Open an overlay in the configured default mode.
    pub fn default_overlay(&self) -> Result<Overlay<EntryDelta>> {
        self.overlay(self.config.overlay.default_mode)
    }

    pub fn overlay_write(&self, overlay: &mut Overlay<EntryDelta>, key: &str, value: &str) -> Result<()> {
        self.ensure_owned(overlay)?;
        overlay.stage(|w| {
            w.insert(key.to_owned(), Some(value.to_owned()));
        })
    }

    pub fn overlay_delete(&self, overlay: &mut Overlay<EntryDelta>, key: &str) -> Result<()> {
        self.ensure_owned(overlay)?;
        overlay.stage(|w| {
            w.insert(key.to_owned(), None);
        })
    }

    /// Overlay-local value if written, else the parent's value at the
    /// overlay's observation point.
    pub fn overlay_read(&self, overlay: &Overlay<EntryDelta>, key: &str) -> Result<Option<String>> {
        self.ensure_owned(overlay)?;
        overlay.ensure_active()?;
        if let Some(local) = overlay.local_writes().get(key) {
            return Ok(local.clone());
        }
        Ok(self.peek_parent(overlay)?.get(key).map(str::to_owned))
    }

    fn ensure_owned(&self, overlay: &Overlay<EntryDelta>) -> Result<()> {
        if self.overlays.owns(overlay) {
            Ok(())
        } else {
            Err(ProtocolError::invalid_state(format!(
                "overlay {} belongs to another system",
                overlay.id()
            )))
        }
    }

    /// Watch with the configured default options.
    pub fn watch_default(&self, callback: WatchCallback) -> Result<WatchId> {
        self.watch(callback, WatchOpts::from(&self.config.watch))
    }
}

// ── Layers ─────────────────────────────────────────────────────────────

impl SystemIdentity for MemorySystem {
    fn system_id(&self) -> String {
        self.system_id.to_string()
    }

    fn system_type(&self) -> String {
        "memory".to_string()
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

impl Snapshotable for MemorySystem {
    type View = MemoryView;

    fn snapshot_id(&self) -> Result<SnapshotId> {
        self.repo.read().head_hash()
    }

    fn parent_ids(&self, snap_id: Option<&str>) -> Result<BTreeSet<SnapshotId>> {
        let repo = self.repo.read();
        let id = match snap_id {
            Some(id) => repo.resolve(id)?,
            None => repo.head_hash()?,
        };
        Ok(repo.get_commit(&id)?.parents.iter().cloned().collect())
    }

    fn as_of(&self, snap_id: &str) -> Result<MemoryView> {
        let repo = self.repo.read();
        let id = repo.resolve(snap_id)?;
        self.view(&repo, &id)
    }

    fn snapshot_meta(&self, snap_id: &str) -> Result<SnapshotMeta> {
        let repo = self.repo.read();
        repo.meta(&repo.resolve(snap_id)?)
    }

    fn snapshot_ref(&self, snap_id: Option<&str>) -> Result<SnapshotRef> {
        let repo = self.repo.read();
        let id = match snap_id {
            Some(id) => repo.resolve(id)?,
            None => repo.head_hash()?,
        };
        self.ref_for(&repo, &id)
    }
}

impl Branchable for MemorySystem {
    fn branches(&self) -> Result<BTreeSet<String>> {
        self.gate(Layer::Branch)?;
        Ok(self.repo.read().branches.keys().cloned().collect())
    }

    fn current_branch(&self) -> Result<String> {
        self.gate(Layer::Branch)?;
        Ok(self.repo.read().current_branch.clone())
    }

    fn branch(&self, name: &str, from_ref: Option<&str>) -> Result<()> {
        self.gate(Layer::Branch)?;
        if name.is_empty() {
            return Err(ProtocolError::invalid_state("branch name is empty"));
        }
        let head = {
            let mut repo = self.repo.write();
            if repo.branches.contains_key(name) {
                return Err(ProtocolError::invalid_state(format!("branch {name} already exists")));
            }
            let head = match from_ref {
                Some(reference) => repo.resolve(reference)?,
                None => repo.head_hash()?,
            };
            repo.branches.insert(name.to_owned(), head.clone());
            self.watchers.enqueue(WatchEvent::new(
                WatchEventKind::BranchCreated,
                Some(head.clone()),
                Some(name.to_owned()),
            ));
            head
        };
        self.watchers.flush();
        tracing::info!(system_id = %self.system_id, branch = name, head = %head, "branch created");
        Ok(())
    }

    fn delete_branch(&self, name: &str) -> Result<()> {
        self.gate(Layer::Branch)?;
        {
            let mut repo = self.repo.write();
            if repo.current_branch == name {
                return Err(ProtocolError::invalid_state(format!(
                    "cannot delete the current branch {name}"
                )));
            }
            let head = repo
                .branches
                .remove(name)
                .ok_or_else(|| ProtocolError::not_found(format!("branch {name}")))?;
            self.watchers.enqueue(WatchEvent::new(
                WatchEventKind::BranchDeleted,
                Some(head),
                Some(name.to_owned()),
            ));
        }
        self.watchers.flush();
        tracing::info!(system_id = %self.system_id, branch = name, "branch deleted");
        Ok(())
    }

    fn checkout(&self, name: &str) -> Result<()> {
        self.gate(Layer::Branch)?;
        {
            let mut repo = self.repo.write();
            let head = repo
                .branches
                .get(name)
                .cloned()
                .ok_or_else(|| ProtocolError::not_found(format!("branch {name}")))?;
            repo.current_branch = name.to_owned();
            self.watchers.enqueue(WatchEvent::new(
                WatchEventKind::Checkout,
                Some(head),
                Some(name.to_owned()),
            ));
        }
        self.watchers.flush();
        tracing::debug!(system_id = %self.system_id, branch = name, "checkout");
        Ok(())
    }
}

impl Graphable for MemorySystem {
    fn history(&self, limit: Option<usize>, since: Option<&str>) -> Result<Vec<SnapshotId>> {
        self.gate(Layer::Graph)?;
        let repo = self.repo.read();
        let head = repo.head_hash()?;
        let since = since.map(|s| repo.resolve(s)).transpose()?;
        graph::history(&*repo, &head, limit, since.as_deref())
    }

    fn ancestors(&self, snap_id: &str) -> Result<BTreeSet<SnapshotId>> {
        self.gate(Layer::Graph)?;
        let repo = self.repo.read();
        graph::ancestors(&*repo, &repo.resolve(snap_id)?)
    }

    fn is_ancestor(&self, a: &str, b: &str) -> Result<bool> {
        self.gate(Layer::Graph)?;
        let repo = self.repo.read();
        graph::is_ancestor(&*repo, &repo.resolve(a)?, &repo.resolve(b)?)
    }

    fn common_ancestor(&self, a: &str, b: &str) -> Result<SnapshotId> {
        self.gate(Layer::Graph)?;
        let repo = self.repo.read();
        graph::common_ancestor(&*repo, &repo.resolve(a)?, &repo.resolve(b)?)
    }

    fn commit_graph(&self) -> Result<CommitGraph> {
        self.gate(Layer::Graph)?;
        let repo = self.repo.read();
        let mut commits: Vec<&Commit> = repo.commits.values().collect();
        commits.sort_by(|a, b| b.hlc.cmp(&a.hlc).then_with(|| a.id.cmp(&b.id)));
        Ok(CommitGraph {
            nodes: commits.iter().map(|c| c.id.clone()).collect(),
            edges: commits
                .iter()
                .flat_map(|c| c.parents.iter().map(|p| (c.id.clone(), p.clone())))
                .collect(),
            branches: repo
                .branches
                .iter()
                .map(|(name, head)| (name.clone(), head.clone()))
                .collect(),
        })
    }
}

impl Mergeable for MemorySystem {
    fn merge(&self, source: &str, strategy: Option<&str>, message: Option<&str>) -> Result<()> {
        self.gate(Layer::Merge)?;
        let strategy = strategy.map(str::parse::<MergeStrategy>).transpose()?;
        let (id, branch, fast_forward) = {
            let mut repo = self.repo.write();
            if !repo.staged.is_empty() {
                return Err(ProtocolError::invalid_state("uncommitted changes block a merge"));
            }
            let head = repo.head_hash()?;
            let src = repo.resolve(source)?;
            let branch = repo.current_branch.clone();

            if src == head || graph::is_ancestor(&*repo, &src, &head)? {
                tracing::debug!(system_id = %self.system_id, source, "merge: already up to date");
                return Ok(());
            }

            let fast_forward = graph::is_ancestor(&*repo, &head, &src)?;
            let id = if fast_forward {
                repo.branches.insert(branch.clone(), src.clone());
                src
            } else {
                let (base, result) = repo.merge_trees(&head, &src)?;
                let ops = if result.is_clean() {
                    result.merged_ops
                } else {
                    match strategy {
                        Some(strategy) => result.resolve(strategy),
                        None => {
                            tracing::info!(
                                system_id = %self.system_id,
                                source,
                                conflicts = result.conflicts.len(),
                                "merge blocked by conflicts"
                            );
                            return Err(ProtocolError::Conflict {
                                conflicts: result.protocol_conflicts(),
                            });
                        }
                    }
                };
                let mut merged = (*base).clone();
                apply_ops(&mut merged, &ops);
                let message = message.map_or_else(|| format!("merge {source}"), str::to_owned);
                repo.record(merged, vec![head, src], &message, &self.config.author, self.clock.tick())
            };
            self.watchers.enqueue(WatchEvent::new(
                WatchEventKind::Commit,
                Some(id.clone()),
                Some(branch.clone()),
            ));
            (id, branch, fast_forward)
        };
        self.watchers.flush();
        tracing::info!(
            system_id = %self.system_id,
            source,
            snapshot_id = %id,
            branch = %branch,
            fast_forward,
            "merge"
        );
        Ok(())
    }

    fn conflicts(&self, a: &str, b: &str) -> Result<Vec<Conflict>> {
        self.gate(Layer::Merge)?;
        let repo = self.repo.read();
        let (a, b) = (repo.resolve(a)?, repo.resolve(b)?);
        // Merging a into b: b is ours.
        let (_, result) = repo.merge_trees(&b, &a)?;
        Ok(result.protocol_conflicts())
    }

    fn diff(&self, a: &str, b: &str) -> Result<Opaque> {
        self.gate(Layer::Merge)?;
        let repo = self.repo.read();
        let old = repo.tree_of(&repo.resolve(a)?)?;
        let new = repo.tree_of(&repo.resolve(b)?)?;
        serde_json::to_value(diff_entries(&old, &new))
            .map_err(|e| ProtocolError::underlying("diff serialization failed", e))
    }
}

impl Overlayable for MemorySystem {
    type Delta = EntryDelta;
    type View = MemoryView;

    fn overlay(&self, mode: OverlayMode) -> Result<Overlay<EntryDelta>> {
        self.gate(Layer::Overlay)?;
        Ok(self.overlays.open(mode, self.head_ref()?))
    }

    fn advance(&self, overlay: &mut Overlay<EntryDelta>) -> Result<()> {
        self.gate(Layer::Overlay)?;
        self.ensure_owned(overlay)?;
        overlay.ensure_active()?;
        overlay.advance_to(self.head_ref()?)
    }

    fn peek_parent(&self, overlay: &Overlay<EntryDelta>) -> Result<MemoryView> {
        self.gate(Layer::Overlay)?;
        self.ensure_owned(overlay)?;
        let point = overlay.observation_point(|| self.head_ref())?;
        let repo = self.repo.read();
        self.view(&repo, &point.snapshot_id)
    }

    fn base_ref(&self, overlay: &Overlay<EntryDelta>) -> Result<SnapshotRef> {
        self.gate(Layer::Overlay)?;
        self.ensure_owned(overlay)?;
        overlay.observation_point(|| self.head_ref())
    }

    fn overlay_writes(&self, overlay: &Overlay<EntryDelta>) -> Result<EntryDelta> {
        self.gate(Layer::Overlay)?;
        self.ensure_owned(overlay)?;
        overlay.ensure_active()?;
        Ok(overlay.local_writes().clone())
    }

    fn merge_down(&self, overlay: &mut Overlay<EntryDelta>) -> Result<()> {
        self.gate(Layer::Overlay)?;
        self.ensure_owned(overlay)?;
        overlay.ensure_active()?;
        let committed = {
            let mut repo = self.repo.write();
            let head = repo.head_hash()?;
            let base = repo.tree_of(&overlay.base_snapshot().snapshot_id)?;
            let current = repo.tree_of(&head)?;
            let mut theirs = (*base).clone();
            apply_delta(&mut theirs, overlay.local_writes());

            let result = three_way(&base, &current, &theirs);
            if !result.is_clean() {
                tracing::info!(
                    system_id = %self.system_id,
                    overlay_id = overlay.id(),
                    conflicts = result.conflicts.len(),
                    "overlay merge-down blocked by conflicts"
                );
                return Err(ProtocolError::Conflict {
                    conflicts: result.protocol_conflicts(),
                });
            }
            let mut merged = (*base).clone();
            apply_ops(&mut merged, &result.merged_ops);

            if merged == *current {
                None
            } else {
                let message = format!("merge overlay {}", overlay.id());
                let id = repo.record(merged, vec![head], &message, &self.config.author, self.clock.tick());
                let branch = repo.current_branch.clone();
                self.watchers.enqueue(WatchEvent::new(
                    WatchEventKind::Commit,
                    Some(id.clone()),
                    Some(branch),
                ));
                Some(id)
            }
        };
        self.watchers.flush();
        overlay.mark_merged()?;
        tracing::info!(
            system_id = %self.system_id,
            overlay_id = overlay.id(),
            snapshot_id = ?committed,
            "overlay applied"
        );
        Ok(())
    }

    fn discard(&self, overlay: &mut Overlay<EntryDelta>) -> Result<()> {
        self.gate(Layer::Overlay)?;
        self.ensure_owned(overlay)?;
        overlay.abandon()
    }
}

impl Watchable for MemorySystem {
    fn watch(&self, callback: WatchCallback, opts: WatchOpts) -> Result<WatchId> {
        self.gate(Layer::Watch)?;
        self.watchers.register(callback, opts)
    }

    fn unwatch(&self, watch_id: &WatchId) -> Result<()> {
        self.gate(Layer::Watch)?;
        self.watchers.unregister(watch_id)
    }
}

impl System for MemorySystem {
    fn as_branchable(&self) -> Option<&dyn Branchable> {
        Some(self)
    }

    fn as_graphable(&self) -> Option<&dyn Graphable> {
        Some(self)
    }

    fn as_mergeable(&self) -> Option<&dyn Mergeable> {
        Some(self)
    }

    fn as_watchable(&self) -> Option<&dyn Watchable> {
        Some(self)
    }
}

// ── Fixture ────────────────────────────────────────────────────────────

/// Conformance fixture over [`MemorySystem`].
#[derive(Debug, Default)]
pub struct MemoryFixture {
    config: ProtocolConfig,
    capabilities: Option<Capabilities>,
    mutations: AtomicUsize,
}

impl MemoryFixture {
    pub fn new(config: ProtocolConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Systems created by this fixture advertise only `capabilities`.
    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }
}

impl Fixture for MemoryFixture {
    type System = MemorySystem;

    fn create_system(&self) -> Result<MemorySystem> {
        let system = MemorySystem::with_config(self.config.clone());
        Ok(match self.capabilities {
            Some(caps) => system.with_capabilities(caps),
            None => system,
        })
    }

    fn mutate(&self, system: MemorySystem) -> Result<MemorySystem> {
        let n = self.mutations.fetch_add(1, Ordering::Relaxed);
        system.write(&format!("mutation-{n}"), &n.to_string());
        Ok(system)
    }

    fn commit(&self, system: MemorySystem, message: &str) -> Result<MemorySystem> {
        system.commit(message)?;
        Ok(system)
    }

    fn close(&self, _system: MemorySystem) {}

    fn write_entry(&self, system: MemorySystem, key: &str, value: &str) -> Result<MemorySystem> {
        system.write(key, value);
        Ok(system)
    }

    fn read_entry(&self, system: &MemorySystem, key: &str) -> Result<Option<String>> {
        system.read(key)
    }

    fn count_entries(&self, system: &MemorySystem) -> Result<usize> {
        system.count()
    }

    fn delete_entry(&self, system: MemorySystem, key: &str) -> Option<Result<MemorySystem>> {
        Some(system.delete(key).map(|()| system))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::{self, ExecOpts};
    use crate::overlay::OverlayStatus;
    use parking_lot::Mutex;

    fn committed(pairs: &[(&str, &str)]) -> MemorySystem {
        let sys = MemorySystem::new();
        for (k, v) in pairs {
            sys.write(k, v);
        }
        sys.commit("seed").unwrap();
        sys
    }

    fn recorder() -> (WatchCallback, Arc<Mutex<Vec<WatchEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let cb: WatchCallback = Arc::new(move |e: &WatchEvent| sink.lock().push(e.clone()));
        (cb, seen)
    }

    #[test]
    fn test_fresh_system_has_empty_root() {
        let sys = MemorySystem::new();
        let root = sys.snapshot_id().unwrap();
        assert!(sys.parent_ids(None).unwrap().is_empty());
        assert_eq!(sys.count().unwrap(), 0);
        assert_eq!(sys.current_branch().unwrap(), "main");
        assert_eq!(sys.snapshot_meta(&root).unwrap().message, "initial commit");
        assert!(sys.system_id().starts_with("memory:"));
    }

    #[test]
    fn test_staged_writes_fold_into_commit() {
        let sys = MemorySystem::new();
        sys.write("a", "1");
        assert_eq!(sys.read("a").unwrap().as_deref(), Some("1"));
        assert!(sys.has_staged_changes());
        let before = sys.snapshot_id().unwrap();
        let id = sys.commit("add a").unwrap();
        assert!(!sys.has_staged_changes());
        assert_eq!(sys.parent_ids(Some(&id)).unwrap(), BTreeSet::from([before]));
        assert_eq!(sys.as_of(&id).unwrap().get("a"), Some("1"));
    }

    #[test]
    fn test_delete_missing_entry_is_not_found() {
        let sys = committed(&[("a", "1")]);
        assert!(matches!(sys.delete("zzz"), Err(ProtocolError::NotFound { .. })));
        sys.delete("a").unwrap();
        assert_eq!(sys.read("a").unwrap(), None);
    }

    #[test]
    fn test_as_of_view_survives_later_commits() {
        let sys = committed(&[("k", "old")]);
        let view = sys.as_of(&sys.snapshot_id().unwrap()).unwrap();
        sys.write("k", "new");
        sys.commit("change").unwrap();
        assert_eq!(view.get("k"), Some("old"));
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("new"));
    }

    #[test]
    fn test_snapshot_ref_carries_hlc_and_hash() {
        let sys = committed(&[("k", "v")]);
        let head = sys.snapshot_ref(None).unwrap();
        assert_eq!(head.system_id, sys.system_id());
        assert!(head.hlc.is_some());
        assert!(head.content_hash.is_some());
        assert_eq!(head.parent_ids, sys.parent_ids(None).unwrap());
    }

    #[test]
    fn test_commit_hlcs_increase() {
        let sys = MemorySystem::new();
        let mut last = sys.snapshot_ref(None).unwrap().hlc.unwrap();
        for i in 0..5 {
            sys.write("k", &i.to_string());
            sys.commit("tick").unwrap();
            let hlc = sys.snapshot_ref(None).unwrap().hlc.unwrap();
            assert!(hlc > last);
            last = hlc;
        }
    }

    #[test]
    fn test_duplicate_branch_is_invalid_state() {
        let sys = MemorySystem::new();
        sys.branch("feature", None).unwrap();
        assert!(matches!(
            sys.branch("feature", None),
            Err(ProtocolError::InvalidState { .. })
        ));
        assert!(matches!(sys.checkout("nope"), Err(ProtocolError::NotFound { .. })));
        assert!(matches!(sys.delete_branch("nope"), Err(ProtocolError::NotFound { .. })));
    }

    #[test]
    fn test_branch_from_ref() {
        let sys = committed(&[("a", "1")]);
        let first = sys.snapshot_id().unwrap();
        sys.write("b", "2");
        sys.commit("b").unwrap();
        sys.branch("old", Some(&first)).unwrap();
        sys.checkout("old").unwrap();
        assert_eq!(sys.snapshot_id().unwrap(), first);
        assert_eq!(sys.read("b").unwrap(), None);
    }

    #[test]
    fn test_checkout_keeps_staged_writes() {
        let sys = committed(&[]);
        sys.branch("feature", None).unwrap();
        sys.write("pending", "yes");
        sys.checkout("feature").unwrap();
        assert_eq!(sys.read("pending").unwrap().as_deref(), Some("yes"));
    }

    #[test]
    fn test_ancestry_is_strict() {
        let sys = committed(&[("a", "1")]);
        let head = sys.snapshot_id().unwrap();
        assert!(!sys.is_ancestor(&head, &head).unwrap());
        assert!(!sys.ancestors(&head).unwrap().contains(&head));
    }

    #[test]
    fn test_history_since_excludes_older() {
        let sys = MemorySystem::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            sys.write("k", &i.to_string());
            ids.push(sys.commit("c").unwrap());
        }
        let hist = sys.history(None, Some(&ids[1])).unwrap();
        assert_eq!(hist, vec![ids[3].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_fast_forward_merge_moves_pointer() {
        let sys = committed(&[("a", "1")]);
        sys.branch("feature", None).unwrap();
        sys.checkout("feature").unwrap();
        sys.write("b", "2");
        let tip = sys.commit("feature work").unwrap();
        sys.checkout("main").unwrap();
        sys.merge("feature", None, None).unwrap();
        assert_eq!(sys.snapshot_id().unwrap(), tip);
        assert_eq!(sys.parent_ids(None).unwrap().len(), 1);
    }

    #[test]
    fn test_merging_an_ancestor_is_a_no_op() {
        let sys = committed(&[("a", "1")]);
        let base = sys.snapshot_id().unwrap();
        sys.write("b", "2");
        let head = sys.commit("more").unwrap();
        sys.merge(&base, None, None).unwrap();
        assert_eq!(sys.snapshot_id().unwrap(), head);
    }

    fn conflicting() -> MemorySystem {
        let sys = committed(&[("k", "base")]);
        sys.branch("feature", None).unwrap();
        sys.write("k", "main");
        sys.commit("main edit").unwrap();
        sys.checkout("feature").unwrap();
        sys.write("k", "feature");
        sys.commit("feature edit").unwrap();
        sys.checkout("main").unwrap();
        sys
    }

    #[test]
    fn test_conflicting_merge_leaves_state_untouched() {
        let sys = conflicting();
        let head = sys.snapshot_id().unwrap();
        let err = sys.merge("feature", None, None).unwrap_err();
        let conflicts = err.conflicts().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].ours, Some(serde_json::json!("main")));
        assert_eq!(conflicts[0].theirs, Some(serde_json::json!("feature")));
        assert_eq!(sys.snapshot_id().unwrap(), head);
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn test_strategies_resolve_conflicts() {
        let sys = conflicting();
        sys.merge("feature", Some("theirs"), Some("take theirs")).unwrap();
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("feature"));
        assert_eq!(sys.parent_ids(None).unwrap().len(), 2);
        let meta = sys.snapshot_meta(&sys.snapshot_id().unwrap()).unwrap();
        assert_eq!(meta.message, "take theirs");

        let sys = conflicting();
        sys.merge("feature", Some("ours"), None).unwrap();
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("main"));
    }

    #[test]
    fn test_unknown_strategy_is_unsupported() {
        let sys = conflicting();
        let err = sys.merge("feature", Some("octopus"), None).unwrap_err();
        assert!(err.is_unsupported());
    }

    #[test]
    fn test_staged_changes_block_merge() {
        let sys = conflicting();
        sys.write("x", "1");
        assert!(matches!(
            sys.merge("feature", Some("ours"), None),
            Err(ProtocolError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_conflicts_dry_run_matches_merge() {
        let sys = conflicting();
        let predicted = sys.conflicts("feature", "main").unwrap();
        assert_eq!(predicted.len(), 1);
        assert_eq!(predicted[0].path, vec![serde_json::json!("k")]);
    }

    #[test]
    fn test_diff_lists_entry_ops() {
        let sys = committed(&[("a", "1"), ("b", "2")]);
        let before = sys.snapshot_id().unwrap();
        sys.write("a", "9");
        sys.delete("b").unwrap();
        let after = sys.commit("edit").unwrap();
        let diff = sys.diff(&before, &after).unwrap();
        assert_eq!(diff.as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn test_commit_graph_lists_everything() {
        let sys = conflicting();
        sys.merge("feature", Some("ours"), None).unwrap();
        let graph = sys.commit_graph().unwrap();
        assert_eq!(graph.nodes.first(), Some(&sys.snapshot_id().unwrap()));
        assert_eq!(graph.nodes.len(), 5);
        assert_eq!(graph.edges.len(), 5);
        assert_eq!(graph.branches.len(), 2);
    }

    #[test]
    fn test_commit_info_falls_back_to_meta() {
        let sys = committed(&[("a", "1")]);
        let id = sys.snapshot_id().unwrap();
        let info = crate::protocol::commit_info(&sys, &id).unwrap();
        assert_eq!(info, sys.snapshot_meta(&id).unwrap());
    }

    #[test]
    fn test_masked_layers_fail_fast() {
        let sys = MemorySystem::new().with_capabilities(Capabilities::snapshot_only());
        assert!(sys.branches().unwrap_err().is_unsupported());
        assert!(sys.history(None, None).unwrap_err().is_unsupported());
        assert!(sys.overlay(OverlayMode::Gated).unwrap_err().is_unsupported());
        assert!(sys.require_mergeable().is_err());
        assert!(sys.snapshot_id().is_ok());
    }

    #[test]
    fn test_handles_share_state() {
        let a = MemorySystem::new();
        let b = a.clone();
        a.write("k", "v");
        b.commit("through b").unwrap();
        assert_eq!(a.snapshot_id().unwrap(), b.snapshot_id().unwrap());
        assert_eq!(a.read("k").unwrap().as_deref(), Some("v"));
    }

    // ── overlays ──

    #[test]
    fn test_overlay_isolates_writes_until_merge_down() {
        let sys = committed(&[("k", "parent")]);
        let mut ov = sys.overlay(OverlayMode::Gated).unwrap();
        sys.overlay_write(&mut ov, "k", "overlay").unwrap();
        sys.overlay_write(&mut ov, "new", "x").unwrap();
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("parent"));
        assert_eq!(sys.overlay_read(&ov, "k").unwrap().as_deref(), Some("overlay"));
        assert_eq!(sys.overlay_writes(&ov).unwrap().len(), 2);

        sys.merge_down(&mut ov).unwrap();
        assert_eq!(ov.status(), OverlayStatus::MergedDown);
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("overlay"));
        assert_eq!(sys.read("new").unwrap().as_deref(), Some("x"));
        assert!(sys.overlays().is_empty());
    }

    #[test]
    fn test_frozen_overlay_ignores_parent_commits() {
        let sys = committed(&[("k", "v1")]);
        let ov = sys.overlay(OverlayMode::Frozen).unwrap();
        let base = ov.base_snapshot().clone();
        sys.write("k", "v2");
        sys.commit("move on").unwrap();
        assert_eq!(sys.peek_parent(&ov).unwrap().get("k"), Some("v1"));
        assert_eq!(sys.base_ref(&ov).unwrap(), base);
    }

    #[test]
    fn test_following_overlay_tracks_head() {
        let sys = committed(&[("k", "v1")]);
        let ov = sys.overlay(OverlayMode::Following).unwrap();
        sys.write("k", "v2");
        let head = sys.commit("move on").unwrap();
        assert_eq!(sys.peek_parent(&ov).unwrap().get("k"), Some("v2"));
        assert_eq!(sys.base_ref(&ov).unwrap().snapshot_id, head);
        assert_eq!(sys.overlay_read(&ov, "k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn test_gated_overlay_moves_only_on_advance() {
        let sys = committed(&[("k", "v1")]);
        let mut ov = sys.overlay(OverlayMode::Gated).unwrap();
        sys.overlay_write(&mut ov, "mine", "1").unwrap();
        sys.write("k", "v2");
        let head = sys.commit("move on").unwrap();
        assert_eq!(sys.peek_parent(&ov).unwrap().get("k"), Some("v1"));
        sys.advance(&mut ov).unwrap();
        assert_eq!(sys.peek_parent(&ov).unwrap().get("k"), Some("v2"));
        assert_eq!(ov.base_snapshot().snapshot_id, head);
        assert_eq!(sys.overlay_read(&ov, "mine").unwrap().as_deref(), Some("1"));
    }

    #[test]
    fn test_advance_rejected_outside_gated() {
        let sys = committed(&[]);
        let mut frozen = sys.overlay(OverlayMode::Frozen).unwrap();
        let mut following = sys.overlay(OverlayMode::Following).unwrap();
        assert!(matches!(sys.advance(&mut frozen), Err(ProtocolError::InvalidState { .. })));
        assert!(matches!(sys.advance(&mut following), Err(ProtocolError::InvalidState { .. })));
    }

    #[test]
    fn test_overlay_conflict_keeps_overlay_active() {
        let sys = committed(&[("k", "base")]);
        let mut ov = sys.overlay(OverlayMode::Gated).unwrap();
        sys.overlay_write(&mut ov, "k", "overlay").unwrap();
        sys.write("k", "parent");
        sys.commit("parent edit").unwrap();

        let err = sys.merge_down(&mut ov).unwrap_err();
        assert_eq!(err.conflicts().map(<[Conflict]>::len), Some(1));
        assert_eq!(ov.status(), OverlayStatus::Active);
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("parent"));

        // Advancing rebases the base; the overlay's write then wins cleanly.
        sys.advance(&mut ov).unwrap();
        sys.merge_down(&mut ov).unwrap();
        assert_eq!(sys.read("k").unwrap().as_deref(), Some("overlay"));
    }

    #[test]
    fn test_overlay_merges_with_disjoint_parent_changes() {
        let sys = committed(&[("a", "1")]);
        let mut ov = sys.overlay(OverlayMode::Frozen).unwrap();
        sys.overlay_write(&mut ov, "b", "2").unwrap();
        sys.write("c", "3");
        sys.commit("parent edit").unwrap();
        sys.merge_down(&mut ov).unwrap();
        assert_eq!(sys.count().unwrap(), 3);
    }

    #[test]
    fn test_overlay_delete_merges_down() {
        let sys = committed(&[("a", "1"), ("b", "2")]);
        let mut ov = sys.overlay(OverlayMode::Gated).unwrap();
        sys.overlay_delete(&mut ov, "a").unwrap();
        assert_eq!(sys.overlay_read(&ov, "a").unwrap(), None);
        sys.merge_down(&mut ov).unwrap();
        assert_eq!(sys.read("a").unwrap(), None);
        assert_eq!(sys.count().unwrap(), 1);
    }

    #[test]
    fn test_discarded_overlay_rejects_everything() {
        let sys = committed(&[("a", "1")]);
        let head = sys.snapshot_id().unwrap();
        let mut ov = sys.overlay(OverlayMode::Gated).unwrap();
        sys.overlay_write(&mut ov, "a", "2").unwrap();
        sys.discard(&mut ov).unwrap();
        assert_eq!(ov.status(), OverlayStatus::Discarded);
        assert_eq!(sys.snapshot_id().unwrap(), head);
        assert!(sys.overlay_writes(&ov).is_err());
        assert!(sys.peek_parent(&ov).is_err());
        assert!(sys.merge_down(&mut ov).is_err());
        assert!(sys.discard(&mut ov).is_err());
        assert!(sys.overlay_write(&mut ov, "a", "3").is_err());
    }

    #[test]
    fn test_foreign_overlay_is_rejected() {
        let a = committed(&[]);
        let b = committed(&[]);
        let mut ov = a.overlay(OverlayMode::Gated).unwrap();
        assert!(matches!(b.merge_down(&mut ov), Err(ProtocolError::InvalidState { .. })));
        assert!(matches!(b.discard(&mut ov), Err(ProtocolError::InvalidState { .. })));
        assert_eq!(ov.status(), OverlayStatus::Active);
    }

    #[test]
    fn test_foreign_overlay_writes_stay_private() {
        let a = committed(&[]);
        let b = committed(&[]);
        let mut ov = a.overlay(OverlayMode::Gated).unwrap();
        a.overlay_write(&mut ov, "secret", "1").unwrap();
        assert!(matches!(b.overlay_writes(&ov), Err(ProtocolError::InvalidState { .. })));
        assert!(matches!(b.overlay_read(&ov, "secret"), Err(ProtocolError::InvalidState { .. })));
        assert_eq!(a.overlay_writes(&ov).unwrap().len(), 1);
    }

    #[test]
    fn test_overlay_registry_tracks_live_overlays() {
        let sys = committed(&[]);
        let first = sys.default_overlay().unwrap();
        let _second = sys.overlay(OverlayMode::Frozen).unwrap();
        assert_eq!(first.mode(), OverlayMode::Gated);
        assert_eq!(sys.overlays().len(), 2);
        drop(first);
        assert_eq!(sys.overlays().len(), 1);
    }

    // ── watch ──

    #[test]
    fn test_watchers_see_mutations_in_order() {
        let sys = committed(&[]);
        let (cb, seen) = recorder();
        let id = sys.watch(cb, WatchOpts::default()).unwrap();
        sys.branch("feature", None).unwrap();
        sys.checkout("feature").unwrap();
        sys.write("k", "v");
        let commit = sys.commit("on feature").unwrap();
        sys.checkout("main").unwrap();
        sys.delete_branch("feature").unwrap();

        let kinds: Vec<_> = seen.lock().iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                WatchEventKind::BranchCreated,
                WatchEventKind::Checkout,
                WatchEventKind::Commit,
                WatchEventKind::Checkout,
                WatchEventKind::BranchDeleted,
            ]
        );
        assert_eq!(seen.lock()[2].snapshot_id.as_deref(), Some(commit.as_str()));
        assert_eq!(seen.lock()[2].branch.as_deref(), Some("feature"));

        sys.unwatch(&id).unwrap();
        sys.write("k", "again");
        sys.commit("unwatched").unwrap();
        assert_eq!(seen.lock().len(), 5);
        assert!(matches!(sys.unwatch(&id), Err(ProtocolError::NotFound { .. })));
    }

    #[test]
    fn test_callback_may_read_the_system() {
        let sys = committed(&[]);
        let reader = sys.clone();
        let heads = Arc::new(Mutex::new(Vec::new()));
        let sink = heads.clone();
        let cb: WatchCallback = Arc::new(move |_e: &WatchEvent| {
            sink.lock().push(reader.snapshot_id().unwrap());
        });
        sys.watch_default(cb).unwrap();
        sys.write("k", "v");
        let id = sys.commit("observed").unwrap();
        assert_eq!(*heads.lock(), vec![id]);
    }

    #[test]
    fn test_overlay_merge_down_emits_commit() {
        let sys = committed(&[]);
        let (cb, seen) = recorder();
        sys.watch(cb, WatchOpts::default()).unwrap();
        let mut ov = sys.overlay(OverlayMode::Gated).unwrap();
        sys.overlay_write(&mut ov, "k", "v").unwrap();
        sys.merge_down(&mut ov).unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(seen.lock()[0].kind, WatchEventKind::Commit);
    }

    // ── exec ──

    #[test]
    fn test_non_blocking_commit_resolves_later() {
        let sys = MemorySystem::new();
        sys.write("k", "v");
        let outcome = exec::run(&sys, ExecOpts::non_blocking(), |s| s.commit("background"));
        assert!(outcome.is_pending());
        let id = outcome.wait().unwrap();
        assert_eq!(sys.snapshot_id().unwrap(), id);
    }

    #[test]
    fn test_fixture_passes_conformance() {
        crate::harness::run_conformance(&MemoryFixture::default()).assert_conformant();
    }
}
