//! Conformance harness
//!
//! The operational definition of "implements the protocol correctly". An
//! adapter supplies a [`Fixture`] (eight hooks) and [`run_conformance`]
//! drives it through checks grouped by layer. A group is skipped, not
//! failed, when the system's capabilities report its layer unsupported.
//! Every check acquires a fresh system and releases it on every exit path,
//! including assertion failures and panics.
//!
//! ```
//! use forkline::harness::run_conformance;
//! use forkline::memory::MemoryFixture;
//!
//! let report = run_conformance(&MemoryFixture::default());
//! report.assert_conformant();
//! ```

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use crate::error::{ProtocolError, Result};
use crate::protocol::{
    self, Branchable, Graphable, Mergeable, Snapshotable, System, SystemIdentity,
};
use crate::types::{Capabilities, Layer, SnapshotId};

/// Adapter hooks the harness drives.
///
/// System handles are cheap clones of shared state: hooks take a handle
/// by value and return the (same, mutated) handle.
pub trait Fixture {
    type System: System + Clone;

    /// Fresh system on its initial branch.
    fn create_system(&self) -> Result<Self::System>;

    /// Make some uncommitted change.
    fn mutate(&self, system: Self::System) -> Result<Self::System>;

    fn commit(&self, system: Self::System, message: &str) -> Result<Self::System>;

    fn close(&self, system: Self::System);

    fn write_entry(&self, system: Self::System, key: &str, value: &str) -> Result<Self::System>;

    fn read_entry(&self, system: &Self::System, key: &str) -> Result<Option<String>>;

    fn count_entries(&self, system: &Self::System) -> Result<usize>;

    /// `None` when the adapter cannot delete; delete and overwrite checks
    /// are then skipped.
    fn delete_entry(&self, _system: Self::System, _key: &str) -> Option<Result<Self::System>> {
        None
    }
}

// ── Report ─────────────────────────────────────────────────────────────

/// Check groups, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CheckGroup {
    Identity,
    Snapshot,
    Branch,
    Graph,
    Merge,
    DataConsistency,
}

impl CheckGroup {
    /// Capability gating the whole group.
    pub fn layer(&self) -> Option<Layer> {
        match self {
            CheckGroup::Identity | CheckGroup::DataConsistency => None,
            CheckGroup::Snapshot => Some(Layer::Snapshot),
            CheckGroup::Branch => Some(Layer::Branch),
            CheckGroup::Graph => Some(Layer::Graph),
            CheckGroup::Merge => Some(Layer::Merge),
        }
    }
}

impl fmt::Display for CheckGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CheckGroup::Identity => "identity",
            CheckGroup::Snapshot => "snapshot",
            CheckGroup::Branch => "branch",
            CheckGroup::Graph => "graph",
            CheckGroup::Merge => "merge",
            CheckGroup::DataConsistency => "data-consistency",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Passed,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckReport {
    pub group: CheckGroup,
    pub name: &'static str,
    pub outcome: CheckOutcome,
}

/// Outcome of a full harness run.
#[derive(Debug, Clone, Default)]
pub struct ConformanceReport {
    pub results: Vec<CheckReport>,
}

impl ConformanceReport {
    pub fn passed(&self) -> usize {
        self.count(|o| matches!(o, CheckOutcome::Passed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, CheckOutcome::Skipped(_)))
    }

    pub fn failures(&self) -> Vec<&CheckReport> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, CheckOutcome::Failed(_)))
            .collect()
    }

    pub fn is_conformant(&self) -> bool {
        self.failures().is_empty()
    }

    pub fn outcome(&self, name: &str) -> Option<&CheckOutcome> {
        self.results.iter().find(|r| r.name == name).map(|r| &r.outcome)
    }

    /// Panic with the failure list unless every check passed or skipped.
    pub fn assert_conformant(&self) {
        if !self.is_conformant() {
            panic!("adapter is not conformant:\n{self}");
        }
    }

    fn count(&self, pred: impl Fn(&CheckOutcome) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.outcome)).count()
    }
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} passed, {} skipped, {} failed",
            self.passed(),
            self.skipped(),
            self.failures().len()
        )?;
        for r in self.failures() {
            if let CheckOutcome::Failed(msg) = &r.outcome {
                writeln!(f, "  [{}] {}: {}", r.group, r.name, msg)?;
            }
        }
        Ok(())
    }
}

// ── Check plumbing ─────────────────────────────────────────────────────

/// Assertion failure or unhandled protocol error inside a check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure(pub String);

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<ProtocolError> for CheckFailure {
    fn from(err: ProtocolError) -> Self {
        CheckFailure(format!("unexpected error: {err}"))
    }
}

enum Verdict {
    Pass,
    Skip(String),
}

type CheckResult = std::result::Result<Verdict, CheckFailure>;

macro_rules! ensure {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err(CheckFailure(format!($($msg)+)));
        }
    };
}

struct Check<F: Fixture> {
    group: CheckGroup,
    name: &'static str,
    /// Layers needed beyond the group's own.
    requires: &'static [Layer],
    run: fn(&F) -> CheckResult,
}

/// A fresh system that is closed when the session ends, however it ends.
struct Session<'f, F: Fixture> {
    fixture: &'f F,
    system: F::System,
}

impl<'f, F: Fixture> Session<'f, F> {
    fn open(fixture: &'f F) -> std::result::Result<Self, CheckFailure> {
        let system = fixture
            .create_system()
            .map_err(|e| CheckFailure(format!("create_system failed: {e}")))?;
        Ok(Self { fixture, system })
    }

    fn sys(&self) -> &F::System {
        &self.system
    }

    fn step<H>(&mut self, hook: H) -> std::result::Result<(), CheckFailure>
    where
        H: FnOnce(&F, F::System) -> Result<F::System>,
    {
        self.system = hook(self.fixture, self.system.clone())?;
        Ok(())
    }

    fn mutate(&mut self) -> std::result::Result<(), CheckFailure> {
        self.step(|f, s| f.mutate(s))
    }

    fn commit(&mut self, message: &str) -> std::result::Result<(), CheckFailure> {
        self.step(|f, s| f.commit(s, message))
    }

    /// `mutate` then `commit`, returning the new snapshot id.
    fn advance(&mut self, message: &str) -> std::result::Result<SnapshotId, CheckFailure> {
        self.mutate()?;
        self.commit(message)?;
        Ok(self.sys().snapshot_id()?)
    }

    fn write(&mut self, key: &str, value: &str) -> std::result::Result<(), CheckFailure> {
        self.step(|f, s| f.write_entry(s, key, value))
    }

    fn read(&self, key: &str) -> std::result::Result<Option<String>, CheckFailure> {
        Ok(self.fixture.read_entry(&self.system, key)?)
    }

    fn count(&self) -> std::result::Result<usize, CheckFailure> {
        Ok(self.fixture.count_entries(&self.system)?)
    }

    /// `Ok(false)` when the fixture has no delete hook.
    fn delete(&mut self, key: &str) -> std::result::Result<bool, CheckFailure> {
        match self.fixture.delete_entry(self.system.clone(), key) {
            None => Ok(false),
            Some(result) => {
                self.system = result?;
                Ok(true)
            }
        }
    }

    fn branching(&self) -> std::result::Result<&dyn Branchable, CheckFailure> {
        Ok(self.system.require_branchable()?)
    }

    fn graph(&self) -> std::result::Result<&dyn Graphable, CheckFailure> {
        Ok(self.system.require_graphable()?)
    }

    fn merging(&self) -> std::result::Result<&dyn Mergeable, CheckFailure> {
        Ok(self.system.require_mergeable()?)
    }
}

impl<F: Fixture> Drop for Session<'_, F> {
    fn drop(&mut self) {
        self.fixture.close(self.system.clone());
    }
}

// ── Runner ─────────────────────────────────────────────────────────────

/// Capabilities of a throwaway system.
fn read_capabilities<F: Fixture>(fixture: &F) -> std::result::Result<Capabilities, CheckFailure> {
    let session = Session::open(fixture)?;
    Ok(session.sys().capabilities())
}

fn missing_layer(check_group: CheckGroup, requires: &[Layer], caps: &Capabilities) -> Option<Layer> {
    check_group
        .layer()
        .into_iter()
        .chain(requires.iter().copied())
        .find(|layer| !caps.supports(*layer))
}

fn run_one<F: Fixture>(fixture: &F, check: &Check<F>) -> CheckOutcome {
    match panic::catch_unwind(AssertUnwindSafe(|| (check.run)(fixture))) {
        Ok(Ok(Verdict::Pass)) => CheckOutcome::Passed,
        Ok(Ok(Verdict::Skip(reason))) => CheckOutcome::Skipped(reason),
        Ok(Err(failure)) => CheckOutcome::Failed(failure.0),
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic".to_string());
            CheckOutcome::Failed(format!("panicked: {msg}"))
        }
    }
}

/// Run every check against `fixture`.
pub fn run_conformance<F: Fixture>(fixture: &F) -> ConformanceReport {
    let caps = read_capabilities(fixture);
    if let Err(e) = &caps {
        tracing::warn!(error = %e, "cannot create a system; every check fails");
    }

    let mut report = ConformanceReport::default();
    for check in checks::<F>() {
        let outcome = match &caps {
            Err(e) => CheckOutcome::Failed(e.0.clone()),
            Ok(caps) => match missing_layer(check.group, check.requires, caps) {
                Some(layer) => CheckOutcome::Skipped(format!("{layer} not supported")),
                None => run_one(fixture, &check),
            },
        };
        match &outcome {
            CheckOutcome::Failed(msg) => {
                tracing::warn!(group = %check.group, check = check.name, %msg, "conformance check failed")
            }
            CheckOutcome::Skipped(reason) => {
                tracing::debug!(group = %check.group, check = check.name, %reason, "conformance check skipped")
            }
            CheckOutcome::Passed => {
                tracing::debug!(group = %check.group, check = check.name, "conformance check passed")
            }
        }
        report.results.push(CheckReport {
            group: check.group,
            name: check.name,
            outcome,
        });
    }

    tracing::info!(
        passed = report.passed(),
        skipped = report.skipped(),
        failed = report.failures().len(),
        "conformance run finished"
    );
    report
}

fn checks<F: Fixture>() -> Vec<Check<F>> {
    use CheckGroup::*;

    macro_rules! check {
        ($group:expr, $name:ident) => {
            check!($group, $name, [])
        };
        ($group:expr, $name:ident, [$($layer:expr),*]) => {
            Check {
                group: $group,
                name: stringify!($name),
                requires: &[$($layer),*],
                run: $name::<F>,
            }
        };
    }

    vec![
        check!(Identity, system_identity),
        check!(Snapshot, snapshot_id_after_commit),
        check!(Snapshot, parent_ids_root_commit),
        check!(Snapshot, parent_ids_chain),
        check!(Snapshot, snapshot_meta),
        check!(Snapshot, as_of),
        check!(Snapshot, unknown_snapshot_not_found),
        check!(Branch, initial_branches),
        check!(Branch, create_branch),
        check!(Branch, checkout),
        check!(Branch, branch_isolation),
        check!(Branch, delete_branch),
        check!(Branch, delete_current_branch_rejected),
        check!(Branch, handles_share_state),
        check!(Graph, history),
        check!(Graph, history_limit),
        check!(Graph, ancestors),
        check!(Graph, ancestor_predicate),
        check!(Graph, ancestor_predicate_matches_ancestors),
        check!(Graph, ancestry_transitive),
        check!(Graph, common_ancestor, [Layer::Branch]),
        check!(Graph, commit_info),
        check!(Merge, merge, [Layer::Branch]),
        check!(Merge, merge_parent_ids, [Layer::Branch]),
        check!(Merge, conflicts_empty_for_compatible, [Layer::Branch]),
        check!(Merge, clean_dry_run_merges, [Layer::Branch]),
        check!(Merge, diff),
        check!(DataConsistency, write_read_roundtrip),
        check!(DataConsistency, count_after_writes),
        check!(DataConsistency, multiple_entries_readable),
        check!(DataConsistency, branch_data_isolation, [Layer::Branch]),
        check!(DataConsistency, delete_entry_consistency),
        check!(DataConsistency, overwrite_entry),
    ]
}

// ── Identity ───────────────────────────────────────────────────────────

fn system_identity<F: Fixture>(fx: &F) -> CheckResult {
    let s = Session::open(fx)?;
    ensure!(!s.sys().system_id().is_empty(), "system_id is empty");
    ensure!(!s.sys().system_type().is_empty(), "system_type is empty");
    ensure!(s.sys().capabilities().snapshotable, "every system must be snapshotable");
    Ok(Verdict::Pass)
}

// ── Snapshot ───────────────────────────────────────────────────────────

fn snapshot_id_after_commit<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let sid = s.advance("first")?;
    ensure!(!sid.is_empty(), "snapshot_id is empty after a commit");
    Ok(Verdict::Pass)
}

fn parent_ids_root_commit<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let mut snap = s.advance("root")?;
    let mut seen = std::collections::BTreeSet::new();
    loop {
        ensure!(seen.insert(snap.clone()), "parent chain loops at {snap}");
        let parents = s.sys().parent_ids(Some(&snap))?;
        match parents.into_iter().next() {
            Some(parent) => snap = parent,
            None => break,
        }
    }
    ensure!(
        s.sys().parent_ids(Some(&snap))?.is_empty(),
        "root snapshot {snap} has parents"
    );
    Ok(Verdict::Pass)
}

fn parent_ids_chain<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let first = s.advance("first")?;
    s.advance("second")?;
    let parents = s.sys().parent_ids(None)?;
    ensure!(
        parents.contains(&first),
        "second commit's parents {parents:?} do not include {first}"
    );
    Ok(Verdict::Pass)
}

fn snapshot_meta<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let sid = s.advance("test message")?;
    let meta = s.sys().snapshot_meta(&sid)?;
    ensure!(meta.snapshot_id == sid, "meta describes {} not {sid}", meta.snapshot_id);
    let parents = s.sys().parent_ids(Some(&sid))?;
    ensure!(
        meta.parent_ids == parents,
        "meta parents {:?} differ from parent_ids {parents:?}",
        meta.parent_ids
    );
    Ok(Verdict::Pass)
}

fn as_of<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let sid = s.advance("snapshot point")?;
    s.sys().as_of(&sid)?;
    Ok(Verdict::Pass)
}

fn unknown_snapshot_not_found<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("something to look past")?;
    let bogus = "no-such-snapshot-0000";
    ensure!(
        matches!(s.sys().as_of(bogus), Err(ProtocolError::NotFound { .. })),
        "as_of on an unknown id must fail NotFound"
    );
    ensure!(
        matches!(s.sys().snapshot_meta(bogus), Err(ProtocolError::NotFound { .. })),
        "snapshot_meta on an unknown id must fail NotFound"
    );
    Ok(Verdict::Pass)
}

// ── Branch ─────────────────────────────────────────────────────────────

fn initial_branches<F: Fixture>(fx: &F) -> CheckResult {
    let s = Session::open(fx)?;
    let current = s.branching()?.current_branch()?;
    let branches = s.branching()?.branches()?;
    ensure!(
        branches.contains(&current),
        "current branch {current} missing from {branches:?}"
    );
    Ok(Verdict::Pass)
}

fn create_branch<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("before fork")?;
    let before = s.branching()?.current_branch()?;
    s.branching()?.branch("experiment", None)?;
    ensure!(
        s.branching()?.branches()?.contains("experiment"),
        "experiment branch missing after branch()"
    );
    ensure!(
        s.branching()?.current_branch()? == before,
        "branch() switched the current branch"
    );
    Ok(Verdict::Pass)
}

fn checkout<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("before fork")?;
    s.branching()?.branch("experiment", None)?;
    s.branching()?.checkout("experiment")?;
    let current = s.branching()?.current_branch()?;
    ensure!(current == "experiment", "current branch is {current} after checkout");
    Ok(Verdict::Pass)
}

fn branch_isolation<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("main commit")?;
    let main = s.branching()?.current_branch()?;
    s.branching()?.branch("experiment", None)?;
    let fork_point = s.sys().snapshot_id()?;

    s.branching()?.checkout("experiment")?;
    s.advance("experiment commit")?;
    s.branching()?.checkout(&main)?;
    let head = s.sys().snapshot_id()?;
    ensure!(
        head == fork_point,
        "{main} moved to {head} after committing on another branch"
    );
    Ok(Verdict::Pass)
}

fn delete_branch<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("before fork")?;
    s.branching()?.branch("temp", None)?;
    ensure!(s.branching()?.branches()?.contains("temp"), "temp not created");
    s.branching()?.delete_branch("temp")?;
    ensure!(
        !s.branching()?.branches()?.contains("temp"),
        "temp still listed after delete_branch"
    );
    Ok(Verdict::Pass)
}

fn delete_current_branch_rejected<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("base")?;
    let current = s.branching()?.current_branch()?;
    ensure!(
        s.branching()?.delete_branch(&current).is_err(),
        "deleting the current branch {current} succeeded"
    );
    ensure!(
        s.branching()?.branches()?.contains(&current),
        "current branch vanished after a rejected delete"
    );
    Ok(Verdict::Pass)
}

fn handles_share_state<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("base")?;
    let other = s.sys().clone();
    other.require_branchable()?.branch("seen-by-both", None)?;
    ensure!(
        s.branching()?.branches()?.contains("seen-by-both"),
        "a branch created through one handle is invisible through another"
    );
    let before = s.sys().snapshot_id()?;
    s.advance("through the first handle")?;
    ensure!(
        other.snapshot_id()? != before,
        "a commit through one handle is invisible through another"
    );
    Ok(Verdict::Pass)
}

// ── Graph ──────────────────────────────────────────────────────────────

/// Three commits in a row.
fn chain3<F: Fixture>(s: &mut Session<'_, F>) -> std::result::Result<[SnapshotId; 3], CheckFailure> {
    Ok([s.advance("first")?, s.advance("second")?, s.advance("third")?])
}

fn history<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let [_, _, id3] = chain3(&mut s)?;
    let hist = s.graph()?.history(None, None)?;
    ensure!(hist.first() == Some(&id3), "history does not start at the head");
    ensure!(hist.len() >= 3, "history has {} entries, expected >= 3", hist.len());
    Ok(Verdict::Pass)
}

fn history_limit<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    for i in 0..5 {
        s.advance(&format!("commit {i}"))?;
    }
    let hist = s.graph()?.history(Some(2), None)?;
    ensure!(hist.len() == 2, "limit=2 returned {} entries", hist.len());
    Ok(Verdict::Pass)
}

fn ancestors<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let [id1, id2, id3] = chain3(&mut s)?;
    let ancs = s.graph()?.ancestors(&id3)?;
    ensure!(ancs.contains(&id2), "parent missing from ancestors");
    ensure!(ancs.contains(&id1), "grandparent missing from ancestors");
    ensure!(!ancs.contains(&id3), "ancestors include the snapshot itself");
    Ok(Verdict::Pass)
}

fn ancestor_predicate<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let id1 = s.advance("first")?;
    let id2 = s.advance("second")?;
    ensure!(s.graph()?.is_ancestor(&id1, &id2)?, "first is not an ancestor of second");
    ensure!(!s.graph()?.is_ancestor(&id2, &id1)?, "second is an ancestor of first");
    Ok(Verdict::Pass)
}

fn ancestor_predicate_matches_ancestors<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let ids = chain3(&mut s)?;
    for a in &ids {
        for b in &ids {
            if a == b {
                continue;
            }
            let predicate = s.graph()?.is_ancestor(a, b)?;
            let member = s.graph()?.ancestors(b)?.contains(a);
            ensure!(
                predicate == member,
                "is_ancestor({a}, {b}) = {predicate} but membership in ancestors = {member}"
            );
        }
    }
    Ok(Verdict::Pass)
}

fn ancestry_transitive<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let [a, b, c] = chain3(&mut s)?;
    let g = s.graph()?;
    if g.ancestors(&b)?.contains(&a) && g.ancestors(&c)?.contains(&b) {
        ensure!(g.ancestors(&c)?.contains(&a), "ancestry is not transitive");
    } else {
        return Err(CheckFailure("chain commits are not ancestors of each other".into()));
    }
    Ok(Verdict::Pass)
}

fn common_ancestor<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("common base")?;
    s.branching()?.branch("feature", None)?;
    let fork_point = s.sys().snapshot_id()?;
    let main_id = s.advance("main advance")?;
    s.branching()?.checkout("feature")?;
    let feat_id = s.advance("feature advance")?;
    let base = s.graph()?.common_ancestor(&main_id, &feat_id)?;
    ensure!(base == fork_point, "common ancestor {base}, expected fork point {fork_point}");
    Ok(Verdict::Pass)
}

fn commit_info<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let sid = s.advance("test info")?;
    let info = protocol::commit_info(s.sys(), &sid)?;
    ensure!(info.snapshot_id == sid, "commit_info describes {}", info.snapshot_id);
    ensure!(
        info.parent_ids == s.sys().parent_ids(Some(&sid))?,
        "commit_info parents differ from parent_ids"
    );
    Ok(Verdict::Pass)
}

// ── Merge ──────────────────────────────────────────────────────────────

/// Base commit, then `feature` and the initial branch advanced
/// independently. Leaves the initial branch checked out and returns its
/// name with both heads.
fn diverge<F: Fixture>(
    s: &mut Session<'_, F>,
) -> std::result::Result<(String, SnapshotId, SnapshotId), CheckFailure> {
    s.advance("base")?;
    let main = s.branching()?.current_branch()?;
    s.branching()?.branch("feature", None)?;
    let main_id = s.advance("main advance")?;
    s.branching()?.checkout("feature")?;
    let feat_id = s.advance("feature advance")?;
    s.branching()?.checkout(&main)?;
    Ok((main, main_id, feat_id))
}

fn merge<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.advance("base")?;
    let main = s.branching()?.current_branch()?;
    s.branching()?.branch("feature", None)?;
    s.branching()?.checkout("feature")?;
    s.advance("feature work")?;
    s.branching()?.checkout(&main)?;
    s.merging()?.merge("feature", None, None)?;
    ensure!(!s.sys().snapshot_id()?.is_empty(), "no snapshot after merge");
    Ok(Verdict::Pass)
}

fn merge_parent_ids<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    diverge(&mut s)?;
    s.merging()?.merge("feature", None, None)?;
    let parents = s.sys().parent_ids(None)?;
    ensure!(parents.len() >= 2, "merge snapshot has {} parent(s)", parents.len());
    Ok(Verdict::Pass)
}

fn conflicts_empty_for_compatible<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let (_, main_id, feat_id) = diverge(&mut s)?;
    let conflicts = s.merging()?.conflicts(&main_id, &feat_id)?;
    ensure!(conflicts.is_empty(), "compatible branches report {} conflict(s)", conflicts.len());
    Ok(Verdict::Pass)
}

fn clean_dry_run_merges<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let (_, main_id, feat_id) = diverge(&mut s)?;
    if !s.merging()?.conflicts(&feat_id, &main_id)?.is_empty() {
        return Ok(Verdict::Skip("dry run reported conflicts".into()));
    }
    match s.merging()?.merge("feature", None, None) {
        Ok(()) => Ok(Verdict::Pass),
        Err(ProtocolError::Conflict { conflicts }) => Err(CheckFailure(format!(
            "empty conflict dry run but merge raised {} conflict(s)",
            conflicts.len()
        ))),
        Err(e) => Err(e.into()),
    }
}

fn diff<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    let id1 = s.advance("first")?;
    let id2 = s.advance("second")?;
    s.merging()?.diff(&id1, &id2)?;
    Ok(Verdict::Pass)
}

// ── Data consistency ───────────────────────────────────────────────────

fn write_read_roundtrip<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.write("key-1", "value-alpha")?;
    s.commit("write one entry")?;
    let got = s.read("key-1")?;
    ensure!(
        got.as_deref() == Some("value-alpha"),
        "read back {got:?}, expected value-alpha"
    );
    Ok(Verdict::Pass)
}

fn count_after_writes<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    ensure!(s.count()? == 0, "fresh system has {} entries", s.count()?);
    s.write("a", "1")?;
    s.commit("first")?;
    ensure!(s.count()? == 1, "count {} after one write", s.count()?);
    ensure!(s.read("a")?.as_deref() == Some("1"), "a does not read back 1");
    s.write("b", "2")?;
    s.write("c", "3")?;
    s.commit("second")?;
    ensure!(s.count()? == 3, "count {} after three writes", s.count()?);
    Ok(Verdict::Pass)
}

fn multiple_entries_readable<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    for (k, v) in [("x", "val-x"), ("y", "val-y"), ("z", "val-z")] {
        s.write(k, v)?;
    }
    s.commit("three entries")?;
    for (k, v) in [("x", "val-x"), ("y", "val-y"), ("z", "val-z")] {
        let got = s.read(k)?;
        ensure!(got.as_deref() == Some(v), "{k} read back {got:?}");
    }
    ensure!(s.read("nonexistent")?.is_none(), "missing key reads as a value");
    Ok(Verdict::Pass)
}

fn branch_data_isolation<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.write("shared", "base-value")?;
    s.commit("base commit")?;
    let main = s.branching()?.current_branch()?;
    s.branching()?.branch("feature", None)?;
    s.write("main-only", "main-data")?;
    s.commit("main write")?;

    s.branching()?.checkout("feature")?;
    s.write("feature-only", "feature-data")?;
    s.commit("feature write")?;
    ensure!(
        s.read("feature-only")?.as_deref() == Some("feature-data"),
        "feature cannot see its own data"
    );
    ensure!(s.read("main-only")?.is_none(), "feature sees main-only data");
    ensure!(
        s.read("shared")?.as_deref() == Some("base-value"),
        "feature lost the shared base data"
    );

    s.branching()?.checkout(&main)?;
    ensure!(
        s.read("main-only")?.as_deref() == Some("main-data"),
        "main cannot see its own data"
    );
    ensure!(s.read("feature-only")?.is_none(), "main sees feature-only data");
    ensure!(
        s.read("shared")?.as_deref() == Some("base-value"),
        "main lost the shared base data"
    );
    Ok(Verdict::Pass)
}

fn delete_entry_consistency<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.write("keep", "keep-val")?;
    s.write("remove", "remove-val")?;
    s.commit("two entries")?;
    let before = s.count()?;
    ensure!(before == 2, "count {before} after two writes");
    ensure!(
        s.read("remove")?.as_deref() == Some("remove-val"),
        "remove does not read back"
    );
    if !s.delete("remove")? {
        return Ok(Verdict::Skip("fixture has no delete_entry".into()));
    }
    s.commit("delete one")?;
    ensure!(s.count()? == before - 1, "count {} after delete", s.count()?);
    ensure!(s.read("remove")?.is_none(), "deleted entry still readable");
    ensure!(
        s.read("keep")?.as_deref() == Some("keep-val"),
        "untouched entry lost"
    );
    Ok(Verdict::Pass)
}

fn overwrite_entry<F: Fixture>(fx: &F) -> CheckResult {
    let mut s = Session::open(fx)?;
    s.write("key", "original")?;
    s.commit("original value")?;
    let before = s.count()?;
    ensure!(
        s.read("key")?.as_deref() == Some("original"),
        "original value not readable"
    );
    if !s.delete("key")? {
        return Ok(Verdict::Skip("fixture has no delete_entry".into()));
    }
    s.write("key", "updated")?;
    s.commit("updated value")?;
    let got = s.read("key")?;
    ensure!(got.as_deref() == Some("updated"), "read {got:?} after overwrite");
    ensure!(s.count()? == before, "count {} after overwrite, expected {before}", s.count()?);
    Ok(Verdict::Pass)
}
