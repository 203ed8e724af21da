//! forkline — Copy-on-Write Capability Protocol
//!
//! Snapshot, branch, merge and fork any copy-on-write system through one
//! vocabulary.
//!
//! A thin, engine-agnostic contract for systems with native copy-on-write
//! semantics (version control, CoW filesystems, branching databases):
//! - Layered capabilities: adopt Snapshot alone, or any subset of Branch,
//!   Graph, Merge, Overlay and Watch on top of it
//! - Universal snapshot references ordered by a hybrid logical clock
//! - Overlays: live forks with frozen, following or gated visibility
//! - A conformance harness that defines "implements the protocol"
//! - An in-memory reference adapter built on a content-addressed store
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`hlc`] | Hybrid logical clock and a thread-safe clock source |
//! | [`types`] | `SnapshotRef`, `Capabilities`, `Conflict`, snapshot metadata |
//! | [`error`] | Protocol error taxonomy |
//! | [`config`] | TOML-loadable protocol defaults |
//! | [`protocol`] | The capability layer traits and dynamic capability query |
//! | [`exec`] | Blocking / non-blocking execution of layer operations |
//! | [`graph`] | Ancestry, merge base and history over any commit DAG |
//! | [`merge`] | Key/value diff and three-way merge with conflict detection |
//! | [`store`] | Content-addressed BLAKE3 snapshot store |
//! | [`overlay`] | Overlay state machine and per-system overlay registry |
//! | [`watch`] | Change-notification fan-out, with polling for pull-only engines |
//! | [`memory`] | In-memory reference adapter implementing every layer |
//! | [`harness`] | Conformance harness |
//!
//! # Quick Start
//!
//! ```
//! use forkline::{Branchable, Graphable, MemorySystem, Mergeable, Snapshotable};
//!
//! let sys = MemorySystem::new();
//! sys.write("greeting", "hello");
//! let first = sys.commit("say hello").unwrap();
//!
//! // Fork, diverge, merge back
//! sys.branch("feature", None).unwrap();
//! sys.checkout("feature").unwrap();
//! sys.write("farewell", "bye");
//! sys.commit("say bye").unwrap();
//! sys.checkout("main").unwrap();
//! sys.merge("feature", None, None).unwrap();
//!
//! assert!(sys.is_ancestor(&first, &sys.snapshot_id().unwrap()).unwrap());
//! assert_eq!(sys.read("farewell").unwrap().as_deref(), Some("bye"));
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod graph;
pub mod harness;
pub mod hlc;
pub mod memory;
pub mod merge;
pub mod overlay;
pub mod protocol;
pub mod store;
pub mod types;
pub mod watch;

pub use config::{OverlayConfig, ProtocolConfig, WatchConfig};
pub use error::{ConfigError, ProtocolError, Result};
pub use exec::{ExecOpts, Outcome, Pending};
pub use graph::CommitDag;
pub use harness::{run_conformance, CheckGroup, CheckOutcome, ConformanceReport, Fixture};
pub use hlc::{Hlc, HlcClock};
pub use memory::{EntryDelta, MemoryFixture, MemorySystem, MemoryView};
pub use merge::{EntryOp, MergeResult, MergeStrategy};
pub use overlay::{Overlay, OverlayMode, OverlayRegistry, OverlayStatus, OverlaySummary};
pub use protocol::{
    Branchable, Graphable, Mergeable, Overlayable, Snapshotable, System, SystemIdentity,
    Watchable,
};
pub use store::SnapshotStore;
pub use types::{
    Capabilities, CommitGraph, Conflict, Layer, Opaque, SnapshotId, SnapshotMeta, SnapshotRef,
};
pub use watch::{WatchCallback, WatchEvent, WatchEventKind, WatchId, WatchOpts, WatchRegistry};
