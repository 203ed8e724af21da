//! State change notification
//!
//! [`WatchRegistry`] is the fan-out an adapter embeds to implement the Watch
//! layer. Adapters with push notification call [`WatchRegistry::emit`] as
//! they mutate; engines that can only be inspected supply a [`HeadSource`]
//! and the registry polls it while at least one watcher is registered.
//!
//! Events of one system reach each watcher in the order they were emitted.
//! Synchronous watchers run on the emitting thread; asynchronous watchers
//! get a dedicated delivery thread fed through a channel.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::WatchConfig;
use crate::error::{ProtocolError, Result};
use crate::hlc::wall_clock_ms;
use crate::types::SnapshotId;

/// Kind of state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEventKind {
    Commit,
    BranchCreated,
    BranchDeleted,
    Checkout,
}

/// One state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub kind: WatchEventKind,
    pub snapshot_id: Option<SnapshotId>,
    pub branch: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, snapshot_id: Option<SnapshotId>, branch: Option<String>) -> Self {
        Self {
            kind,
            snapshot_id,
            branch,
            timestamp: wall_clock_ms(),
        }
    }
}

/// Watch registration handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(String);

impl WatchId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Callback invoked for each event.
pub type WatchCallback = Arc<dyn Fn(&WatchEvent) + Send + Sync>;

/// Registration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchOpts {
    /// Deliver on the emitting thread. Default: true.
    pub sync: bool,
    /// Poll period when the registry polls a head source. Default: 1000.
    pub poll_interval_ms: u64,
}

impl Default for WatchOpts {
    fn default() -> Self {
        Self::from(&WatchConfig::default())
    }
}

impl From<&WatchConfig> for WatchOpts {
    fn from(config: &WatchConfig) -> Self {
        Self {
            sync: config.sync,
            poll_interval_ms: config.poll_interval_ms,
        }
    }
}

impl WatchOpts {
    pub fn asynchronous() -> Self {
        Self {
            sync: false,
            ..Self::default()
        }
    }
}

// ── Polling ────────────────────────────────────────────────────────────

/// Branch heads as seen by one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadState {
    pub current_branch: Option<String>,
    pub heads: BTreeMap<String, SnapshotId>,
}

/// Inspection hook for engines without push notification.
pub type HeadSource = Arc<dyn Fn() -> Result<HeadState> + Send + Sync>;

/// Events that explain the move from `prev` to `next`.
///
/// Order: deletions, creations, head moves, then a checkout.
pub fn diff_states(prev: &HeadState, next: &HeadState) -> Vec<WatchEvent> {
    let mut events = Vec::new();

    for (branch, head) in &prev.heads {
        if !next.heads.contains_key(branch) {
            events.push(WatchEvent::new(
                WatchEventKind::BranchDeleted,
                Some(head.clone()),
                Some(branch.clone()),
            ));
        }
    }
    for (branch, head) in &next.heads {
        if !prev.heads.contains_key(branch) {
            events.push(WatchEvent::new(
                WatchEventKind::BranchCreated,
                Some(head.clone()),
                Some(branch.clone()),
            ));
        }
    }
    for (branch, head) in &next.heads {
        match prev.heads.get(branch) {
            Some(old) if old != head => events.push(WatchEvent::new(
                WatchEventKind::Commit,
                Some(head.clone()),
                Some(branch.clone()),
            )),
            _ => {}
        }
    }
    if next.current_branch != prev.current_branch {
        if let Some(branch) = &next.current_branch {
            events.push(WatchEvent::new(
                WatchEventKind::Checkout,
                next.heads.get(branch).cloned(),
                Some(branch.clone()),
            ));
        }
    }

    events
}

/// Background poll loop; stops when `stop` is dropped.
struct Poller {
    _stop: Sender<()>,
}

impl Poller {
    /// Changes are reported relative to `baseline`.
    fn start(shared: Weak<Shared>, source: HeadSource, baseline: HeadState, interval: Duration) -> Self {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(0);
        let spawned = thread::Builder::new()
            .name("forkline-watch-poll".into())
            .spawn(move || poll_loop(shared, source, baseline, interval, stopped));
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "failed to start watch poller");
        }
        Self { _stop: stop }
    }
}

fn poll_loop(
    shared: Weak<Shared>,
    source: HeadSource,
    mut prev: HeadState,
    interval: Duration,
    stopped: Receiver<()>,
) {
    loop {
        match stopped.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        match source() {
            Ok(next) => {
                for event in diff_states(&prev, &next) {
                    shared.enqueue(event);
                }
                shared.flush();
                prev = next;
            }
            Err(e) => tracing::warn!(error = %e, "watch head poll failed"),
        }
    }
    tracing::debug!("watch poller stopped");
}

// ── Registry ───────────────────────────────────────────────────────────

#[derive(Clone)]
enum Delivery {
    Inline(WatchCallback),
    Channel(Sender<WatchEvent>),
}

struct Shared {
    watchers: Mutex<BTreeMap<WatchId, Delivery>>,
    queue: Mutex<VecDeque<WatchEvent>>,
    delivering: Mutex<()>,
    source: Mutex<Option<HeadSource>>,
    poller: Mutex<Option<Poller>>,
}

impl Shared {
    fn enqueue(&self, event: WatchEvent) {
        if self.watchers.lock().is_empty() {
            return;
        }
        self.queue.lock().push_back(event);
    }

    /// Deliver queued events in order. Only one thread delivers at a time;
    /// a nested or concurrent flush leaves its events to the active one.
    fn flush(&self) {
        loop {
            let Some(guard) = self.delivering.try_lock() else {
                return;
            };
            loop {
                let Some(event) = self.queue.lock().pop_front() else {
                    break;
                };
                let targets: Vec<Delivery> = self.watchers.lock().values().cloned().collect();
                for target in targets {
                    deliver(&target, &event);
                }
            }
            drop(guard);
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }
}

fn deliver(target: &Delivery, event: &WatchEvent) {
    match target {
        Delivery::Inline(callback) => {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                tracing::warn!(kind = ?event.kind, "watch callback panicked");
            }
        }
        Delivery::Channel(tx) => {
            if tx.send(event.clone()).is_err() {
                tracing::warn!(kind = ?event.kind, "watch delivery thread gone, event dropped");
            }
        }
    }
}

fn spawn_delivery(callback: WatchCallback) -> Result<Sender<WatchEvent>> {
    let (tx, rx) = crossbeam_channel::unbounded::<WatchEvent>();
    thread::Builder::new()
        .name("forkline-watch".into())
        .spawn(move || {
            for event in rx.iter() {
                if panic::catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    tracing::warn!(kind = ?event.kind, "watch callback panicked");
                }
            }
        })
        .map_err(|e| ProtocolError::underlying("failed to spawn watch delivery thread", e))?;
    Ok(tx)
}

/// Watcher fan-out owned by a watchable system. Clones share watchers.
#[derive(Clone)]
pub struct WatchRegistry {
    shared: Arc<Shared>,
}

impl Default for WatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("watchers", &self.len())
            .field("polling", &self.is_polling())
            .finish()
    }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                watchers: Mutex::new(BTreeMap::new()),
                queue: Mutex::new(VecDeque::new()),
                delivering: Mutex::new(()),
                source: Mutex::new(None),
                poller: Mutex::new(None),
            }),
        }
    }

    /// Registry that polls `source` while watchers are registered.
    pub fn polling(source: HeadSource) -> Self {
        let registry = Self::new();
        *registry.shared.source.lock() = Some(source);
        registry
    }

    /// Registration fails, leaving nothing registered, if a polling
    /// registry cannot read the baseline state for its first watcher.

    pub fn register(&self, callback: WatchCallback, opts: WatchOpts) -> Result<WatchId> {
        let delivery = if opts.sync {
            Delivery::Inline(callback)
        } else {
            Delivery::Channel(spawn_delivery(callback)?)
        };

        let id = WatchId::generate();
        let first = {
            let mut watchers = self.shared.watchers.lock();
            watchers.insert(id.clone(), delivery);
            watchers.len() == 1
        };

        if first {
            if let Some(source) = self.shared.source.lock().clone() {
                let baseline = match source() {
                    Ok(state) => state,
                    Err(e) => {
                        self.shared.watchers.lock().remove(&id);
                        tracing::warn!(error = %e, "watch baseline unavailable");
                        return Err(e);
                    }
                };
                let interval = Duration::from_millis(opts.poll_interval_ms.max(1));
                *self.shared.poller.lock() = Some(Poller::start(
                    Arc::downgrade(&self.shared),
                    source,
                    baseline,
                    interval,
                ));
                tracing::debug!(interval_ms = opts.poll_interval_ms, "watch poller started");
            }
        }
        tracing::debug!(watch_id = %id, sync = opts.sync, "watcher registered");
        Ok(id)
    }

    /// Remove a watcher. The last removal stops polling; an async
    /// watcher's delivery thread exits once its queue drains.
    pub fn unregister(&self, id: &WatchId) -> Result<()> {
        let now_empty = {
            let mut watchers = self.shared.watchers.lock();
            if watchers.remove(id).is_none() {
                return Err(ProtocolError::not_found(format!("watch {id}")));
            }
            watchers.is_empty()
        };
        if now_empty {
            self.shared.poller.lock().take();
            self.shared.queue.lock().clear();
        }
        tracing::debug!(watch_id = %id, "watcher removed");
        Ok(())
    }

    /// Queue an event without delivering. Pair with [`flush`](Self::flush)
    /// once engine locks are released.
    pub fn enqueue(&self, event: WatchEvent) {
        self.shared.enqueue(event);
    }

    pub fn flush(&self) {
        self.shared.flush();
    }

    pub fn emit(&self, event: WatchEvent) {
        self.enqueue(event);
        self.flush();
    }

    pub fn len(&self) -> usize {
        self.shared.watchers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_polling(&self) -> bool {
        self.shared.poller.lock().is_some()
    }
}
