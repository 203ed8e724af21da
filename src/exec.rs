//! Blocking and non-blocking call execution
//!
//! Calls are synchronous by default. With `sync = false` the operation runs
//! on a clone of the system handle on a worker thread and the caller gets a
//! [`Pending`] back. Dropping a `Pending` abandons it: nothing happens beyond
//! what the backing engine already committed.

use std::thread::{self, JoinHandle};

use crate::error::{ProtocolError, Result};

/// Execution control for a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOpts {
    /// Block and return the value directly. Default: true.
    pub sync: bool,
}

impl Default for ExecOpts {
    fn default() -> Self {
        Self { sync: true }
    }
}

impl ExecOpts {
    pub const fn blocking() -> Self {
        Self { sync: true }
    }

    pub const fn non_blocking() -> Self {
        Self { sync: false }
    }
}

/// Handle to a call running on a worker thread.
#[derive(Debug)]
pub struct Pending<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> Pending<T> {
    /// Block until the call finishes.
    pub fn wait(self) -> Result<T> {
        match self.handle.join() {
            Ok(result) => result,
            Err(_) => Err(ProtocolError::Underlying {
                message: "pending call panicked".to_string(),
                source: None,
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Result of [`run`]: a direct value or a pending handle.
#[derive(Debug)]
pub enum Outcome<T> {
    Ready(Result<T>),
    Pending(Pending<T>),
}

impl<T> Outcome<T> {
    /// Resolve either variant to its value.
    pub fn wait(self) -> Result<T> {
        match self {
            Outcome::Ready(result) => result,
            Outcome::Pending(pending) => pending.wait(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Outcome::Pending(_))
    }
}

/// Run `op` against `system` honouring `opts.sync`.
pub fn run<S, T, F>(system: &S, opts: ExecOpts, op: F) -> Outcome<T>
where
    S: Clone + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&S) -> Result<T> + Send + 'static,
{
    if opts.sync {
        return Outcome::Ready(op(system));
    }
    let handle = system.clone();
    Outcome::Pending(Pending {
        handle: thread::spawn(move || op(&handle)),
    })
}
