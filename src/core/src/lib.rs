//! # Chain Engine
//!
//! The chain engine executes declarative task chains: ordered templates of
//! typed tasks that collect, transform, and report on structured records.
//!
//! This crate, `chain-core`, provides the small, stable seam every task kind
//! is built against:
//!
//! * [`TaskMethod`] – the trait a task kind implements to do its actual work.
//! * [`Context`] – a workspace shared across every task method invoked by a
//!   single chain run, currently a temporary directory on disk.
//!
//! Everything else – the record model, matching grammar, variable
//! interpolation, the task lifecycle and chain driver, the worker pool, and
//! the status silo adapter – lives in `chain-engine`, which depends on this
//! crate. Concrete task kinds (shell commands, dataset transforms, and so on)
//! live in `chain-tasks` and implement [`TaskMethod`].

#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::pedantic,
    rust_2018_idioms,
    warnings
)]
#![allow(clippy::multiple_crate_versions)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::{error, fmt, io, path};
use tempfile::{tempdir, TempDir};

/// The trait every task kind implements to perform its actual work.
///
/// A `TaskMethod` is handed a [`Context`] (the shared workspace for the
/// current chain run) and returns whatever structured result it produced, or
/// an error describing why it could not.
///
/// Unlike the chain engine's lifecycle (retry, `on:` directives, result
/// publication), a `TaskMethod` implementation is purely about the unit of
/// work itself: cloning a repository, running a shell command, filtering a
/// dataset. The engine wraps every `TaskMethod` invocation with retry,
/// templating, and status bookkeeping.
pub trait TaskMethod: fmt::Debug {
    /// The human-formatted name of the task kind, used to register it and to
    /// identify it in diagnostics.
    const NAME: &'static str;

    /// If a task method fails, the returned error is recorded in the task's
    /// `meta.Errors` list and is subject to the task's retry policy.
    type Error: error::Error;

    /// The output of a task method is serialized into the chain's shared
    /// variables (via `result_as`) or into the final chain result.
    type Output: serde::Serialize;

    /// Runs the task, performing whatever side effect is defined by this
    /// specific task kind.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` when the task cannot complete its work. The
    /// chain engine decides, based on the task's retry policy, whether to
    /// attempt the method again.
    fn run(&mut self, context: &Context) -> Result<Self::Output, Self::Error>;

    /// Used by the chain engine to validate a task's configuration before
    /// running it. The default implementation always succeeds.
    ///
    /// # Errors
    ///
    /// Returns `Self::Error` if the configuration is invalid.
    fn validate(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Shared workspace for every task run during a single chain execution.
///
/// Currently this provides a temporary directory on the local file system,
/// so that tasks which shell out to external tools (git, a build system, a
/// formatter) have somewhere to work that is cleaned up once the chain
/// completes. It also carries the chain's cooperative cancellation flag, so
/// that long-running task methods (a delay, a poll loop) can check it
/// without needing their own back-reference to the chain.
#[derive(Debug)]
pub struct Context {
    workspace: TempDir,
    cancelled: Arc<AtomicBool>,
}

impl Context {
    /// Creates a new `Context`, allocating a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns [`ContextError::Io`] if the temporary directory cannot be
    /// created.
    pub fn new() -> Result<Self, ContextError> {
        Ok(Self {
            workspace: tempdir()?,
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Returns the path to the shared workspace directory.
    pub fn workspace_path(&self) -> &path::Path {
        self.workspace.path()
    }

    /// True once the owning chain has requested cooperative termination.
    ///
    /// Task methods that loop or sleep for longer than a brief, bounded
    /// interval should check this between iterations and return promptly
    /// when it becomes true, rather than polling any other state.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns a handle that can flip [`Context::is_cancelled`] to `true` from
    /// another thread, independent of this `Context`'s ownership.
    pub fn cancellation_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }
}

/// Represents all the ways a [`Context`] can fail to be constructed.
///
/// Not intended to be exhaustively matched; new variants may be added
/// without a major version bump.
#[derive(Debug)]
pub enum ContextError {
    /// An error occurred while creating the workspace directory.
    Io(io::Error),

    #[doc(hidden)]
    __Unknown,
}

impl fmt::Display for ContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ContextError::Io(ref err) => write!(f, "IO error: {}", err),
            ContextError::__Unknown => unreachable!(),
        }
    }
}

impl error::Error for ContextError {
    fn cause(&self) -> Option<&dyn error::Error> {
        match *self {
            ContextError::Io(ref err) => Some(err),
            ContextError::__Unknown => unreachable!(),
        }
    }
}

impl From<io::Error> for ContextError {
    fn from(err: io::Error) -> Self {
        ContextError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_new_creates_a_workspace_dir() {
        let context = Context::new().unwrap();
        assert!(context.workspace_path().is_dir());
    }

    #[test]
    fn cancellation_handle_is_observed_through_is_cancelled() {
        let context = Context::new().unwrap();
        assert!(!context.is_cancelled());

        let handle = context.cancellation_handle();
        handle.store(true, Ordering::SeqCst);

        assert!(context.is_cancelled());
    }
}
