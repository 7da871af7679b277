//! # chain-engine
//!
//! The engine that drives a declarative task chain: the record model and
//! matching grammar records are queried with, variable interpolation, the
//! task lifecycle (retry, `when`, `on:` directives, result publication),
//! the chain driver itself, the non-blocking task pool, and the adapter to
//! an external status-publication silo.
//!
//! Concrete task kinds implement [`chain_core::TaskMethod`] (or the
//! lower-level [`registry::TaskBody`] this crate's [`task::Task`] actually
//! holds) and live in `chain-tasks`; this crate only needs them registered
//! in a [`registry::Registry`] by name.

#![deny(
    clippy::all,
    clippy::cargo,
    clippy::nursery,
    clippy::pedantic,
    rust_2018_idioms,
    warnings
)]
#![allow(clippy::multiple_crate_versions)]

pub mod chain;
pub mod dataset;
pub mod env;
pub mod error;
pub mod filter;
pub mod interpolate;
pub mod matching;
pub mod pool;
pub mod record;
pub mod registry;
pub mod silo;
pub mod status;
pub mod task;

pub use chain::{Chain, ChainConfig};
pub use env::Environment;
pub use error::ChainError;
pub use record::WalkableDict;
pub use registry::{MethodAdapter, Registry, TaskBody};
pub use silo::{MemorySilo, StatusRecord, StatusSilo};
pub use status::Status;
pub use task::Task;
