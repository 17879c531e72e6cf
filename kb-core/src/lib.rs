//! Core persistence fabric for a hierarchical knowledge base: a path-addressed
//! node graph (C2/C3), a durable job queue (C4), a durable stream buffer (C5),
//! and a bidirectional RPC fabric (C6), all built on pre-allocated fixed-
//! capacity slot tables with row-level `SKIP LOCKED`/`NOWAIT` concurrency.
//!
//! Every component ships two backends behind the same trait: an in-memory one
//! for tests and single-process use, and (with the `postgres` feature) a
//! PostgreSQL one for durable multi-process deployments.

pub mod error;
pub mod graph;
pub mod job_queue;
pub mod lock_key;
pub mod path;
pub mod provision;
pub mod query;
pub mod retry;
pub mod rpc;
pub mod stream;
pub mod types;

pub use error::{KbError, Result};
pub use path::{Path, PathPattern};
