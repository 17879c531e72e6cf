//! C4 — Job queue engine: pre-allocated job slots per path, claimed with
//! `FOR UPDATE SKIP LOCKED` semantics. See [`JobQueueEngine`] for the contract.

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::GraphStore;
use crate::path::Path;
use crate::query::QueryComposer;
use crate::types::{labels, JobSlot, Json, Node};

/// Persistence contract for the job queue. One table per kb (`<kb>_job`),
/// slots pre-allocated by [`JobQueueEngine::provision`] and never created or
/// destroyed by any other operation — only their column values change.
#[async_trait]
pub trait JobQueueEngine: Send + Sync {
    /// Grow `path`'s slot pool to at least `capacity` free slots. Idempotent:
    /// calling again with an equal or smaller capacity is a no-op.
    async fn provision(&self, path: &Path, capacity: usize) -> Result<()>;

    /// Count of pending-or-leased slots (`valid=true`) for `path`.
    async fn count_queued(&self, path: &Path) -> Result<usize>;

    /// Count of free slots (`valid=false`) for `path`.
    async fn count_free(&self, path: &Path) -> Result<usize>;

    /// Claim the oldest free slot for `path` and populate it with `data`,
    /// transitioning it to pending. Fails with [`crate::error::KbError::NoSlot`]
    /// if the pool is exhausted.
    async fn push(&self, path: &Path, data: Json) -> Result<JobSlot>;

    /// Claim the oldest pending, due slot for `path` (schedule_at null or past),
    /// transitioning it to leased. Returns `None` if no slot is claimable.
    async fn peek_and_claim(&self, path: &Path) -> Result<Option<JobSlot>>;

    /// Complete a leased slot, freeing it. Returns `false` (not an error) if
    /// `id` exists but is not currently leased.
    async fn mark_completed(&self, id: i64) -> Result<bool>;

    /// Paginated read of pending slots for `path`, oldest first.
    async fn list_pending(&self, path: &Path, limit: usize, offset: usize) -> Result<Vec<JobSlot>>;

    /// Paginated read of leased (active) slots for `path`, oldest first.
    async fn list_active(&self, path: &Path, limit: usize, offset: usize) -> Result<Vec<JobSlot>>;

    /// Reset every slot for `path` back to free, clearing `data`.
    async fn clear(&self, path: &Path) -> Result<()>;
}

/// Find nodes labeled as job-queue anchors within `kb`, optionally narrowed by
/// an additional caller-supplied query. Delegates entirely to the graph store;
/// the job queue engine itself never touches the node table.
pub async fn find_job(store: &dyn GraphStore, kb: &str, extra: QueryComposer) -> Result<Vec<Node>> {
    let query = extra.with_kb(kb).with_label(labels::JOB_QUEUE);
    store.find_nodes(kb, &query).await
}
