//! C6 — RPC fabric: a server-side request queue and a client-side reply queue,
//! joined by `request_id`. See [`RpcServerQueue`] and [`RpcClientQueue`].

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::path::Path;
use crate::types::{RpcClientSlot, RpcReply, RpcServerRequest, RpcServerSlot, RpcServerState};

/// Persistence contract for the server-side RPC request queue. One table per
/// kb (`<kb>_rpc_server`), slots pre-allocated by [`RpcServerQueue::provision`].
#[async_trait]
pub trait RpcServerQueue: Send + Sync {
    /// Grow `server_path`'s slot pool to at least `capacity` slots.
    async fn provision(&self, server_path: &Path, capacity: usize) -> Result<()>;

    /// Claim the `empty` slot ordered by `priority desc, request_timestamp asc`
    /// (never-claimed slots have a null timestamp, which sorts first) and
    /// populate it, transitioning it to `new_job`. A recycled slot freed by
    /// [`RpcServerQueue::mark_completion`] keeps the priority/timestamp from
    /// its last use, so this is a real ordering among empty slots, not just a
    /// tiebreak.
    async fn push(&self, server_path: &Path, request: RpcServerRequest) -> Result<RpcServerSlot>;

    /// Claim the oldest `new_job` slot for `server_path`, ordered by
    /// `priority DESC, request_timestamp ASC`, transitioning it to `processing`.
    async fn peek_and_claim(&self, server_path: &Path) -> Result<Option<RpcServerSlot>>;

    /// Complete a `processing` slot, freeing it. Returns `false` if `id` is not
    /// currently `processing` for `server_path`.
    async fn mark_completion(&self, server_path: &Path, id: i64) -> Result<bool>;

    async fn count_by_state(&self, server_path: &Path, state: RpcServerState) -> Result<usize>;

    async fn list_by_state(&self, server_path: &Path, state: RpcServerState) -> Result<Vec<RpcServerSlot>>;

    /// Reset every slot for `server_path` to `empty`, clearing payload and
    /// assigning a fresh `request_id`.
    async fn clear(&self, server_path: &Path) -> Result<()>;
}

/// Persistence contract for the client-side RPC reply queue. One table per kb
/// (`<kb>_rpc_client`), slots pre-allocated by [`RpcClientQueue::provision`].
#[async_trait]
pub trait RpcClientQueue: Send + Sync {
    /// Grow `client_path`'s slot pool to at least `capacity` slots.
    async fn provision(&self, client_path: &Path, capacity: usize) -> Result<()>;

    /// Occupy the oldest free (`is_new_result=false`) slot for `client_path`
    /// and populate it with `reply`, transitioning it to pending.
    async fn push_and_claim_reply(&self, client_path: &Path, reply: RpcReply) -> Result<RpcClientSlot>;

    /// Claim the oldest pending (`is_new_result=true`) slot for `client_path`,
    /// freeing it and returning its prior contents. `None` if none pending.
    async fn peek_and_claim_reply(&self, client_path: &Path) -> Result<Option<RpcClientSlot>>;

    async fn count_free(&self, client_path: &Path) -> Result<usize>;

    async fn count_queued(&self, client_path: &Path) -> Result<usize>;

    /// All pending slots for `client_path`, oldest first.
    async fn list_waiting(&self, client_path: &Path) -> Result<Vec<RpcClientSlot>>;

    /// Reset every slot for `client_path` to free: fresh `request_id`,
    /// `server_path = client_path`, empty payload, `is_new_result = false`.
    async fn clear(&self, client_path: &Path) -> Result<()>;
}
