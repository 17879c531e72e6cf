//! Shared record types for the graph, job queue, stream, and RPC fabric tables.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::path::Path;

/// Free-form JSON payload, used for node `data`/`properties`, job/stream slot
/// `data`, and RPC request/response payloads.
pub type Json = serde_json::Value;

/// A node's property bag: string keys to arbitrary JSON values.
pub type Properties = BTreeMap<String, Json>;

/// Standard node `label` tags the rest of the fabric looks for via the query
/// composer. Applications may mint additional labels; these are the ones the
/// core itself cross-references.
pub mod labels {
    pub const JOB_QUEUE: &str = "KB_JOB_QUEUE";
    pub const STREAM_FIELD: &str = "KB_STREAM_FIELD";
    pub const RPC_SERVER_FIELD: &str = "KB_RPC_SERVER_FIELD";
    pub const RPC_CLIENT_FIELD: &str = "KB_RPC_CLIENT_FIELD";
    pub const STATUS_FIELD: &str = "KB_STATUS_FIELD";
}

/// A single node in a knowledge base's tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub kb: String,
    pub label: String,
    pub name: String,
    pub properties: Properties,
    pub data: Json,
    pub path: Path,
    pub has_link: bool,
    pub has_link_mount: bool,
}

/// Input to [`crate::graph::GraphStore::add_node`] — everything but the flags,
/// which the store always initializes to `false`.
#[derive(Clone, Debug)]
pub struct NewNode {
    pub kb: String,
    pub label: String,
    pub name: String,
    pub properties: Properties,
    pub data: Json,
    pub path: Path,
}

/// Target-side edge row: `link_name` is globally unique across the relation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkMount {
    pub link_name: String,
    pub kb: String,
    pub mount_path: Path,
    pub description: Option<String>,
}

/// Source-side edge row.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Link {
    pub link_name: String,
    pub parent_kb: String,
    pub parent_path: Path,
}

// ─── Job queue (C4) ────────────────────────────────────────────

/// A pre-allocated job slot. Lifecycle:
/// `(valid=false, is_active=false)` free → `push` → `(valid=true, is_active=false)`
/// pending → `claim` → `(valid=true, is_active=true)` leased → `complete` → free.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSlot {
    pub id: i64,
    pub path: Path,
    pub data: Json,
    pub schedule_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub valid: bool,
}

// ─── Stream buffer (C5) ────────────────────────────────────────

/// A pre-allocated stream slot in a path's circular buffer.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamSlot {
    pub id: i64,
    pub path: Path,
    pub recorded_at: DateTime<Utc>,
    pub data: Json,
    pub valid: bool,
}

/// Aggregate statistics over a stream path's valid slots.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StreamStatistics {
    pub count: i64,
    pub earliest: Option<DateTime<Utc>>,
    pub latest: Option<DateTime<Utc>>,
    pub avg_interarrival_seconds: Option<f64>,
}

/// Read-order for [`crate::stream::StreamEngine::list`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

// ─── RPC fabric (C6) ───────────────────────────────────────────

/// RPC server slot state. `empty` → `push` → `new_job` → `peek_and_claim` →
/// `processing` → `mark_completion` → `empty`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcServerState {
    Empty,
    NewJob,
    Processing,
}

impl RpcServerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::NewJob => "new_job",
            Self::Processing => "processing",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(Self::Empty),
            "new_job" => Some(Self::NewJob),
            "processing" => Some(Self::Processing),
            _ => None,
        }
    }
}

/// A pre-allocated server-side RPC request slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcServerSlot {
    pub id: i64,
    pub server_path: Path,
    pub request_id: Uuid,
    pub rpc_action: String,
    pub request_payload: Json,
    pub transaction_tag: Option<String>,
    pub priority: i32,
    pub rpc_client_queue: Option<String>,
    pub state: RpcServerState,
    pub request_timestamp: Option<DateTime<Utc>>,
    pub processing_timestamp: Option<DateTime<Utc>>,
    pub completed_timestamp: Option<DateTime<Utc>>,
}

/// Fields a caller supplies to [`crate::rpc::RpcServerQueue::push`]; the store
/// fills in `id`, `state`, and timestamps.
#[derive(Clone, Debug)]
pub struct RpcServerRequest {
    pub request_id: Option<Uuid>,
    pub rpc_action: String,
    pub request_payload: Json,
    pub transaction_tag: Option<String>,
    pub priority: i32,
    pub rpc_client_queue: Option<String>,
}

/// A pre-allocated client-side RPC reply slot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RpcClientSlot {
    pub id: i64,
    pub client_path: Path,
    pub request_id: Uuid,
    pub server_path: String,
    pub rpc_action: String,
    pub transaction_tag: Option<String>,
    pub response_payload: Json,
    pub response_timestamp: Option<DateTime<Utc>>,
    pub is_new_result: bool,
}

/// Fields a caller supplies to [`crate::rpc::RpcClientQueue::push_and_claim_reply`].
#[derive(Clone, Debug)]
pub struct RpcReply {
    pub request_id: Uuid,
    pub server_path: String,
    pub rpc_action: String,
    pub transaction_tag: Option<String>,
    pub reply_data: Json,
}
