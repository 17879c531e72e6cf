//! In-memory [`RpcServerQueue`] / [`RpcClientQueue`] backends.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{RpcClientQueue, RpcServerQueue};
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::types::{RpcClientSlot, RpcReply, RpcServerRequest, RpcServerSlot, RpcServerState};

struct ServerInner {
    slots: HashMap<String, Vec<RpcServerSlot>>,
    next_id: i64,
}

pub struct MemoryRpcServerQueue {
    inner: RwLock<ServerInner>,
}

impl MemoryRpcServerQueue {
    pub fn new() -> Self {
        Self { inner: RwLock::new(ServerInner { slots: HashMap::new(), next_id: 1 }) }
    }
}

impl Default for MemoryRpcServerQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcServerQueue for MemoryRpcServerQueue {
    async fn provision(&self, server_path: &Path, capacity: usize) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = server_path.render();
        let existing = w.slots.get(&key).map(Vec::len).unwrap_or(0);
        let to_add = capacity.saturating_sub(existing);
        let mut new_slots = Vec::with_capacity(to_add);
        for _ in 0..to_add {
            let id = w.next_id;
            w.next_id += 1;
            new_slots.push(RpcServerSlot {
                id,
                server_path: server_path.clone(),
                request_id: Uuid::new_v4(),
                rpc_action: String::new(),
                request_payload: serde_json::json!({}),
                transaction_tag: None,
                priority: 0,
                rpc_client_queue: None,
                state: RpcServerState::Empty,
                request_timestamp: None,
                processing_timestamp: None,
                completed_timestamp: None,
            });
        }
        w.slots.entry(key).or_default().extend(new_slots);
        Ok(())
    }

    async fn push(&self, server_path: &Path, request: RpcServerRequest) -> Result<RpcServerSlot> {
        let mut w = self.inner.write().await;
        let key = server_path.render();
        let slots = w
            .slots
            .get_mut(&key)
            .ok_or_else(|| KbError::no_slot(format!("no rpc server slots provisioned for {server_path}")))?;

        // Empty slots, ordered by priority desc then request_timestamp asc
        // (never-claimed slots have `request_timestamp = None`, which sorts
        // first) — a recycled slot still carries its prior priority/timestamp
        // until repopulated below, so freshly-emptied and never-used slots are
        // not generally tied.
        let target = slots
            .iter_mut()
            .filter(|s| s.state == RpcServerState::Empty)
            .min_by_key(|s| (std::cmp::Reverse(s.priority), s.request_timestamp))
            .ok_or_else(|| KbError::no_slot(format!("rpc server pool exhausted for {server_path}")))?;

        target.request_id = request.request_id.unwrap_or_else(Uuid::new_v4);
        target.rpc_action = request.rpc_action;
        target.request_payload = request.request_payload;
        target.transaction_tag = request.transaction_tag;
        target.priority = request.priority;
        target.rpc_client_queue = request.rpc_client_queue;
        target.state = RpcServerState::NewJob;
        target.request_timestamp = Some(Utc::now());
        target.completed_timestamp = None;
        Ok(target.clone())
    }

    async fn peek_and_claim(&self, server_path: &Path) -> Result<Option<RpcServerSlot>> {
        let mut w = self.inner.write().await;
        let Some(slots) = w.slots.get_mut(&server_path.render()) else { return Ok(None) };

        let target = slots
            .iter_mut()
            .filter(|s| s.state == RpcServerState::NewJob)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.request_timestamp.cmp(&a.request_timestamp))
            });

        match target {
            None => Ok(None),
            Some(slot) => {
                slot.state = RpcServerState::Processing;
                slot.processing_timestamp = Some(Utc::now());
                Ok(Some(slot.clone()))
            }
        }
    }

    async fn mark_completion(&self, server_path: &Path, id: i64) -> Result<bool> {
        let mut w = self.inner.write().await;
        let Some(slots) = w.slots.get_mut(&server_path.render()) else {
            return Err(KbError::not_found(format!("no rpc server slots for {server_path}")));
        };
        let Some(slot) = slots.iter_mut().find(|s| s.id == id) else {
            return Err(KbError::not_found(format!("no rpc server slot with id {id}")));
        };
        if slot.state != RpcServerState::Processing {
            return Ok(false);
        }
        slot.state = RpcServerState::Empty;
        slot.completed_timestamp = Some(Utc::now());
        Ok(true)
    }

    async fn count_by_state(&self, server_path: &Path, state: RpcServerState) -> Result<usize> {
        let r = self.inner.read().await;
        Ok(r.slots
            .get(&server_path.render())
            .map(|slots| slots.iter().filter(|s| s.state == state).count())
            .unwrap_or(0))
    }

    async fn list_by_state(&self, server_path: &Path, state: RpcServerState) -> Result<Vec<RpcServerSlot>> {
        let r = self.inner.read().await;
        let mut slots: Vec<RpcServerSlot> = r
            .slots
            .get(&server_path.render())
            .map(|slots| slots.iter().filter(|s| s.state == state).cloned().collect())
            .unwrap_or_default();
        slots.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| a.request_timestamp.cmp(&b.request_timestamp))
        });
        Ok(slots)
    }

    async fn clear(&self, server_path: &Path) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(slots) = w.slots.get_mut(&server_path.render()) {
            for slot in slots.iter_mut() {
                slot.request_id = Uuid::new_v4();
                slot.rpc_action = String::new();
                slot.request_payload = serde_json::json!({});
                slot.transaction_tag = None;
                slot.priority = 0;
                slot.rpc_client_queue = None;
                slot.state = RpcServerState::Empty;
                slot.request_timestamp = None;
                slot.processing_timestamp = None;
                slot.completed_timestamp = None;
            }
        }
        Ok(())
    }
}

struct ClientInner {
    slots: HashMap<String, Vec<RpcClientSlot>>,
    next_id: i64,
}

pub struct MemoryRpcClientQueue {
    inner: RwLock<ClientInner>,
}

impl MemoryRpcClientQueue {
    pub fn new() -> Self {
        Self { inner: RwLock::new(ClientInner { slots: HashMap::new(), next_id: 1 }) }
    }
}

impl Default for MemoryRpcClientQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RpcClientQueue for MemoryRpcClientQueue {
    async fn provision(&self, client_path: &Path, capacity: usize) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = client_path.render();
        let existing = w.slots.get(&key).map(Vec::len).unwrap_or(0);
        let to_add = capacity.saturating_sub(existing);
        let mut new_slots = Vec::with_capacity(to_add);
        for _ in 0..to_add {
            let id = w.next_id;
            w.next_id += 1;
            new_slots.push(RpcClientSlot {
                id,
                client_path: client_path.clone(),
                request_id: Uuid::new_v4(),
                server_path: client_path.render(),
                rpc_action: String::new(),
                transaction_tag: None,
                response_payload: serde_json::json!({}),
                response_timestamp: Some(Utc::now()),
                is_new_result: false,
            });
        }
        w.slots.entry(key).or_default().extend(new_slots);
        Ok(())
    }

    async fn push_and_claim_reply(&self, client_path: &Path, reply: RpcReply) -> Result<RpcClientSlot> {
        let mut w = self.inner.write().await;
        let key = client_path.render();
        let slots = w
            .slots
            .get_mut(&key)
            .ok_or_else(|| KbError::no_slot(format!("no rpc client slots provisioned for {client_path}")))?;

        let target = slots
            .iter_mut()
            .filter(|s| !s.is_new_result)
            .min_by_key(|s| s.response_timestamp)
            .ok_or_else(|| KbError::no_slot(format!("rpc client pool exhausted for {client_path}")))?;

        target.request_id = reply.request_id;
        target.server_path = reply.server_path;
        target.rpc_action = reply.rpc_action;
        target.transaction_tag = reply.transaction_tag;
        target.response_payload = reply.reply_data;
        target.response_timestamp = Some(Utc::now());
        target.is_new_result = true;
        Ok(target.clone())
    }

    async fn peek_and_claim_reply(&self, client_path: &Path) -> Result<Option<RpcClientSlot>> {
        let mut w = self.inner.write().await;
        let Some(slots) = w.slots.get_mut(&client_path.render()) else { return Ok(None) };

        let target = slots
            .iter_mut()
            .filter(|s| s.is_new_result)
            .min_by_key(|s| s.response_timestamp);

        match target {
            None => Ok(None),
            Some(slot) => {
                let result = slot.clone();
                slot.is_new_result = false;
                Ok(Some(result))
            }
        }
    }

    async fn count_free(&self, client_path: &Path) -> Result<usize> {
        let r = self.inner.read().await;
        let slots = r
            .slots
            .get(&client_path.render())
            .ok_or_else(|| KbError::not_found(format!("no rpc client slots for {client_path}")))?;
        Ok(slots.iter().filter(|s| !s.is_new_result).count())
    }

    async fn count_queued(&self, client_path: &Path) -> Result<usize> {
        let r = self.inner.read().await;
        let slots = r
            .slots
            .get(&client_path.render())
            .ok_or_else(|| KbError::not_found(format!("no rpc client slots for {client_path}")))?;
        Ok(slots.iter().filter(|s| s.is_new_result).count())
    }

    async fn list_waiting(&self, client_path: &Path) -> Result<Vec<RpcClientSlot>> {
        let r = self.inner.read().await;
        let mut slots: Vec<RpcClientSlot> = r
            .slots
            .get(&client_path.render())
            .map(|slots| slots.iter().filter(|s| s.is_new_result).cloned().collect())
            .unwrap_or_default();
        slots.sort_by_key(|s| s.response_timestamp);
        Ok(slots)
    }

    async fn clear(&self, client_path: &Path) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(slots) = w.slots.get_mut(&client_path.render()) {
            for slot in slots.iter_mut() {
                slot.request_id = Uuid::new_v4();
                slot.server_path = client_path.render();
                slot.response_payload = serde_json::json!({});
                slot.response_timestamp = Some(Utc::now());
                slot.is_new_result = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Testable property 6: priorities [1,3,2,3] claim in order [3,3,2,1] with
    /// FIFO tiebreak among equal priorities.
    #[tokio::test]
    async fn scenario_b_rpc_priority_ordering() {
        let server = MemoryRpcServerQueue::new();
        let path = Path::parse("kb1.rpc.worker").unwrap();
        server.provision(&path, 4).await.unwrap();

        for priority in [1, 3, 2, 3] {
            server
                .push(
                    &path,
                    RpcServerRequest {
                        request_id: None,
                        rpc_action: "act".to_string(),
                        request_payload: serde_json::json!({}),
                        transaction_tag: None,
                        priority,
                        rpc_client_queue: None,
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut claimed_priorities = Vec::new();
        while let Some(slot) = server.peek_and_claim(&path).await.unwrap() {
            claimed_priorities.push(slot.priority);
        }
        assert_eq!(claimed_priorities, vec![3, 3, 2, 1]);
    }

    /// Scenario D / property 7: client replies claimed in FIFO order.
    #[tokio::test]
    async fn scenario_d_client_reply_fifo() {
        let client = MemoryRpcClientQueue::new();
        let path = Path::parse("kb1.rpc.caller").unwrap();
        client.provision(&path, 3).await.unwrap();

        for i in 0..3 {
            client
                .push_and_claim_reply(
                    &path,
                    RpcReply {
                        request_id: Uuid::new_v4(),
                        server_path: "kb1.rpc.worker".to_string(),
                        rpc_action: "act".to_string(),
                        transaction_tag: None,
                        reply_data: serde_json::json!({"n": i}),
                    },
                )
                .await
                .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let mut order = Vec::new();
        while let Some(slot) = client.peek_and_claim_reply(&path).await.unwrap() {
            order.push(slot.response_payload["n"].as_i64().unwrap());
        }
        assert_eq!(order, vec![0, 1, 2]);
    }

    /// §4.6.1 step 2: `push` selects among empty slots by `priority desc,
    /// request_timestamp asc`, not insertion order — a recycled slot that
    /// still carries a high stale `priority` outranks a never-used slot with
    /// a lower id.
    #[tokio::test]
    async fn push_orders_empty_slots_by_stale_priority_not_id() {
        let server = MemoryRpcServerQueue::new();
        let path = Path::parse("kb1.rpc.worker").unwrap();
        server.provision(&path, 3).await.unwrap();

        let request = |priority| RpcServerRequest {
            request_id: None,
            rpc_action: "act".to_string(),
            request_payload: serde_json::json!({}),
            transaction_tag: None,
            priority,
            rpc_client_queue: None,
        };

        // Cycle the first-provisioned (lowest-id) slot through a high
        // priority and back to empty, leaving it stamped priority=5 while
        // the other two slots remain untouched (priority=0, timestamp=None).
        let recycled = server.push(&path, request(5)).await.unwrap();
        let claimed = server.peek_and_claim(&path).await.unwrap().unwrap();
        assert_eq!(claimed.id, recycled.id);
        server.mark_completion(&path, claimed.id).await.unwrap();

        let pushed = server.push(&path, request(1)).await.unwrap();
        assert_eq!(
            pushed.id, recycled.id,
            "stale priority 5 empty slot should win over untouched priority 0 slots"
        );
    }

    #[tokio::test]
    async fn mark_completion_rejects_non_processing_slot() {
        let server = MemoryRpcServerQueue::new();
        let path = Path::parse("kb1.rpc.worker").unwrap();
        server.provision(&path, 1).await.unwrap();
        let slot = server
            .push(
                &path,
                RpcServerRequest {
                    request_id: None,
                    rpc_action: "act".to_string(),
                    request_payload: serde_json::json!({}),
                    transaction_tag: None,
                    priority: 0,
                    rpc_client_queue: None,
                },
            )
            .await
            .unwrap();
        // not yet claimed -> not processing
        let result = server.mark_completion(&path, slot.id).await.unwrap();
        assert!(!result);
    }
}
