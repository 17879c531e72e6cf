//! In-memory [`JobQueueEngine`] backend — a `RwLock<Vec<JobSlot>>` per path,
//! mirroring the teacher's `MemoryStore` shape without a real lock manager
//! (single-process mutual exclusion via the lock itself stands in for
//! `FOR UPDATE SKIP LOCKED`).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::JobQueueEngine;
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::types::{JobSlot, Json};

struct Inner {
    slots: HashMap<String, Vec<JobSlot>>,
    next_id: i64,
}

pub struct MemoryJobQueue {
    inner: RwLock<Inner>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner { slots: HashMap::new(), next_id: 1 }),
        }
    }
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueueEngine for MemoryJobQueue {
    async fn provision(&self, path: &Path, capacity: usize) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = path.render();
        let existing = w.slots.get(&key).map(Vec::len).unwrap_or(0);
        let to_add = capacity.saturating_sub(existing);
        let mut new_slots = Vec::with_capacity(to_add);
        for _ in 0..to_add {
            let id = w.next_id;
            w.next_id += 1;
            new_slots.push(JobSlot {
                id,
                path: path.clone(),
                data: serde_json::json!({}),
                schedule_at: None,
                started_at: None,
                completed_at: Some(Utc::now()),
                is_active: false,
                valid: false,
            });
        }
        w.slots.entry(key).or_default().extend(new_slots);
        Ok(())
    }

    async fn count_queued(&self, path: &Path) -> Result<usize> {
        let r = self.inner.read().await;
        Ok(r.slots
            .get(&path.render())
            .map(|slots| slots.iter().filter(|s| s.valid).count())
            .unwrap_or(0))
    }

    async fn count_free(&self, path: &Path) -> Result<usize> {
        let r = self.inner.read().await;
        Ok(r.slots
            .get(&path.render())
            .map(|slots| slots.iter().filter(|s| !s.valid).count())
            .unwrap_or(0))
    }

    async fn push(&self, path: &Path, data: Json) -> Result<JobSlot> {
        let mut w = self.inner.write().await;
        let key = path.render();
        let slots = w.slots.get_mut(&key).ok_or_else(|| KbError::no_slot(format!("no slots provisioned for {path}")))?;

        let target = slots
            .iter_mut()
            .filter(|s| !s.valid)
            .min_by_key(|s| s.completed_at)
            .ok_or_else(|| KbError::no_slot(format!("job pool exhausted for {path}")))?;

        let now = Utc::now();
        target.data = data;
        target.schedule_at = Some(now);
        target.started_at = Some(now);
        target.completed_at = Some(now);
        target.valid = true;
        target.is_active = false;
        Ok(target.clone())
    }

    async fn peek_and_claim(&self, path: &Path) -> Result<Option<JobSlot>> {
        let mut w = self.inner.write().await;
        let key = path.render();
        let Some(slots) = w.slots.get_mut(&key) else { return Ok(None) };

        let now = Utc::now();
        let target = slots
            .iter_mut()
            .filter(|s| s.valid && !s.is_active && s.schedule_at.map(|t| t <= now).unwrap_or(true))
            .min_by_key(|s| s.schedule_at);

        match target {
            None => Ok(None),
            Some(slot) => {
                slot.is_active = true;
                slot.started_at = Some(now);
                Ok(Some(slot.clone()))
            }
        }
    }

    async fn mark_completed(&self, id: i64) -> Result<bool> {
        let mut w = self.inner.write().await;
        for slots in w.slots.values_mut() {
            if let Some(slot) = slots.iter_mut().find(|s| s.id == id) {
                if !slot.is_active {
                    return Ok(false);
                }
                slot.completed_at = Some(Utc::now());
                slot.valid = false;
                slot.is_active = false;
                return Ok(true);
            }
        }
        Err(KbError::not_found(format!("no job slot with id {id}")))
    }

    async fn list_pending(&self, path: &Path, limit: usize, offset: usize) -> Result<Vec<JobSlot>> {
        let r = self.inner.read().await;
        let mut slots: Vec<JobSlot> = r
            .slots
            .get(&path.render())
            .map(|s| s.iter().filter(|s| s.valid && !s.is_active).cloned().collect())
            .unwrap_or_default();
        slots.sort_by_key(|s| s.schedule_at);
        Ok(slots.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_active(&self, path: &Path, limit: usize, offset: usize) -> Result<Vec<JobSlot>> {
        let r = self.inner.read().await;
        let mut slots: Vec<JobSlot> = r
            .slots
            .get(&path.render())
            .map(|s| s.iter().filter(|s| s.is_active).cloned().collect())
            .unwrap_or_default();
        slots.sort_by_key(|s| s.started_at);
        Ok(slots.into_iter().skip(offset).take(limit).collect())
    }

    async fn clear(&self, path: &Path) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(slots) = w.slots.get_mut(&path.render()) {
            for slot in slots.iter_mut() {
                slot.data = serde_json::json!({});
                slot.schedule_at = None;
                slot.started_at = None;
                slot.completed_at = None;
                slot.is_active = false;
                slot.valid = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_fails_without_provision() {
        let q = MemoryJobQueue::new();
        let path = Path::parse("kb1.jobs.worker").unwrap();
        let err = q.push(&path, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, KbError::NoSlot(_)));
    }

    #[tokio::test]
    async fn push_fails_when_pool_exhausted() {
        let q = MemoryJobQueue::new();
        let path = Path::parse("kb1.jobs.worker").unwrap();
        q.provision(&path, 1).await.unwrap();
        q.push(&path, serde_json::json!({"a":1})).await.unwrap();
        let err = q.push(&path, serde_json::json!({"a":2})).await.unwrap_err();
        assert!(matches!(err, KbError::NoSlot(_)));
    }

    /// Scenario A (job round-trip): provision, push, claim, complete.
    #[tokio::test]
    async fn scenario_a_job_round_trip() {
        let q = MemoryJobQueue::new();
        let path = Path::parse("kb1.jobs.worker").unwrap();
        q.provision(&path, 2).await.unwrap();

        assert_eq!(q.count_free(&path).await.unwrap(), 2);
        let pushed = q.push(&path, serde_json::json!({"n": 1})).await.unwrap();
        assert_eq!(q.count_queued(&path).await.unwrap(), 1);

        let claimed = q.peek_and_claim(&path).await.unwrap().unwrap();
        assert_eq!(claimed.id, pushed.id);
        assert!(claimed.is_active);

        assert!(q.peek_and_claim(&path).await.unwrap().is_none());

        let completed = q.mark_completed(claimed.id).await.unwrap();
        assert!(completed);
        assert_eq!(q.count_free(&path).await.unwrap(), 2);
    }

    /// Testable property 4: completing a non-leased slot returns false.
    #[tokio::test]
    async fn mark_completed_on_non_leased_slot_returns_false() {
        let q = MemoryJobQueue::new();
        let path = Path::parse("kb1.jobs.worker").unwrap();
        q.provision(&path, 1).await.unwrap();
        let pushed = q.push(&path, serde_json::json!({})).await.unwrap();
        // pushed but not claimed -> not active
        let result = q.mark_completed(pushed.id).await.unwrap();
        assert!(!result);
    }

    #[tokio::test]
    async fn clear_resets_all_slots() {
        let q = MemoryJobQueue::new();
        let path = Path::parse("kb1.jobs.worker").unwrap();
        q.provision(&path, 2).await.unwrap();
        q.push(&path, serde_json::json!({"x": 1})).await.unwrap();
        q.clear(&path).await.unwrap();
        assert_eq!(q.count_free(&path).await.unwrap(), 2);
        assert_eq!(q.count_queued(&path).await.unwrap(), 0);
    }
}
