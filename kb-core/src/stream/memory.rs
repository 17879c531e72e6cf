//! In-memory [`StreamEngine`] backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{compute_statistics, StreamEngine};
use crate::error::{KbError, Result};
use crate::path::Path;
use crate::types::{Json, SortOrder, StreamSlot, StreamStatistics};

struct Inner {
    slots: HashMap<String, Vec<StreamSlot>>,
    next_id: i64,
}

pub struct MemoryStreamEngine {
    inner: RwLock<Inner>,
}

impl MemoryStreamEngine {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner { slots: HashMap::new(), next_id: 1 }) }
    }
}

impl Default for MemoryStreamEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamEngine for MemoryStreamEngine {
    async fn provision(&self, path: &Path, capacity: usize) -> Result<()> {
        let mut w = self.inner.write().await;
        let key = path.render();
        let existing = w.slots.get(&key).map(Vec::len).unwrap_or(0);
        let to_add = capacity.saturating_sub(existing);
        let mut new_slots = Vec::with_capacity(to_add);
        for _ in 0..to_add {
            let id = w.next_id;
            w.next_id += 1;
            new_slots.push(StreamSlot {
                id,
                path: path.clone(),
                recorded_at: Utc::now(),
                data: serde_json::json!({}),
                valid: false,
            });
        }
        w.slots.entry(key).or_default().extend(new_slots);
        Ok(())
    }

    async fn push(&self, path: &Path, data: Json) -> Result<StreamSlot> {
        let mut w = self.inner.write().await;
        let key = path.render();
        let slots = w
            .slots
            .get_mut(&key)
            .ok_or_else(|| KbError::not_found(format!("no stream slots provisioned for {path}")))?;
        if slots.is_empty() {
            return Err(KbError::not_found(format!("no stream slots provisioned for {path}")));
        }
        let target = slots.iter_mut().min_by_key(|s| s.recorded_at).expect("non-empty");
        target.data = data;
        target.recorded_at = Utc::now();
        target.valid = true;
        Ok(target.clone())
    }

    async fn get_latest(&self, path: &Path) -> Result<Option<StreamSlot>> {
        let r = self.inner.read().await;
        Ok(r.slots
            .get(&path.render())
            .and_then(|slots| slots.iter().filter(|s| s.valid).max_by_key(|s| s.recorded_at))
            .cloned())
    }

    async fn list(
        &self,
        path: &Path,
        limit: usize,
        offset: usize,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
        order: SortOrder,
    ) -> Result<Vec<StreamSlot>> {
        let r = self.inner.read().await;
        let mut slots: Vec<StreamSlot> = r
            .slots
            .get(&path.render())
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| s.valid)
                    .filter(|s| after.map(|a| s.recorded_at > a).unwrap_or(true))
                    .filter(|s| before.map(|b| s.recorded_at < b).unwrap_or(true))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        match order {
            SortOrder::Ascending => slots.sort_by_key(|s| s.recorded_at),
            SortOrder::Descending => slots.sort_by_key(|s| std::cmp::Reverse(s.recorded_at)),
        }
        Ok(slots.into_iter().skip(offset).take(limit).collect())
    }

    async fn range(&self, path: &Path, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StreamSlot>> {
        let r = self.inner.read().await;
        let mut slots: Vec<StreamSlot> = r
            .slots
            .get(&path.render())
            .map(|slots| {
                slots
                    .iter()
                    .filter(|s| s.valid && s.recorded_at >= start && s.recorded_at <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        slots.sort_by_key(|s| s.recorded_at);
        Ok(slots)
    }

    async fn count(&self, path: &Path, include_invalid: bool) -> Result<usize> {
        let r = self.inner.read().await;
        Ok(r.slots
            .get(&path.render())
            .map(|slots| slots.iter().filter(|s| include_invalid || s.valid).count())
            .unwrap_or(0))
    }

    async fn clear(&self, path: &Path, older_than: Option<DateTime<Utc>>) -> Result<()> {
        let mut w = self.inner.write().await;
        if let Some(slots) = w.slots.get_mut(&path.render()) {
            for slot in slots.iter_mut() {
                if older_than.map(|t| slot.recorded_at < t).unwrap_or(true) {
                    slot.valid = false;
                }
            }
        }
        Ok(())
    }

    async fn statistics(&self, path: &Path) -> Result<StreamStatistics> {
        let r = self.inner.read().await;
        let timestamps: Vec<DateTime<Utc>> = r
            .slots
            .get(&path.render())
            .map(|slots| slots.iter().filter(|s| s.valid).map(|s| s.recorded_at).collect())
            .unwrap_or_default();
        Ok(compute_statistics(timestamps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Testable property 5 / Scenario C: pushing more items than capacity
    /// retains only the most recent `S`, newest-first.
    #[tokio::test]
    async fn scenario_c_stream_overwrite_oldest() {
        let engine = MemoryStreamEngine::new();
        let path = Path::parse("kb1.metrics.cpu").unwrap();
        engine.provision(&path, 3).await.unwrap();

        for i in 0..5 {
            engine.push(&path, serde_json::json!({"tick": i})).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        assert_eq!(engine.count(&path, true).await.unwrap(), 3);
        let latest = engine.get_latest(&path).await.unwrap().unwrap();
        assert_eq!(latest.data, serde_json::json!({"tick": 4}));

        let all = engine
            .list(&path, 10, 0, None, None, SortOrder::Descending)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].data, serde_json::json!({"tick": 4}));
        assert_eq!(all[2].data, serde_json::json!({"tick": 2}));
    }

    #[tokio::test]
    async fn push_without_provision_fails() {
        let engine = MemoryStreamEngine::new();
        let path = Path::parse("kb1.metrics.cpu").unwrap();
        let err = engine.push(&path, serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, KbError::NotFound(_)));
    }

    #[tokio::test]
    async fn clear_keeps_recorded_at() {
        let engine = MemoryStreamEngine::new();
        let path = Path::parse("kb1.metrics.cpu").unwrap();
        engine.provision(&path, 1).await.unwrap();
        engine.push(&path, serde_json::json!({"a": 1})).await.unwrap();
        engine.clear(&path, None).await.unwrap();
        assert_eq!(engine.count(&path, false).await.unwrap(), 0);
        assert_eq!(engine.count(&path, true).await.unwrap(), 1);
    }
}
