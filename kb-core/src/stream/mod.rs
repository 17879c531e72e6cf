//! C5 — Stream engine: a per-path circular buffer of pre-allocated slots.
//! Writes always overwrite the globally-oldest slot, valid or not. See
//! [`StreamEngine`] for the contract.

#[cfg(feature = "postgres")]
pub mod postgres;

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::path::Path;
use crate::types::{Json, SortOrder, StreamSlot, StreamStatistics};

/// Persistence contract for the stream buffer. One table per kb (`<kb>_stream`),
/// slots pre-allocated by [`StreamEngine::provision`].
#[async_trait]
pub trait StreamEngine: Send + Sync {
    /// Grow `path`'s slot pool to at least `capacity` slots.
    async fn provision(&self, path: &Path, capacity: usize) -> Result<()>;

    /// Overwrite the oldest slot (by `recorded_at`, ignoring `valid`) for `path`
    /// with `data`, stamping a fresh `recorded_at` and `valid=true`. Fails with
    /// [`crate::error::KbError::NotFound`] if `path` has zero slots provisioned.
    async fn push(&self, path: &Path, data: Json) -> Result<StreamSlot>;

    /// The most recently recorded valid slot for `path`, if any.
    async fn get_latest(&self, path: &Path) -> Result<Option<StreamSlot>>;

    /// Paginated, valid-only window over `path`'s slots.
    async fn list(
        &self,
        path: &Path,
        limit: usize,
        offset: usize,
        after: Option<DateTime<Utc>>,
        before: Option<DateTime<Utc>>,
        order: SortOrder,
    ) -> Result<Vec<StreamSlot>>;

    /// Inclusive `[start, end]` window over valid slots, ascending.
    async fn range(&self, path: &Path, start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Vec<StreamSlot>>;

    /// Slot count for `path`; `include_invalid` controls whether free slots count.
    async fn count(&self, path: &Path, include_invalid: bool) -> Result<usize>;

    /// Soft-clear: sets `valid=false` on matching rows without resetting
    /// `recorded_at`, so a just-cleared row remains eligible as the next
    /// overwrite target exactly when it is the oldest in the pool.
    async fn clear(&self, path: &Path, older_than: Option<DateTime<Utc>>) -> Result<()>;

    /// Aggregate statistics (count, earliest/latest, average inter-arrival) over
    /// `path`'s valid slots.
    async fn statistics(&self, path: &Path) -> Result<StreamStatistics>;
}

/// Compute [`StreamStatistics`] from a set of valid slots' `recorded_at` values,
/// shared by both backends so the aggregation logic is defined once.
pub fn compute_statistics(mut timestamps: Vec<DateTime<Utc>>) -> StreamStatistics {
    timestamps.sort();
    if timestamps.is_empty() {
        return StreamStatistics { count: 0, earliest: None, latest: None, avg_interarrival_seconds: None };
    }
    let count = timestamps.len();
    let earliest = timestamps.first().copied();
    let latest = timestamps.last().copied();
    let avg_interarrival_seconds = if count >= 2 {
        let span = (latest.unwrap() - earliest.unwrap()).num_milliseconds() as f64 / 1000.0;
        Some(span / (count - 1) as f64)
    } else {
        None
    };
    StreamStatistics { count: count as i64, earliest, latest, avg_interarrival_seconds }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn statistics_empty() {
        let stats = compute_statistics(vec![]);
        assert_eq!(stats, StreamStatistics { count: 0, earliest: None, latest: None, avg_interarrival_seconds: None });
    }

    #[test]
    fn statistics_average_interarrival() {
        let t0 = Utc::now();
        let times = vec![t0, t0 + Duration::seconds(2), t0 + Duration::seconds(6)];
        let stats = compute_statistics(times.clone());
        assert_eq!(stats.count, 3);
        assert_eq!(stats.earliest, Some(times[0]));
        assert_eq!(stats.latest, Some(times[2]));
        assert_eq!(stats.avg_interarrival_seconds, Some(3.0));
    }
}
