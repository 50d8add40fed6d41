// src/store.rs - the atomic primitives every component mutates shared state through
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Sentinel written over an item before it is swept out of its list.
pub const DELETE_MARKER: &str = "TO_DELETE";

/// Result of an owner-guarded mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    /// The item at the index is no longer the expected one.
    Moved,
    /// The caller does not hold the consumer lease.
    LeaseLost,
}

/// Details stored for an administrative lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockInfo {
    pub requested_by: String,
    /// Creation time in milliseconds since the epoch.
    pub timestamp: i64,
}

impl LockInfo {
    pub fn new(requested_by: impl Into<String>) -> Self {
        Self {
            requested_by: requested_by.into(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Store key layout, all rooted at the configured prefix.
#[derive(Debug, Clone)]
pub struct Keys {
    prefix: String,
}

impl Keys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Sorted set of queue names scored by their last-modified time.
    pub fn queues(&self) -> String {
        format!("{}queues", self.prefix)
    }

    pub fn queue(&self, name: &str) -> String {
        format!("{}queues:{}", self.prefix, name)
    }

    pub fn consumer(&self, name: &str) -> String {
        format!("{}consumers:{}", self.prefix, name)
    }

    pub fn locks(&self) -> String {
        format!("{}locks", self.prefix)
    }
}

impl Default for Keys {
    fn default() -> Self {
        Self::new("redisques:")
    }
}

/// Queue store contract.
///
/// Every mutation that another instance could race with is a single atomic
/// step here. Implementations never retry; callers own retry policy.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Appends `item` and refreshes the queue timestamp. Returns the new length.
    async fn enqueue(&self, queue: &str, item: &str) -> Result<u64>;

    /// Claims or renews the consumer lease. Fails with `LeaseHeld` when a
    /// different instance holds a live lease.
    async fn acquire_lease(&self, queue: &str, instance_id: &str, ttl: Duration) -> Result<()>;

    /// Deletes the lease if `instance_id` owns it. Returns whether it did.
    async fn release_lease(&self, queue: &str, instance_id: &str) -> Result<bool>;

    async fn lease_owner(&self, queue: &str) -> Result<Option<String>>;

    /// Overwrites the item at `index` with [`DELETE_MARKER`]. With `expected`
    /// set, only marks when the current value equals it.
    async fn mark_for_deletion(
        &self,
        queue: &str,
        index: i64,
        expected: Option<&str>,
    ) -> Result<bool>;

    /// Marks the item at `index` only if it still equals `expected` and
    /// `instance_id` holds the consumer lease, checked in the same atomic step.
    async fn mark_owned_for_deletion(
        &self,
        queue: &str,
        index: i64,
        expected: &str,
        instance_id: &str,
    ) -> Result<MarkOutcome>;

    /// Removes every entry equal to `marker`. Returns how many were removed.
    async fn remove_marked(&self, queue: &str, marker: &str) -> Result<u64>;

    async fn replace_item(&self, queue: &str, index: i64, item: &str) -> Result<()>;

    async fn item_at(&self, queue: &str, index: i64) -> Result<Option<String>>;

    /// Items from the head, at most `limit` when given.
    async fn items(&self, queue: &str, limit: Option<usize>) -> Result<Vec<String>>;

    async fn queue_len(&self, queue: &str) -> Result<u64>;

    /// Queue names known to the timestamp index.
    async fn queues(&self) -> Result<Vec<String>>;

    /// Drops `queue` from the index if it is empty and untouched since
    /// `older_than_millis`.
    async fn cleanup_queue(&self, queue: &str, older_than_millis: i64) -> Result<bool>;

    async fn set_locks(&self, names: &[String], info: &LockInfo) -> Result<()>;

    async fn lock_names(&self) -> Result<Vec<String>>;

    async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>>;

    async fn is_locked(&self, name: &str) -> Result<bool>;

    async fn delete_lock(&self, name: &str) -> Result<bool>;

    /// Current memory usage in percent, if the store reports it.
    async fn memory_usage_percent(&self) -> Result<Option<u8>>;

    /// Lock names, filtered by `pattern` when given.
    async fn get_locks(&self, pattern: Option<&Regex>) -> Result<Vec<String>> {
        let names = self.lock_names().await?;
        Ok(match pattern {
            Some(pattern) => names.into_iter().filter(|n| pattern.is_match(n)).collect(),
            None => names,
        })
    }

    /// Two-phase delete of the item at `index` as one logical step.
    ///
    /// A failing sweep is logged and ignored; the marker is swept by the next
    /// successful delete on this queue.
    async fn delete_item(&self, queue: &str, index: i64, expected: Option<&str>) -> Result<bool> {
        if !self.mark_for_deletion(queue, index, expected).await? {
            return Ok(false);
        }
        if let Err(e) = self.remove_marked(queue, DELETE_MARKER).await {
            tracing::warn!(queue, index, error = %e, "Sweeping deleted item failed, continuing");
        }
        Ok(true)
    }

    /// Removes a delivered item on behalf of the lease owner.
    async fn complete_item(
        &self,
        queue: &str,
        index: i64,
        expected: &str,
        instance_id: &str,
    ) -> Result<MarkOutcome> {
        let outcome = self
            .mark_owned_for_deletion(queue, index, expected, instance_id)
            .await?;
        if outcome == MarkOutcome::Marked {
            if let Err(e) = self.remove_marked(queue, DELETE_MARKER).await {
                tracing::warn!(queue, index, error = %e, "Sweeping delivered item failed, continuing");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_prefixed() {
        let keys = Keys::new("q:");
        assert_eq!(keys.queue("orders"), "q:queues:orders");
        assert_eq!(keys.queues(), "q:queues");
        assert_eq!(keys.consumer("orders"), "q:consumers:orders");
        assert_eq!(keys.locks(), "q:locks");
    }

    #[test]
    fn lock_info_round_trips_camel_case() {
        let info = LockInfo {
            requested_by: "ops".into(),
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_string(&info).unwrap();
        assert_eq!(json, r#"{"requestedBy":"ops","timestamp":1700000000000}"#);
        assert!(info.created_at().is_some());
    }
}
