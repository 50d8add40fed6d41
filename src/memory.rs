//! In-process queue store.
//!
//! Mirrors the semantics of the redis scripts: every trait call runs under a
//! single mutex, so each call is atomic with respect to the others. Lease
//! expiry follows tokio time, which lets tests drive it with a paused clock.

use crate::store::{LockInfo, MarkOutcome, QueueStore};
use crate::{RelqError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

struct Lease {
    owner: String,
    expires_at: Instant,
}

#[derive(Default)]
struct State {
    lists: HashMap<String, Vec<String>>,
    /// Queue name -> last modification in millis.
    timestamps: BTreeMap<String, i64>,
    leases: HashMap<String, Lease>,
    locks: BTreeMap<String, LockInfo>,
    memory_usage: Option<u8>,
}

impl State {
    fn live_lease(&self, queue: &str) -> Option<&Lease> {
        self.leases
            .get(queue)
            .filter(|lease| lease.expires_at > Instant::now())
    }

    fn resolve_index(&self, queue: &str, index: i64) -> Option<usize> {
        let len = self.lists.get(queue).map_or(0, Vec::len) as i64;
        let resolved = if index < 0 { len + index } else { index };
        (0..len).contains(&resolved).then_some(resolved as usize)
    }
}

/// Thread-safe in-memory [`QueueStore`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sets the value reported by `memory_usage_percent`.
    pub fn set_memory_usage(&self, percent: Option<u8>) {
        if let Ok(mut state) = self.state.lock() {
            state.memory_usage = percent;
        }
    }

    /// Overrides the recorded timestamp of `queue`.
    pub fn set_queue_timestamp(&self, queue: &str, millis: i64) {
        if let Ok(mut state) = self.state.lock() {
            state.timestamps.insert(queue.to_string(), millis);
        }
    }

    pub fn queue_timestamp(&self, queue: &str) -> Option<i64> {
        self.state.lock().ok()?.timestamps.get(queue).copied()
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RelqError::StoreUnavailable("store is down".into()));
        }
        self.state
            .lock()
            .map_err(|_| RelqError::StoreUnavailable("store state poisoned".into()))
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn enqueue(&self, queue: &str, item: &str) -> Result<u64> {
        let mut state = self.state()?;
        state
            .timestamps
            .insert(queue.to_string(), Utc::now().timestamp_millis());
        let list = state.lists.entry(queue.to_string()).or_default();
        list.push(item.to_string());
        Ok(list.len() as u64)
    }

    async fn acquire_lease(&self, queue: &str, instance_id: &str, ttl: Duration) -> Result<()> {
        let mut state = self.state()?;
        match state.live_lease(queue) {
            Some(lease) if lease.owner != instance_id => {
                return Err(RelqError::LeaseHeld(queue.to_string()));
            }
            Some(_) => {}
            None if state.locks.contains_key(queue) => {
                return Err(RelqError::QueueLocked(queue.to_string()));
            }
            None => {}
        }
        state.leases.insert(
            queue.to_string(),
            Lease {
                owner: instance_id.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn release_lease(&self, queue: &str, instance_id: &str) -> Result<bool> {
        let mut state = self.state()?;
        let owned = state
            .live_lease(queue)
            .is_some_and(|lease| lease.owner == instance_id);
        if owned {
            state.leases.remove(queue);
        }
        Ok(owned)
    }

    async fn lease_owner(&self, queue: &str) -> Result<Option<String>> {
        let state = self.state()?;
        Ok(state.live_lease(queue).map(|lease| lease.owner.clone()))
    }

    async fn mark_for_deletion(
        &self,
        queue: &str,
        index: i64,
        expected: Option<&str>,
    ) -> Result<bool> {
        let mut state = self.state()?;
        let Some(position) = state.resolve_index(queue, index) else {
            if expected.is_some() {
                return Ok(false);
            }
            return Err(RelqError::ScriptFailure {
                script: "mark_for_deletion",
                message: "ERR index out of range".into(),
            });
        };
        let Some(list) = state.lists.get_mut(queue) else {
            return Ok(false);
        };
        if expected.is_some_and(|expected| list[position] != expected) {
            return Ok(false);
        }
        list[position] = crate::store::DELETE_MARKER.to_string();
        Ok(true)
    }

    async fn mark_owned_for_deletion(
        &self,
        queue: &str,
        index: i64,
        expected: &str,
        instance_id: &str,
    ) -> Result<MarkOutcome> {
        let mut state = self.state()?;
        if !state
            .live_lease(queue)
            .is_some_and(|lease| lease.owner == instance_id)
        {
            return Ok(MarkOutcome::LeaseLost);
        }
        let Some(position) = state.resolve_index(queue, index) else {
            return Ok(MarkOutcome::Moved);
        };
        match state.lists.get_mut(queue) {
            Some(list) if list[position] == expected => {
                list[position] = crate::store::DELETE_MARKER.to_string();
                Ok(MarkOutcome::Marked)
            }
            _ => Ok(MarkOutcome::Moved),
        }
    }

    async fn remove_marked(&self, queue: &str, marker: &str) -> Result<u64> {
        let mut state = self.state()?;
        let Some(list) = state.lists.get_mut(queue) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|item| item != marker);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            state.lists.remove(queue);
        }
        if removed > 0 {
            if let Some(timestamp) = state.timestamps.get_mut(queue) {
                *timestamp = Utc::now().timestamp_millis();
            }
        }
        Ok(removed)
    }

    async fn replace_item(&self, queue: &str, index: i64, item: &str) -> Result<()> {
        let mut state = self.state()?;
        let position = state
            .resolve_index(queue, index)
            .ok_or_else(|| RelqError::ScriptFailure {
                script: "replace_item",
                message: "ERR index out of range".into(),
            })?;
        if let Some(list) = state.lists.get_mut(queue) {
            list[position] = item.to_string();
        }
        Ok(())
    }

    async fn item_at(&self, queue: &str, index: i64) -> Result<Option<String>> {
        let state = self.state()?;
        Ok(state
            .resolve_index(queue, index)
            .and_then(|position| state.lists.get(queue).map(|list| list[position].clone())))
    }

    async fn items(&self, queue: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let state = self.state()?;
        let list = state.lists.get(queue).map(Vec::as_slice).unwrap_or(&[]);
        let take = limit.unwrap_or(list.len());
        Ok(list.iter().take(take).cloned().collect())
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let state = self.state()?;
        Ok(state.lists.get(queue).map_or(0, Vec::len) as u64)
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let state = self.state()?;
        let mut by_time: Vec<(&String, &i64)> = state.timestamps.iter().collect();
        by_time.sort_by_key(|(name, timestamp)| (**timestamp, (*name).clone()));
        Ok(by_time.into_iter().map(|(name, _)| name.clone()).collect())
    }

    async fn cleanup_queue(&self, queue: &str, older_than_millis: i64) -> Result<bool> {
        let mut state = self.state()?;
        if state.lists.get(queue).is_some_and(|list| !list.is_empty()) {
            return Ok(false);
        }
        match state.timestamps.get(queue) {
            Some(timestamp) if *timestamp < older_than_millis => {
                state.timestamps.remove(queue);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_locks(&self, names: &[String], info: &LockInfo) -> Result<()> {
        let mut state = self.state()?;
        for name in names {
            state.locks.insert(name.clone(), info.clone());
        }
        Ok(())
    }

    async fn lock_names(&self) -> Result<Vec<String>> {
        let state = self.state()?;
        Ok(state.locks.keys().cloned().collect())
    }

    async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>> {
        let state = self.state()?;
        Ok(state.locks.get(name).cloned())
    }

    async fn is_locked(&self, name: &str) -> Result<bool> {
        let state = self.state()?;
        Ok(state.locks.contains_key(name))
    }

    async fn delete_lock(&self, name: &str) -> Result<bool> {
        let mut state = self.state()?;
        Ok(state.locks.remove(name).is_some())
    }

    async fn memory_usage_percent(&self) -> Result<Option<u8>> {
        let state = self.state()?;
        Ok(state.memory_usage)
    }
}
