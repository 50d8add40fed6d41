// src/queue.rs
use crate::connection::{ConnectionManager, RedisConnector};
use crate::store::{Keys, LockInfo, MarkOutcome, QueueStore};
use crate::{RelqConfig, RelqError, Result, lua::LuaScripts};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::time::Duration;

/// Redis-backed queue store.
pub struct RedisStore {
    connections: ConnectionManager<RedisConnector>,
    scripts: LuaScripts,
    keys: Keys,
}

impl RedisStore {
    pub fn new(config: &RelqConfig) -> Result<Self> {
        let connector = RedisConnector::new(&config.redis_url())?;
        let connections = ConnectionManager::new(connector, config.reconnect_settings());
        Ok(Self::with_connections(
            connections,
            Keys::new(config.redis_prefix.clone()),
        ))
    }

    pub fn with_connections(connections: ConnectionManager<RedisConnector>, keys: Keys) -> Self {
        Self {
            connections,
            scripts: LuaScripts::new(),
            keys,
        }
    }

    pub fn connections(&self) -> &ConnectionManager<RedisConnector> {
        &self.connections
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    async fn conn(&self) -> Result<(MultiplexedConnection, u64)> {
        self.connections.checkout().await
    }

    /// Sorts a redis failure into a dropped connection or a rejected operation.
    async fn check<T>(
        &self,
        generation: u64,
        operation: &'static str,
        result: redis::RedisResult<T>,
    ) -> Result<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e)
                if e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_timeout() =>
            {
                self.connections
                    .connection_lost(generation, &e.to_string())
                    .await;
                Err(RelqError::StoreUnavailable(e.to_string()))
            }
            Err(e) => Err(RelqError::ScriptFailure {
                script: operation,
                message: e.to_string(),
            }),
        }
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Reads `used_memory` against `maxmemory` (or the host memory) from `INFO memory`.
fn parse_memory_usage(info: &str) -> Option<u8> {
    let field = |name: &str| -> Option<u64> {
        info.lines()
            .filter_map(|line| line.trim().split_once(':'))
            .find(|(key, _)| *key == name)
            .and_then(|(_, value)| value.parse().ok())
    };
    let used = field("used_memory")?;
    let limit = match field("maxmemory") {
        Some(max) if max > 0 => max,
        _ => field("total_system_memory").filter(|total| *total > 0)?,
    };
    Some((used.saturating_mul(100) / limit).min(100) as u8)
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn enqueue(&self, queue: &str, item: &str) -> Result<u64> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .enqueue
            .key(self.keys.queues())
            .key(self.keys.queue(queue))
            .arg(queue)
            .arg(now_millis())
            .arg(item)
            .invoke_async(&mut con)
            .await;
        self.check(generation, "enqueue", result).await
    }

    async fn acquire_lease(&self, queue: &str, instance_id: &str, ttl: Duration) -> Result<()> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .acquire_lease
            .key(self.keys.consumer(queue))
            .key(self.keys.locks())
            .arg(instance_id)
            .arg(ttl.as_millis() as u64)
            .arg(queue)
            .invoke_async(&mut con)
            .await;
        let acquired: i64 = self.check(generation, "acquire_lease", result).await?;
        match acquired {
            1 => Ok(()),
            -1 => Err(RelqError::QueueLocked(queue.to_string())),
            _ => Err(RelqError::LeaseHeld(queue.to_string())),
        }
    }

    async fn release_lease(&self, queue: &str, instance_id: &str) -> Result<bool> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .release_lease
            .key(self.keys.consumer(queue))
            .arg(instance_id)
            .invoke_async(&mut con)
            .await;
        let released: i64 = self.check(generation, "release_lease", result).await?;
        Ok(released > 0)
    }

    async fn lease_owner(&self, queue: &str) -> Result<Option<String>> {
        let (mut con, generation) = self.conn().await?;
        let result = con.get(self.keys.consumer(queue)).await;
        self.check(generation, "lease_owner", result).await
    }

    async fn mark_for_deletion(
        &self,
        queue: &str,
        index: i64,
        expected: Option<&str>,
    ) -> Result<bool> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .mark_for_deletion
            .key(self.keys.queue(queue))
            .arg(index)
            .arg(crate::store::DELETE_MARKER)
            .arg(expected.unwrap_or(""))
            .arg(if expected.is_some() { "1" } else { "0" })
            .invoke_async(&mut con)
            .await;
        let marked: i64 = self.check(generation, "mark_for_deletion", result).await?;
        Ok(marked == 1)
    }

    async fn mark_owned_for_deletion(
        &self,
        queue: &str,
        index: i64,
        expected: &str,
        instance_id: &str,
    ) -> Result<MarkOutcome> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .mark_for_deletion
            .key(self.keys.queue(queue))
            .key(self.keys.consumer(queue))
            .arg(index)
            .arg(crate::store::DELETE_MARKER)
            .arg(expected)
            .arg("1")
            .arg(instance_id)
            .invoke_async(&mut con)
            .await;
        let marked: i64 = self.check(generation, "mark_for_deletion", result).await?;
        Ok(match marked {
            1 => MarkOutcome::Marked,
            -1 => MarkOutcome::LeaseLost,
            _ => MarkOutcome::Moved,
        })
    }

    async fn remove_marked(&self, queue: &str, marker: &str) -> Result<u64> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .remove_marked
            .key(self.keys.queue(queue))
            .key(self.keys.queues())
            .arg(marker)
            .arg(queue)
            .arg(now_millis())
            .invoke_async(&mut con)
            .await;
        self.check(generation, "remove_marked", result).await
    }

    async fn replace_item(&self, queue: &str, index: i64, item: &str) -> Result<()> {
        let (mut con, generation) = self.conn().await?;
        let result = con.lset(self.keys.queue(queue), index as isize, item).await;
        self.check(generation, "replace_item", result).await
    }

    async fn item_at(&self, queue: &str, index: i64) -> Result<Option<String>> {
        let (mut con, generation) = self.conn().await?;
        let result = con.lindex(self.keys.queue(queue), index as isize).await;
        self.check(generation, "item_at", result).await
    }

    async fn items(&self, queue: &str, limit: Option<usize>) -> Result<Vec<String>> {
        let stop = match limit {
            Some(0) => return Ok(Vec::new()),
            Some(limit) => limit as isize - 1,
            None => -1,
        };
        let (mut con, generation) = self.conn().await?;
        let result = con.lrange(self.keys.queue(queue), 0, stop).await;
        self.check(generation, "items", result).await
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let (mut con, generation) = self.conn().await?;
        let result = con.llen(self.keys.queue(queue)).await;
        self.check(generation, "queue_len", result).await
    }

    async fn queues(&self) -> Result<Vec<String>> {
        let (mut con, generation) = self.conn().await?;
        let result = con.zrange(self.keys.queues(), 0, -1).await;
        self.check(generation, "queues", result).await
    }

    async fn cleanup_queue(&self, queue: &str, older_than_millis: i64) -> Result<bool> {
        let (mut con, generation) = self.conn().await?;
        let result = self
            .scripts
            .cleanup_queue
            .key(self.keys.queues())
            .key(self.keys.queue(queue))
            .arg(queue)
            .arg(older_than_millis)
            .invoke_async(&mut con)
            .await;
        let removed: i64 = self.check(generation, "cleanup_queue", result).await?;
        Ok(removed > 0)
    }

    async fn set_locks(&self, names: &[String], info: &LockInfo) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        let info_json = serde_json::to_string(info)?;
        let mut invocation = self.scripts.set_locks.key(self.keys.locks());
        for name in names {
            invocation.arg(name).arg(&info_json);
        }
        let (mut con, generation) = self.conn().await?;
        let result: redis::RedisResult<i64> = invocation.invoke_async(&mut con).await;
        self.check(generation, "set_locks", result).await?;
        Ok(())
    }

    async fn lock_names(&self) -> Result<Vec<String>> {
        let (mut con, generation) = self.conn().await?;
        let result = con.hkeys(self.keys.locks()).await;
        self.check(generation, "lock_names", result).await
    }

    async fn lock_info(&self, name: &str) -> Result<Option<LockInfo>> {
        let (mut con, generation) = self.conn().await?;
        let result = con.hget(self.keys.locks(), name).await;
        let raw: Option<String> = self.check(generation, "lock_info", result).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn is_locked(&self, name: &str) -> Result<bool> {
        let (mut con, generation) = self.conn().await?;
        let result = con.hexists(self.keys.locks(), name).await;
        self.check(generation, "is_locked", result).await
    }

    async fn delete_lock(&self, name: &str) -> Result<bool> {
        let (mut con, generation) = self.conn().await?;
        let result = con.hdel(self.keys.locks(), name).await;
        let removed: i64 = self.check(generation, "delete_lock", result).await?;
        Ok(removed > 0)
    }

    async fn memory_usage_percent(&self) -> Result<Option<u8>> {
        let (mut con, generation) = self.conn().await?;
        let result = redis::cmd("INFO").arg("memory").query_async(&mut con).await;
        let info: String = self.check(generation, "memory_usage", result).await?;
        Ok(parse_memory_usage(&info))
    }
}
