// src/engine.rs
use crate::api::{Operation, Reply, Request};
use crate::backoff::RetryPolicy;
use crate::backpressure::BackpressureMonitor;
use crate::context::Processor;
use crate::delivery::{DeliveryDeps, DeliverySettings};
use crate::lease::{ActiveQueues, LeaseManager};
use crate::locks::LockRegistry;
use crate::queue::RedisStore;
use crate::stats::{QueueStatistics, StatisticsCollector};
use crate::store::QueueStore;
use crate::{RelqConfig, RelqError, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

/// Engine builder for fluent configuration
pub struct EngineBuilder {
    config: RelqConfig,
    store: Option<Arc<dyn QueueStore>>,
    processor: Option<Arc<dyn Processor>>,
}

impl EngineBuilder {
    pub fn new(config: RelqConfig) -> Self {
        Self {
            config,
            store: None,
            processor: None,
        }
    }

    /// Uses `store` instead of connecting to the configured redis.
    pub fn with_store(mut self, store: impl QueueStore) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    pub fn with_shared_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_processor(mut self, processor: impl Processor) -> Self {
        self.processor = Some(Arc::new(processor));
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.config.instance_id = Some(id.into());
        self
    }

    pub fn build(self) -> Result<Engine> {
        self.config.validate()?;
        let processor = self
            .processor
            .ok_or_else(|| RelqError::Config("Processor is required".to_string()))?;
        let store = match self.store {
            Some(store) => store,
            None => Arc::new(RedisStore::new(&self.config)?),
        };

        Engine::new(self.config, store, processor)
    }
}

/// Point-in-time view of one engine instance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStats {
    pub instance_id: String,
    pub active_queues: Vec<String>,
    pub memory_usage_percent: Option<u8>,
    pub is_shutting_down: bool,
    pub queues: HashMap<String, QueueStatistics>,
}

/// One service instance: answers requests and delivers the queues it leases.
pub struct Engine {
    instance_id: String,
    config: RelqConfig,
    store: Arc<dyn QueueStore>,
    locks: LockRegistry,
    backpressure: BackpressureMonitor,
    stats: StatisticsCollector,
    deps: DeliveryDeps,
    active: ActiveQueues,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    is_shutting_down: Arc<AtomicBool>,
}

impl Engine {
    fn new(
        config: RelqConfig,
        store: Arc<dyn QueueStore>,
        processor: Arc<dyn Processor>,
    ) -> Result<Self> {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| format!("relq-{}", uuid::Uuid::new_v4()));
        let retry_policy = RetryPolicy::new(
            &config.queue_configurations,
            Duration::from_secs(config.default_retry_interval_sec),
        )?;
        let stats = StatisticsCollector::new(Duration::from_secs(config.queue_speed_interval_sec));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            deps: DeliveryDeps {
                store: Arc::clone(&store),
                processor,
                retry_policy: Arc::new(retry_policy),
                stats: stats.clone(),
            },
            locks: LockRegistry::new(Arc::clone(&store)),
            backpressure: BackpressureMonitor::new(config.memory_usage_limit_percent),
            active: ActiveQueues::default(),
            handles: Vec::new(),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
            instance_id,
            config,
            store,
            stats,
            shutdown_tx,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &RelqConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn QueueStore> {
        &self.store
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    /// Starts lease election and memory sampling in the background.
    pub fn start(&mut self) -> Result<()> {
        if !self.handles.is_empty() {
            return Ok(());
        }
        if self.is_shutting_down.load(Ordering::SeqCst) {
            return Err(RelqError::Config("Engine has been shut down".to_string()));
        }

        info!(
            instance = %self.instance_id,
            check_period = ?self.config.check_period(),
            "Starting engine"
        );

        let manager = LeaseManager::new(
            self.instance_id.clone(),
            self.deps.clone(),
            DeliverySettings::from(&self.config),
            self.config.check_period(),
            self.shutdown_tx.subscribe(),
        );
        self.active = manager.active_queues();
        self.handles.push(tokio::spawn(manager.run()));

        if self.backpressure.enabled() {
            self.handles.push(self.backpressure.spawn_sampler(
                Arc::clone(&self.store),
                Duration::from_secs(self.config.memory_usage_check_interval_sec),
                self.shutdown_tx.subscribe(),
            ));
        }

        info!("Engine started successfully");
        Ok(())
    }

    /// Starts, then runs until SIGINT/SIGTERM and shuts down gracefully.
    pub async fn run(mut self) -> Result<()> {
        self.start()?;
        Self::wait_for_shutdown_signal().await;
        self.shutdown().await;
        Ok(())
    }

    async fn wait_for_shutdown_signal() {
        use tokio::signal;

        #[cfg(unix)]
        {
            use signal::unix::{SignalKind, signal};

            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(mut sigterm), Ok(mut sigint)) => {
                    tokio::select! {
                        _ = sigterm.recv() => info!("SIGTERM received"),
                        _ = sigint.recv() => info!("SIGINT received"),
                    }
                    return;
                }
                (Err(e), _) | (_, Err(e)) => {
                    warn!(error = %e, "Failed to setup signal handlers, waiting for CTRL+C")
                }
            }
        }

        match signal::ctrl_c().await {
            Ok(()) => info!("CTRL+C received"),
            Err(e) => error!(error = %e, "Failed to listen for CTRL+C"),
        }
    }

    /// Stops election, lets consumers release their leases, bounded by the shutdown timeout.
    pub async fn shutdown(&mut self) {
        if self.is_shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(instance = %self.instance_id, "Initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.handles.drain(..).collect();
        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        match timeout(
            self.config.shutdown_timeout(),
            futures::future::join_all(handles),
        )
        .await
        {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!(error = %e, "Background task failed during shutdown");
                    }
                }
                info!(instance = %self.instance_id, "Engine shutdown complete");
            }
            Err(_) => {
                warn!("Shutdown timeout reached, remaining leases will expire");
                for abort in aborts {
                    abort.abort();
                }
            }
        }
    }

    /// Takes a memory sample now instead of waiting for the sampler.
    pub async fn refresh_memory_usage(&self) {
        self.backpressure.refresh(self.store.as_ref()).await;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            instance_id: self.instance_id.clone(),
            active_queues: self.active.names(),
            memory_usage_percent: self.backpressure.current_sample(),
            is_shutting_down: self.is_shutting_down.load(Ordering::SeqCst),
            queues: self.stats.snapshot(),
        }
    }

    pub fn queue_stats(&self, queue: &str) -> Option<QueueStatistics> {
        self.stats.get(queue)
    }

    /// Answers a raw JSON request.
    pub async fn handle_json(&self, json: &str) -> Reply {
        match Request::from_json(json) {
            Ok(request) => self.handle(request).await,
            Err(e) => Reply::from(&e),
        }
    }

    pub async fn handle(&self, request: Request) -> Reply {
        match request.into_operation() {
            Ok(operation) => self.execute(operation).await,
            Err(e) => {
                debug!(error = %e, "Rejected request");
                Reply::from(&e)
            }
        }
    }

    #[instrument(skip(self), fields(instance = %self.instance_id))]
    pub async fn execute(&self, operation: Operation) -> Reply {
        let result = match operation {
            Operation::Enqueue { queue, message } => return self.enqueue(&queue, &message).await,
            Operation::GetQueueItemsCount { queue } => self
                .store
                .queue_len(&queue)
                .await
                .map(Reply::ok_with_value),
            Operation::DeleteQueueItem { queue, index } => self
                .store
                .delete_item(&queue, index, None)
                .await
                .map(|_| Reply::ok()),
            Operation::ReplaceQueueItem {
                queue,
                index,
                buffer,
            } => self
                .store
                .replace_item(&queue, index, &buffer)
                .await
                .map(|()| Reply::ok()),
            Operation::PutLock {
                queue,
                requested_by,
            } => self
                .locks
                .put(&[queue], &requested_by)
                .await
                .map(|()| Reply::ok()),
            Operation::GetLock { queue } => match self.locks.info(&queue).await {
                Ok(Some(info)) => serde_json::to_value(info)
                    .map(Reply::ok_with_value)
                    .map_err(RelqError::from),
                Ok(None) => Ok(Reply::error("No such lock")),
                Err(e) => Err(e),
            },
            Operation::GetAllLocks { filter } => self
                .locks
                .get(filter.as_deref())
                .await
                .map(|locks| Reply::ok_with_value(json!({ "locks": locks }))),
            Operation::DeleteLock { queue } => {
                self.locks.delete(&queue).await.map(|_| Reply::ok())
            }
            Operation::GetQueueItems { queue, limit } => self
                .store
                .items(&queue, limit)
                .await
                .map(Reply::ok_with_value),
            Operation::GetQueues { filter } => self.queues(filter.as_deref()).await,
        };

        result.unwrap_or_else(|e| {
            warn!(error = %e, "Operation failed");
            Reply::from(&e)
        })
    }

    async fn enqueue(&self, queue: &str, message: &str) -> Reply {
        if let Err(e) = self.backpressure.admit_current() {
            warn!(queue, limit = self.backpressure.limit_percent(), "Enqueue denied");
            return Reply::from(&e);
        }

        match self.store.enqueue(queue, message).await {
            Ok(len) => {
                debug!(queue, len, "Message enqueued");
                self.stats.enqueued(queue);
                Reply::ok_with_message("enqueued")
            }
            Err(e) => {
                error!(queue, error = %e, "Enqueue failed");
                Reply {
                    error_type: Some(e.error_kind().to_string()),
                    ..Reply::error(format!(
                        "RelQ QUEUE_ERROR: Error while enqueueing message into queue {queue}"
                    ))
                }
            }
        }
    }

    async fn queues(&self, filter: Option<&str>) -> Result<Reply> {
        let filter = filter
            .map(|p| {
                Regex::new(p).map_err(|e| RelqError::BadInput(format!("Invalid filter pattern: {e}")))
            })
            .transpose()?;
        let queues: Vec<String> = self
            .store
            .queues()
            .await?
            .into_iter()
            .filter(|name| filter.as_ref().is_none_or(|re| re.is_match(name)))
            .collect();
        Ok(Reply::ok_with_value(json!({ "queues": queues })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use crate::context::{Delivery, FnProcessor};

    fn engine(store: &MemoryStore) -> Engine {
        EngineBuilder::new(RelqConfig::default().with_memory_usage_limit_percent(80))
            .with_store(store.clone())
            .with_processor(FnProcessor(|_: Delivery| async { Ok(()) }))
            .with_instance_id("instance-a")
            .build()
            .unwrap()
    }

    #[test]
    fn build_requires_processor() {
        let result = EngineBuilder::new(RelqConfig::default())
            .with_store(MemoryStore::new())
            .build();
        assert!(matches!(result, Err(RelqError::Config(_))));
    }

    #[tokio::test]
    async fn admin_operations_round_trip() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        for item in ["a", "b", "c"] {
            assert!(engine.handle(Request::enqueue("orders", item)).await.is_ok());
        }

        let count = engine.handle(Request::get_queue_items_count("orders")).await;
        assert_eq!(count.value, Some(json!(3)));

        assert!(engine.handle(Request::replace_queue_item("orders", 1, "B")).await.is_ok());
        assert!(engine.handle(Request::delete_queue_item("orders", 0)).await.is_ok());
        let items = engine.handle(Request::get_queue_items("orders", None)).await;
        assert_eq!(items.value, Some(json!(["B", "c"])));

        let queues = engine.handle(Request::get_queues(Some("^ord"))).await;
        assert_eq!(queues.value, Some(json!({ "queues": ["orders"] })));
        assert_eq!(engine.queue_stats("orders").unwrap().enqueued, 3);
    }

    #[tokio::test]
    async fn lock_operations() {
        let store = MemoryStore::new();
        let engine = engine(&store);

        assert!(engine.handle(Request::put_lock("orders", "ops")).await.is_ok());
        let locks = engine.handle(Request::get_all_locks(None)).await;
        assert_eq!(locks.value, Some(json!({ "locks": ["orders"] })));

        let info = engine.handle(Request::get_lock("orders")).await;
        assert_eq!(info.value.unwrap()["requestedBy"], json!("ops"));

        assert!(engine.handle(Request::delete_lock("orders")).await.is_ok());
        assert!(!engine.handle(Request::get_lock("orders")).await.is_ok());
    }

    #[tokio::test]
    async fn invalid_requests_are_rejected_without_mutation() {
        let store = MemoryStore::new();
        let engine = engine(&store);

        let reply = engine.handle_json(r#"{"operation":"putLock","payload":{"queuename":"orders"}}"#).await;
        assert_eq!(reply.message.as_deref(), Some("Property 'requestedBy' missing"));
        assert_eq!(reply.error_type, None);

        let reply = engine.handle(Request::get_queues(Some("orders("))).await;
        assert_eq!(reply.error_type.as_deref(), Some("bad input"));

        let reply = engine.handle_json("not json").await;
        assert!(!reply.is_ok());
        assert!(store.lock_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reserved_marker_payload_is_refused() {
        let store = MemoryStore::new();
        let engine = engine(&store);

        let reply = engine.handle(Request::enqueue("orders", "TO_DELETE")).await;
        assert_eq!(reply.error_type.as_deref(), Some("bad input"));
        assert_eq!(store.queue_len("orders").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn enqueue_failure_reports_queue_error() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        store.set_unavailable(true);

        let reply = engine.handle(Request::enqueue("orders", "hello")).await;
        assert_eq!(
            reply.message.as_deref(),
            Some("RelQ QUEUE_ERROR: Error while enqueueing message into queue orders")
        );
        assert_eq!(reply.error_type.as_deref(), Some("store unavailable"));
    }

    #[tokio::test]
    async fn stats_snapshot_reports_instance() {
        let store = MemoryStore::new();
        let engine = engine(&store);
        engine.handle(Request::enqueue("orders", "a")).await;

        let stats = engine.stats();
        assert_eq!(stats.instance_id, "instance-a");
        assert!(stats.active_queues.is_empty());
        assert_eq!(stats.queues["orders"].enqueued, 1);
    }
}
