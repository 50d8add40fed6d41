// src/lease.rs - periodic lease election across instances
use crate::RelqError;
use crate::delivery::{
    DeliveryDeps, DeliveryMachine, DeliveryReport, DeliverySettings, ReleaseReason, matching_prefix,
};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info, instrument, warn};

/// Empty queues untouched for this many check periods leave the index.
const STALE_QUEUE_CHECKS: u32 = 3;

/// Names of the queues this instance is currently delivering.
#[derive(Clone, Default)]
pub struct ActiveQueues(Arc<Mutex<BTreeSet<String>>>);

impl ActiveQueues {
    pub fn names(&self) -> Vec<String> {
        self.0
            .lock()
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.0.lock().map(|names| names.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish<'a>(&self, names: impl Iterator<Item = &'a String>) {
        if let Ok(mut active) = self.0.lock() {
            *active = names.cloned().collect();
        }
    }
}

/// Claims leases for non-empty queues and runs one delivery machine per claim.
pub struct LeaseManager {
    instance_id: String,
    deps: DeliveryDeps,
    settings: DeliverySettings,
    check_period: Duration,
    shutdown: watch::Receiver<bool>,
    machines: HashMap<String, JoinHandle<DeliveryReport>>,
    /// Head items per queue this instance gave up on, in queue order.
    parked: HashMap<String, Vec<String>>,
    active: ActiveQueues,
}

impl LeaseManager {
    pub fn new(
        instance_id: impl Into<String>,
        deps: DeliveryDeps,
        settings: DeliverySettings,
        check_period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            deps,
            settings,
            check_period,
            shutdown,
            machines: HashMap::new(),
            parked: HashMap::new(),
            active: ActiveQueues::default(),
        }
    }

    pub fn active_queues(&self) -> ActiveQueues {
        self.active.clone()
    }

    /// Ticks until shutdown, then waits for every machine to release its lease.
    pub async fn run(mut self) {
        info!(instance = %self.instance_id, period = ?self.check_period, "Lease manager started");
        let mut ticker = interval(self.check_period);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = self.shutdown.changed() => break,
            }
            if *self.shutdown.borrow() {
                break;
            }
        }

        info!(count = self.machines.len(), "Waiting for consumers to release leases");
        for (queue, handle) in self.machines.drain() {
            if let Err(e) = handle.await {
                error!(queue = %queue, error = %e, "Consumer task failed");
            }
        }
        self.active.publish(std::iter::empty());
        info!("Lease manager stopped");
    }

    #[instrument(skip_all, fields(instance = %self.instance_id))]
    pub async fn tick(&mut self) {
        self.reap().await;

        let queues = match self.deps.store.queues().await {
            Ok(queues) => queues,
            Err(e) => {
                warn!(error = %e, "Listing queues failed, skipping check");
                return;
            }
        };

        for queue in queues {
            if self.machines.contains_key(&queue) || *self.shutdown.borrow() {
                continue;
            }
            if let Err(e) = self.check_queue(&queue).await {
                match e {
                    RelqError::LeaseHeld(_) | RelqError::QueueLocked(_) => {
                        debug!(queue = %queue, reason = e.error_kind(), "Lease not acquired")
                    }
                    e => warn!(queue = %queue, error = %e, "Queue check failed"),
                }
            }
        }
        self.active.publish(self.machines.keys());
    }

    async fn check_queue(&mut self, queue: &str) -> crate::Result<()> {
        let len = self.deps.store.queue_len(queue).await?;
        if len == 0 {
            let threshold = Utc::now().timestamp_millis()
                - (self.check_period * STALE_QUEUE_CHECKS).as_millis() as i64;
            if self.deps.store.cleanup_queue(queue, threshold).await? {
                debug!(queue, "Removed stale queue");
            }
            self.parked.remove(queue);
            return Ok(());
        }

        let parked = self.current_parked(queue).await?;
        if len as usize <= parked.len() {
            return Ok(());
        }

        self.deps
            .store
            .acquire_lease(queue, &self.instance_id, self.settings.lease_ttl)
            .await?;
        info!(queue, parked = parked.len(), "Lease acquired, starting consumer");

        let machine = DeliveryMachine::new(
            queue,
            self.instance_id.clone(),
            self.deps.clone(),
            self.settings,
            self.shutdown.clone(),
            parked,
        );
        self.machines
            .insert(queue.to_string(), tokio::spawn(machine.run()));
        Ok(())
    }

    /// Parked items of `queue` that are still at its head. Entries removed or
    /// replaced since parking are forgotten along with everything after them.
    async fn current_parked(&mut self, queue: &str) -> crate::Result<Vec<String>> {
        let Some(parked) = self.parked.get_mut(queue) else {
            return Ok(Vec::new());
        };
        let head = self.deps.store.items(queue, Some(parked.len())).await?;
        let kept = matching_prefix(parked, &head);
        if kept < parked.len() {
            debug!(queue, kept, "Parked items changed since they were parked");
            parked.truncate(kept);
        }
        let parked = parked.clone();
        if parked.is_empty() {
            self.parked.remove(queue);
        }
        Ok(parked)
    }

    /// Collects finished machines and remembers what they parked.
    async fn reap(&mut self) {
        let finished: Vec<String> = self
            .machines
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(queue, _)| queue.clone())
            .collect();

        for queue in finished {
            let Some(handle) = self.machines.remove(&queue) else {
                continue;
            };
            match handle.await {
                Ok(report) => {
                    if report.reason != ReleaseReason::Drained {
                        debug!(queue = %queue, reason = ?report.reason, "Consumer stopped");
                    }
                    if report.parked.is_empty() {
                        self.parked.remove(&queue);
                    } else {
                        self.parked.insert(queue, report.parked);
                    }
                }
                Err(e) => error!(queue = %queue, error = %e, "Consumer task failed"),
            }
        }
    }
}
