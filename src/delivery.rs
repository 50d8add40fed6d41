// src/delivery.rs - per-queue delivery state machine
use crate::backoff::RetryPolicy;
use crate::context::{Delivery, Processor};
use crate::stats::StatisticsCollector;
use crate::store::{DELETE_MARKER, MarkOutcome, QueueStore};
use crate::{RelqConfig, RelqError, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, interval_at, timeout};
use tracing::{Instrument, debug, info, instrument, warn};

/// How often a locked queue is checked for unlock.
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Fetching,
    Dispatched,
    Completing,
    Retrying,
    Failing,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    Drained,
    LeaseLost,
    StoreUnavailable,
    Shutdown,
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure(String),
    Timeout,
}

#[derive(Debug, Clone, Copy)]
pub struct DeliverySettings {
    pub lease_ttl: Duration,
    pub renewal_period: Duration,
    pub processor_timeout: Duration,
    pub processor_delay_max: Duration,
}

impl From<&RelqConfig> for DeliverySettings {
    fn from(config: &RelqConfig) -> Self {
        Self {
            lease_ttl: config.lease_ttl(),
            renewal_period: config.renewal_period(),
            processor_timeout: config.processor_timeout(),
            processor_delay_max: config.processor_delay_max(),
        }
    }
}

/// Summary handed back to the lease manager when a machine stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub reason: ReleaseReason,
    /// Head items, in order, that exhausted their retries and were skipped.
    pub parked: Vec<String>,
}

/// How many leading entries of `parked` still sit at the head of the queue.
pub fn matching_prefix(parked: &[String], head: &[String]) -> usize {
    parked
        .iter()
        .zip(head)
        .take_while(|(parked, current)| parked == current)
        .count()
}

/// Collaborators shared by every machine of one instance.
#[derive(Clone)]
pub struct DeliveryDeps {
    pub store: Arc<dyn QueueStore>,
    pub processor: Arc<dyn Processor>,
    pub retry_policy: Arc<RetryPolicy>,
    pub stats: StatisticsCollector,
}

/// Delivers the items of one queue while this instance holds its lease.
pub struct DeliveryMachine {
    queue: String,
    instance_id: String,
    deps: DeliveryDeps,
    settings: DeliverySettings,
    shutdown: watch::Receiver<bool>,
    state: DeliveryState,
    /// Parked head items. The item under delivery sits right after them.
    parked: Vec<String>,
    current_item: Option<String>,
    failures: u32,
    next_eligible: Option<Instant>,
    renew_at: Instant,
}

impl DeliveryMachine {
    /// Expects the lease to be held already. `parked` lists head items to
    /// skip while they are still in place.
    pub fn new(
        queue: impl Into<String>,
        instance_id: impl Into<String>,
        deps: DeliveryDeps,
        settings: DeliverySettings,
        shutdown: watch::Receiver<bool>,
        parked: Vec<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            instance_id: instance_id.into(),
            deps,
            settings,
            shutdown,
            state: DeliveryState::Idle,
            parked,
            current_item: None,
            failures: 0,
            next_eligible: None,
            renew_at: Instant::now() + settings.renewal_period,
        }
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    fn cursor(&self) -> i64 {
        self.parked.len() as i64
    }

    fn transition(&mut self, next: DeliveryState) {
        if self.state != next {
            debug!(queue = %self.queue, from = ?self.state, to = ?next, "Delivery state change");
            self.state = next;
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow() || self.shutdown.has_changed().is_err()
    }

    #[instrument(skip_all, fields(queue = %self.queue, instance = %self.instance_id))]
    pub async fn run(mut self) -> DeliveryReport {
        info!("Consumer started");
        let reason = loop {
            match self.step().await {
                Ok(None) => continue,
                Ok(Some(reason)) => break reason,
                Err(e) => {
                    warn!(error = %e, "Stopping consumer after store failure");
                    break ReleaseReason::StoreUnavailable;
                }
            }
        };
        self.release(reason).await
    }

    /// One pass through `Fetching`. `Some` means the machine must stop.
    async fn step(&mut self) -> Result<Option<ReleaseReason>> {
        if self.is_shutting_down() {
            return Ok(Some(ReleaseReason::Shutdown));
        }
        if Instant::now() >= self.renew_at && !self.renew().await {
            return Ok(Some(ReleaseReason::LeaseLost));
        }

        self.transition(DeliveryState::Fetching);
        self.verify_parked().await?;
        let Some(item) = self.deps.store.item_at(&self.queue, self.cursor()).await? else {
            return Ok(Some(ReleaseReason::Drained));
        };
        if item == DELETE_MARKER {
            // Left behind by a delete whose sweep failed or has not run yet.
            let swept = self.deps.store.remove_marked(&self.queue, DELETE_MARKER).await?;
            debug!(swept, "Swept deleted items ahead of delivery");
            return Ok(None);
        }
        if self.current_item.as_deref() != Some(item.as_str()) {
            self.current_item = Some(item.clone());
            self.failures = 0;
            self.next_eligible = None;
        }

        if let Some(eligible_at) = self.next_eligible {
            let now = Instant::now();
            if now < eligible_at {
                self.pause(eligible_at - now).await;
                return Ok(None);
            }
        }

        self.jitter().await;
        if self.deps.store.is_locked(&self.queue).await? {
            debug!("Queue is locked, holding delivery");
            self.pause(LOCK_POLL_INTERVAL).await;
            return Ok(None);
        }

        let outcome = self.dispatch(&item).await;

        match self.deps.store.lease_owner(&self.queue).await? {
            Some(owner) if owner == self.instance_id => {}
            owner => {
                warn!(?owner, ?outcome, "Lease lost during dispatch, discarding outcome");
                return Ok(Some(ReleaseReason::LeaseLost));
            }
        }

        match outcome {
            Outcome::Success => {
                if let Some(reason) = self.complete(&item).await? {
                    return Ok(Some(reason));
                }
            }
            Outcome::Failure(reason) => self.fail(item, &reason),
            Outcome::Timeout => self.fail(item, "processor timeout"),
        }
        self.transition(DeliveryState::Idle);
        Ok(None)
    }

    /// Forgets parked items that were removed or replaced since they were
    /// parked, so the cursor never skips an item that was not tried.
    async fn verify_parked(&mut self) -> Result<()> {
        if self.parked.is_empty() {
            return Ok(());
        }
        let head = self
            .deps
            .store
            .items(&self.queue, Some(self.parked.len()))
            .await?;
        let kept = matching_prefix(&self.parked, &head);
        if kept < self.parked.len() {
            info!(
                kept,
                dropped = self.parked.len() - kept,
                "Parked items changed, resuming from the first changed position"
            );
            self.parked.truncate(kept);
        }
        Ok(())
    }

    /// Sends `item` to the processor, renewing the lease while it runs.
    async fn dispatch(&mut self, item: &str) -> Outcome {
        self.transition(DeliveryState::Dispatched);
        let delivery = Delivery::new(&self.queue, item, self.failures, &self.instance_id);
        let span = delivery.span.clone();
        let processor = Arc::clone(&self.deps.processor);
        let processor_timeout = self.settings.processor_timeout;

        let work = async move {
            match timeout(processor_timeout, processor.process(&delivery)).await {
                Ok(Ok(())) => Outcome::Success,
                Ok(Err(e)) => Outcome::Failure(format!("{e:#}")),
                Err(_) => Outcome::Timeout,
            }
        }
        .instrument(span);
        tokio::pin!(work);

        let period = self.settings.renewal_period;
        let mut renewals = interval_at(self.renew_at.max(Instant::now()), period);
        loop {
            tokio::select! {
                outcome = &mut work => return outcome,
                _ = renewals.tick() => {
                    // A failed renewal lets the attempt finish; the outcome is then discarded.
                    self.renew().await;
                }
            }
        }
    }

    /// Removes the delivered item. `Some` means the lease was gone and
    /// nothing was touched.
    async fn complete(&mut self, item: &str) -> Result<Option<ReleaseReason>> {
        self.transition(DeliveryState::Completing);
        let outcome = self
            .deps
            .store
            .complete_item(&self.queue, self.cursor(), item, &self.instance_id)
            .await?;
        match outcome {
            MarkOutcome::Marked => {
                debug!("Item delivered and removed");
                self.deps.stats.delivered(&self.queue);
            }
            MarkOutcome::Moved => {
                warn!("Delivered item moved before removal, leaving queue untouched");
            }
            MarkOutcome::LeaseLost => {
                warn!("Lease lost before removal, discarding outcome");
                return Ok(Some(ReleaseReason::LeaseLost));
            }
        }
        self.current_item = None;
        self.failures = 0;
        self.next_eligible = None;
        Ok(None)
    }

    fn fail(&mut self, item: String, reason: &str) {
        self.failures += 1;
        self.deps.stats.failed(&self.queue);
        let schedule = self.deps.retry_policy.resolve(&self.queue);
        let exhausted = schedule.is_exhausted(self.failures);
        let delay = schedule.delay(self.failures - 1);

        if exhausted {
            self.transition(DeliveryState::Failing);
            warn!(
                failures = self.failures,
                reason, "Retries exhausted, leaving item in queue"
            );
            self.deps.stats.parked(&self.queue);
            self.parked.push(item);
            self.current_item = None;
            self.failures = 0;
            self.next_eligible = None;
            return;
        }

        self.transition(DeliveryState::Retrying);
        self.next_eligible = Some(Instant::now() + delay);
        info!(
            failures = self.failures,
            retry_in_secs = delay.as_secs(),
            reason,
            "Delivery failed, rescheduled"
        );
    }

    async fn renew(&mut self) -> bool {
        match self
            .deps
            .store
            .acquire_lease(&self.queue, &self.instance_id, self.settings.lease_ttl)
            .await
        {
            Ok(()) => {
                self.renew_at = Instant::now() + self.settings.renewal_period;
                true
            }
            Err(e) => {
                warn!(error = %e, "Lease renewal failed");
                false
            }
        }
    }

    async fn jitter(&mut self) {
        let max = self.settings.processor_delay_max.as_millis() as u64;
        if max == 0 {
            return;
        }
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max));
        self.pause(delay).await;
    }

    /// Waits `duration`, cut short by shutdown or the next renewal.
    async fn pause(&mut self, duration: Duration) {
        let until = (Instant::now() + duration).min(self.renew_at);
        tokio::select! {
            _ = tokio::time::sleep_until(until) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn release(&mut self, reason: ReleaseReason) -> DeliveryReport {
        self.transition(DeliveryState::Released);
        if reason != ReleaseReason::LeaseLost {
            match self
                .deps
                .store
                .release_lease(&self.queue, &self.instance_id)
                .await
            {
                Ok(_) => {}
                Err(RelqError::StoreUnavailable(e)) => {
                    debug!(error = %e, "Lease left to expire, store unavailable")
                }
                Err(e) => warn!(error = %e, "Releasing lease failed"),
            }
        }
        info!(?reason, parked = self.parked.len(), "Consumer released");
        DeliveryReport {
            reason,
            parked: std::mem::take(&mut self.parked),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;
    use crate::config::QueueConfiguration;
    use crate::context::FnProcessor;
    use crate::store::LockInfo;
    use std::sync::Mutex;
    use tokio::time::sleep;

    const INSTANCE: &str = "instance-a";

    fn settings() -> DeliverySettings {
        DeliverySettings {
            lease_ttl: Duration::from_secs(20),
            renewal_period: Duration::from_secs(10),
            processor_timeout: Duration::from_secs(5),
            processor_delay_max: Duration::ZERO,
        }
    }

    fn policy(intervals: Vec<u64>, max_retries: Option<u32>) -> RetryPolicy {
        let mut config = QueueConfiguration::new(".*", intervals);
        config.max_retries = max_retries;
        RetryPolicy::new(&[config], Duration::from_secs(5)).unwrap()
    }

    struct Harness {
        store: MemoryStore,
        stats: StatisticsCollector,
        seen: Arc<Mutex<Vec<String>>>,
        shutdown_tx: watch::Sender<bool>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: MemoryStore::new(),
                stats: StatisticsCollector::new(Duration::from_secs(60)),
                seen: Arc::new(Mutex::new(Vec::new())),
                shutdown_tx: watch::channel(false).0,
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }

        /// Takes the lease and runs a machine. The processor fails items
        /// starting with "fail", hangs on "hang" and takes 30s on "slow".
        async fn spawn(
            &self,
            queue: &str,
            policy: RetryPolicy,
            settings: DeliverySettings,
        ) -> tokio::task::JoinHandle<DeliveryReport> {
            self.spawn_parked(queue, policy, settings, Vec::new()).await
        }

        async fn spawn_parked(
            &self,
            queue: &str,
            policy: RetryPolicy,
            settings: DeliverySettings,
            parked: Vec<String>,
        ) -> tokio::task::JoinHandle<DeliveryReport> {
            let recorder = Arc::clone(&self.seen);
            let processor = FnProcessor(move |delivery: Delivery| {
                let recorder = Arc::clone(&recorder);
                async move {
                    recorder.lock().unwrap().push(delivery.payload.clone());
                    if delivery.payload.starts_with("hang") {
                        std::future::pending::<()>().await;
                    }
                    if delivery.payload.starts_with("slow") {
                        sleep(Duration::from_secs(30)).await;
                    }
                    if delivery.payload.starts_with("fail") {
                        anyhow::bail!("rejected {}", delivery.payload);
                    }
                    Ok(())
                }
            });

            let deps = DeliveryDeps {
                store: Arc::new(self.store.clone()),
                processor: Arc::new(processor),
                retry_policy: Arc::new(policy),
                stats: self.stats.clone(),
            };
            self.store
                .acquire_lease(queue, INSTANCE, settings.lease_ttl)
                .await
                .unwrap();
            let machine = DeliveryMachine::new(
                queue,
                INSTANCE,
                deps,
                settings,
                self.shutdown_tx.subscribe(),
                parked,
            );
            tokio::spawn(machine.run())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_in_fifo_order_and_drains() {
        let harness = Harness::new();
        for item in ["1", "2", "3"] {
            harness.store.enqueue("orders", item).await.unwrap();
        }

        let handle = harness
            .spawn("orders", RetryPolicy::default(), settings())
            .await;
        let report = handle.await.unwrap();

        assert_eq!(report.reason, ReleaseReason::Drained);
        assert!(report.parked.is_empty());
        assert_eq!(harness.seen(), vec!["1", "2", "3"]);
        assert_eq!(harness.store.queue_len("orders").await.unwrap(), 0);
        assert_eq!(harness.store.lease_owner("orders").await.unwrap(), None);
        assert_eq!(harness.stats.get("orders").unwrap().delivered, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_item_is_retried_on_schedule() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "fail-1").await.unwrap();
        let handle = harness
            .spawn("orders", policy(vec![10, 20, 30, 60], None), settings())
            .await;

        sleep(Duration::from_millis(1)).await;
        assert_eq!(harness.seen().len(), 1);

        sleep(Duration::from_secs(9)).await;
        assert_eq!(harness.seen().len(), 1);
        sleep(Duration::from_secs(2)).await;
        assert_eq!(harness.seen().len(), 2);

        // 20s, 30s, then 60s for every later attempt
        sleep(Duration::from_secs(20 + 30 + 60 + 60)).await;
        assert_eq!(harness.seen().len(), 6);
        assert_eq!(harness.stats.get("orders").unwrap().current_failures, 6);
        assert_eq!(harness.store.queue_len("orders").await.unwrap(), 1);

        harness.shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().reason, ReleaseReason::Shutdown);
        assert_eq!(harness.store.lease_owner("orders").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_item_is_parked_and_next_item_delivered() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "fail-1").await.unwrap();
        harness.store.enqueue("orders", "ok-2").await.unwrap();

        let handle = harness
            .spawn("orders", policy(vec![1], Some(1)), settings())
            .await;
        let report = handle.await.unwrap();

        assert_eq!(report.reason, ReleaseReason::Drained);
        assert_eq!(report.parked, vec!["fail-1"]);
        assert_eq!(harness.seen(), vec!["fail-1", "fail-1", "ok-2"]);
        assert_eq!(
            harness.store.items("orders", None).await.unwrap(),
            vec!["fail-1"]
        );
        assert_eq!(harness.stats.get("orders").unwrap().parked, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_counts_as_failure() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "hang-1").await.unwrap();
        let handle = harness
            .spawn("orders", policy(vec![30], None), settings())
            .await;

        sleep(Duration::from_secs(6)).await;
        let stats = harness.stats.get("orders").unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.delivered, 0);
        assert_eq!(harness.store.queue_len("orders").await.unwrap(), 1);

        harness.shutdown_tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().reason, ReleaseReason::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_holds_delivery_until_removed() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "hello").await.unwrap();
        let handle = harness
            .spawn("orders", RetryPolicy::default(), settings())
            .await;
        harness
            .store
            .set_locks(&["orders".to_string()], &LockInfo::new("ops"))
            .await
            .unwrap();

        sleep(Duration::from_secs(60)).await;
        assert!(harness.seen().is_empty());
        assert!(harness.stats.get("orders").is_none());
        assert_eq!(
            harness.store.lease_owner("orders").await.unwrap().as_deref(),
            Some(INSTANCE)
        );

        harness.store.delete_lock("orders").await.unwrap();
        let report = handle.await.unwrap();
        assert_eq!(report.reason, ReleaseReason::Drained);
        assert_eq!(harness.seen(), vec!["hello"]);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_owner_does_not_mutate_after_losing_lease() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "slow-1").await.unwrap();
        let slow = DeliverySettings {
            processor_timeout: Duration::from_secs(60),
            ..settings()
        };
        let handle = harness.spawn("orders", RetryPolicy::default(), slow).await;
        sleep(Duration::from_millis(1)).await;

        // renewals fail until the lease expires, then another instance takes over
        harness.store.set_unavailable(true);
        sleep(Duration::from_secs(21)).await;
        harness.store.set_unavailable(false);
        harness
            .store
            .acquire_lease("orders", "instance-b", Duration::from_secs(20))
            .await
            .unwrap();

        let report = handle.await.unwrap();
        assert_eq!(report.reason, ReleaseReason::LeaseLost);
        assert_eq!(harness.seen(), vec!["slow-1"]);
        assert_eq!(harness.store.queue_len("orders").await.unwrap(), 1);
        assert_eq!(
            harness.store.lease_owner("orders").await.unwrap().as_deref(),
            Some("instance-b")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn removed_parked_item_does_not_shift_the_cursor() {
        let harness = Harness::new();
        // "fail-1" was parked by an earlier run and then deleted
        harness.store.enqueue("orders", "ok-2").await.unwrap();
        harness.store.enqueue("orders", "ok-3").await.unwrap();

        let handle = harness
            .spawn_parked(
                "orders",
                RetryPolicy::default(),
                settings(),
                vec!["fail-1".to_string()],
            )
            .await;
        let report = handle.await.unwrap();

        assert_eq!(report.reason, ReleaseReason::Drained);
        assert!(report.parked.is_empty());
        assert_eq!(harness.seen(), vec!["ok-2", "ok-3"]);
        assert_eq!(harness.store.queue_len("orders").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn parked_item_deleted_mid_run_is_forgotten() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "fail-1").await.unwrap();
        harness.store.enqueue("orders", "fail-2").await.unwrap();
        harness.store.enqueue("orders", "ok-3").await.unwrap();

        // fail-1 parks at 10s, fail-2 then waits until 20s for its retry
        let handle = harness
            .spawn("orders", policy(vec![10], Some(1)), settings())
            .await;
        sleep(Duration::from_secs(11)).await;
        assert_eq!(harness.seen(), vec!["fail-1", "fail-1", "fail-2"]);

        harness.store.delete_item("orders", 0, Some("fail-1")).await.unwrap();
        let report = handle.await.unwrap();

        assert_eq!(report.reason, ReleaseReason::Drained);
        assert_eq!(report.parked, vec!["fail-2"]);
        assert_eq!(
            harness.seen(),
            vec!["fail-1", "fail-1", "fail-2", "fail-2", "ok-3"]
        );
        assert_eq!(
            harness.store.items("orders", None).await.unwrap(),
            vec!["fail-2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivered_is_not_counted_when_item_moved() {
        let harness = Harness::new();
        harness.store.enqueue("orders", "slow-1").await.unwrap();
        let slow = DeliverySettings {
            processor_timeout: Duration::from_secs(60),
            ..settings()
        };
        let handle = harness.spawn("orders", RetryPolicy::default(), slow).await;
        sleep(Duration::from_secs(1)).await;

        harness
            .store
            .replace_item("orders", 0, "slow-2")
            .await
            .unwrap();
        sleep(Duration::from_secs(30)).await;

        let stats = harness.stats.get("orders").unwrap_or_default();
        assert_eq!(stats.delivered, 0);
        assert_eq!(harness.seen(), vec!["slow-1", "slow-2"]);

        let report = handle.await.unwrap();
        assert_eq!(report.reason, ReleaseReason::Drained);
        assert_eq!(harness.stats.get("orders").unwrap().delivered, 1);
    }
}
