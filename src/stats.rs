// src/stats.rs - per-queue counters and decaying throughput
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// Weight of the newest window when folding it into the decaying rate.
const RATE_DECAY: f64 = 0.5;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatistics {
    pub enqueued: u64,
    pub delivered: u64,
    pub failures: u64,
    /// Consecutive failures of the current head item.
    pub current_failures: u64,
    /// Items parked after exhausting their retries.
    pub parked: u64,
    /// Decaying deliveries per second.
    pub speed: f64,
}

#[derive(Debug)]
struct Tracked {
    stats: QueueStatistics,
    window_start: Instant,
    window_deliveries: u64,
}

impl Tracked {
    fn new() -> Self {
        Self {
            stats: QueueStatistics::default(),
            window_start: Instant::now(),
            window_deliveries: 0,
        }
    }

    /// Folds every elapsed window into the rate. Idle windows decay it.
    fn roll(&mut self, window: Duration) {
        let now = Instant::now();
        while now.duration_since(self.window_start) >= window {
            let rate = self.window_deliveries as f64 / window.as_secs_f64();
            self.stats.speed = RATE_DECAY * rate + (1.0 - RATE_DECAY) * self.stats.speed;
            self.window_deliveries = 0;
            self.window_start += window;
        }
    }
}

/// Local statistics. Observing never fails the observed operation.
#[derive(Clone)]
pub struct StatisticsCollector {
    window: Duration,
    queues: Arc<Mutex<HashMap<String, Tracked>>>,
}

impl StatisticsCollector {
    pub fn new(window: Duration) -> Self {
        Self {
            window: window.max(Duration::from_secs(1)),
            queues: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn record(&self, queue: &str, update: impl FnOnce(&mut Tracked)) {
        match self.queues.lock() {
            Ok(mut queues) => {
                let tracked = queues.entry(queue.to_string()).or_insert_with(Tracked::new);
                tracked.roll(self.window);
                update(tracked);
            }
            Err(_) => warn!(queue, "Statistics unavailable, dropping sample"),
        }
    }

    pub fn enqueued(&self, queue: &str) {
        self.record(queue, |t| t.stats.enqueued += 1);
    }

    pub fn delivered(&self, queue: &str) {
        self.record(queue, |t| {
            t.stats.delivered += 1;
            t.stats.current_failures = 0;
            t.window_deliveries += 1;
        });
    }

    pub fn failed(&self, queue: &str) {
        self.record(queue, |t| {
            t.stats.failures += 1;
            t.stats.current_failures += 1;
        });
    }

    pub fn parked(&self, queue: &str) {
        self.record(queue, |t| {
            t.stats.parked += 1;
            t.stats.current_failures = 0;
        });
    }

    pub fn get(&self, queue: &str) -> Option<QueueStatistics> {
        let mut queues = self.queues.lock().ok()?;
        let tracked = queues.get_mut(queue)?;
        tracked.roll(self.window);
        Some(tracked.stats.clone())
    }

    pub fn snapshot(&self) -> HashMap<String, QueueStatistics> {
        match self.queues.lock() {
            Ok(mut queues) => queues
                .iter_mut()
                .map(|(name, tracked)| {
                    tracked.roll(self.window);
                    (name.clone(), tracked.stats.clone())
                })
                .collect(),
            Err(_) => HashMap::new(),
        }
    }
}
