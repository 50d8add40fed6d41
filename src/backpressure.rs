// src/backpressure.rs - memory-pressure admission control for enqueues
use crate::store::QueueStore;
use crate::{RelqError, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, warn};

const NO_SAMPLE: u8 = u8::MAX;

#[derive(Clone)]
pub struct BackpressureMonitor {
    limit_percent: u8,
    sample: Arc<AtomicU8>,
}

impl BackpressureMonitor {
    pub fn new(limit_percent: u8) -> Self {
        Self {
            limit_percent,
            sample: Arc::new(AtomicU8::new(NO_SAMPLE)),
        }
    }

    /// A limit of 100% can never be exceeded, so sampling is pointless.
    pub fn enabled(&self) -> bool {
        self.limit_percent < 100
    }

    pub fn limit_percent(&self) -> u8 {
        self.limit_percent
    }

    pub fn record_sample(&self, percent: Option<u8>) {
        self.sample
            .store(percent.map_or(NO_SAMPLE, |p| p.min(100)), Ordering::Relaxed);
    }

    pub fn current_sample(&self) -> Option<u8> {
        match self.sample.load(Ordering::Relaxed) {
            NO_SAMPLE => None,
            percent => Some(percent),
        }
    }

    /// Denies when `sample` exceeds the limit; no sample always admits.
    pub fn admit(&self, sample: Option<u8>) -> Result<()> {
        match sample {
            Some(percent) if percent > self.limit_percent => Err(RelqError::MemoryLimitReached),
            _ => Ok(()),
        }
    }

    pub fn admit_current(&self) -> Result<()> {
        self.admit(self.current_sample())
    }

    /// Takes a fresh sample. Failures clear the sample instead of propagating.
    pub async fn refresh(&self, store: &dyn QueueStore) {
        match store.memory_usage_percent().await {
            Ok(percent) => {
                debug!(?percent, "Sampled store memory usage");
                self.record_sample(percent);
            }
            Err(e) => {
                warn!(error = %e, "Sampling store memory usage failed");
                self.record_sample(None);
            }
        }
    }

    pub fn spawn_sampler(
        &self,
        store: Arc<dyn QueueStore>,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => monitor.refresh(store.as_ref()).await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}
