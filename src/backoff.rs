// src/backoff.rs
use crate::config::QueueConfiguration;
use crate::Result;
use regex::Regex;
use std::time::Duration;

/// Ordered backoff intervals applied to successive failures of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    intervals: Vec<Duration>,
    max_retries: Option<u32>,
}

impl RetrySchedule {
    /// Builds a schedule; an empty interval list means immediate retry.
    pub fn new(intervals: Vec<Duration>, max_retries: Option<u32>) -> Self {
        let intervals = if intervals.is_empty() {
            vec![Duration::ZERO]
        } else {
            intervals
        };
        Self {
            intervals,
            max_retries,
        }
    }

    pub fn from_secs(intervals: &[u64]) -> Self {
        Self::new(intervals.iter().copied().map(Duration::from_secs).collect(), None)
    }

    pub fn intervals(&self) -> &[Duration] {
        &self.intervals
    }

    /// `intervals[min(attempt, len - 1)]`: saturates at the last interval.
    pub fn delay(&self, attempt: u32) -> Duration {
        let last = self.intervals.len() - 1;
        self.intervals[(attempt as usize).min(last)]
    }

    /// True once `failures` failed attempts used up the retry allowance.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        self.max_retries.is_some_and(|max| failures > max)
    }
}

/// Maps queue names to retry schedules, first matching pattern wins.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    rules: Vec<(Regex, RetrySchedule)>,
    default: RetrySchedule,
}

impl RetryPolicy {
    pub fn new(configurations: &[QueueConfiguration], default_interval: Duration) -> Result<Self> {
        let rules = configurations
            .iter()
            .map(|config| {
                let schedule = RetrySchedule::new(
                    config
                        .retry_intervals
                        .iter()
                        .copied()
                        .map(Duration::from_secs)
                        .collect(),
                    config.max_retries,
                );
                Ok((config.compile()?, schedule))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            rules,
            default: RetrySchedule::new(vec![default_interval], None),
        })
    }

    pub fn resolve(&self, queue_name: &str) -> &RetrySchedule {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(queue_name))
            .map(|(_, schedule)| schedule)
            .unwrap_or(&self.default)
    }

    pub fn next_delay(&self, queue_name: &str, attempt: u32) -> Duration {
        self.resolve(queue_name).delay(attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default: RetrySchedule::new(vec![Duration::from_secs(5)], None),
        }
    }
}
