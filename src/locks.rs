// src/locks.rs
use crate::store::{LockInfo, QueueStore};
use crate::{RelqError, Result};
use regex::Regex;
use std::sync::Arc;
use tracing::info;

/// Administrative locks that suppress delivery for a queue.
#[derive(Clone)]
pub struct LockRegistry {
    store: Arc<dyn QueueStore>,
}

impl LockRegistry {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self { store }
    }

    pub async fn put(&self, names: &[String], requested_by: &str) -> Result<()> {
        if names.is_empty() {
            return Err(RelqError::BadInput("No lock names given".into()));
        }
        if names.iter().any(|name| name.trim().is_empty()) {
            return Err(RelqError::BadInput("Lock must be a string value".into()));
        }
        if requested_by.trim().is_empty() {
            return Err(RelqError::BadInput("Property 'requestedBy' missing".into()));
        }

        self.store
            .set_locks(names, &LockInfo::new(requested_by))
            .await?;
        info!(locks = ?names, requested_by, "Locks set");
        Ok(())
    }

    /// Lock names, filtered by a regex when `pattern` is given.
    pub async fn get(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let filter = pattern
            .map(|p| {
                Regex::new(p).map_err(|e| RelqError::BadInput(format!("Invalid filter pattern: {e}")))
            })
            .transpose()?;
        self.store.get_locks(filter.as_ref()).await
    }

    pub async fn info(&self, name: &str) -> Result<Option<LockInfo>> {
        self.store.lock_info(name).await
    }

    pub async fn is_locked(&self, name: &str) -> Result<bool> {
        self.store.is_locked(name).await
    }

    pub async fn delete(&self, name: &str) -> Result<bool> {
        let removed = self.store.delete_lock(name).await?;
        if removed {
            info!(lock = name, "Lock deleted");
        }
        Ok(removed)
    }
}
