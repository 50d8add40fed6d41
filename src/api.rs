// src/api.rs - request and reply shapes of the administrative surface
//!
//! Requests arrive as `{"operation": ..., "payload": {...}, "message": ...}`.
//! Each one is answered by exactly one [`Reply`].

use crate::store::DELETE_MARKER;
use crate::{RelqError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Enqueue,
    GetQueueItemsCount,
    DeleteQueueItem,
    ReplaceQueueItem,
    PutLock,
    GetLock,
    GetAllLocks,
    DeleteLock,
    GetQueueItems,
    GetQueues,
}

/// Wire form of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub operation: OperationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A validated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Enqueue { queue: String, message: String },
    GetQueueItemsCount { queue: String },
    DeleteQueueItem { queue: String, index: i64 },
    ReplaceQueueItem { queue: String, index: i64, buffer: String },
    PutLock { queue: String, requested_by: String },
    GetLock { queue: String },
    GetAllLocks { filter: Option<String> },
    DeleteLock { queue: String },
    GetQueueItems { queue: String, limit: Option<usize> },
    GetQueues { filter: Option<String> },
}

#[derive(Deserialize)]
struct QueuePayload {
    queuename: String,
}

#[derive(Deserialize)]
struct IndexPayload {
    queuename: String,
    index: i64,
}

#[derive(Deserialize)]
struct ReplacePayload {
    queuename: String,
    index: i64,
    buffer: String,
}

#[derive(Deserialize)]
struct LockPayload {
    queuename: String,
    #[serde(rename = "requestedBy")]
    requested_by: Option<String>,
}

#[derive(Deserialize, Default)]
struct FilterPayload {
    filter: Option<String>,
}

#[derive(Deserialize)]
struct ItemsPayload {
    queuename: String,
    limit: Option<usize>,
}

impl Request {
    pub fn new(operation: OperationKind, payload: Value) -> Self {
        Self {
            operation,
            payload: Some(payload),
            message: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| RelqError::BadInput(format!("Invalid request: {e}")))
    }

    pub fn enqueue(queue: &str, message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::new(OperationKind::Enqueue, json!({ "queuename": queue }))
        }
    }

    pub fn get_queue_items_count(queue: &str) -> Self {
        Self::new(OperationKind::GetQueueItemsCount, json!({ "queuename": queue }))
    }

    pub fn delete_queue_item(queue: &str, index: i64) -> Self {
        Self::new(
            OperationKind::DeleteQueueItem,
            json!({ "queuename": queue, "index": index }),
        )
    }

    pub fn replace_queue_item(queue: &str, index: i64, buffer: &str) -> Self {
        Self::new(
            OperationKind::ReplaceQueueItem,
            json!({ "queuename": queue, "index": index, "buffer": buffer }),
        )
    }

    pub fn put_lock(queue: &str, requested_by: &str) -> Self {
        Self::new(
            OperationKind::PutLock,
            json!({ "queuename": queue, "requestedBy": requested_by }),
        )
    }

    pub fn get_lock(queue: &str) -> Self {
        Self::new(OperationKind::GetLock, json!({ "queuename": queue }))
    }

    pub fn get_all_locks(filter: Option<&str>) -> Self {
        Self::new(OperationKind::GetAllLocks, json!({ "filter": filter }))
    }

    pub fn delete_lock(queue: &str) -> Self {
        Self::new(OperationKind::DeleteLock, json!({ "queuename": queue }))
    }

    pub fn get_queue_items(queue: &str, limit: Option<usize>) -> Self {
        Self::new(
            OperationKind::GetQueueItems,
            json!({ "queuename": queue, "limit": limit }),
        )
    }

    pub fn get_queues(filter: Option<&str>) -> Self {
        Self::new(OperationKind::GetQueues, json!({ "filter": filter }))
    }

    fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        let payload = self
            .payload
            .clone()
            .ok_or_else(|| RelqError::BadInput("Payload missing".into()))?;
        serde_json::from_value(payload)
            .map_err(|e| RelqError::BadInput(format!("Invalid payload: {e}")))
    }

    /// Optional payloads, where an absent payload means "no filter".
    fn optional_payload<T: DeserializeOwned + Default>(&self) -> Result<T> {
        match self.payload {
            None | Some(Value::Null) => Ok(T::default()),
            Some(_) => self.payload(),
        }
    }

    /// Validates the payload for the requested operation.
    pub fn into_operation(self) -> Result<Operation> {
        let operation = match self.operation {
            OperationKind::Enqueue => {
                let QueuePayload { queuename } = self.payload()?;
                let message = self
                    .message
                    .ok_or_else(|| RelqError::BadInput("Message missing".into()))?;
                Operation::Enqueue {
                    queue: queue_name(queuename)?,
                    message: item(message)?,
                }
            }
            OperationKind::GetQueueItemsCount => {
                let QueuePayload { queuename } = self.payload()?;
                Operation::GetQueueItemsCount {
                    queue: queue_name(queuename)?,
                }
            }
            OperationKind::DeleteQueueItem => {
                let IndexPayload { queuename, index } = self.payload()?;
                Operation::DeleteQueueItem {
                    queue: queue_name(queuename)?,
                    index,
                }
            }
            OperationKind::ReplaceQueueItem => {
                let ReplacePayload {
                    queuename,
                    index,
                    buffer,
                } = self.payload()?;
                Operation::ReplaceQueueItem {
                    queue: queue_name(queuename)?,
                    index,
                    buffer: item(buffer)?,
                }
            }
            OperationKind::PutLock => {
                let LockPayload {
                    queuename,
                    requested_by,
                } = self.payload()?;
                let requested_by = requested_by
                    .filter(|r| !r.trim().is_empty())
                    .ok_or(RelqError::MissingProperty("requestedBy"))?;
                Operation::PutLock {
                    queue: queue_name(queuename)?,
                    requested_by,
                }
            }
            OperationKind::GetLock => {
                let QueuePayload { queuename } = self.payload()?;
                Operation::GetLock {
                    queue: queue_name(queuename)?,
                }
            }
            OperationKind::GetAllLocks => {
                let FilterPayload { filter } = self.optional_payload()?;
                Operation::GetAllLocks { filter }
            }
            OperationKind::DeleteLock => {
                let QueuePayload { queuename } = self.payload()?;
                Operation::DeleteLock {
                    queue: queue_name(queuename)?,
                }
            }
            OperationKind::GetQueueItems => {
                let ItemsPayload { queuename, limit } = self.payload()?;
                Operation::GetQueueItems {
                    queue: queue_name(queuename)?,
                    limit,
                }
            }
            OperationKind::GetQueues => {
                let FilterPayload { filter } = self.optional_payload()?;
                Operation::GetQueues { filter }
            }
        };
        Ok(operation)
    }
}

fn queue_name(name: String) -> Result<String> {
    if name.trim().is_empty() {
        return Err(RelqError::BadInput("Queue name must not be empty".into()));
    }
    Ok(name)
}

/// Stored items may not look like a pending delete, or the next sweep drops them.
fn item(payload: String) -> Result<String> {
    if payload == DELETE_MARKER {
        return Err(RelqError::BadInput(format!(
            "Item must not equal the reserved value '{DELETE_MARKER}'"
        )));
    }
    Ok(payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

/// Exactly one reply is produced per request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
}

impl Reply {
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            value: None,
            message: None,
            error_type: None,
        }
    }

    pub fn ok_with_value(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::ok()
        }
    }

    pub fn ok_with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: Status::Error,
            message: Some(message.into()),
            ..Self::ok()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

impl From<&RelqError> for Reply {
    fn from(err: &RelqError) -> Self {
        let message = match err {
            RelqError::BadInput(message) => message.clone(),
            err => err.to_string(),
        };
        let error_type = match err {
            // Matches the bare enqueue denial and missing property replies.
            RelqError::MemoryLimitReached | RelqError::MissingProperty(_) => None,
            err => Some(err.error_kind().to_string()),
        };
        Self {
            error_type,
            ..Self::error(message)
        }
    }
}
