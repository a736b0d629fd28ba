//! The outbox record model: the durable unit of delivery.
//!
//! A record represents "handler H must process payload P once". Records with
//! the same key are dispatched serially in creation order; the key also
//! determines the partition, which is the unit of cluster-wide assignment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::DispatchError;

/// Per-record context map, merged from global providers and the per-call
/// overlay. Stored as JSON; callers must not rely on key ordering.
pub type ContextMap = BTreeMap<String, String>;

/// Delivery status of an outbox record.
///
/// `Completed` and `Failed` are terminal; a record never leaves them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    New,
    Completed,
    Failed,
}

impl RecordStatus {
    /// Database representation of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::New => "NEW",
            RecordStatus::Completed => "COMPLETED",
            RecordStatus::Failed => "FAILED",
        }
    }

    /// Parse the database representation back into a status.
    pub fn from_db(value: &str) -> anyhow::Result<Self> {
        match value {
            "NEW" => Ok(RecordStatus::New),
            "COMPLETED" => Ok(RecordStatus::Completed),
            "FAILED" => Ok(RecordStatus::Failed),
            other => Err(anyhow::anyhow!("unknown record status: {other}")),
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the stable partition of a key.
///
/// Same key, same partition, forever: the partition is the first 8 bytes of
/// `SHA-256(key)` reduced modulo `total_partitions`, which is stable across
/// processes, architectures and releases.
pub fn partition_for_key(key: &str, total_partitions: i32) -> i32 {
    debug_assert!(total_partitions > 0);
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    (u64::from_be_bytes(prefix) % total_partitions as u64) as i32
}

/// A persisted unit of delivery.
///
/// One record is written per (payload, applicable handler) pair; each record
/// carries its own status and failure bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique identifier for this record
    pub id: Uuid,

    /// Business grouping key; equal keys dispatch serially in `created_at` order
    pub key: String,

    /// Fully qualified type tag used by the codec to deserialize the payload
    pub record_type: String,

    /// Serialized domain object (opaque string)
    pub payload: String,

    /// Merged string-to-string context captured at schedule time
    pub context: ContextMap,

    /// Stable hash bucket of `key`, in `[0, total_partitions)`
    pub partition: i32,

    /// Identifier of the handler that will consume this record
    pub handler_id: String,

    /// Delivery status
    pub status: RecordStatus,

    /// Count of failed dispatch attempts; never decreases
    pub failure_count: i32,

    /// Last failure, if any
    pub failure_reason: Option<String>,

    /// Timestamp when the record was scheduled
    pub created_at: DateTime<Utc>,

    /// Earliest instant this record is eligible for dispatch
    pub next_retry_at: DateTime<Utc>,

    /// Timestamp of successful completion (None while undelivered)
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Create a fresh record, immediately eligible for dispatch.
    pub fn new(
        key: impl Into<String>,
        record_type: impl Into<String>,
        payload: impl Into<String>,
        context: ContextMap,
        handler_id: impl Into<String>,
        total_partitions: i32,
    ) -> Self {
        let key = key.into();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            partition: partition_for_key(&key, total_partitions),
            key,
            record_type: record_type.into(),
            payload: payload.into(),
            context,
            handler_id: handler_id.into(),
            status: RecordStatus::New,
            failure_count: 0,
            failure_reason: None,
            created_at: now,
            next_retry_at: now,
            completed_at: None,
        }
    }

    /// A record is eligible when it is `NEW` and its retry time has passed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == RecordStatus::New && self.next_retry_at <= now
    }

    /// Record a failed dispatch attempt. `failure_count` only ever grows.
    pub fn mark_attempt_failed(&mut self, error: &DispatchError) {
        self.failure_count += 1;
        self.failure_reason = Some(error.to_string());
    }

    /// Transition to the terminal `Completed` state.
    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.status = RecordStatus::Completed;
        self.completed_at = Some(now);
    }

    /// Transition to the terminal `Failed` state.
    pub fn mark_failed(&mut self) {
        self.status = RecordStatus::Failed;
    }

    /// Metadata value handed to handlers alongside the payload.
    pub fn metadata(&self) -> RecordMetadata {
        RecordMetadata {
            id: self.id,
            key: self.key.clone(),
            record_type: self.record_type.clone(),
            handler_id: self.handler_id.clone(),
            created_at: self.created_at,
            context: self.context.clone(),
        }
    }
}

/// Metadata surfaced to handlers for every dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub id: Uuid,
    pub key: String,
    pub record_type: String,
    pub handler_id: String,
    pub created_at: DateTime<Utc>,
    pub context: ContextMap,
}

/// Failure details surfaced to fallback handlers.
#[derive(Debug, Clone)]
pub struct FailureContext {
    pub metadata: RecordMetadata,

    /// Failed dispatch attempts so far
    pub failure_count: i32,

    /// The last dispatch error
    pub last_error: DispatchError,

    /// True when the retry budget ran out
    pub retries_exhausted: bool,

    /// True when the retry policy refused the error class
    pub non_retryable: bool,
}
