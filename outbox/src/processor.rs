//! The dispatch state machine: Primary → Retry → Fallback → PermanentFailure.
//!
//! Each stage either finishes the record or delegates to the next one.
//! A successful primary or fallback invocation completes the record; a
//! retryable failure reschedules it and ends the chain; everything else
//! falls through to the terminal FAILED state. Store failures inside the
//! chain abandon the record as-is — the next tick picks it up again, which
//! is where the at-least-once guarantee comes from.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};

use crate::context::dispatch_span;
use crate::error::DispatchError;
use crate::handler::HandlerRegistry;
use crate::metrics::OutboxMetrics;
use crate::record::{FailureContext, OutboxRecord};
use crate::store::RecordStore;

/// Result of pushing one record through the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Primary or fallback handler succeeded; record is terminal.
    Completed,

    /// Failure was retryable; record stays NEW with a future retry time.
    Rescheduled,

    /// Retries spent or error non-retryable, no fallback rescued it.
    Failed,

    /// A store operation failed mid-chain; record left untouched for the
    /// next tick.
    Abandoned,
}

impl DispatchOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, DispatchOutcome::Completed)
    }
}

/// The fixed processor pipeline shared by all key workers of an engine.
pub struct ProcessorChain<S: RecordStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    delete_completed_records: bool,
    metrics: Option<OutboxMetrics>,
}

impl<S: RecordStore> ProcessorChain<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        delete_completed_records: bool,
        metrics: Option<OutboxMetrics>,
    ) -> Self {
        Self {
            store,
            registry,
            delete_completed_records,
            metrics,
        }
    }

    /// Dispatch one record through the chain.
    ///
    /// Handler failures never escape: they are folded into the record's
    /// failure bookkeeping and the returned outcome.
    pub async fn dispatch(&self, mut record: OutboxRecord) -> DispatchOutcome {
        let error = match self.invoke_primary(&record).await {
            Ok(()) => return self.complete(record).await,
            Err(error) => error,
        };

        record.mark_attempt_failed(&error);
        warn!(
            record_id = %record.id,
            record_key = %record.key,
            handler_id = %record.handler_id,
            failure_count = record.failure_count,
            error = %error,
            "Record dispatch failed"
        );

        let policy = self.registry.retry_policy_for(&record.handler_id);

        let retries_exhausted = policy.is_exhausted(record.failure_count);
        let retryable = policy.should_retry(&error);
        if !retries_exhausted && retryable {
            let delay = policy.delay(record.failure_count);
            record.next_retry_at =
                Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64);
            if let Err(e) = self.store.save(&record).await {
                error!(record_id = %record.id, error = ?e, "Failed to reschedule record");
                return DispatchOutcome::Abandoned;
            }
            debug!(
                record_id = %record.id,
                failure_count = record.failure_count,
                next_retry_at = %record.next_retry_at,
                "Record rescheduled"
            );
            self.count_outcome("retried");
            return DispatchOutcome::Rescheduled;
        }

        if let Some(fallback) = self.registry.fallback_for(&record.handler_id) {
            let failure = FailureContext {
                metadata: record.metadata(),
                failure_count: record.failure_count,
                last_error: error.clone(),
                retries_exhausted,
                non_retryable: !retryable,
            };
            match fallback.invoke(&record.payload, failure).await {
                Ok(()) => {
                    info!(
                        record_id = %record.id,
                        handler_id = %record.handler_id,
                        "Fallback handler compensated failed record"
                    );
                    return self.complete(record).await;
                }
                Err(fallback_error) => {
                    // the fallback's failure replaces the primary one
                    record.failure_reason = Some(fallback_error.to_string());
                    warn!(
                        record_id = %record.id,
                        handler_id = %record.handler_id,
                        error = %fallback_error,
                        "Fallback handler failed"
                    );
                }
            }
        }

        record.mark_failed();
        if let Err(e) = self.store.save(&record).await {
            error!(record_id = %record.id, error = ?e, "Failed to persist permanent failure");
            return DispatchOutcome::Abandoned;
        }
        error!(
            record_id = %record.id,
            record_key = %record.key,
            handler_id = %record.handler_id,
            failure_count = record.failure_count,
            failure_reason = record.failure_reason.as_deref().unwrap_or(""),
            "Record permanently failed"
        );
        self.count_outcome("failed");
        DispatchOutcome::Failed
    }

    async fn invoke_primary(&self, record: &OutboxRecord) -> Result<(), DispatchError> {
        let handler = self
            .registry
            .handler_by_id(&record.handler_id)
            .ok_or_else(|| {
                error!(
                    record_id = %record.id,
                    handler_id = %record.handler_id,
                    "No handler registered for persisted record"
                );
                DispatchError::with_class(
                    "ConfigurationError",
                    format!("no handler registered with id '{}'", record.handler_id),
                )
            })?;

        let span = dispatch_span(record);
        handler
            .invoke(&record.payload, record.metadata())
            .instrument(span)
            .await
    }

    async fn complete(&self, mut record: OutboxRecord) -> DispatchOutcome {
        record.mark_completed(Utc::now());
        let finalize = if self.delete_completed_records {
            self.store.delete_by_id(record.id).await
        } else {
            self.store.save(&record).await
        };
        if let Err(e) = finalize {
            error!(
                record_id = %record.id,
                error = ?e,
                "Failed to finalize completed record, it will be re-dispatched"
            );
            return DispatchOutcome::Abandoned;
        }
        debug!(
            record_id = %record.id,
            handler_id = %record.handler_id,
            "Record completed"
        );
        self.count_outcome("completed");
        DispatchOutcome::Completed
    }

    fn count_outcome(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.dispatched.with_label_values(&[outcome]).inc();
        }
    }
}
