//! # Transactional Outbox Delivery Engine
//!
//! This library implements the transactional outbox pattern: domain events
//! are durably enqueued in PostgreSQL inside the same transaction that
//! mutates business state, and an asynchronous delivery engine dispatches
//! them to registered handlers with at-least-once semantics, per-key
//! ordering, retries and graceful degradation.
//!
//! ## Guarantees
//!
//! - **Atomic enqueue**: records are inserted within the caller's business
//!   transaction; either both commit or neither does.
//! - **At-least-once delivery**: every record is dispatched until it reaches
//!   a terminal state. Handlers must be idempotent.
//! - **Per-key ordering**: records sharing a key dispatch serially in
//!   creation order; distinct keys run fully in parallel.
//! - **Single writer per key**: keys hash to stable partitions, partitions
//!   are assigned to exactly one instance cluster-wide, and within an
//!   instance an in-flight guard serializes each key.
//! - **Graceful degradation**: failures walk the
//!   Primary → Retry → Fallback → PermanentFailure chain with configurable
//!   backoff and error-class filtering.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox::{outbox_context, HandlerRegistry, OutboxConfig, OutboxEngine, OutboxPayload};
//! use serde::{Deserialize, Serialize};
//! use sqlx::PgPool;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderCreated {
//!     order_id: String,
//! }
//!
//! impl OutboxPayload for OrderCreated {
//!     fn record_type() -> &'static str {
//!         "order.created"
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = PgPool::connect("postgresql://localhost/app").await?;
//!
//!     // 1. Register handlers once, at startup
//!     let config = OutboxConfig::from_env();
//!     let mut handlers = HandlerRegistry::new(config.default_retry_policy());
//!     handlers.register_typed::<OrderCreated, _, _>(
//!         "order-handler",
//!         None,
//!         |order, metadata| async move {
//!             println!("shipping {} for tenant {:?}", order.order_id, metadata.context.get("tenant"));
//!             Ok(())
//!         },
//!     )?;
//!
//!     // 2. Start the delivery engine
//!     let engine = OutboxEngine::new(pool.clone(), config, handlers, Vec::new())?;
//!     engine.start().await?;
//!
//!     // 3. Schedule records inside business transactions
//!     let outbox = engine.outbox();
//!     let mut tx = pool.begin().await?;
//!     sqlx::query("INSERT INTO orders (id) VALUES ($1)")
//!         .bind("o1")
//!         .execute(&mut *tx)
//!         .await?;
//!     outbox
//!         .schedule(
//!             &mut tx,
//!             &OrderCreated { order_id: "o1".into() },
//!             "o1",
//!             outbox_context! { "tenant" => "acme" },
//!         )
//!         .await?;
//!     tx.commit().await?;
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

use sqlx::{Postgres, Transaction};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

pub mod codec;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod handler;
pub mod instance;
pub mod macros;
pub mod metrics;
pub mod partition;
pub mod processor;
pub mod record;
pub mod retry;
pub mod routing;
pub mod scheduler;
pub mod store;

pub use codec::OutboxPayload;
pub use config::OutboxConfig;
pub use context::{ContextProvider, TraceContextProvider};
pub use engine::OutboxEngine;
pub use error::{DispatchError, OutboxError, OutboxResult};
pub use handler::{FallbackHandler, HandlerKind, HandlerRegistry, OutboxHandler};
pub use metrics::OutboxMetrics;
pub use record::{ContextMap, FailureContext, OutboxRecord, RecordMetadata, RecordStatus};
pub use retry::{Backoff, RetryPolicy};
pub use store::{InMemoryRecordStore, RecordStore, SqlxRecordStore};

/// The scheduling façade.
///
/// All `schedule` variants require the caller's open database transaction:
/// the record insert commits or rolls back together with the business
/// write. One record is created per applicable handler; when nothing
/// applies, nothing is written and the call succeeds with no ids.
#[derive(Clone)]
pub struct Outbox {
    store: Arc<SqlxRecordStore>,
    handlers: Arc<HandlerRegistry>,
    providers: Vec<Arc<dyn ContextProvider>>,
    total_partitions: i32,
}

impl Outbox {
    /// Build a façade over an existing store and registry.
    ///
    /// Usually obtained from [`OutboxEngine::outbox`]; constructing it
    /// directly is useful for processes that only schedule and leave
    /// delivery to other instances.
    pub fn new(
        store: Arc<SqlxRecordStore>,
        handlers: Arc<HandlerRegistry>,
        providers: Vec<Arc<dyn ContextProvider>>,
        total_partitions: i32,
    ) -> Self {
        Self {
            store,
            handlers,
            providers,
            total_partitions,
        }
    }

    /// Schedule a payload under a key with additional per-call context.
    ///
    /// The context stored on the record is the composition of all registered
    /// providers (in order, failing providers skipped) with
    /// `additional_context` overlaid last. Returns the ids of the created
    /// records, one per applicable handler.
    pub async fn schedule<T: OutboxPayload>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &T,
        key: &str,
        additional_context: ContextMap,
    ) -> OutboxResult<Vec<Uuid>> {
        let (record_type, raw) = codec::encode_payload(payload)?;
        let applicable = self.handlers.handlers_for(&record_type);
        if applicable.is_empty() {
            debug!(
                record_type = %record_type,
                "No applicable handler, nothing scheduled"
            );
            return Ok(Vec::new());
        }

        let context = context::merge_context(&self.providers, &additional_context);
        let mut ids = Vec::with_capacity(applicable.len());
        for handler in applicable.iter() {
            let record = OutboxRecord::new(
                key,
                &record_type,
                raw.clone(),
                context.clone(),
                &handler.id,
                self.total_partitions,
            );
            self.store.insert(tx, &record).await?;
            ids.push(record.id);
        }

        debug!(
            record_key = %key,
            record_type = %record_type,
            records = ids.len(),
            "Scheduled outbox records"
        );

        Ok(ids)
    }

    /// Schedule a payload under a key, with no additional context.
    pub async fn schedule_keyed<T: OutboxPayload>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &T,
        key: &str,
    ) -> OutboxResult<Vec<Uuid>> {
        self.schedule(tx, payload, key, ContextMap::new()).await
    }

    /// Schedule a payload with a fresh UUID key and additional context.
    /// The record has no ordering relationship with any other record.
    pub async fn schedule_with_context<T: OutboxPayload>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &T,
        additional_context: ContextMap,
    ) -> OutboxResult<Vec<Uuid>> {
        let key = Uuid::new_v4().to_string();
        self.schedule(tx, payload, &key, additional_context).await
    }

    /// Schedule a payload with a fresh UUID key.
    pub async fn schedule_unkeyed<T: OutboxPayload>(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        payload: &T,
    ) -> OutboxResult<Vec<Uuid>> {
        let key = Uuid::new_v4().to_string();
        self.schedule(tx, payload, &key, ContextMap::new()).await
    }
}
