//! Handler registration and resolution.
//!
//! Handlers are registered once at startup and shared immutably for the
//! process lifetime. There is no runtime discovery: registration is an
//! explicit table of `(descriptor, function)` pairs, and payload matching is
//! an exact type-tag lookup plus the list of generic handlers.
//!
//! ```no_run
//! use outbox::{HandlerRegistry, OutboxPayload, RetryPolicy};
//! use serde::{Deserialize, Serialize};
//! use std::time::Duration;
//!
//! #[derive(Serialize, Deserialize)]
//! struct OrderCreated {
//!     order_id: String,
//! }
//!
//! impl OutboxPayload for OrderCreated {}
//!
//! # fn main() -> outbox::OutboxResult<()> {
//! let mut registry = HandlerRegistry::new(RetryPolicy::default());
//! registry.register_typed::<OrderCreated, _, _>(
//!     "order-handler",
//!     Some(RetryPolicy::fixed(Duration::from_secs(1), 5)),
//!     |order, _metadata| async move {
//!         println!("shipping {}", order.order_id);
//!         Ok(())
//!     },
//! )?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::codec::{decode_payload, OutboxPayload};
use crate::error::{DispatchError, OutboxError, OutboxResult};
use crate::record::{FailureContext, RecordMetadata};
use crate::retry::RetryPolicy;

/// Classifies a handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Consumes one concrete payload type.
    Typed,
    /// Consumes every payload.
    Generic,
    /// Terminal compensation for another handler's failures.
    Fallback,
}

/// A registered consumer of outbox payloads.
///
/// Implementations receive the raw serialized payload; the closure adapters
/// built by [`HandlerRegistry::register_typed`] decode it first.
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    async fn invoke(&self, payload: &str, metadata: RecordMetadata) -> Result<(), DispatchError>;
}

/// Terminal compensation invoked when a record's retries are spent or its
/// error is non-retryable.
#[async_trait]
pub trait FallbackHandler: Send + Sync {
    async fn invoke(&self, payload: &str, failure: FailureContext) -> Result<(), DispatchError>;
}

/// Static descriptor of a registered handler.
pub struct HandlerRegistration {
    pub id: String,
    pub kind: HandlerKind,
    /// Type tag consumed by a typed handler; `None` for generic handlers.
    pub payload_type: Option<String>,
    pub retry_policy: Arc<RetryPolicy>,
    handler: Arc<dyn OutboxHandler>,
}

impl HandlerRegistration {
    pub async fn invoke(
        &self,
        payload: &str,
        metadata: RecordMetadata,
    ) -> Result<(), DispatchError> {
        self.handler.invoke(payload, metadata).await
    }
}

struct TypedAdapter<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> OutboxHandler for TypedAdapter<T, F>
where
    T: OutboxPayload,
    F: Fn(T, RecordMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DispatchError>> + Send,
{
    async fn invoke(&self, payload: &str, metadata: RecordMetadata) -> Result<(), DispatchError> {
        let payload: T = decode_payload(payload)?;
        (self.f)(payload, metadata).await
    }
}

struct GenericAdapter<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> OutboxHandler for GenericAdapter<F>
where
    F: Fn(String, RecordMetadata) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DispatchError>> + Send,
{
    async fn invoke(&self, payload: &str, metadata: RecordMetadata) -> Result<(), DispatchError> {
        (self.f)(payload.to_string(), metadata).await
    }
}

struct TypedFallbackAdapter<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> FallbackHandler for TypedFallbackAdapter<T, F>
where
    T: OutboxPayload,
    F: Fn(T, FailureContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DispatchError>> + Send,
{
    async fn invoke(&self, payload: &str, failure: FailureContext) -> Result<(), DispatchError> {
        let payload: T = decode_payload(payload)?;
        (self.f)(payload, failure).await
    }
}

struct GenericFallbackAdapter<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> FallbackHandler for GenericFallbackAdapter<F>
where
    F: Fn(String, FailureContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), DispatchError>> + Send,
{
    async fn invoke(&self, payload: &str, failure: FailureContext) -> Result<(), DispatchError> {
        (self.f)(payload.to_string(), failure).await
    }
}

/// Startup-built table of handlers, shared immutably once the engine runs.
///
/// Resolution for a payload returns every typed handler whose tag matches
/// plus every generic handler, in registration order; one record is written
/// per resolved handler. Results are cached per type tag.
pub struct HandlerRegistry {
    handlers: Vec<Arc<HandlerRegistration>>,
    by_id: HashMap<String, Arc<HandlerRegistration>>,
    fallbacks: HashMap<String, Arc<dyn FallbackHandler>>,
    resolution_cache: DashMap<String, Arc<Vec<Arc<HandlerRegistration>>>>,
    default_policy: Arc<RetryPolicy>,
}

impl HandlerRegistry {
    pub fn new(default_policy: RetryPolicy) -> Self {
        Self {
            handlers: Vec::new(),
            by_id: HashMap::new(),
            fallbacks: HashMap::new(),
            resolution_cache: DashMap::new(),
            default_policy: Arc::new(default_policy),
        }
    }

    /// Register a handler for one concrete payload type.
    ///
    /// `policy` overrides the engine default for this handler only.
    /// Fails fast on a duplicate handler id or an invalid policy.
    pub fn register_typed<T, F, Fut>(
        &mut self,
        id: &str,
        policy: Option<RetryPolicy>,
        f: F,
    ) -> OutboxResult<()>
    where
        T: OutboxPayload,
        F: Fn(T, RecordMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.register(
            id,
            HandlerKind::Typed,
            Some(T::record_type().to_string()),
            policy,
            Arc::new(TypedAdapter::<T, F> {
                f,
                _payload: PhantomData,
            }),
        )
    }

    /// Register a handler that consumes every payload.
    ///
    /// The closure receives the raw serialized payload; the metadata's
    /// `record_type` names the concrete type.
    pub fn register_generic<F, Fut>(
        &mut self,
        id: &str,
        policy: Option<RetryPolicy>,
        f: F,
    ) -> OutboxResult<()>
    where
        F: Fn(String, RecordMetadata) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.register(
            id,
            HandlerKind::Generic,
            None,
            policy,
            Arc::new(GenericAdapter { f }),
        )
    }

    /// Register a pre-built handler object as a generic handler.
    ///
    /// Used by broker adapters that implement [`OutboxHandler`] directly.
    pub fn register_generic_handler(
        &mut self,
        id: &str,
        policy: Option<RetryPolicy>,
        handler: Arc<dyn OutboxHandler>,
    ) -> OutboxResult<()> {
        self.register(id, HandlerKind::Generic, None, policy, handler)
    }

    /// Associate a typed fallback with an already-registered handler.
    ///
    /// At most one fallback per handler id; a second registration, an
    /// unknown handler id, or a payload-type mismatch fails fast.
    pub fn register_fallback<T, F, Fut>(&mut self, for_handler_id: &str, f: F) -> OutboxResult<()>
    where
        T: OutboxPayload,
        F: Fn(T, FailureContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        let target = self.require_fallback_target(for_handler_id)?;
        if let Some(payload_type) = &target.payload_type {
            if payload_type != T::record_type() {
                return Err(OutboxError::Configuration(format!(
                    "fallback payload type {} does not match handler '{}' payload type {}",
                    T::record_type(),
                    for_handler_id,
                    payload_type
                )));
            }
        }
        self.insert_fallback(
            for_handler_id,
            Arc::new(TypedFallbackAdapter::<T, F> {
                f,
                _payload: PhantomData,
            }),
        )
    }

    /// Associate a generic fallback (raw payload) with a handler.
    pub fn register_generic_fallback<F, Fut>(
        &mut self,
        for_handler_id: &str,
        f: F,
    ) -> OutboxResult<()>
    where
        F: Fn(String, FailureContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DispatchError>> + Send + 'static,
    {
        self.require_fallback_target(for_handler_id)?;
        self.insert_fallback(for_handler_id, Arc::new(GenericFallbackAdapter { f }))
    }

    fn register(
        &mut self,
        id: &str,
        kind: HandlerKind,
        payload_type: Option<String>,
        policy: Option<RetryPolicy>,
        handler: Arc<dyn OutboxHandler>,
    ) -> OutboxResult<()> {
        if self.by_id.contains_key(id) {
            return Err(OutboxError::Configuration(format!(
                "handler '{id}' is already registered"
            )));
        }
        let retry_policy = match policy {
            Some(policy) => {
                policy.validate()?;
                Arc::new(policy)
            }
            None => Arc::clone(&self.default_policy),
        };
        let registration = Arc::new(HandlerRegistration {
            id: id.to_string(),
            kind,
            payload_type,
            retry_policy,
            handler,
        });
        self.handlers.push(Arc::clone(&registration));
        self.by_id.insert(id.to_string(), registration);
        self.resolution_cache.clear();
        Ok(())
    }

    fn require_fallback_target(&self, handler_id: &str) -> OutboxResult<&HandlerRegistration> {
        if self.fallbacks.contains_key(handler_id) {
            return Err(OutboxError::Configuration(format!(
                "handler '{handler_id}' already has a fallback registered"
            )));
        }
        self.by_id
            .get(handler_id)
            .map(Arc::as_ref)
            .ok_or_else(|| {
                OutboxError::Configuration(format!(
                    "cannot register fallback for unknown handler '{handler_id}'"
                ))
            })
    }

    fn insert_fallback(
        &mut self,
        handler_id: &str,
        fallback: Arc<dyn FallbackHandler>,
    ) -> OutboxResult<()> {
        self.fallbacks.insert(handler_id.to_string(), fallback);
        Ok(())
    }

    /// Every handler applicable to a payload type: typed handlers with a
    /// matching tag plus all generic handlers, in registration order.
    pub fn handlers_for(&self, record_type: &str) -> Arc<Vec<Arc<HandlerRegistration>>> {
        if let Some(cached) = self.resolution_cache.get(record_type) {
            return Arc::clone(&cached);
        }
        let resolved: Vec<Arc<HandlerRegistration>> = self
            .handlers
            .iter()
            .filter(|h| match &h.payload_type {
                Some(tag) => tag == record_type,
                None => true,
            })
            .cloned()
            .collect();
        let resolved = Arc::new(resolved);
        self.resolution_cache
            .insert(record_type.to_string(), Arc::clone(&resolved));
        resolved
    }

    pub fn handler_by_id(&self, id: &str) -> Option<Arc<HandlerRegistration>> {
        self.by_id.get(id).cloned()
    }

    /// The retry policy governing a handler, falling back to the engine default
    /// when the handler is unknown.
    pub fn retry_policy_for(&self, handler_id: &str) -> Arc<RetryPolicy> {
        self.by_id
            .get(handler_id)
            .map(|h| Arc::clone(&h.retry_policy))
            .unwrap_or_else(|| Arc::clone(&self.default_policy))
    }

    pub fn fallback_for(&self, handler_id: &str) -> Option<Arc<dyn FallbackHandler>> {
        self.fallbacks.get(handler_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContextMap;
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: String,
    }

    impl OutboxPayload for OrderCreated {
        fn record_type() -> &'static str {
            "order.created"
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct InvoiceIssued {
        invoice_id: String,
    }

    impl OutboxPayload for InvoiceIssued {
        fn record_type() -> &'static str {
            "invoice.issued"
        }
    }

    fn metadata_for(handler_id: &str) -> RecordMetadata {
        RecordMetadata {
            id: Uuid::new_v4(),
            key: "k".to_string(),
            record_type: "order.created".to_string(),
            handler_id: handler_id.to_string(),
            created_at: Utc::now(),
            context: ContextMap::new(),
        }
    }

    #[test]
    fn typed_match_plus_generics_in_registration_order() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, |_, _| async { Ok(()) })
            .unwrap();
        registry
            .register_generic("audit", None, |_, _| async { Ok(()) })
            .unwrap();
        registry
            .register_typed::<InvoiceIssued, _, _>("invoices", None, |_, _| async { Ok(()) })
            .unwrap();

        let resolved = registry.handlers_for("order.created");
        let ids: Vec<&str> = resolved.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["orders", "audit"]);

        let resolved = registry.handlers_for("invoice.issued");
        let ids: Vec<&str> = resolved.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["audit", "invoices"]);

        // unknown type still reaches generic handlers
        let resolved = registry.handlers_for("unknown.type");
        let ids: Vec<&str> = resolved.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["audit"]);
    }

    #[test]
    fn resolution_is_cached_per_type_tag() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, |_, _| async { Ok(()) })
            .unwrap();

        let first = registry.handlers_for("order.created");
        let second = registry.handlers_for("order.created");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn duplicate_handler_id_fails_fast() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, |_, _| async { Ok(()) })
            .unwrap();
        let err = registry
            .register_generic("orders", None, |_, _| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, OutboxError::Configuration(_)));
    }

    #[test]
    fn duplicate_fallback_fails_fast() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, |_, _| async { Ok(()) })
            .unwrap();
        registry
            .register_fallback::<OrderCreated, _, _>("orders", |_, _| async { Ok(()) })
            .unwrap();
        let err = registry
            .register_fallback::<OrderCreated, _, _>("orders", |_, _| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, OutboxError::Configuration(_)));
    }

    #[test]
    fn fallback_for_unknown_handler_fails_fast() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        let err = registry
            .register_fallback::<OrderCreated, _, _>("missing", |_, _| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, OutboxError::Configuration(_)));
    }

    #[test]
    fn fallback_payload_type_mismatch_fails_fast() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, |_, _| async { Ok(()) })
            .unwrap();
        let err = registry
            .register_fallback::<InvoiceIssued, _, _>("orders", |_, _| async { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, OutboxError::Configuration(_)));
    }

    #[test]
    fn per_handler_policy_overrides_the_default() {
        let mut registry = HandlerRegistry::new(RetryPolicy::fixed(Duration::from_secs(1), 9));
        registry
            .register_typed::<OrderCreated, _, _>(
                "orders",
                Some(RetryPolicy::fixed(Duration::from_secs(1), 2)),
                |_, _| async { Ok(()) },
            )
            .unwrap();
        registry
            .register_generic("audit", None, |_, _| async { Ok(()) })
            .unwrap();

        assert_eq!(registry.retry_policy_for("orders").max_retries, 2);
        assert_eq!(registry.retry_policy_for("audit").max_retries, 9);
        assert_eq!(registry.retry_policy_for("unknown").max_retries, 9);
    }

    #[tokio::test]
    async fn typed_adapter_decodes_before_invoking() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, move |order, metadata| {
                let seen = seen.clone();
                async move {
                    assert_eq!(order.order_id, "o1");
                    assert_eq!(metadata.handler_id, "orders");
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .unwrap();

        let handler = registry.handler_by_id("orders").unwrap();
        handler
            .invoke(r#"{"order_id":"o1"}"#, metadata_for("orders"))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn typed_adapter_classes_decode_failures() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_typed::<OrderCreated, _, _>("orders", None, |_, _| async { Ok(()) })
            .unwrap();

        let handler = registry.handler_by_id("orders").unwrap();
        let err = handler
            .invoke("not json", metadata_for("orders"))
            .await
            .unwrap_err();
        assert_eq!(err.class, "SerializationError");
    }

    #[tokio::test]
    async fn generic_adapter_receives_raw_payload() {
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        registry
            .register_generic("audit", None, |raw, metadata| async move {
                assert_eq!(raw, r#"{"order_id":"o1"}"#);
                assert_eq!(metadata.record_type, "order.created");
                Ok(())
            })
            .unwrap();

        let handler = registry.handler_by_id("audit").unwrap();
        handler
            .invoke(r#"{"order_id":"o1"}"#, metadata_for("audit"))
            .await
            .unwrap();
    }
}
