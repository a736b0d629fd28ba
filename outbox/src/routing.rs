//! Selector-based routing of records to broker targets.
//!
//! A routing table is an ordered list of rules; the first rule whose
//! selector matches a message wins. Each rule names a target (topic, queue,
//! exchange — whatever the publisher understands) and may override the
//! message key, attach headers, or map the outbound payload. A `defaults`
//! target catches everything unmatched; without one, an unmatched message is
//! a dispatch failure so the processor chain records it.
//!
//! ```
//! use outbox::routing::{Route, RouteTable};
//!
//! let table = RouteTable::builder()
//!     .route(
//!         Route::for_type("order.created")
//!             .to("orders")
//!             .key(|m| format!("order-{}", m.metadata.key))
//!             .headers(|_| vec![("source".to_string(), "outbox".to_string())]),
//!     )
//!     .route(Route::for_context_value("tenant", "internal").to("internal-events"))
//!     .defaults("events")
//!     .build();
//! # let _ = table;
//! ```

use async_trait::async_trait;
use tracing::debug;

use crate::error::DispatchError;
use crate::record::RecordMetadata;

/// The message visible to selectors and mapping hooks.
pub struct RouteMessage<'a> {
    pub record_type: &'a str,
    pub payload: &'a str,
    pub metadata: &'a RecordMetadata,
}

type PredicateFn = Box<dyn Fn(&RouteMessage<'_>) -> bool + Send + Sync>;
type KeyFn = Box<dyn Fn(&RouteMessage<'_>) -> String + Send + Sync>;
type HeadersFn = Box<dyn Fn(&RouteMessage<'_>) -> Vec<(String, String)> + Send + Sync>;
type MappingFn = Box<dyn Fn(&RouteMessage<'_>) -> String + Send + Sync>;

enum Selector {
    /// Exact record type tag match.
    RecordType(String),
    /// Arbitrary predicate over the message.
    Predicate(PredicateFn),
    /// A context entry equals the given value.
    ContextValue { key: String, value: String },
}

impl Selector {
    fn matches(&self, message: &RouteMessage<'_>) -> bool {
        match self {
            Selector::RecordType(tag) => tag == message.record_type,
            Selector::Predicate(predicate) => predicate(message),
            Selector::ContextValue { key, value } => message
                .metadata
                .context
                .get(key)
                .is_some_and(|v| v == value),
        }
    }
}

/// One routing rule under construction.
pub struct Route {
    selector: Selector,
    target: Option<String>,
    key: Option<KeyFn>,
    headers: Option<HeadersFn>,
    mapping: Option<MappingFn>,
    filter: Option<PredicateFn>,
}

impl Route {
    /// Match messages of one record type.
    pub fn for_type(record_type: impl Into<String>) -> Self {
        Self::with_selector(Selector::RecordType(record_type.into()))
    }

    /// Match messages by predicate.
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&RouteMessage<'_>) -> bool + Send + Sync + 'static,
    {
        Self::with_selector(Selector::Predicate(Box::new(predicate)))
    }

    /// Match messages whose context entry `key` equals `value`.
    pub fn for_context_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::with_selector(Selector::ContextValue {
            key: key.into(),
            value: value.into(),
        })
    }

    fn with_selector(selector: Selector) -> Self {
        Self {
            selector,
            target: None,
            key: None,
            headers: None,
            mapping: None,
            filter: None,
        }
    }

    /// The broker target this rule publishes to.
    pub fn to(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Override the outbound message key (defaults to the record key).
    pub fn key<F>(mut self, key: F) -> Self
    where
        F: Fn(&RouteMessage<'_>) -> String + Send + Sync + 'static,
    {
        self.key = Some(Box::new(key));
        self
    }

    /// Attach headers to the outbound message (defaults to none).
    pub fn headers<F>(mut self, headers: F) -> Self
    where
        F: Fn(&RouteMessage<'_>) -> Vec<(String, String)> + Send + Sync + 'static,
    {
        self.headers = Some(Box::new(headers));
        self
    }

    /// Map the outbound payload (defaults to the stored payload verbatim).
    pub fn mapping<F>(mut self, mapping: F) -> Self
    where
        F: Fn(&RouteMessage<'_>) -> String + Send + Sync + 'static,
    {
        self.mapping = Some(Box::new(mapping));
        self
    }

    /// Drop messages for which the filter returns false; a dropped message
    /// counts as successfully dispatched.
    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&RouteMessage<'_>) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(filter));
        self
    }
}

/// The outbound message a rule resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoute {
    pub target: String,
    pub key: String,
    pub headers: Vec<(String, String)>,
    pub payload: String,
}

/// Ordered routing rules plus an optional catch-all target.
pub struct RouteTable {
    rules: Vec<Route>,
    default_target: Option<String>,
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder {
            rules: Vec::new(),
            default_target: None,
        }
    }

    /// Resolve a message against the table.
    ///
    /// `Ok(None)` means the message was filtered out and must be treated as
    /// dispatched. An unmatched message without a default target is an
    /// error, surfaced through the processor chain like any handler failure.
    pub fn resolve(
        &self,
        message: &RouteMessage<'_>,
    ) -> Result<Option<ResolvedRoute>, DispatchError> {
        for rule in &self.rules {
            if !rule.selector.matches(message) {
                continue;
            }
            if let Some(filter) = &rule.filter {
                if !filter(message) {
                    debug!(
                        record_type = message.record_type,
                        record_key = %message.metadata.key,
                        "Message filtered out by routing rule"
                    );
                    return Ok(None);
                }
            }
            let target = rule.target.clone().ok_or_else(|| {
                DispatchError::with_class(
                    "ConfigurationError",
                    format!("routing rule for {} has no target", message.record_type),
                )
            })?;
            return Ok(Some(ResolvedRoute {
                target,
                key: rule
                    .key
                    .as_ref()
                    .map(|f| f(message))
                    .unwrap_or_else(|| message.metadata.key.clone()),
                headers: rule.headers.as_ref().map(|f| f(message)).unwrap_or_default(),
                payload: rule
                    .mapping
                    .as_ref()
                    .map(|f| f(message))
                    .unwrap_or_else(|| message.payload.to_string()),
            }));
        }

        match &self.default_target {
            Some(target) => Ok(Some(ResolvedRoute {
                target: target.clone(),
                key: message.metadata.key.clone(),
                headers: Vec::new(),
                payload: message.payload.to_string(),
            })),
            None => Err(DispatchError::with_class(
                "RoutingError",
                format!("no route matches record type {}", message.record_type),
            )),
        }
    }
}

pub struct RouteTableBuilder {
    rules: Vec<Route>,
    default_target: Option<String>,
}

impl RouteTableBuilder {
    /// Append a rule; rules are evaluated in insertion order.
    pub fn route(mut self, route: Route) -> Self {
        self.rules.push(route);
        self
    }

    /// Catch-all target for unmatched messages.
    pub fn defaults(mut self, target: impl Into<String>) -> Self {
        self.default_target = Some(target.into());
        self
    }

    pub fn build(self) -> RouteTable {
        RouteTable {
            rules: self.rules,
            default_target: self.default_target,
        }
    }
}

/// Broker seam: publishes one resolved message.
///
/// Errors propagate into the processor chain, which records the failure and
/// drives retry/fallback like for any other handler.
#[async_trait]
pub trait RoutePublisher: Send + Sync {
    async fn publish(&self, route: &ResolvedRoute) -> Result<(), DispatchError>;
}

/// Routes records through a table to a publisher.
pub struct MessageRouter<P: RoutePublisher> {
    table: RouteTable,
    publisher: P,
}

impl<P: RoutePublisher> MessageRouter<P> {
    pub fn new(table: RouteTable, publisher: P) -> Self {
        Self { table, publisher }
    }

    /// Resolve and publish one record. Filtered messages succeed silently.
    pub async fn dispatch(
        &self,
        record_type: &str,
        payload: &str,
        metadata: &RecordMetadata,
    ) -> Result<(), DispatchError> {
        let message = RouteMessage {
            record_type,
            payload,
            metadata,
        };
        match self.table.resolve(&message)? {
            Some(route) => self.publisher.publish(&route).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::ContextMap;
    use chrono::Utc;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn metadata(key: &str, context: &[(&str, &str)]) -> RecordMetadata {
        RecordMetadata {
            id: Uuid::new_v4(),
            key: key.to_string(),
            record_type: "order.created".to_string(),
            handler_id: "router".to_string(),
            created_at: Utc::now(),
            context: context
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<ContextMap>(),
        }
    }

    fn message<'a>(
        record_type: &'a str,
        payload: &'a str,
        metadata: &'a RecordMetadata,
    ) -> RouteMessage<'a> {
        RouteMessage {
            record_type,
            payload,
            metadata,
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = RouteTable::builder()
            .route(Route::for_type("order.created").to("orders"))
            .route(Route::when(|_| true).to("everything"))
            .build();

        let meta = metadata("k", &[]);
        let resolved = table
            .resolve(&message("order.created", "{}", &meta))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.target, "orders");

        let resolved = table
            .resolve(&message("invoice.issued", "{}", &meta))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.target, "everything");
    }

    #[test]
    fn defaults_catch_unmatched_messages() {
        let table = RouteTable::builder()
            .route(Route::for_type("order.created").to("orders"))
            .defaults("events")
            .build();

        let meta = metadata("k", &[]);
        let resolved = table
            .resolve(&message("unknown.type", "{}", &meta))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.target, "events");
        assert_eq!(resolved.key, "k");
        assert!(resolved.headers.is_empty());
    }

    #[test]
    fn unmatched_without_defaults_is_a_routing_error() {
        let table = RouteTable::builder()
            .route(Route::for_type("order.created").to("orders"))
            .build();

        let meta = metadata("k", &[]);
        let err = table
            .resolve(&message("unknown.type", "{}", &meta))
            .unwrap_err();
        assert_eq!(err.class, "RoutingError");
    }

    #[test]
    fn context_value_selector_reads_the_metadata() {
        let table = RouteTable::builder()
            .route(Route::for_context_value("tenant", "internal").to("internal-events"))
            .defaults("events")
            .build();

        let internal = metadata("k", &[("tenant", "internal")]);
        let external = metadata("k", &[("tenant", "acme")]);
        assert_eq!(
            table
                .resolve(&message("t", "{}", &internal))
                .unwrap()
                .unwrap()
                .target,
            "internal-events"
        );
        assert_eq!(
            table
                .resolve(&message("t", "{}", &external))
                .unwrap()
                .unwrap()
                .target,
            "events"
        );
    }

    #[test]
    fn filtered_messages_resolve_to_none() {
        let table = RouteTable::builder()
            .route(
                Route::for_type("order.created")
                    .to("orders")
                    .filter(|m| m.metadata.key != "skip-me"),
            )
            .build();

        let keep = metadata("k", &[]);
        let skip = metadata("skip-me", &[]);
        assert!(table
            .resolve(&message("order.created", "{}", &keep))
            .unwrap()
            .is_some());
        assert!(table
            .resolve(&message("order.created", "{}", &skip))
            .unwrap()
            .is_none());
    }

    #[test]
    fn key_headers_and_mapping_hooks_apply() {
        let table = RouteTable::builder()
            .route(
                Route::for_type("order.created")
                    .to("orders")
                    .key(|m| format!("order-{}", m.metadata.key))
                    .headers(|m| vec![("type".to_string(), m.record_type.to_string())])
                    .mapping(|m| format!(r#"{{"wrapped":{}}}"#, m.payload)),
            )
            .build();

        let meta = metadata("42", &[]);
        let resolved = table
            .resolve(&message("order.created", r#"{"n":1}"#, &meta))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.key, "order-42");
        assert_eq!(
            resolved.headers,
            vec![("type".to_string(), "order.created".to_string())]
        );
        assert_eq!(resolved.payload, r#"{"wrapped":{"n":1}}"#);
    }

    struct RecordingPublisher {
        published: Mutex<Vec<ResolvedRoute>>,
    }

    #[async_trait]
    impl RoutePublisher for RecordingPublisher {
        async fn publish(&self, route: &ResolvedRoute) -> Result<(), DispatchError> {
            self.published.lock().unwrap().push(route.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn router_publishes_resolved_messages_and_skips_filtered_ones() {
        let table = RouteTable::builder()
            .route(
                Route::for_type("order.created")
                    .to("orders")
                    .filter(|m| m.metadata.key != "skip-me"),
            )
            .build();
        let router = MessageRouter::new(
            table,
            RecordingPublisher {
                published: Mutex::new(Vec::new()),
            },
        );

        let keep = metadata("k", &[]);
        router
            .dispatch("order.created", "{}", &keep)
            .await
            .unwrap();

        let skip = metadata("skip-me", &[]);
        router
            .dispatch("order.created", "{}", &skip)
            .await
            .unwrap();

        let published = router.publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].target, "orders");
    }
}
