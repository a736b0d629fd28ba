//! # Kafka binding for the outbox delivery engine
//!
//! Publishes routed outbox records to Kafka. The binding is just an
//! implementation of the engine's handler contract: register the
//! [`KafkaRoutingHandler`] as a generic handler and every scheduled record
//! flows through the routing table to a topic.
//!
//! ## Kafka Configuration Requirements
//!
//! The producer SHOULD be configured with:
//! - `enable.idempotence = true` (prevents broker-side duplicates)
//! - `acks = all` (ensures durability)
//! - `max.in.flight.requests.per.connection = 5` (with idempotence)
//!
//! The outbox itself delivers at-least-once; consumers must still be
//! idempotent.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use outbox::routing::{Route, RouteTable};
//! use outbox::{HandlerRegistry, RetryPolicy};
//! use outbox_kafka::KafkaRoutingHandler;
//! use rdkafka::producer::FutureProducer;
//! use rdkafka::ClientConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let producer: FutureProducer = ClientConfig::new()
//!     .set("bootstrap.servers", "localhost:9092")
//!     .set("enable.idempotence", "true")
//!     .set("acks", "all")
//!     .create()?;
//!
//! let table = RouteTable::builder()
//!     .route(Route::for_type("order.created").to("orders"))
//!     .defaults("events")
//!     .build();
//!
//! let mut registry = HandlerRegistry::new(RetryPolicy::default());
//! KafkaRoutingHandler::new(table, producer).register(&mut registry, "kafka-router", None)?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use outbox::routing::{MessageRouter, ResolvedRoute, RoutePublisher, RouteTable};
use outbox::{
    DispatchError, HandlerRegistry, OutboxHandler, OutboxResult, RecordMetadata, RetryPolicy,
};

/// Publishes resolved routes to Kafka topics.
///
/// The route target is the topic, the route key is the Kafka message key
/// (preserving per-key ordering on a single topic partition), and route
/// headers become Kafka headers.
pub struct KafkaRoutePublisher {
    producer: FutureProducer,
    delivery_timeout: Duration,
}

impl KafkaRoutePublisher {
    pub fn new(producer: FutureProducer) -> Self {
        Self {
            producer,
            delivery_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_delivery_timeout(mut self, delivery_timeout: Duration) -> Self {
        self.delivery_timeout = delivery_timeout;
        self
    }
}

fn build_headers(route: &ResolvedRoute) -> OwnedHeaders {
    let mut headers = OwnedHeaders::new();
    for (key, value) in &route.headers {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_bytes()),
        });
    }
    headers
}

#[async_trait]
impl RoutePublisher for KafkaRoutePublisher {
    async fn publish(&self, route: &ResolvedRoute) -> Result<(), DispatchError> {
        let record = FutureRecord::to(&route.target)
            .key(&route.key)
            .payload(&route.payload)
            .headers(build_headers(route));

        self.producer
            .send(record, self.delivery_timeout)
            .await
            .map_err(|(err, _)| {
                DispatchError::with_class("KafkaError", format!("Kafka publish failed: {err}"))
            })?;

        info!(
            topic = %route.target,
            message_key = %route.key,
            "Message published to Kafka"
        );

        Ok(())
    }
}

/// A generic outbox handler that routes every record to Kafka.
///
/// Publish failures propagate into the processor chain, so delivery
/// inherits the engine's retry, fallback and permanent-failure handling.
pub struct KafkaRoutingHandler {
    router: MessageRouter<KafkaRoutePublisher>,
}

impl KafkaRoutingHandler {
    pub fn new(table: RouteTable, producer: FutureProducer) -> Self {
        Self {
            router: MessageRouter::new(table, KafkaRoutePublisher::new(producer)),
        }
    }

    pub fn with_publisher(table: RouteTable, publisher: KafkaRoutePublisher) -> Self {
        Self {
            router: MessageRouter::new(table, publisher),
        }
    }

    /// Register this handler with the engine's registry as a generic
    /// handler under `id`.
    pub fn register(
        self,
        registry: &mut HandlerRegistry,
        id: &str,
        policy: Option<RetryPolicy>,
    ) -> OutboxResult<()> {
        registry.register_generic_handler(id, policy, Arc::new(self))
    }
}

#[async_trait]
impl OutboxHandler for KafkaRoutingHandler {
    async fn invoke(&self, payload: &str, metadata: RecordMetadata) -> Result<(), DispatchError> {
        self.router
            .dispatch(&metadata.record_type, payload, &metadata)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox::routing::Route;
    use rdkafka::config::FromClientConfig;
    use rdkafka::message::Headers;
    use rdkafka::ClientConfig;

    fn test_producer() -> FutureProducer {
        FutureProducer::from_config(&ClientConfig::new()).unwrap()
    }

    #[test]
    fn headers_carry_every_route_entry() {
        let route = ResolvedRoute {
            target: "orders".to_string(),
            key: "o1".to_string(),
            headers: vec![
                ("record_type".to_string(), "order.created".to_string()),
                ("source".to_string(), "outbox".to_string()),
            ],
            payload: "{}".to_string(),
        };
        let headers = build_headers(&route);
        assert_eq!(headers.count(), 2);
    }

    #[test]
    fn empty_route_headers_build_empty_kafka_headers() {
        let route = ResolvedRoute {
            target: "orders".to_string(),
            key: "o1".to_string(),
            headers: Vec::new(),
            payload: "{}".to_string(),
        };
        assert_eq!(build_headers(&route).count(), 0);
    }

    #[test]
    fn handler_registers_as_generic() {
        let table = RouteTable::builder()
            .route(Route::for_type("order.created").to("orders"))
            .defaults("events")
            .build();
        let handler = KafkaRoutingHandler::new(table, test_producer());

        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        handler
            .register(&mut registry, "kafka-router", None)
            .unwrap();

        let registration = registry.handler_by_id("kafka-router").unwrap();
        assert_eq!(registration.kind, outbox::HandlerKind::Generic);
        assert!(registration.payload_type.is_none());

        // generic handlers apply to every record type
        let resolved = registry.handlers_for("anything.at.all");
        assert_eq!(resolved.len(), 1);
    }

    #[test]
    fn duplicate_registration_fails_fast() {
        let mk = || {
            KafkaRoutingHandler::new(
                RouteTable::builder().defaults("events").build(),
                test_producer(),
            )
        };
        let mut registry = HandlerRegistry::new(RetryPolicy::default());
        mk().register(&mut registry, "kafka-router", None).unwrap();
        assert!(mk().register(&mut registry, "kafka-router", None).is_err());
    }
}
