//! Record context: global providers, per-call overlay, trace propagation.
//!
//! Every scheduled record carries a flat string-to-string context map. The
//! map is assembled at schedule time from the registered providers (in
//! registration order) with the per-call overlay applied last, and surfaced
//! back to handlers inside [`RecordMetadata`](crate::record::RecordMetadata)
//! at dispatch time.

use std::collections::HashMap;
use std::sync::Arc;

use opentelemetry::trace::TraceContextExt;
use tracing::{info_span, warn, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::record::{ContextMap, OutboxRecord};

/// Supplies global context entries for every scheduled record.
///
/// Providers run synchronously inside `schedule(...)`. A provider that
/// fails is skipped and logged; it never fails the business transaction.
pub trait ContextProvider: Send + Sync {
    /// Short name used in log lines when the provider fails.
    fn name(&self) -> &str;

    /// Produce context entries for the record being scheduled.
    fn provide(&self) -> anyhow::Result<ContextMap>;
}

/// Merge provider context with the per-call overlay.
///
/// Providers compose in iteration order (later providers win on collision);
/// the overlay is applied last and wins over everything.
pub fn merge_context(providers: &[Arc<dyn ContextProvider>], overlay: &ContextMap) -> ContextMap {
    let mut merged = ContextMap::new();
    for provider in providers {
        match provider.provide() {
            Ok(entries) => merged.extend(entries),
            Err(e) => {
                warn!(
                    provider = provider.name(),
                    error = ?e,
                    "Context provider failed, skipping"
                );
            }
        }
    }
    merged.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Captures the current W3C trace context (`traceparent`/`tracestate`)
/// into the record context, so the dispatch span can link back to the
/// producing trace across the async boundary.
///
/// Requires a global text-map propagator, e.g.
/// `opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new())`.
pub struct TraceContextProvider;

impl ContextProvider for TraceContextProvider {
    fn name(&self) -> &str {
        "trace-context"
    }

    fn provide(&self) -> anyhow::Result<ContextMap> {
        let cx = Span::current().context();
        let mut carrier: HashMap<String, String> = HashMap::new();
        opentelemetry::global::get_text_map_propagator(|propagator| {
            propagator.inject_context(&cx, &mut carrier)
        });
        Ok(carrier.into_iter().collect())
    }
}

/// Build the consumer span for one dispatch attempt.
///
/// The span carries the record coordinates as fields; when the record
/// context holds a valid remote trace context it is attached as a span link
/// rather than a parent, keeping producer and consumer traces separate but
/// navigable.
pub fn dispatch_span(record: &OutboxRecord) -> Span {
    let span = info_span!(
        "outbox.dispatch",
        record_id = %record.id,
        record_key = %record.key,
        record_type = %record.record_type,
        handler_id = %record.handler_id,
        failure_count = record.failure_count,
    );

    let carrier: HashMap<String, String> = record
        .context
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let remote =
        opentelemetry::global::get_text_map_propagator(|propagator| propagator.extract(&carrier));
    let remote_span = remote.span().span_context().clone();
    if remote_span.is_valid() {
        span.add_link(remote_span);
    }

    span
}
