//! Handler manager
//!
//! Owns the set of activated handlers. For every delivery it captures the raw
//! message into an envelope, evaluates eligibility across all handlers
//! concurrently, then runs every candidate in parallel. One handler's failure
//! (error, panic or timeout) never stops its siblings and never escapes
//! `process_message`.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::join_all;
use parking_lot::RwLock;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use switchboard_common::activator::panic_message;
use switchboard_common::{Disposition, Envelope, EventRelay, HandlerError, RelayEvent};

use super::Handler;
use crate::transport::{Delivery, RetrySink};

const EVENT_SOURCE: &str = "handler-manager";

/// What happened to one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DispatchReport {
    pub correlation_id: String,
    /// Handlers found eligible, in registration order
    pub candidates: Vec<String>,
    pub completed: Vec<String>,
    pub retried: Vec<String>,
    pub failures: Vec<(String, HandlerError)>,
}

impl DispatchReport {
    fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            ..Self::default()
        }
    }

    /// No handler was eligible, so the message was dropped.
    pub fn is_dropped(&self) -> bool {
        self.candidates.is_empty()
    }
}

pub struct HandlerManager {
    /// Populated once by `initialize`, read-only afterwards
    handlers: RwLock<Arc<Vec<Arc<dyn Handler>>>>,
    events: EventRelay,
    handler_timeout: Duration,
    retries: Option<Arc<dyn RetrySink>>,
}

impl HandlerManager {
    pub fn new(events: EventRelay, handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(Arc::new(Vec::new())),
            events,
            handler_timeout,
            retries: None,
        }
    }

    /// Route retry requests to `sink` instead of only logging them.
    pub fn with_retry_sink(mut self, sink: Arc<dyn RetrySink>) -> Self {
        self.retries = Some(sink);
        self
    }

    /// Record the discovered handlers. Returns false when there are none.
    pub fn initialize(&self, handlers: Vec<Arc<dyn Handler>>) -> bool {
        if handlers.is_empty() {
            warn!("No handlers found");
            return false;
        }

        for handler in &handlers {
            debug!(
                handler = %handler.type_name(),
                "Registered handler for [{}]",
                handler.handled_types().join(", ")
            );
        }
        info!("Initialized with {} handler(s)", handlers.len());
        *self.handlers.write() = Arc::new(handlers);
        true
    }

    pub fn handlers(&self) -> Arc<Vec<Arc<dyn Handler>>> {
        self.handlers.read().clone()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Processing
    // ─────────────────────────────────────────────────────────────────────────

    /// Capture and dispatch one received message.
    pub async fn process_message(&self, delivery: &Delivery) -> DispatchReport {
        let envelope = match delivery.message.capture(delivery.codec) {
            Ok(envelope) => envelope,
            Err(e) => {
                let id = delivery.message.id();
                warn!(queue = %delivery.queue, id = %id, "Failed to capture message: {}", e);
                self.publish(
                    "message.dropped",
                    json!({ "id": id, "queue": delivery.queue, "reason": e.to_string() }),
                );
                return DispatchReport::new(id);
            }
        };
        self.dispatch(&delivery.queue, Arc::new(envelope)).await
    }

    /// Handlers eligible for `envelope`, in registration order.
    pub async fn resolve(&self, envelope: &Envelope) -> Vec<Arc<dyn Handler>> {
        let handlers = self.handlers();
        let timeout = self.handler_timeout;

        let checks = handlers.iter().map(|handler| async move {
            let check = AssertUnwindSafe(handler.can_process(envelope)).catch_unwind();
            match tokio::time::timeout(timeout, check).await {
                Ok(Ok(true)) => Some(handler.clone()),
                Ok(Ok(false)) => None,
                Ok(Err(payload)) => {
                    warn!(
                        handler = %handler.type_name(),
                        "Eligibility check panicked: {}",
                        panic_message(&*payload)
                    );
                    None
                }
                Err(_) => {
                    warn!(handler = %handler.type_name(), "Eligibility check timed out");
                    None
                }
            }
        });

        join_all(checks).await.into_iter().flatten().collect()
    }

    /// Run every eligible handler for `envelope` received on `queue`.
    pub async fn dispatch(&self, queue: &str, envelope: Arc<Envelope>) -> DispatchReport {
        let mut report = DispatchReport::new(envelope.correlation_id());

        let candidates = self.resolve(&envelope).await;
        if candidates.is_empty() {
            info!(
                queue,
                id = envelope.correlation_id(),
                "No eligible handler, dropping message"
            );
            self.publish(
                "message.dropped",
                json!({ "id": envelope.correlation_id(), "queue": queue, "reason": "no eligible handler" }),
            );
            return report;
        }
        report.candidates = candidates.iter().map(|h| h.type_name().to_string()).collect();

        let mut tasks = JoinSet::new();
        for handler in candidates {
            let envelope = envelope.clone();
            let timeout = self.handler_timeout;
            tasks.spawn(async move {
                let name = handler.type_name().to_string();
                let call = AssertUnwindSafe(handler.process(&envelope)).catch_unwind();
                let outcome = match tokio::time::timeout(timeout, call).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(payload)) => Err(HandlerError::Panicked(panic_message(&*payload))),
                    Err(_) => Err(HandlerError::Timeout(timeout)),
                };
                (name, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let (name, outcome) = match joined {
                Ok(result) => result,
                Err(e) => {
                    warn!(id = envelope.correlation_id(), "Handler task failed: {}", e);
                    continue;
                }
            };

            match outcome {
                Ok(Disposition::Completed) => {
                    debug!(handler = %name, id = envelope.correlation_id(), "Message completed");
                    report.completed.push(name);
                }
                Ok(Disposition::Retry) => {
                    self.request_retry(queue, &envelope, &name).await;
                    report.retried.push(name);
                }
                Err(e) => {
                    warn!(handler = %name, id = envelope.correlation_id(), "Handler failed: {}", e);
                    self.publish(
                        "handler.failed",
                        json!({
                            "id": envelope.correlation_id(),
                            "queue": queue,
                            "handler": name,
                            "error": e.to_string(),
                        }),
                    );
                    report.failures.push((name, e));
                }
            }
        }

        if !report.failures.is_empty() {
            warn!(
                id = envelope.correlation_id(),
                "{} of {} handler(s) failed",
                report.failures.len(),
                report.candidates.len()
            );
        }
        report
    }

    async fn request_retry(&self, queue: &str, envelope: &Envelope, handler: &str) {
        let retried = match envelope.retried_by(handler, queue) {
            Ok(retried) => retried,
            Err(e) => {
                warn!(handler, id = envelope.correlation_id(), "Cannot build retry: {}", e);
                return;
            }
        };

        let attempts = retried
            .retry_provenance()
            .ok()
            .flatten()
            .map(|p| p.attempts)
            .unwrap_or_default();

        match &self.retries {
            Some(sink) => match sink.requeue(queue, retried).await {
                Ok(()) => debug!(handler, queue, attempts, "Retry requeued"),
                Err(e) => warn!(handler, queue, "Failed to requeue retry: {}", e),
            },
            None => info!(
                handler,
                queue,
                attempts,
                id = envelope.correlation_id(),
                "Retry requested but no retry sink is attached"
            ),
        }
    }

    fn publish(&self, name: &str, data: serde_json::Value) {
        self.events.publish(RelayEvent::new(name, EVENT_SOURCE, data));
    }
}
