use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use switchboard_common::activator::panic_message;
use switchboard_common::{
    Disposition, Envelope, EventRelay, EventSink, HandlerContext, HandlerError, HandlerInfo,
    MessageHandler,
};

use super::Handler;

/// A [`MessageHandler`] constructed in the bus's own address space.
///
/// Both calls run on the blocking pool, so eligibility checks for several
/// local handlers proceed in parallel. A panicking `process` becomes
/// [`HandlerError::Panicked`]; a panicking `can_process` means ineligible.
pub struct LocalHandler {
    handler: Arc<dyn MessageHandler>,
    info: HandlerInfo,
    sink: Arc<dyn EventSink>,
}

impl LocalHandler {
    pub fn new(handler: Arc<dyn MessageHandler>, events: EventRelay) -> Self {
        let info = HandlerInfo::of(handler.as_ref());
        Self {
            handler,
            info,
            sink: Arc::new(events),
        }
    }

    pub fn info(&self) -> &HandlerInfo {
        &self.info
    }
}

#[async_trait]
impl Handler for LocalHandler {
    fn type_name(&self) -> &str {
        &self.info.type_name
    }

    fn handled_types(&self) -> &[String] {
        &self.info.handled_types
    }

    async fn can_process(&self, envelope: &Envelope) -> bool {
        let handler = self.handler.clone();
        let envelope = envelope.clone();

        match tokio::task::spawn_blocking(move || handler.can_process(&envelope)).await {
            Ok(eligible) => eligible,
            Err(e) if e.is_panic() => {
                debug!(
                    handler = %self.info.type_name,
                    "Eligibility check panicked: {}",
                    panic_message(&*e.into_panic())
                );
                false
            }
            Err(e) => {
                debug!(handler = %self.info.type_name, "Eligibility check cancelled: {}", e);
                false
            }
        }
    }

    async fn process(&self, envelope: &Envelope) -> Result<Disposition, HandlerError> {
        let handler = self.handler.clone();
        let envelope = envelope.clone();
        let ctx = HandlerContext::new(self.info.type_name.clone(), self.sink.clone());

        match tokio::task::spawn_blocking(move || handler.process(&envelope, &ctx)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::Panicked(panic_message(&*e.into_panic()))),
            Err(e) => Err(HandlerError::Unavailable(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchboard_common::{BodyCodec, DecodedBody};

    #[derive(Default)]
    struct Shipping;

    impl MessageHandler for Shipping {
        fn handled_types(&self) -> &[&str] {
            &["OrderPlaced", "Poison"]
        }

        fn can_process(&self, envelope: &Envelope) -> bool {
            if envelope.label() == "explode" {
                panic!("eligibility exploded");
            }
            switchboard_common::is_eligible(self.type_name(), self.handled_types(), envelope)
        }

        fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
            let body = envelope.decode_body().map_err(|e| HandlerError::failed(e.to_string()))?;
            if body.type_name == "Poison" {
                panic!("poisoned");
            }
            ctx.emit("order.shipped", json!({ "id": envelope.correlation_id() }));
            Ok(Disposition::Completed)
        }
    }

    fn envelope(id: &str, type_name: &str) -> Envelope {
        Envelope::new(id)
            .with_body(BodyCodec::Json, &DecodedBody::new(type_name, json!({})))
            .unwrap()
    }

    #[tokio::test]
    async fn test_process_emits_on_relay() {
        let events = EventRelay::default();
        let mut rx = events.subscribe();
        let handler = LocalHandler::new(Arc::new(Shipping), events);

        assert!(handler.type_name().ends_with("Shipping"));
        assert!(handler.can_process(&envelope("1", "OrderPlaced")).await);
        assert!(!handler.can_process(&envelope("2", "Refund")).await);

        let outcome = handler.process(&envelope("1", "OrderPlaced")).await;
        assert_eq!(outcome, Ok(Disposition::Completed));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "order.shipped");
        assert_eq!(event.source, handler.type_name());
        assert_eq!(event.data, json!({ "id": "1" }));
    }

    #[tokio::test]
    async fn test_panics_are_contained() {
        let handler = LocalHandler::new(Arc::new(Shipping), EventRelay::default());

        let outcome = handler.process(&envelope("p", "Poison")).await;
        assert_eq!(outcome, Err(HandlerError::Panicked("poisoned".into())));

        let exploding = envelope("e", "OrderPlaced").with_label("explode");
        assert!(!handler.can_process(&exploding).await);
    }
}
