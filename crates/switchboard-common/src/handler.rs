//! The message-handler contract
//!
//! Plugin authors implement [`MessageHandler`]. Implementations run inside an
//! isolation boundary (or in-process for parts that opt out of isolation) and
//! are always driven from a blocking-capable thread, so they are plain
//! synchronous code.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::eligibility;
use crate::envelope::Envelope;
use crate::relay::{EventSink, NullSink, RelayEvent};

/// Contract name under which handlers are exported and activated.
pub const MESSAGE_HANDLER_CONTRACT: &str = "switchboard.MessageHandler";

/// Per-boundary settings read from `<working dir>/<config base name>.toml`.
pub type HostSettings = toml::Table;

/// Outcome of a successful `process` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// The handler is done with the message.
    Completed,
    /// Redeliver the message to this handler later.
    Retry,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler configuration rejected: {0}")]
    Configuration(String),

    #[error("Handler panicked: {0}")]
    Panicked(String),

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error("Handler unavailable: {0}")]
    Unavailable(String),
}

impl HandlerError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handler Context
// ─────────────────────────────────────────────────────────────────────────────

/// Passed to every `process` call. Lets a handler publish events without
/// knowing where it runs.
#[derive(Clone)]
pub struct HandlerContext {
    source: String,
    sink: Arc<dyn EventSink>,
}

impl HandlerContext {
    pub fn new(source: impl Into<String>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            source: source.into(),
            sink,
        }
    }

    /// Context whose events go nowhere.
    pub fn detached(source: impl Into<String>) -> Self {
        Self::new(source, Arc::new(NullSink))
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn emit(&self, name: impl Into<String>, data: serde_json::Value) {
        self.sink
            .post(RelayEvent::new(name, self.source.clone(), data));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Handler
// ─────────────────────────────────────────────────────────────────────────────

/// A message handler.
///
/// # Example
///
/// ```ignore
/// #[derive(Default)]
/// struct AuditHandler;
///
/// impl MessageHandler for AuditHandler {
///     fn handled_types(&self) -> &[&str] {
///         &["OrderPlaced"]
///     }
///
///     fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
///         ctx.emit("order.audited", serde_json::json!({ "id": envelope.correlation_id() }));
///         Ok(Disposition::Completed)
///     }
/// }
/// ```
pub trait MessageHandler: Send + Sync + 'static {
    /// Stable identity used as the retry source.
    fn type_name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Logical body types this handler accepts.
    fn handled_types(&self) -> &[&str];

    /// Apply boundary settings. Called once, right after construction.
    fn configure(&self, _settings: &HostSettings) -> Result<(), HandlerError> {
        Ok(())
    }

    fn can_process(&self, envelope: &Envelope) -> bool {
        eligibility::is_eligible(self.type_name(), self.handled_types(), envelope)
    }

    fn process(
        &self,
        envelope: &Envelope,
        ctx: &HandlerContext,
    ) -> Result<Disposition, HandlerError>;
}

/// Contract-level description of an activated handler, safe to hand across a
/// boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerInfo {
    pub type_name: String,
    pub handled_types: Vec<String>,
}

impl HandlerInfo {
    pub fn of(handler: &dyn MessageHandler) -> Self {
        Self {
            type_name: handler.type_name().to_string(),
            handled_types: handler
                .handled_types()
                .iter()
                .map(|t| t.to_string())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{BodyCodec, DecodedBody};
    use crate::relay::EventRelay;
    use serde_json::json;

    #[derive(Default)]
    struct Greeter;

    impl MessageHandler for Greeter {
        fn handled_types(&self) -> &[&str] {
            &["Greeting"]
        }

        fn process(&self, _: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
            ctx.emit("greeted", json!({}));
            Ok(Disposition::Completed)
        }
    }

    #[test]
    fn test_default_type_name_is_rust_path() {
        assert!(Greeter.type_name().ends_with("Greeter"));
        let info = HandlerInfo::of(&Greeter);
        assert_eq!(info.handled_types, vec!["Greeting".to_string()]);
    }

    #[test]
    fn test_default_can_process_uses_eligibility() {
        let yes = Envelope::new("1")
            .with_body(BodyCodec::Json, &DecodedBody::new("Greeting", json!({})))
            .unwrap();
        let no = Envelope::new("2")
            .with_body(BodyCodec::Json, &DecodedBody::new("Farewell", json!({})))
            .unwrap();
        assert!(Greeter.can_process(&yes));
        assert!(!Greeter.can_process(&no));
    }

    #[tokio::test]
    async fn test_context_emits_with_source() {
        let relay = EventRelay::new(8);
        let mut rx = relay.subscribe();
        let ctx = HandlerContext::new("greeter", Arc::new(relay));

        let envelope = Envelope::new("1");
        Greeter.process(&envelope, &ctx).unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name, "greeted");
        assert_eq!(event.source, "greeter");
    }

    #[test]
    fn test_handler_error_survives_json() {
        let err = HandlerError::Timeout(Duration::from_millis(250));
        let text = serde_json::to_string(&err).unwrap();
        assert_eq!(serde_json::from_str::<HandlerError>(&text).unwrap(), err);
    }
}
