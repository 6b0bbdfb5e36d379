//! Handlers shipped with the plugin host.

use parking_lot::RwLock;
use serde_json::json;
use tracing::{debug, info};

use switchboard_common::{
    Disposition, Envelope, HandlerContext, HandlerError, HostSettings, MessageHandler,
};

// ─────────────────────────────────────────────────────────────────────────────
// Audit
// ─────────────────────────────────────────────────────────────────────────────

/// Records order lifecycle messages.
///
/// Settings:
/// - `prefix` (string): tag added to every audit event
#[derive(Default)]
pub struct AuditHandler {
    prefix: RwLock<String>,
}

impl MessageHandler for AuditHandler {
    fn handled_types(&self) -> &[&str] {
        &["OrderPlaced", "OrderCancelled"]
    }

    fn configure(&self, settings: &HostSettings) -> Result<(), HandlerError> {
        match settings.get("prefix") {
            None => Ok(()),
            Some(toml::Value::String(prefix)) => {
                *self.prefix.write() = prefix.clone();
                Ok(())
            }
            Some(other) => Err(HandlerError::Configuration(format!(
                "prefix must be a string, got {}",
                other.type_str()
            ))),
        }
    }

    fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
        let body = envelope
            .decode_body()
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        let prefix = self.prefix.read().clone();

        info!(id = envelope.correlation_id(), "Audited {}", body.type_name);
        ctx.emit(
            "order.audited",
            json!({
                "id": envelope.correlation_id(),
                "type": body.type_name,
                "prefix": prefix,
            }),
        );
        Ok(Disposition::Completed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Payment Retry
// ─────────────────────────────────────────────────────────────────────────────

/// Deliveries needed before a payment is accepted.
pub const PAYMENT_ATTEMPTS: u32 = 3;

/// Asks for redelivery until the message has been seen
/// [`PAYMENT_ATTEMPTS`] times.
#[derive(Default)]
pub struct PaymentRetryHandler;

impl MessageHandler for PaymentRetryHandler {
    fn handled_types(&self) -> &[&str] {
        &["PaymentCaptured"]
    }

    fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
        let attempts = envelope
            .retry_provenance()
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .map(|p| p.attempts.max(1))
            .unwrap_or(1);

        ctx.emit(
            "payment.attempt",
            json!({ "id": envelope.correlation_id(), "attempts": attempts }),
        );
        if attempts < PAYMENT_ATTEMPTS {
            debug!(id = envelope.correlation_id(), attempts, "Payment not settled yet");
            Ok(Disposition::Retry)
        } else {
            Ok(Disposition::Completed)
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Crashing
// ─────────────────────────────────────────────────────────────────────────────

/// Panics on every `Poison` message.
#[derive(Default)]
pub struct CrashingHandler;

impl MessageHandler for CrashingHandler {
    fn handled_types(&self) -> &[&str] {
        &["Poison"]
    }

    fn process(&self, envelope: &Envelope, _: &HandlerContext) -> Result<Disposition, HandlerError> {
        panic!("poison message {}", envelope.correlation_id());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Echo
// ─────────────────────────────────────────────────────────────────────────────

/// Echoes text bodies back as events.
#[derive(Default)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn handled_types(&self) -> &[&str] {
        &[switchboard_common::envelope::TEXT_TYPE]
    }

    fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
        let body = envelope
            .decode_body()
            .map_err(|e| HandlerError::failed(e.to_string()))?;
        ctx.emit("text.echoed", json!({ "text": body.value }));
        Ok(Disposition::Completed)
    }
}
