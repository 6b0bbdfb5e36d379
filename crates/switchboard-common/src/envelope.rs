//! Message envelopes
//!
//! An [`Envelope`] is the immutable, transport-independent form of a message
//! pulled off a queue. Handlers never see the transport's own message object;
//! the dispatcher captures one of these and hands out shared references.
//!
//! Retry provenance travels in the envelope's extension bytes as a small JSON
//! record, so it survives a round trip through any transport that preserves
//! opaque extension data.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Property under which JSON bodies carry their logical type name.
pub const TYPE_TAG: &str = "$type";

/// Logical type name reported for bodies decoded by [`BodyCodec::Text`].
pub const TEXT_TYPE: &str = "text";

// ─────────────────────────────────────────────────────────────────────────────
// Envelope Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("Envelope has no body")]
    NoBody,

    #[error("Body is not valid UTF-8: {0}")]
    InvalidText(#[from] std::string::FromUtf8Error),

    #[error("Body is not valid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("JSON body has no \"{TYPE_TAG}\" tag")]
    MissingTypeTag,

    #[error("Extension is not a retry provenance record: {0}")]
    InvalidProvenance(#[source] serde_json::Error),

    #[error("Failed to encode retry provenance: {0}")]
    EncodeProvenance(#[source] serde_json::Error),

    #[error("Unknown body codec: {0}")]
    UnknownCodec(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Priority
// ─────────────────────────────────────────────────────────────────────────────

/// Eight-level message priority, lowest first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Lowest,
    VeryLow,
    Low,
    #[default]
    Normal,
    AboveNormal,
    High,
    VeryHigh,
    Highest,
}

// ─────────────────────────────────────────────────────────────────────────────
// Body Codec
// ─────────────────────────────────────────────────────────────────────────────

/// How a message body is turned into a typed value.
///
/// `Json` bodies are objects tagged with their logical type under
/// [`TYPE_TAG`]. `Text` bodies are UTF-8 strings whose type is always
/// [`TEXT_TYPE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BodyCodec {
    Json,
    Text,
}

/// A decoded body: the logical type name plus the payload value.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBody {
    pub type_name: String,
    pub value: Value,
}

impl DecodedBody {
    pub fn new(type_name: impl Into<String>, value: Value) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(TEXT_TYPE, Value::String(text.into()))
    }
}

impl BodyCodec {
    pub fn name(&self) -> &'static str {
        match self {
            BodyCodec::Json => "json",
            BodyCodec::Text => "text",
        }
    }

    /// Decode raw body bytes.
    ///
    /// JSON bodies have the type tag stripped from the returned value.
    pub fn decode(&self, bytes: &[u8]) -> Result<DecodedBody, EnvelopeError> {
        match self {
            BodyCodec::Json => {
                let value: Value =
                    serde_json::from_slice(bytes).map_err(EnvelopeError::InvalidJson)?;
                let Value::Object(mut object) = value else {
                    return Err(EnvelopeError::MissingTypeTag);
                };
                match object.remove(TYPE_TAG) {
                    Some(Value::String(type_name)) => {
                        Ok(DecodedBody::new(type_name, Value::Object(object)))
                    }
                    _ => Err(EnvelopeError::MissingTypeTag),
                }
            }
            BodyCodec::Text => Ok(DecodedBody::text(String::from_utf8(bytes.to_vec())?)),
        }
    }

    /// Encode a body. Non-object JSON values are wrapped as `{"value": ...}`
    /// so the type tag has somewhere to live.
    pub fn encode(&self, body: &DecodedBody) -> Result<Vec<u8>, EnvelopeError> {
        match self {
            BodyCodec::Json => {
                let mut object = match &body.value {
                    Value::Object(object) => object.clone(),
                    other => {
                        let mut wrapped = serde_json::Map::new();
                        wrapped.insert("value".into(), other.clone());
                        wrapped
                    }
                };
                object.insert(TYPE_TAG.into(), Value::String(body.type_name.clone()));
                serde_json::to_vec(&Value::Object(object)).map_err(EnvelopeError::InvalidJson)
            }
            BodyCodec::Text => Ok(match &body.value {
                Value::String(text) => text.clone().into_bytes(),
                other => other.to_string().into_bytes(),
            }),
        }
    }
}

impl fmt::Display for BodyCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BodyCodec {
    type Err = EnvelopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(BodyCodec::Json),
            "text" => Ok(BodyCodec::Text),
            other => Err(EnvelopeError::UnknownCodec(other.to_string())),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Retry Provenance
// ─────────────────────────────────────────────────────────────────────────────

/// Where a redelivered message came from and who asked for the redelivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryProvenance {
    /// Queue the message was first received on.
    pub origin_queue: String,
    /// Type name of the handler that requested the retry.
    pub retry_source: String,
    /// Delivery attempt number. 1 is the first delivery.
    pub attempts: u32,
}

impl RetryProvenance {
    pub fn is_first_delivery(&self) -> bool {
        self.attempts <= 1
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Body {
    codec: BodyCodec,
    bytes: Vec<u8>,
}

/// Immutable capture of a received message.
///
/// A body, when present, always comes with the codec needed to read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    correlation_id: String,
    #[serde(default)]
    body: Option<Body>,
    #[serde(default)]
    extension: Vec<u8>,
    #[serde(default)]
    label: String,
    #[serde(default)]
    app_specific: i32,
    #[serde(default)]
    priority: Priority,
}

impl Envelope {
    pub fn new(correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            body: None,
            extension: Vec::new(),
            label: String::new(),
            app_specific: 0,
            priority: Priority::default(),
        }
    }

    /// Encode `body` with `codec` and attach it.
    pub fn with_body(mut self, codec: BodyCodec, body: &DecodedBody) -> Result<Self, EnvelopeError> {
        self.body = Some(Body {
            codec,
            bytes: codec.encode(body)?,
        });
        Ok(self)
    }

    /// Attach already-encoded body bytes.
    pub fn with_raw_body(mut self, codec: BodyCodec, bytes: Vec<u8>) -> Self {
        self.body = Some(Body { codec, bytes });
        self
    }

    pub fn with_extension(mut self, extension: Vec<u8>) -> Self {
        self.extension = extension;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_app_specific(mut self, app_specific: i32) -> Self {
        self.app_specific = app_specific;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Record `provenance` in the extension bytes.
    pub fn with_retry_provenance(
        self,
        provenance: &RetryProvenance,
    ) -> Result<Self, EnvelopeError> {
        let extension = serde_json::to_vec(provenance).map_err(EnvelopeError::EncodeProvenance)?;
        Ok(self.with_extension(extension))
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn codec(&self) -> Option<BodyCodec> {
        self.body.as_ref().map(|body| body.codec)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.body.as_ref().map(|body| body.bytes.as_slice())
    }

    pub fn extension(&self) -> &[u8] {
        &self.extension
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn app_specific(&self) -> i32 {
        self.app_specific
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Decode the body with its codec.
    pub fn decode_body(&self) -> Result<DecodedBody, EnvelopeError> {
        let body = self.body.as_ref().ok_or(EnvelopeError::NoBody)?;
        body.codec.decode(&body.bytes)
    }

    /// Retry provenance carried in the extension, if any.
    ///
    /// Empty extension bytes mean the message has never been retried.
    pub fn retry_provenance(&self) -> Result<Option<RetryProvenance>, EnvelopeError> {
        if self.extension.is_empty() {
            return Ok(None);
        }
        serde_json::from_slice(&self.extension)
            .map(Some)
            .map_err(EnvelopeError::InvalidProvenance)
    }

    /// Build the envelope to redeliver after `handler_type` asked for a retry.
    ///
    /// The attempt counter advances from the current value (absent counts as
    /// the first delivery) and the origin queue is kept from the first retry.
    pub fn retried_by(
        &self,
        handler_type: &str,
        receiving_queue: &str,
    ) -> Result<Envelope, EnvelopeError> {
        let previous = self.retry_provenance()?;
        let (origin_queue, attempts) = match previous {
            Some(p) => (p.origin_queue, p.attempts.max(1)),
            None => (receiving_queue.to_string(), 1),
        };
        let provenance = RetryProvenance {
            origin_queue,
            retry_source: handler_type.to_string(),
            attempts: attempts.saturating_add(1),
        };
        self.clone().with_retry_provenance(&provenance)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn order_placed() -> Envelope {
        Envelope::new("msg-1")
            .with_body(
                BodyCodec::Json,
                &DecodedBody::new("OrderPlaced", json!({ "order": 42 })),
            )
            .unwrap()
    }

    #[test]
    fn test_json_body_carries_type_tag() {
        let envelope = order_placed();
        let raw: Value = serde_json::from_slice(envelope.payload().unwrap()).unwrap();
        assert_eq!(raw[TYPE_TAG], "OrderPlaced");

        let body = envelope.decode_body().unwrap();
        assert_eq!(body.type_name, "OrderPlaced");
        assert_eq!(body.value, json!({ "order": 42 }));
    }

    #[test]
    fn test_json_body_without_tag_is_rejected() {
        let envelope = Envelope::new("m").with_raw_body(BodyCodec::Json, br#"{"order":1}"#.to_vec());
        assert!(matches!(
            envelope.decode_body(),
            Err(EnvelopeError::MissingTypeTag)
        ));
    }

    #[test]
    fn test_text_body() {
        let envelope = Envelope::new("m").with_raw_body(BodyCodec::Text, b"hello".to_vec());
        let body = envelope.decode_body().unwrap();
        assert_eq!(body.type_name, TEXT_TYPE);
        assert_eq!(body.value, json!("hello"));
    }

    #[test]
    fn test_missing_body() {
        let envelope = Envelope::new("m");
        assert!(envelope.codec().is_none());
        assert!(matches!(envelope.decode_body(), Err(EnvelopeError::NoBody)));
    }

    #[test]
    fn test_no_extension_means_no_provenance() {
        assert_eq!(order_placed().retry_provenance().unwrap(), None);
    }

    #[test]
    fn test_garbage_extension_is_an_error() {
        let envelope = order_placed().with_extension(b"not json".to_vec());
        assert!(envelope.retry_provenance().is_err());
    }

    #[test]
    fn test_recorded_provenance_reads_back() {
        let provenance = RetryProvenance {
            origin_queue: "orders".into(),
            retry_source: "app::Billing".into(),
            attempts: 4,
        };
        let envelope = order_placed().with_retry_provenance(&provenance).unwrap();
        assert!(!envelope.extension().is_empty());
        assert_eq!(envelope.retry_provenance().unwrap(), Some(provenance));
    }

    #[test]
    fn test_retry_chain_keeps_origin_and_counts_attempts() {
        let first = order_placed().retried_by("app::Audit", "orders").unwrap();
        let p = first.retry_provenance().unwrap().unwrap();
        assert_eq!(p.origin_queue, "orders");
        assert_eq!(p.retry_source, "app::Audit");
        assert_eq!(p.attempts, 2);

        let second = first.retried_by("app::Audit", "orders-retry").unwrap();
        let p = second.retry_provenance().unwrap().unwrap();
        assert_eq!(p.origin_queue, "orders");
        assert_eq!(p.attempts, 3);

        // Body and metadata are untouched.
        assert_eq!(second.payload(), order_placed().payload());
        assert_eq!(second.correlation_id(), "msg-1");
    }

    #[test]
    fn test_codec_from_str() {
        assert_eq!("json".parse::<BodyCodec>().unwrap(), BodyCodec::Json);
        assert_eq!("text".parse::<BodyCodec>().unwrap(), BodyCodec::Text);
        assert!("xml".parse::<BodyCodec>().is_err());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Lowest < Priority::Normal);
        assert!(Priority::Highest > Priority::VeryHigh);
        assert_eq!(Priority::default(), Priority::Normal);
    }
}
