//! Transport contract
//!
//! The bus consumes messages from a [`Transport`] and hands retried envelopes
//! back through a [`RetrySink`]. [`MemoryTransport`] implements both over
//! in-process channels; it backs the CLI feed and the tests.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::debug;

use switchboard_common::{BodyCodec, Envelope, EnvelopeError, Priority};

use crate::config::QueueConfig;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Queue '{0}' is not open")]
    QueueNotOpen(String),

    #[error("Transport is closed")]
    Closed,

    #[error("Failed to read message body: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to capture message: {0}")]
    Envelope(#[from] EnvelopeError),
}

// ─────────────────────────────────────────────────────────────────────────────
// Raw Messages
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct RawInner {
    id: String,
    label: String,
    app_specific: i32,
    priority: Priority,
    extension: Vec<u8>,
    codec: Option<BodyCodec>,
    body: Option<Cursor<Vec<u8>>>,
}

/// A message as it comes off a queue.
///
/// The body is a positioned stream, so reading it moves shared state. All
/// access goes through one lock and [`RawMessage::capture`] copies every
/// field while holding it.
#[derive(Debug)]
pub struct RawMessage {
    inner: Mutex<RawInner>,
}

impl RawMessage {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            inner: Mutex::new(RawInner {
                id: id.into(),
                ..RawInner::default()
            }),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.inner.get_mut().label = label.into();
        self
    }

    pub fn with_app_specific(mut self, app_specific: i32) -> Self {
        self.inner.get_mut().app_specific = app_specific;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.inner.get_mut().priority = priority;
        self
    }

    pub fn with_extension(mut self, extension: Vec<u8>) -> Self {
        self.inner.get_mut().extension = extension;
        self
    }

    pub fn with_codec(mut self, codec: BodyCodec) -> Self {
        self.inner.get_mut().codec = Some(codec);
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.inner.get_mut().body = Some(Cursor::new(body));
        self
    }

    /// Raw message carrying everything in `envelope`.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        let mut message = Self::new(envelope.correlation_id())
            .with_label(envelope.label())
            .with_app_specific(envelope.app_specific())
            .with_priority(envelope.priority())
            .with_extension(envelope.extension().to_vec());
        if let Some(codec) = envelope.codec() {
            message = message.with_codec(codec);
        }
        if let Some(payload) = envelope.payload() {
            message = message.with_body(payload.to_vec());
        }
        message
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    /// Copy the message into an [`Envelope`]. Messages that do not name a
    /// codec are stamped with `default_codec`.
    pub fn capture(&self, default_codec: BodyCodec) -> Result<Envelope, TransportError> {
        let mut inner = self.inner.lock();

        let mut envelope = Envelope::new(inner.id.clone())
            .with_label(inner.label.clone())
            .with_app_specific(inner.app_specific)
            .with_priority(inner.priority)
            .with_extension(inner.extension.clone());

        let codec = inner.codec.unwrap_or(default_codec);
        if let Some(body) = inner.body.as_mut() {
            body.seek(SeekFrom::Start(0))?;
            let mut bytes = Vec::new();
            body.read_to_end(&mut bytes)?;
            envelope = envelope.with_raw_body(codec, bytes);
        }
        Ok(envelope)
    }
}

/// One received message and the queue it came from.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// Codec configured for the queue
    pub codec: BodyCodec,
    pub message: Arc<RawMessage>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Contracts
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts envelopes a handler asked to see again.
#[async_trait]
pub trait RetrySink: Send + Sync {
    async fn requeue(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Start accepting messages for `queues`.
    async fn open(&self, queues: &[QueueConfig]) -> Result<(), TransportError>;

    /// Next delivery, or `None` once the transport is closed.
    async fn receive(&self) -> Option<Delivery>;

    async fn close(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Memory Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Unbounded in-process queues sharing one delivery channel.
pub struct MemoryTransport {
    queues: RwLock<HashMap<String, BodyCodec>>,
    sender: mpsc::UnboundedSender<Delivery>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<Delivery>>,
    closed: AtomicBool,
}

impl MemoryTransport {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            queues: RwLock::new(HashMap::new()),
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_open(&self, queue: &str) -> bool {
        self.queues.read().contains_key(queue)
    }

    /// Enqueue `message` on `queue`.
    pub fn send(&self, queue: &str, message: RawMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let codec = self
            .queues
            .read()
            .get(queue)
            .copied()
            .ok_or_else(|| TransportError::QueueNotOpen(queue.to_string()))?;

        self.sender
            .send(Delivery {
                queue: queue.to_string(),
                codec,
                message: Arc::new(message),
            })
            .map_err(|_| TransportError::Closed)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, queues: &[QueueConfig]) -> Result<(), TransportError> {
        let mut open = self.queues.write();
        for queue in queues {
            debug!(queue = %queue.key, codec = %queue.codec, "Opening queue {}", queue.path);
            open.insert(queue.key.clone(), queue.codec);
        }
        self.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn receive(&self) -> Option<Delivery> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.receiver.lock().await.recv().await
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.queues.write().clear();
    }
}

#[async_trait]
impl RetrySink for MemoryTransport {
    async fn requeue(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError> {
        debug!(queue, id = envelope.correlation_id(), "Requeueing message");
        self.send(queue, RawMessage::from_envelope(&envelope))
    }
}
