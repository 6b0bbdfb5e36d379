//! Bus side of the boundary channel
//!
//! A [`BoundaryClient`] owns the framed channel to one boundary. Requests are
//! tagged with an id and parked in a pending table until the background
//! reader routes the matching reply back. Events from the boundary go to the
//! bus's [`EventRelay`]; fault reports and unexpected channel loss go to the
//! [`FaultReporter`].
//!
//! Frames are written by a single writer task, so a caller dropped mid-call
//! never leaves half a frame on the channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use switchboard_common::ipc::{
    ActivateRequest, FaultReport, Frame, FrameReader, FrameWriter, InvokeRequest, IpcError,
    MessageType, ReleaseRequest, Reply, ReplyBody,
};
use switchboard_common::{Disposition, Envelope, EventRelay, HandlerError, HandlerInfo, RelayEvent};

use super::error::{ActivationCause, BoundaryError};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READER_GRACE: Duration = Duration::from_secs(2);
const OUTBOX_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Fault Reporting
// ─────────────────────────────────────────────────────────────────────────────

/// Receives fault reports tagged with the id of the boundary that raised them.
pub trait FaultSink: Send + Sync {
    fn boundary_faulted(&self, boundary_id: Uuid, cause: String);
}

struct NoFaultSink;

impl FaultSink for NoFaultSink {
    fn boundary_faulted(&self, _boundary_id: Uuid, _cause: String) {}
}

/// A boundary's handle for reporting its own faults.
#[derive(Clone)]
pub struct FaultReporter {
    boundary_id: Uuid,
    sink: Weak<dyn FaultSink>,
}

impl FaultReporter {
    pub fn new(boundary_id: Uuid, sink: Weak<dyn FaultSink>) -> Self {
        Self { boundary_id, sink }
    }

    /// A reporter whose reports go nowhere.
    pub fn detached(boundary_id: Uuid) -> Self {
        let sink: Weak<dyn FaultSink> = Weak::<NoFaultSink>::new();
        Self { boundary_id, sink }
    }

    pub fn boundary_id(&self) -> Uuid {
        self.boundary_id
    }

    pub fn report(&self, cause: impl Into<String>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.boundary_faulted(self.boundary_id, cause.into());
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Boundary Client
// ─────────────────────────────────────────────────────────────────────────────

type Pending = Arc<DashMap<u64, oneshot::Sender<ReplyBody>>>;

enum Outgoing {
    Frame(Frame),
    /// Send `Shutdown`, close the write half, then acknowledge.
    Close(oneshot::Sender<()>),
}

/// Drops a call's pending entry however the call ends.
struct PendingSlot<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

pub struct BoundaryClient {
    boundary_id: Uuid,
    outbox: mpsc::Sender<Outgoing>,
    pending: Pending,
    next_id: AtomicU64,
    call_timeout: Duration,
    closing: Arc<AtomicBool>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
}

impl BoundaryClient {
    /// Wait for the boundary's `Ready` frame, then start routing replies.
    pub async fn connect(
        boundary_id: Uuid,
        reader: BoxedReader,
        writer: BoxedWriter,
        startup_timeout: Duration,
        call_timeout: Duration,
        faults: FaultReporter,
        events: EventRelay,
    ) -> Result<Self, BoundaryError> {
        let mut reader = FrameReader::new(reader);

        let msg = tokio::time::timeout(startup_timeout, reader.recv())
            .await
            .map_err(|_| BoundaryError::NotReady("timeout waiting for Ready".into()))?
            .map_err(|e| BoundaryError::NotReady(format!("IPC error: {}", e)))?
            .ok_or_else(|| BoundaryError::NotReady("boundary closed before Ready".into()))?;

        if msg.msg_type != MessageType::Ready {
            return Err(BoundaryError::NotReady(format!(
                "expected Ready, got {:?}",
                msg.msg_type
            )));
        }

        debug!(boundary = %boundary_id, "Boundary is ready");

        let pending: Pending = Arc::new(DashMap::new());
        let closing = Arc::new(AtomicBool::new(false));
        let reader_task = tokio::spawn(read_loop(
            reader,
            pending.clone(),
            closing.clone(),
            faults,
            events,
        ));
        let (outbox, queued) = mpsc::channel(OUTBOX_CAPACITY);
        tokio::spawn(write_loop(FrameWriter::new(writer), queued, boundary_id));

        Ok(Self {
            boundary_id,
            outbox,
            pending,
            next_id: AtomicU64::new(1),
            call_timeout,
            closing,
            reader_task: Mutex::new(Some(reader_task)),
        })
    }

    pub fn boundary_id(&self) -> Uuid {
        self.boundary_id
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    async fn call<F>(&self, build: F) -> Result<ReplyBody, BoundaryError>
    where
        F: FnOnce(u64) -> Result<Frame, IpcError>,
    {
        if self.closing.load(Ordering::SeqCst) {
            return Err(BoundaryError::NotRunning);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = build(id).map_err(|e| BoundaryError::Ipc(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        let _slot = PendingSlot {
            pending: &self.pending,
            id,
        };

        let exchange = async {
            self.outbox
                .send(Outgoing::Frame(frame))
                .await
                .map_err(|_| BoundaryError::Disconnected)?;
            rx.await.map_err(|_| BoundaryError::Disconnected)
        };

        tokio::time::timeout(self.call_timeout, exchange)
            .await
            .map_err(|_| BoundaryError::Timeout(self.call_timeout))?
    }

    /// Activate `type_name` inside the boundary. Returns the instance handle
    /// and its contract metadata.
    pub async fn activate(
        &self,
        type_name: &str,
        contract: Option<&str>,
    ) -> Result<(u64, HandlerInfo), ActivationCause> {
        let body = self
            .call(|id| {
                Frame::json(
                    MessageType::Activate,
                    &ActivateRequest {
                        id,
                        type_name: type_name.to_string(),
                        contract: contract.map(str::to_string),
                    },
                )
            })
            .await?;

        match body {
            ReplyBody::Activated { handle, info } => Ok((handle, info)),
            ReplyBody::ActivationFailed { error } => Err(error.into()),
            other => Err(unexpected(other).into()),
        }
    }

    pub async fn can_process(&self, handle: u64, envelope: &Envelope) -> Result<bool, BoundaryError> {
        let body = self
            .call(|id| {
                Frame::json(
                    MessageType::CanProcess,
                    &InvokeRequest {
                        id,
                        handle,
                        envelope: envelope.clone(),
                    },
                )
            })
            .await?;

        match body {
            ReplyBody::Eligible { eligible } => Ok(eligible),
            other => Err(unexpected(other)),
        }
    }

    pub async fn process(&self, handle: u64, envelope: &Envelope) -> Result<Disposition, HandlerError> {
        let body = self
            .call(|id| {
                Frame::json(
                    MessageType::Process,
                    &InvokeRequest {
                        id,
                        handle,
                        envelope: envelope.clone(),
                    },
                )
            })
            .await?;

        match body {
            ReplyBody::Processed { outcome } => outcome,
            other => Err(unexpected(other).into()),
        }
    }

    pub async fn release(&self, handle: u64) -> Result<(), BoundaryError> {
        let body = self
            .call(|id| Frame::json(MessageType::Release, &ReleaseRequest { id, handle }))
            .await?;

        match body {
            ReplyBody::Released => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Ask the boundary to exit and stop listening to it. Channel loss after
    /// this point is not a fault.
    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let (done, closed) = oneshot::channel();
        if self.outbox.send(Outgoing::Close(done)).await.is_ok() {
            if tokio::time::timeout(READER_GRACE, closed).await.is_err() {
                debug!(boundary = %self.boundary_id, "Writer did not close in time");
            }
        }

        let task = self.reader_task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(READER_GRACE, &mut task).await.is_err() {
                debug!(boundary = %self.boundary_id, "Reader still running, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for BoundaryClient {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.get_mut().take() {
            task.abort();
        }
    }
}

fn unexpected(body: ReplyBody) -> BoundaryError {
    match body {
        ReplyBody::Error { message } => BoundaryError::Remote(message),
        other => BoundaryError::UnexpectedReply(format!("{:?}", other)),
    }
}

async fn write_loop(
    mut writer: FrameWriter<BoxedWriter>,
    mut outbox: mpsc::Receiver<Outgoing>,
    boundary_id: Uuid,
) {
    while let Some(outgoing) = outbox.recv().await {
        match outgoing {
            Outgoing::Frame(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    warn!(boundary = %boundary_id, "Failed to write to boundary: {}", e);
                    break;
                }
            }
            Outgoing::Close(done) => {
                if let Err(e) = writer.send(&Frame::empty(MessageType::Shutdown)).await {
                    debug!(boundary = %boundary_id, "Shutdown not delivered: {}", e);
                }
                let _ = writer.shutdown().await;
                let _ = done.send(());
                break;
            }
        }
    }
    debug!(boundary = %boundary_id, "Writer exited");
}

async fn read_loop(
    mut reader: FrameReader<BoxedReader>,
    pending: Pending,
    closing: Arc<AtomicBool>,
    faults: FaultReporter,
    events: EventRelay,
) {
    let boundary_id = faults.boundary_id();

    let cause = loop {
        match reader.recv().await {
            Ok(Some(frame)) => match frame.msg_type {
                MessageType::Reply => match frame.parse_json::<Reply>() {
                    Ok(reply) => match pending.remove(&reply.id) {
                        Some((_, tx)) => {
                            let _ = tx.send(reply.body);
                        }
                        None => debug!(boundary = %boundary_id, id = reply.id, "Late reply dropped"),
                    },
                    Err(e) => warn!(boundary = %boundary_id, "Malformed reply: {}", e),
                },
                MessageType::Event => match frame.parse_json::<RelayEvent>() {
                    Ok(event) => {
                        events.publish(event);
                    }
                    Err(e) => warn!(boundary = %boundary_id, "Malformed event: {}", e),
                },
                MessageType::Fault => match frame.parse_json::<FaultReport>() {
                    Ok(report) => faults.report(report.cause),
                    Err(e) => faults.report(format!("unreadable fault report: {}", e)),
                },
                other => {
                    warn!(boundary = %boundary_id, "Unexpected message type from boundary: {:?}", other);
                }
            },
            Ok(None) => break "boundary closed its channel".to_string(),
            Err(e) => break format!("boundary channel failed: {}", e),
        }
    };

    // Dropping the senders wakes every waiting caller with Disconnected.
    pending.clear();

    if closing.load(Ordering::SeqCst) {
        debug!(boundary = %boundary_id, "Boundary channel closed after shutdown");
    } else {
        warn!(boundary = %boundary_id, "{}", cause);
        faults.report(cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use switchboard_common::activator::TypeCatalog;
    use switchboard_common::boundary::serve;
    use switchboard_common::{
        BodyCodec, DecodedBody, HandlerContext, MESSAGE_HANDLER_CONTRACT, MessageHandler,
        RemoteActivator,
    };

    #[derive(Default)]
    struct Slow;

    impl MessageHandler for Slow {
        fn handled_types(&self) -> &[&str] {
            &["Slow"]
        }

        fn process(&self, _: &Envelope, _: &HandlerContext) -> Result<Disposition, HandlerError> {
            std::thread::sleep(Duration::from_millis(500));
            Ok(Disposition::Completed)
        }
    }

    #[derive(Default)]
    struct Quick;

    impl MessageHandler for Quick {
        fn handled_types(&self) -> &[&str] {
            &["Quick"]
        }

        fn process(&self, _: &Envelope, _: &HandlerContext) -> Result<Disposition, HandlerError> {
            Ok(Disposition::Completed)
        }
    }

    struct RecordingSink(parking_lot::Mutex<Vec<(Uuid, String)>>);

    impl FaultSink for RecordingSink {
        fn boundary_faulted(&self, boundary_id: Uuid, cause: String) {
            self.0.lock().push((boundary_id, cause));
        }
    }

    async fn connect(
        call_timeout: Duration,
        sink: &Arc<RecordingSink>,
    ) -> (BoundaryClient, tokio::task::JoinHandle<Result<(), IpcError>>) {
        connect_with_buffer(call_timeout, sink, 64 * 1024).await
    }

    async fn connect_with_buffer(
        call_timeout: Duration,
        sink: &Arc<RecordingSink>,
        buffer: usize,
    ) -> (BoundaryClient, tokio::task::JoinHandle<Result<(), IpcError>>) {
        let mut catalog = TypeCatalog::new();
        catalog.register_handler::<Slow>();
        catalog.register_handler::<Quick>();
        let activator = RemoteActivator::new(Arc::new(catalog));

        let (bus_side, boundary_side) = tokio::io::duplex(buffer);
        let (r, w) = tokio::io::split(boundary_side);
        let served = tokio::spawn(serve(r, w, activator));

        let id = Uuid::new_v4();
        let weak: Weak<dyn FaultSink> = Arc::downgrade(sink) as Weak<dyn FaultSink>;
        let (r, w) = tokio::io::split(bus_side);
        let client = BoundaryClient::connect(
            id,
            Box::new(r),
            Box::new(w),
            Duration::from_secs(5),
            call_timeout,
            FaultReporter::new(id, weak),
            EventRelay::default(),
        )
        .await
        .unwrap();
        (client, served)
    }

    fn slow_envelope() -> Envelope {
        Envelope::new("s")
            .with_body(BodyCodec::Json, &DecodedBody::new("Slow", serde_json::json!({})))
            .unwrap()
    }

    #[tokio::test]
    async fn test_call_timeout_and_clean_shutdown() {
        let sink = Arc::new(RecordingSink(parking_lot::Mutex::new(Vec::new())));
        let (client, served) = connect(Duration::from_millis(100), &sink).await;

        let (handle, info) = client
            .activate(std::any::type_name::<Slow>(), Some(MESSAGE_HANDLER_CONTRACT))
            .await
            .unwrap();
        assert_eq!(info.handled_types, vec!["Slow".to_string()]);

        let outcome = client.process(handle, &slow_envelope()).await;
        assert!(matches!(outcome, Err(HandlerError::Timeout(_))));
        assert_eq!(client.in_flight(), 0);

        client.shutdown().await;
        assert!(served.await.unwrap().is_ok());
        assert!(sink.0.lock().is_empty(), "orderly shutdown is not a fault");

        assert!(matches!(
            client.release(handle).await,
            Err(BoundaryError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_dropped_call_leaves_channel_usable() {
        let sink = Arc::new(RecordingSink(parking_lot::Mutex::new(Vec::new())));
        let (client, served) = connect_with_buffer(Duration::from_secs(5), &sink, 256).await;

        let (slow, _) = client
            .activate(std::any::type_name::<Slow>(), Some(MESSAGE_HANDLER_CONTRACT))
            .await
            .unwrap();
        let (quick, _) = client
            .activate(std::any::type_name::<Quick>(), Some(MESSAGE_HANDLER_CONTRACT))
            .await
            .unwrap();

        // Far larger than the pipe buffer, so the write is still going when
        // the caller gives up.
        let large = Envelope::new("big")
            .with_body(
                BodyCodec::Json,
                &DecodedBody::new("Slow", serde_json::json!({ "blob": "x".repeat(256 * 1024) })),
            )
            .unwrap();
        let dropped = tokio::time::timeout(Duration::from_millis(1), client.process(slow, &large)).await;
        assert!(dropped.is_err());
        assert_eq!(client.in_flight(), 0);

        let small = Envelope::new("q")
            .with_body(BodyCodec::Json, &DecodedBody::new("Quick", serde_json::json!({})))
            .unwrap();
        assert_eq!(client.process(quick, &small).await, Ok(Disposition::Completed));
        assert_eq!(client.in_flight(), 0);
        assert!(sink.0.lock().is_empty());

        client.shutdown().await;
        assert!(served.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_lost_channel_is_reported_as_fault() {
        let sink = Arc::new(RecordingSink(parking_lot::Mutex::new(Vec::new())));
        let (client, served) = connect(Duration::from_secs(5), &sink).await;

        served.abort();
        let _ = served.await;

        // The boundary task owned its half of the pipe; aborting it closes it.
        for _ in 0..50 {
            if !sink.0.lock().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let faults = sink.0.lock().clone();
        assert_eq!(faults.len(), 1);
        assert_eq!(faults[0].0, client.boundary_id());
    }
}
