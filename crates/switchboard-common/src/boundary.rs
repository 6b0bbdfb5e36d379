//! Boundary runtime
//!
//! The code that runs on the far side of an isolation boundary. It answers
//! the bus's requests over a framed byte channel: activating instances from
//! the local [`TypeCatalog`](crate::activator::TypeCatalog), invoking them,
//! and releasing them. The same loop serves a child process over stdio and a
//! dedicated thread over an in-memory pipe.
//!
//! Handler code runs on the blocking pool. A handler that panics is reported
//! to the bus as a fault of the whole boundary.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::activator::{
    ActivationHook, ActivatorError, Instance, RemoteActivator, panic_message,
};
use crate::handler::{
    HandlerContext, HandlerError, HandlerInfo, HostSettings, MESSAGE_HANDLER_CONTRACT,
    MessageHandler,
};
use crate::ipc::{
    ActivateRequest, FaultReport, Frame, FrameReader, FrameWriter, InvokeRequest, IpcError,
    MessageType, ReleaseRequest, Reply, ReplyBody,
};
use crate::relay::{EventSink, RelayEvent};

/// How long to keep flushing replies after the bus asks us to shut down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

// ─────────────────────────────────────────────────────────────────────────────
// Settings
// ─────────────────────────────────────────────────────────────────────────────

/// Read `<dir>/<config_base_name>.toml`.
///
/// A missing file yields empty settings. A malformed file is logged and also
/// yields empty settings, so a bad config never prevents a boundary from
/// coming up.
pub async fn load_host_settings(dir: &Path, config_base_name: &str) -> HostSettings {
    let path = dir.join(format!("{config_base_name}.toml"));
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No boundary settings at {:?}", path);
            return HostSettings::new();
        }
        Err(e) => {
            warn!("Failed to read boundary settings {:?}: {}", path, e);
            return HostSettings::new();
        }
    };
    match toml::from_str(&content) {
        Ok(settings) => {
            info!("Loaded boundary settings from {:?}", path);
            settings
        }
        Err(e) => {
            warn!("Ignoring malformed boundary settings {:?}: {}", path, e);
            HostSettings::new()
        }
    }
}

/// Post-construction hook that hands boundary settings to new handlers.
pub struct ConfigureHook {
    settings: HostSettings,
}

impl ConfigureHook {
    pub fn new(settings: HostSettings) -> Self {
        Self { settings }
    }
}

impl ActivationHook for ConfigureHook {
    fn after_create(&self, instance: &Instance) -> Result<(), String> {
        match instance.handler() {
            Some(handler) => handler.configure(&self.settings).map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serve Loop
// ─────────────────────────────────────────────────────────────────────────────

/// Serve the boundary over stdin/stdout.
pub async fn serve_stdio(activator: RemoteActivator) -> Result<(), IpcError> {
    serve(tokio::io::stdin(), tokio::io::stdout(), activator).await
}

/// Serve the boundary protocol until the bus sends `Shutdown` or closes the
/// channel.
pub async fn serve<R, W>(reader: R, writer: W, activator: RemoteActivator) -> Result<(), IpcError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();

    let writer_task = tokio::spawn(async move {
        let mut writer = FrameWriter::new(writer);
        while let Some(frame) = outbound_rx.recv().await {
            if let Err(e) = writer.send(&frame).await {
                warn!("Failed to write to bus: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let runtime = Arc::new(BoundaryRuntime::new(activator, outbound));
    runtime.send(Frame::empty(MessageType::Ready));
    debug!("Boundary ready");

    let mut reader = FrameReader::new(reader);
    let result = loop {
        match reader.recv().await {
            Ok(Some(frame)) if frame.msg_type == MessageType::Shutdown => {
                debug!("Shutdown requested");
                break Ok(());
            }
            Ok(Some(frame)) => {
                let runtime = runtime.clone();
                tokio::spawn(async move { runtime.handle(frame).await });
            }
            Ok(None) => {
                debug!("Bus closed the channel");
                break Ok(());
            }
            Err(e) => break Err(e),
        }
    };

    runtime.release_all();
    drop(runtime);
    if tokio::time::timeout(SHUTDOWN_GRACE, writer_task).await.is_err() {
        warn!("Gave up flushing replies after {:?}", SHUTDOWN_GRACE);
    }
    result
}

#[derive(Deserialize)]
struct RequestId {
    id: u64,
}

struct BoundaryRuntime {
    activator: RemoteActivator,
    instances: Mutex<HashMap<u64, Instance>>,
    next_handle: AtomicU64,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl BoundaryRuntime {
    fn new(activator: RemoteActivator, outbound: mpsc::UnboundedSender<Frame>) -> Self {
        Self {
            activator,
            instances: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            outbound,
        }
    }

    fn send(&self, frame: Frame) {
        // The writer only goes away once we are shutting down.
        let _ = self.outbound.send(frame);
    }

    fn reply(&self, id: u64, body: ReplyBody) {
        match Frame::json(MessageType::Reply, &Reply { id, body }) {
            Ok(frame) => self.send(frame),
            Err(e) => warn!(id, "Failed to encode reply: {}", e),
        }
    }

    fn fault(&self, cause: String) {
        warn!("Reporting fault: {}", cause);
        match Frame::json(MessageType::Fault, &FaultReport { cause }) {
            Ok(frame) => self.send(frame),
            Err(e) => warn!("Failed to encode fault: {}", e),
        }
    }

    fn handler(&self, handle: u64) -> Option<Arc<dyn MessageHandler>> {
        self.instances.lock().get(&handle).and_then(Instance::handler)
    }

    fn release_all(&self) {
        let released = std::mem::take(&mut *self.instances.lock());
        if !released.is_empty() {
            debug!("Released {} instance(s) on shutdown", released.len());
        }
    }

    /// Report a panic as a fault. Returns the panic message.
    fn contain(&self, what: &str, e: JoinError) -> String {
        if e.is_panic() {
            let message = panic_message(e.into_panic().as_ref());
            self.fault(format!("{} panicked: {}", what, message));
            message
        } else {
            let cause = format!("{} was cancelled", what);
            self.fault(cause.clone());
            cause
        }
    }

    async fn handle(self: Arc<Self>, frame: Frame) {
        let id = match frame.parse_json::<RequestId>() {
            Ok(request) => request.id,
            Err(e) => {
                warn!("Dropping {:?} request without an id: {}", frame.msg_type, e);
                return;
            }
        };

        let body = match frame.msg_type {
            MessageType::Activate => match frame.parse_json() {
                Ok(request) => self.activate(request).await,
                Err(e) => ReplyBody::Error {
                    message: e.to_string(),
                },
            },
            MessageType::CanProcess => match frame.parse_json() {
                Ok(request) => self.can_process(request).await,
                Err(e) => ReplyBody::Error {
                    message: e.to_string(),
                },
            },
            MessageType::Process => match frame.parse_json() {
                Ok(request) => self.process(request).await,
                Err(e) => ReplyBody::Error {
                    message: e.to_string(),
                },
            },
            MessageType::Release => match frame.parse_json::<ReleaseRequest>() {
                Ok(request) => {
                    self.instances.lock().remove(&request.handle);
                    ReplyBody::Released
                }
                Err(e) => ReplyBody::Error {
                    message: e.to_string(),
                },
            },
            other => ReplyBody::Error {
                message: format!("Unexpected message type: {:?}", other),
            },
        };
        self.reply(id, body);
    }

    async fn activate(&self, request: ActivateRequest) -> ReplyBody {
        let activator = self.activator.clone();
        let type_name = request.type_name.clone();
        let contract = request.contract.clone();
        let created = tokio::task::spawn_blocking(move || {
            activator.create_instance_and_cast_to(&type_name, contract.as_deref())
        })
        .await;

        let instance = match created {
            Ok(Ok(instance)) => instance,
            Ok(Err(error)) => return ReplyBody::ActivationFailed { error },
            Err(e) => {
                let message = self.contain("Activation", e);
                return ReplyBody::ActivationFailed {
                    error: ActivatorError::ConstructionFailed {
                        type_name: request.type_name,
                        reason: format!("panicked: {}", message),
                    },
                };
            }
        };

        let Some(handler) = instance.handler() else {
            return ReplyBody::ActivationFailed {
                error: ActivatorError::CastFailed {
                    type_name: request.type_name,
                    contract: MESSAGE_HANDLER_CONTRACT.to_string(),
                },
            };
        };

        let info = HandlerInfo::of(handler.as_ref());
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.instances.lock().insert(handle, instance);
        debug!(handle, type_name = %info.type_name, "Activated");
        ReplyBody::Activated { handle, info }
    }

    async fn can_process(&self, request: InvokeRequest) -> ReplyBody {
        let Some(handler) = self.handler(request.handle) else {
            return unknown_handle(request.handle);
        };
        let envelope = request.envelope;
        match tokio::task::spawn_blocking(move || handler.can_process(&envelope)).await {
            Ok(eligible) => ReplyBody::Eligible { eligible },
            Err(e) => {
                self.contain("Eligibility check", e);
                ReplyBody::Eligible { eligible: false }
            }
        }
    }

    async fn process(&self, request: InvokeRequest) -> ReplyBody {
        let Some(handler) = self.handler(request.handle) else {
            return unknown_handle(request.handle);
        };
        let sink: Arc<dyn EventSink> = Arc::new(FrameSink {
            outbound: self.outbound.clone(),
        });
        let ctx = HandlerContext::new(handler.type_name().to_string(), sink);
        let envelope = request.envelope;

        match tokio::task::spawn_blocking(move || handler.process(&envelope, &ctx)).await {
            Ok(outcome) => ReplyBody::Processed { outcome },
            Err(e) => ReplyBody::Processed {
                outcome: Err(HandlerError::Panicked(self.contain("Handler", e))),
            },
        }
    }
}

fn unknown_handle(handle: u64) -> ReplyBody {
    ReplyBody::Error {
        message: format!("Unknown instance handle {}", handle),
    }
}

/// Forwards handler events to the bus as `Event` frames.
struct FrameSink {
    outbound: mpsc::UnboundedSender<Frame>,
}

impl EventSink for FrameSink {
    fn post(&self, event: RelayEvent) {
        if let Ok(frame) = Frame::json(MessageType::Event, &event) {
            let _ = self.outbound.send(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activator::TypeCatalog;
    use crate::envelope::{BodyCodec, DecodedBody, Envelope};
    use crate::handler::Disposition;
    use parking_lot::RwLock;
    use serde_json::json;

    #[derive(Default)]
    struct Audit {
        prefix: RwLock<String>,
    }

    impl MessageHandler for Audit {
        fn handled_types(&self) -> &[&str] {
            &["OrderPlaced"]
        }

        fn configure(&self, settings: &HostSettings) -> Result<(), HandlerError> {
            if let Some(prefix) = settings.get("prefix").and_then(|v| v.as_str()) {
                *self.prefix.write() = prefix.to_string();
            }
            Ok(())
        }

        fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
            ctx.emit(
                "order.audited",
                json!({ "id": envelope.correlation_id(), "prefix": self.prefix.read().clone() }),
            );
            Ok(Disposition::Completed)
        }
    }

    #[derive(Default)]
    struct Crashing;

    impl MessageHandler for Crashing {
        fn handled_types(&self) -> &[&str] {
            &["Poison"]
        }

        fn process(&self, _: &Envelope, _: &HandlerContext) -> Result<Disposition, HandlerError> {
            panic!("poisoned");
        }
    }

    struct Bus {
        writer: FrameWriter<tokio::io::WriteHalf<tokio::io::DuplexStream>>,
        reader: FrameReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        served: tokio::task::JoinHandle<Result<(), IpcError>>,
    }

    fn start(settings: HostSettings) -> Bus {
        let mut catalog = TypeCatalog::new();
        catalog.register_handler::<Audit>();
        catalog.register_handler::<Crashing>();
        let activator = RemoteActivator::new(Arc::new(catalog))
            .with_hook(Arc::new(ConfigureHook::new(settings)));

        let (bus_side, boundary_side) = tokio::io::duplex(64 * 1024);
        let (boundary_read, boundary_write) = tokio::io::split(boundary_side);
        let served = tokio::spawn(serve(boundary_read, boundary_write, activator));
        let (bus_read, bus_write) = tokio::io::split(bus_side);
        Bus {
            writer: FrameWriter::new(bus_write),
            reader: FrameReader::new(bus_read),
            served,
        }
    }

    impl Bus {
        async fn next(&mut self) -> Frame {
            self.reader.recv().await.unwrap().unwrap()
        }

        async fn next_reply(&mut self) -> Reply {
            loop {
                let frame = self.next().await;
                if frame.msg_type == MessageType::Reply {
                    return frame.parse_json().unwrap();
                }
            }
        }

        async fn activate(&mut self, id: u64, type_name: &str) -> ReplyBody {
            let request = ActivateRequest {
                id,
                type_name: type_name.to_string(),
                contract: Some(MESSAGE_HANDLER_CONTRACT.to_string()),
            };
            self.writer
                .send_json(MessageType::Activate, &request)
                .await
                .unwrap();
            let reply = self.next_reply().await;
            assert_eq!(reply.id, id);
            reply.body
        }
    }

    fn order(id: &str) -> Envelope {
        Envelope::new(id)
            .with_body(BodyCodec::Json, &DecodedBody::new("OrderPlaced", json!({})))
            .unwrap()
    }

    #[tokio::test]
    async fn test_activate_process_release_shutdown() {
        let mut settings = HostSettings::new();
        settings.insert("prefix".into(), toml::Value::String("eu".into()));
        let mut bus = start(settings);

        assert_eq!(bus.next().await.msg_type, MessageType::Ready);

        let handle = match bus.activate(1, std::any::type_name::<Audit>()).await {
            ReplyBody::Activated { handle, info } => {
                assert_eq!(info.handled_types, vec!["OrderPlaced".to_string()]);
                handle
            }
            other => panic!("unexpected reply: {other:?}"),
        };

        let request = InvokeRequest {
            id: 2,
            handle,
            envelope: order("m-1"),
        };
        bus.writer
            .send_json(MessageType::CanProcess, &request)
            .await
            .unwrap();
        assert_eq!(
            bus.next_reply().await.body,
            ReplyBody::Eligible { eligible: true }
        );

        let request = InvokeRequest { id: 3, ..request };
        bus.writer
            .send_json(MessageType::Process, &request)
            .await
            .unwrap();

        let mut event = None;
        let reply = loop {
            let frame = bus.next().await;
            match frame.msg_type {
                MessageType::Event => event = Some(frame.parse_json::<RelayEvent>().unwrap()),
                MessageType::Reply => break frame.parse_json::<Reply>().unwrap(),
                other => panic!("unexpected frame {other:?}"),
            }
        };
        assert_eq!(
            reply.body,
            ReplyBody::Processed {
                outcome: Ok(Disposition::Completed)
            }
        );
        let event = event.expect("handler event is sent before the reply");
        assert_eq!(event.name, "order.audited");
        assert_eq!(event.data["prefix"], "eu");

        bus.writer
            .send_json(MessageType::Release, &ReleaseRequest { id: 4, handle })
            .await
            .unwrap();
        assert_eq!(bus.next_reply().await.body, ReplyBody::Released);

        bus.writer
            .send(&Frame::empty(MessageType::Shutdown))
            .await
            .unwrap();
        assert!(bus.served.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_type_fails_activation() {
        let mut bus = start(HostSettings::new());
        bus.next().await;

        match bus.activate(1, "not::Registered").await {
            ReplyBody::ActivationFailed { error } => {
                assert_eq!(error, ActivatorError::UnknownType("not::Registered".into()))
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_panicking_handler_reports_fault() {
        let mut bus = start(HostSettings::new());
        bus.next().await;

        let handle = match bus.activate(1, std::any::type_name::<Crashing>()).await {
            ReplyBody::Activated { handle, .. } => handle,
            other => panic!("unexpected reply: {other:?}"),
        };

        let envelope = Envelope::new("p")
            .with_body(BodyCodec::Json, &DecodedBody::new("Poison", json!({})))
            .unwrap();
        bus.writer
            .send_json(
                MessageType::Process,
                &InvokeRequest {
                    id: 2,
                    handle,
                    envelope,
                },
            )
            .await
            .unwrap();

        let mut fault = None;
        let mut reply = None;
        while fault.is_none() || reply.is_none() {
            let frame = bus.next().await;
            match frame.msg_type {
                MessageType::Fault => fault = Some(frame.parse_json::<FaultReport>().unwrap()),
                MessageType::Reply => reply = Some(frame.parse_json::<Reply>().unwrap()),
                _ => {}
            }
        }
        assert!(fault.unwrap().cause.contains("poisoned"));
        assert!(matches!(
            reply.unwrap().body,
            ReplyBody::Processed {
                outcome: Err(HandlerError::Panicked(_))
            }
        ));
    }

    #[tokio::test]
    async fn test_unknown_handle() {
        let mut bus = start(HostSettings::new());
        bus.next().await;

        bus.writer
            .send_json(
                MessageType::Process,
                &InvokeRequest {
                    id: 9,
                    handle: 404,
                    envelope: order("x"),
                },
            )
            .await
            .unwrap();
        assert!(matches!(
            bus.next_reply().await.body,
            ReplyBody::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_closing_the_channel_ends_the_loop() {
        let mut bus = start(HostSettings::new());
        bus.next().await;
        let Bus {
            mut writer, served, ..
        } = bus;
        writer.shutdown().await.unwrap();
        assert!(served.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_load_host_settings() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_host_settings(dir.path(), "domain").await.is_empty());

        std::fs::write(dir.path().join("domain.toml"), "prefix = \"us\"\n").unwrap();
        let settings = load_host_settings(dir.path(), "domain").await;
        assert_eq!(settings["prefix"].as_str(), Some("us"));

        std::fs::write(dir.path().join("broken.toml"), "prefix = ").unwrap();
        assert!(load_host_settings(dir.path(), "broken").await.is_empty());
    }
}
