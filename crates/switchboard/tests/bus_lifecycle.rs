//! End-to-end bus tests over thread boundaries and the in-memory transport.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use switchboard::config::{BoundaryKind, BusConfig, QueueConfig};
use switchboard::discovery::MANIFEST_FILE;
use switchboard::transport::{MemoryTransport, RawMessage};
use switchboard::{BusManager, ConfigSource};
use switchboard_common::{
    ControlState, Disposition, Envelope, HandlerContext, HandlerError, MessageHandler, RelayEvent,
    TypeCatalog,
};

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct OrderAudit;

impl MessageHandler for OrderAudit {
    fn handled_types(&self) -> &[&str] {
        &["OrderPlaced"]
    }

    fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
        ctx.emit("order.audited", json!({ "id": envelope.correlation_id() }));
        Ok(Disposition::Completed)
    }
}

/// Asks for a retry until the third delivery.
#[derive(Default)]
struct FlakyPayment;

impl MessageHandler for FlakyPayment {
    fn handled_types(&self) -> &[&str] {
        &["PaymentCaptured"]
    }

    fn process(&self, envelope: &Envelope, ctx: &HandlerContext) -> Result<Disposition, HandlerError> {
        let attempts = envelope
            .retry_provenance()
            .map_err(|e| HandlerError::failed(e.to_string()))?
            .map(|p| p.attempts)
            .unwrap_or(1);
        ctx.emit("payment.attempt", json!({ "attempts": attempts }));
        if attempts < 3 {
            Ok(Disposition::Retry)
        } else {
            Ok(Disposition::Completed)
        }
    }
}

#[derive(Default)]
struct Crashing;

impl MessageHandler for Crashing {
    fn handled_types(&self) -> &[&str] {
        &["Poison"]
    }

    fn process(&self, _: &Envelope, _: &HandlerContext) -> Result<Disposition, HandlerError> {
        panic!("poison pill");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixtures
// ─────────────────────────────────────────────────────────────────────────────

fn catalog() -> Arc<TypeCatalog> {
    let mut catalog = TypeCatalog::new();
    catalog.register_handler::<OrderAudit>();
    catalog.register_handler::<FlakyPayment>();
    catalog.register_handler::<Crashing>();
    Arc::new(catalog)
}

fn write_plugin(root: &Path, name: &str, handlers: &[(&str, &str)]) {
    let dir = root.join(name);
    std::fs::create_dir_all(&dir).unwrap();
    let mut manifest = format!("[plugin]\nid = \"{name}\"\n");
    for (type_name, isolation) in handlers {
        manifest.push_str(&format!(
            "\n[[handlers]]\ntype_name = \"{type_name}\"\nisolation = \"{isolation}\"\n"
        ));
    }
    std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
}

fn config(handler_path: &Path) -> BusConfig {
    let mut config = BusConfig::new(handler_path)
        .with_boundary(BoundaryKind::Thread)
        .with_queue(QueueConfig::new(1, "orders"));
    config.isolation.call_timeout_ms = 5_000;
    config
}

fn make_bus(config: BusConfig) -> (BusManager, Arc<MemoryTransport>) {
    let transport = Arc::new(MemoryTransport::new());
    let bus = BusManager::new(ConfigSource::Inline(config), transport.clone()).with_catalog(catalog());
    (bus, transport)
}

fn message(id: &str, type_name: &str) -> RawMessage {
    RawMessage::new(id).with_body(format!(r#"{{"$type":"{type_name}"}}"#).into_bytes())
}

async fn next_event(rx: &mut broadcast::Receiver<RelayEvent>, name: &str) -> RelayEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let event = rx.recv().await.unwrap();
            if event.name == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {name}"))
}

/// Wait for one event of each name, in any order.
async fn collect_events(
    rx: &mut broadcast::Receiver<RelayEvent>,
    names: &[&str],
) -> HashMap<String, RelayEvent> {
    let mut seen = HashMap::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while seen.len() < names.len() {
            let event = rx.recv().await.unwrap();
            if names.contains(&event.name.as_str()) {
                seen.entry(event.name.clone()).or_insert(event);
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {names:?}"));
    seen
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn zero_queues_leaves_bus_stopped() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "orders", &[(std::any::type_name::<OrderAudit>(), "isolated")]);

    let (bus, _) = make_bus(BusConfig::new(dir.path()).with_boundary(BoundaryKind::Thread));
    assert!(bus.start().await.is_err());
    assert_eq!(bus.state(), ControlState::Stopped);
    assert!(bus.registry().is_none());
}

#[tokio::test]
async fn missing_config_file_leaves_bus_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let bus = BusManager::new(ConfigSource::File(dir.path().join("switchboard.toml")), transport);
    assert!(bus.start().await.is_err());
    assert_eq!(bus.state(), ControlState::Stopped);
}

#[tokio::test]
async fn no_handlers_leaves_bus_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let (bus, transport) = make_bus(config(dir.path()));

    let err = bus.start().await.unwrap_err();
    assert!(err.to_string().contains("No handlers found"));
    assert_eq!(bus.state(), ControlState::Stopped);
    assert!(!transport.is_open("orders"));
}

#[tokio::test]
async fn isolated_handler_processes_messages() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "orders", &[(std::any::type_name::<OrderAudit>(), "isolated")]);

    let (bus, transport) = make_bus(config(dir.path()));
    let mut events = bus.events().subscribe();
    assert!(bus.start().await.unwrap());
    assert_eq!(bus.state(), ControlState::Running);

    let registry = bus.registry().unwrap();
    let hosts = registry.hosts();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].description().working_directory, dir.path().join("orders"));
    assert!(hosts[0].has_activated(std::any::type_name::<OrderAudit>()));

    transport.send("orders", message("m-1", "OrderPlaced")).unwrap();
    let event = next_event(&mut events, "order.audited").await;
    assert_eq!(event.data, json!({ "id": "m-1" }));
    assert_eq!(event.source, std::any::type_name::<OrderAudit>());

    assert!(bus.stop().await.unwrap());
    assert_eq!(bus.state(), ControlState::Stopped);
    assert!(registry.hosts().is_empty());
    assert_eq!(hosts[0].state(), ControlState::Stopped);
}

#[tokio::test]
async fn retries_are_redelivered_to_the_requesting_handler() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(
        dir.path(),
        "payments",
        &[
            (std::any::type_name::<FlakyPayment>(), "isolated"),
            (std::any::type_name::<OrderAudit>(), "none"),
        ],
    );

    let (bus, transport) = make_bus(config(dir.path()));
    let mut events = bus.events().subscribe();
    bus.start().await.unwrap();
    assert_eq!(bus.handler_manager().unwrap().handler_count(), 2);

    transport.send("orders", message("p-1", "PaymentCaptured")).unwrap();
    for expected in 1..=3 {
        let event = next_event(&mut events, "payment.attempt").await;
        assert_eq!(event.data["attempts"], expected);
    }

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn crashing_handler_faults_its_host_only() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "bad", &[(std::any::type_name::<Crashing>(), "isolated")]);
    write_plugin(dir.path(), "good", &[(std::any::type_name::<OrderAudit>(), "isolated")]);

    let (bus, transport) = make_bus(config(dir.path()));
    let mut events = bus.events().subscribe();
    bus.start().await.unwrap();
    assert_eq!(bus.registry().unwrap().hosts().len(), 2);

    transport.send("orders", message("x-1", "Poison")).unwrap();
    let seen = collect_events(&mut events, &["handler.failed", "host.faulted"]).await;
    assert_eq!(seen["handler.failed"].data["handler"], std::any::type_name::<Crashing>());
    assert!(
        seen["host.faulted"].data["cause"]
            .as_str()
            .unwrap()
            .contains("poison pill")
    );

    let registry = bus.registry().unwrap();
    let bad = registry
        .hosts()
        .into_iter()
        .find(|h| h.description().working_directory == dir.path().join("bad"))
        .unwrap();
    assert!(bad.is_faulted());

    // The healthy plugin keeps working
    transport.send("orders", message("x-2", "OrderPlaced")).unwrap();
    next_event(&mut events, "order.audited").await;
    let good = registry
        .hosts()
        .into_iter()
        .find(|h| h.description().working_directory == dir.path().join("good"))
        .unwrap();
    assert!(!good.is_faulted());

    bus.stop().await.unwrap();
}

#[tokio::test]
async fn bus_can_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_plugin(dir.path(), "orders", &[(std::any::type_name::<OrderAudit>(), "isolated")]);

    let (bus, transport) = make_bus(config(dir.path()));
    let mut events = bus.events().subscribe();
    bus.start().await.unwrap();
    let first = bus.registry().unwrap();

    // Start while running stops first
    bus.start().await.unwrap();
    let second = bus.registry().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(first.hosts().is_empty());

    transport.send("orders", message("r-1", "OrderPlaced")).unwrap();
    next_event(&mut events, "order.audited").await;
    bus.stop().await.unwrap();
}
