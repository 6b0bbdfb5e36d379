//! Bus Manager
//!
//! Top-level component. Starting the bus loads and validates configuration,
//! discovers and composes handlers, opens the transport and begins receiving.
//! Any failure along the way leaves the bus Stopped with the reason logged.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{Semaphore, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use switchboard_common::{
    ControlState, Controller, EventRelay, Lifecycle, LifecycleError, RelayEvent, StateChange,
    TypeCatalog,
};

use crate::config::{BoundaryKind, BusConfig, ConfigError};
use crate::discovery::{self, Composition, DiscoveryError};
use crate::handlers::HandlerManager;
use crate::isolation::{BoundaryLauncher, HostRegistry, PartFactory, ProcessLauncher, ThreadLauncher};
use crate::transport::{RetrySink, Transport, TransportError};

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("No handlers found in {0}")]
    NoHandlers(PathBuf),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Where the bus gets its configuration on each start.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Inline(BusConfig),
}

struct RunningBus {
    config: BusConfig,
    registry: Arc<HostRegistry>,
    handler_manager: Arc<HandlerManager>,
    composition: Composition,
    shutdown: watch::Sender<bool>,
    receiver: JoinHandle<()>,
    fault_forwarder: JoinHandle<()>,
}

pub struct BusManager {
    source: ConfigSource,
    control: Controller,
    catalog: Arc<TypeCatalog>,
    transport: Arc<dyn Transport>,
    retries: Arc<dyn RetrySink>,
    events: EventRelay,
    running: Mutex<Option<RunningBus>>,
}

impl BusManager {
    pub fn new<T>(source: ConfigSource, transport: Arc<T>) -> Self
    where
        T: Transport + RetrySink + 'static,
    {
        let retries: Arc<dyn RetrySink> = transport.clone();
        let transport: Arc<dyn Transport> = transport;
        Self {
            source,
            control: Controller::new("bus"),
            catalog: Arc::new(TypeCatalog::new()),
            transport,
            retries,
            events: EventRelay::default(),
            running: Mutex::new(None),
        }
    }

    /// Types that can be built in-process (and inside thread boundaries).
    pub fn with_catalog(mut self, catalog: Arc<TypeCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_events(mut self, events: EventRelay) -> Self {
        self.events = events;
        self
    }

    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.control.subscribe()
    }

    pub fn events(&self) -> &EventRelay {
        &self.events
    }

    pub fn config(&self) -> Option<BusConfig> {
        self.running.lock().as_ref().map(|r| r.config.clone())
    }

    pub fn handler_manager(&self) -> Option<Arc<HandlerManager>> {
        self.running.lock().as_ref().map(|r| r.handler_manager.clone())
    }

    pub fn registry(&self) -> Option<Arc<HostRegistry>> {
        self.running.lock().as_ref().map(|r| r.registry.clone())
    }

    /// Start the bus. Returns `Ok(false)` if the start was vetoed.
    pub async fn start(&self) -> Result<bool, LifecycleError> {
        self.control.start(self).await
    }

    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        self.control.stop(self).await
    }

    async fn load_config(&self) -> Result<BusConfig, BusError> {
        let config = match &self.source {
            ConfigSource::File(path) => BusConfig::load(path).await?,
            ConfigSource::Inline(config) => config.clone(),
        };
        config.validate()?;
        Ok(config)
    }

    fn launcher(&self, config: &BusConfig) -> Arc<dyn BoundaryLauncher> {
        match config.isolation.boundary {
            BoundaryKind::Process => {
                let mut launcher = ProcessLauncher::new();
                if let Some(path) = &config.isolation.host_binary {
                    launcher = launcher.with_host_binary(path);
                }
                Arc::new(launcher)
            }
            BoundaryKind::Thread => Arc::new(ThreadLauncher::new(self.catalog.clone())),
        }
    }

    async fn bring_up(&self) -> Result<RunningBus, BusError> {
        let config = self.load_config().await?;

        let registry = HostRegistry::new(
            self.launcher(&config),
            config.isolation.registry_settings(),
            self.events.clone(),
        );

        let plugins = match discovery::discover_plugins(&config.handler_path).await {
            Ok(plugins) => plugins,
            Err(e) => {
                registry.shutdown().await;
                return Err(e.into());
            }
        };
        let definitions = plugins.iter().flat_map(|p| p.part_definitions()).collect();
        let factory = PartFactory::new(self.catalog.clone(), registry.clone(), self.events.clone());
        let composition = discovery::compose(definitions, &factory).await;

        let handler_manager = Arc::new(
            HandlerManager::new(self.events.clone(), config.dispatch.handler_timeout())
                .with_retry_sink(self.retries.clone()),
        );
        if !handler_manager.initialize(composition.handlers.clone()) {
            composition.dispose().await;
            registry.shutdown().await;
            return Err(BusError::NoHandlers(config.handler_path.clone()));
        }

        if let Err(e) = self.transport.open(&config.queues).await {
            composition.dispose().await;
            registry.shutdown().await;
            return Err(e.into());
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let receiver = tokio::spawn(receive_loop(
            self.transport.clone(),
            handler_manager.clone(),
            Arc::new(Semaphore::new(config.dispatch.max_in_flight.max(1))),
            shutdown_rx,
        ));
        let fault_forwarder = tokio::spawn(forward_faults(registry.clone(), self.events.clone()));

        Ok(RunningBus {
            config,
            registry,
            handler_manager,
            composition,
            shutdown,
            receiver,
            fault_forwarder,
        })
    }
}

#[async_trait]
impl Lifecycle for BusManager {
    async fn on_start(&self) -> Result<(), LifecycleError> {
        match self.bring_up().await {
            Ok(running) => {
                info!(
                    "Bus started: {} queue(s), {} handler(s)",
                    running.config.queues.len(),
                    running.handler_manager.handler_count()
                );
                *self.running.lock() = Some(running);
                Ok(())
            }
            Err(e) => {
                error!("Bus failed to start: {}", e);
                Err(LifecycleError::StartFailed(e.to_string()))
            }
        }
    }

    async fn on_stop(&self) -> Result<(), LifecycleError> {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return Ok(());
        };

        running.shutdown.send_replace(true);
        if let Err(e) = running.receiver.await {
            warn!("Receive loop ended abnormally: {}", e);
        }
        self.transport.close().await;

        running.composition.dispose().await;
        running.registry.shutdown().await;
        running.fault_forwarder.abort();

        info!("Bus stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Background Tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn receive_loop(
    transport: Arc<dyn Transport>,
    manager: Arc<HandlerManager>,
    limit: Arc<Semaphore>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        let permit = tokio::select! {
            _ = shutdown.changed() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let delivery = tokio::select! {
            _ = shutdown.changed() => break,
            delivery = transport.receive() => match delivery {
                Some(delivery) => delivery,
                None => {
                    debug!("Transport closed");
                    break;
                }
            },
        };

        let manager = manager.clone();
        in_flight.spawn(async move {
            let _permit = permit;
            let report = manager.process_message(&delivery).await;
            debug!(
                queue = %delivery.queue,
                id = %report.correlation_id,
                candidates = report.candidates.len(),
                failures = report.failures.len(),
                "Message processed"
            );
        });

        while let Some(finished) = in_flight.try_join_next() {
            if let Err(e) = finished {
                warn!("Message task failed: {}", e);
            }
        }
    }

    // Let in-flight messages finish
    while let Some(finished) = in_flight.join_next().await {
        if let Err(e) = finished {
            warn!("Message task failed: {}", e);
        }
    }
    debug!("Receive loop exited");
}

async fn forward_faults(registry: Arc<HostRegistry>, events: EventRelay) {
    let mut faults = registry.subscribe_faults();
    drop(registry);
    loop {
        match faults.recv().await {
            Ok(fault) => {
                events.publish(RelayEvent::new(
                    "host.faulted",
                    "host-registry",
                    json!({
                        "host": fault.description.id,
                        "working_directory": fault.description.working_directory,
                        "cause": fault.cause,
                        "faulted_at": fault.faulted_at,
                    }),
                ));
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} host fault notification(s)", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
