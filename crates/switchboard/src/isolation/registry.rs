//! Host registry
//!
//! Picks the activation host for each type, creating and starting hosts on
//! demand. Selection prefers a host that already activated the type, then a
//! host running from the same origin directory. Faulted hosts stay registered
//! until shutdown but are skipped during selection unless configured
//! otherwise.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use switchboard_common::EventRelay;

use super::client::{FaultReporter, FaultSink};
use super::error::{ActivationCause, ActivationError};
use super::host::{ActivationHost, HostDescription, HostFaulted, RemoteHandler};
use super::launcher::{BoundaryLauncher, LaunchContext};
use crate::handlers::Handler;

#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Skip faulted hosts when selecting a host for a new activation
    pub exclude_faulted: bool,
    pub startup_timeout: Duration,
    pub call_timeout: Duration,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            exclude_faulted: true,
            startup_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HostRegistry {
    hosts: parking_lot::Mutex<Vec<Arc<ActivationHost>>>,
    launcher: Arc<dyn BoundaryLauncher>,
    settings: RegistrySettings,
    events: EventRelay,
    faults: broadcast::Sender<HostFaulted>,
    weak_self: Weak<HostRegistry>,
}

impl HostRegistry {
    pub fn new(
        launcher: Arc<dyn BoundaryLauncher>,
        settings: RegistrySettings,
        events: EventRelay,
    ) -> Arc<Self> {
        let (faults, _) = broadcast::channel(64);
        Arc::new_cyclic(|weak_self| Self {
            hosts: parking_lot::Mutex::new(Vec::new()),
            launcher,
            settings,
            events,
            faults,
            weak_self: weak_self.clone(),
        })
    }

    pub fn subscribe_faults(&self) -> broadcast::Receiver<HostFaulted> {
        self.faults.subscribe()
    }

    /// Snapshot of registered hosts, in creation order.
    pub fn hosts(&self) -> Vec<Arc<ActivationHost>> {
        self.hosts.lock().clone()
    }

    pub fn find_host(&self, id: Uuid) -> Option<Arc<ActivationHost>> {
        self.hosts.lock().iter().find(|h| h.id() == id).cloned()
    }

    fn eligible(&self, host: &ActivationHost) -> bool {
        !(self.settings.exclude_faulted && host.is_faulted())
    }

    /// Find or create the host for `type_name` from `origin`.
    ///
    /// Selection and insertion happen under one lock, so concurrent callers
    /// for the same origin share a single host. The new host is started
    /// outside the lock; if that fails, or the creating call is dropped
    /// before the start finishes, it is removed again and waiting callers
    /// select afresh.
    pub async fn get_or_create_host(
        &self,
        origin: &Path,
        type_name: &str,
        config_base_name: &str,
    ) -> Result<Arc<ActivationHost>, ActivationError> {
        loop {
            let (host, created) = self.select_or_insert(origin, type_name, config_base_name);

            if !created {
                // Another caller may still be starting it.
                host.settled().await;
                if self.is_registered(&host) {
                    return Ok(host);
                }
                debug!(host = %host.id(), "Host was abandoned during start, selecting again");
                continue;
            }

            let mut launching = Launching {
                registry: self,
                host: host.clone(),
                started: false,
            };
            let failure = match host.start().await {
                Ok(true) => {
                    launching.started = true;
                    info!(host = %host.id(), "Created host for {}", origin.display());
                    return Ok(host);
                }
                Ok(false) => ActivationCause::HostStartVetoed,
                Err(e) => ActivationCause::HostStart(e),
            };
            return Err(ActivationError::new(type_name, failure));
        }
    }

    fn select_or_insert(
        &self,
        origin: &Path,
        type_name: &str,
        config_base_name: &str,
    ) -> (Arc<ActivationHost>, bool) {
        let mut hosts = self.hosts.lock();

        let existing = hosts
            .iter()
            .filter(|h| self.eligible(h))
            .find(|h| h.has_activated(type_name))
            .or_else(|| {
                hosts
                    .iter()
                    .filter(|h| self.eligible(h))
                    .find(|h| h.description().working_directory == origin)
            })
            .cloned();

        match existing {
            Some(host) => (host, false),
            None => {
                let host = Arc::new(self.new_host(HostDescription::new(origin, config_base_name)));
                hosts.push(host.clone());
                (host, true)
            }
        }
    }

    fn is_registered(&self, host: &Arc<ActivationHost>) -> bool {
        self.hosts.lock().iter().any(|h| Arc::ptr_eq(h, host))
    }

    fn new_host(&self, description: HostDescription) -> ActivationHost {
        let sink: Weak<dyn FaultSink> = self.weak_self.clone();
        let launch = LaunchContext {
            faults: FaultReporter::new(description.id, sink),
            events: self.events.clone(),
            startup_timeout: self.settings.startup_timeout,
            call_timeout: self.settings.call_timeout,
        };
        ActivationHost::new(description, self.launcher.clone(), launch, self.faults.clone())
    }

    /// Activate `type_name` in `host`, narrowed to `contract` when given.
    pub async fn create_instance(
        &self,
        host: &Arc<ActivationHost>,
        type_name: &str,
        contract: Option<&str>,
    ) -> Result<Arc<RemoteHandler>, ActivationError> {
        host.settled().await;
        host.activate(type_name, contract)
            .await
            .map_err(|cause| ActivationError::new(type_name, cause))
    }

    /// Select a host and activate `type_name` in it.
    pub async fn activate(
        &self,
        origin: &Path,
        type_name: &str,
        config_base_name: &str,
        contract: Option<&str>,
    ) -> Result<Arc<RemoteHandler>, ActivationError> {
        let host = self
            .get_or_create_host(origin, type_name, config_base_name)
            .await?;
        self.create_instance(&host, type_name, contract).await
    }

    /// Release an instance that exposes an explicit-release contract.
    pub async fn release_instance(&self, instance: &dyn Handler) {
        instance.release().await;
    }

    pub fn mark_faulted(&self, host: &ActivationHost, cause: impl Into<String>) -> bool {
        host.mark_faulted(cause)
    }

    /// Route a fault raised by the boundary with `boundary_id`. Reports from
    /// boundaries that do not belong to a registered host are ignored.
    pub fn report_boundary_fault(&self, boundary_id: Uuid, cause: impl Into<String>) -> bool {
        match self.find_host(boundary_id) {
            Some(host) => host.mark_faulted(cause),
            None => {
                debug!(boundary = %boundary_id, "Ignoring fault from unknown boundary");
                false
            }
        }
    }

    /// Stop and forget every host.
    pub async fn shutdown(&self) {
        let hosts = std::mem::take(&mut *self.hosts.lock());
        for host in hosts {
            if let Err(e) = host.stop().await {
                warn!(host = %host.id(), "Failed to stop host: {}", e);
            }
        }
    }
}

/// Ends the first start attempt of a newly created host. Unless the start
/// succeeded the host is unregistered before waiters are released, which
/// also covers the creating call being dropped mid-launch.
struct Launching<'a> {
    registry: &'a HostRegistry,
    host: Arc<ActivationHost>,
    started: bool,
}

impl Drop for Launching<'_> {
    fn drop(&mut self) {
        if !self.started {
            self.registry
                .hosts
                .lock()
                .retain(|h| !Arc::ptr_eq(h, &self.host));
            warn!(host = %self.host.id(), "Host did not start, unregistered");
        }
        self.host.finish_launch();
    }
}

impl FaultSink for HostRegistry {
    fn boundary_faulted(&self, boundary_id: Uuid, cause: String) {
        self.report_boundary_fault(boundary_id, cause);
    }
}
