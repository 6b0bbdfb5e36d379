//! Activation hosts
//!
//! An [`ActivationHost`] is one live isolation boundary plus its bookkeeping:
//! which types have been activated inside it and whether it has faulted.
//! Instances activated through a host come back as [`RemoteHandler`] proxies
//! that forward every call across the boundary.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

use switchboard_common::{
    ControlState, Controller, Disposition, Envelope, HandlerError, HandlerInfo, Lifecycle,
    LifecycleError,
};

use super::error::ActivationCause;
use super::launcher::{Boundary, BoundaryLauncher, LaunchContext};
use crate::handlers::Handler;

// ─────────────────────────────────────────────────────────────────────────────
// Host Description
// ─────────────────────────────────────────────────────────────────────────────

/// Immutable identity of a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostDescription {
    pub id: Uuid,
    /// Directory the boundary runs in and resolves its settings from
    pub working_directory: PathBuf,
    /// Base name of the boundary's settings file
    pub config_base_name: String,
}

impl HostDescription {
    pub fn new(working_directory: impl Into<PathBuf>, config_base_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            working_directory: working_directory.into(),
            config_base_name: config_base_name.into(),
        }
    }
}

/// Published exactly once per host, the first time it faults.
#[derive(Debug, Clone, Serialize)]
pub struct HostFaulted {
    pub description: HostDescription,
    pub cause: String,
    pub faulted_at: DateTime<Utc>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Activation Host
// ─────────────────────────────────────────────────────────────────────────────

pub struct ActivationHost {
    description: HostDescription,
    control: Controller,
    launcher: Arc<dyn BoundaryLauncher>,
    launch: LaunchContext,
    boundary: RwLock<Option<Arc<Boundary>>>,
    activated_types: Mutex<HashSet<String>>,
    fault: Mutex<Option<String>>,
    faults: broadcast::Sender<HostFaulted>,
    /// Flips to true once the first start attempt has finished
    launched: watch::Sender<bool>,
}

impl ActivationHost {
    pub(crate) fn new(
        description: HostDescription,
        launcher: Arc<dyn BoundaryLauncher>,
        launch: LaunchContext,
        faults: broadcast::Sender<HostFaulted>,
    ) -> Self {
        let control = Controller::new(format!("host-{}", description.id));
        Self {
            description,
            control,
            launcher,
            launch,
            boundary: RwLock::new(None),
            activated_types: Mutex::new(HashSet::new()),
            fault: Mutex::new(None),
            faults,
            launched: watch::Sender::new(false),
        }
    }

    pub fn description(&self) -> &HostDescription {
        &self.description
    }

    pub fn id(&self) -> Uuid {
        self.description.id
    }

    pub fn state(&self) -> ControlState {
        self.control.state()
    }

    /// Wait until the first start attempt has finished and no transition is
    /// in progress.
    pub async fn settled(&self) -> ControlState {
        let mut launched = self.launched.subscribe();
        let _ = launched.wait_for(|done| *done).await;
        self.control.settled().await
    }

    pub fn is_faulted(&self) -> bool {
        self.fault.lock().is_some()
    }

    pub fn fault_cause(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub fn has_activated(&self, type_name: &str) -> bool {
        self.activated_types.lock().contains(type_name)
    }

    pub fn activated_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.activated_types.lock().iter().cloned().collect();
        types.sort();
        types
    }

    pub async fn start(&self) -> Result<bool, LifecycleError> {
        self.control.start(self).await
    }

    /// Release callers parked in [`settled`](Self::settled). Called once the
    /// first start attempt is over, however it ended.
    pub(crate) fn finish_launch(&self) {
        self.launched.send_replace(true);
    }

    pub async fn stop(&self) -> Result<bool, LifecycleError> {
        self.control.stop(self).await
    }

    /// Flag the host as faulted. Only the first call has any effect; it
    /// records the cause and publishes one [`HostFaulted`].
    pub fn mark_faulted(&self, cause: impl Into<String>) -> bool {
        let mut fault = self.fault.lock();
        if fault.is_some() {
            return false;
        }
        let cause = cause.into();
        error!(host = %self.description.id, "Host faulted: {}", cause);
        *fault = Some(cause.clone());
        let _ = self.faults.send(HostFaulted {
            description: self.description.clone(),
            cause,
            faulted_at: Utc::now(),
        });
        true
    }

    pub(crate) fn boundary(&self) -> Option<Arc<Boundary>> {
        self.boundary.read().clone()
    }

    /// Activate `type_name` inside this host.
    pub(crate) async fn activate(
        self: &Arc<Self>,
        type_name: &str,
        contract: Option<&str>,
    ) -> Result<Arc<RemoteHandler>, ActivationCause> {
        let boundary = self
            .boundary()
            .ok_or(ActivationCause::HostNotRunning(self.description.id))?;
        let (handle, info) = boundary.client().activate(type_name, contract).await?;
        self.activated_types.lock().insert(type_name.to_string());

        debug!(host = %self.description.id, handle, "Activated {}", type_name);
        Ok(Arc::new(RemoteHandler {
            host: self.clone(),
            handle,
            info,
            released: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl Lifecycle for ActivationHost {
    async fn on_start(&self) -> Result<(), LifecycleError> {
        let boundary = self
            .launcher
            .launch(&self.description, self.launch.clone())
            .await
            .map_err(|e| LifecycleError::StartFailed(e.to_string()))?;
        *self.boundary.write() = Some(Arc::new(boundary));

        info!(
            host = %self.description.id,
            kind = self.launcher.kind(),
            "Host started for {}",
            self.description.working_directory.display()
        );
        Ok(())
    }

    async fn on_stop(&self) -> Result<(), LifecycleError> {
        let boundary = self.boundary.write().take();
        if let Some(boundary) = boundary {
            boundary.shutdown().await;
        }
        info!(host = %self.description.id, "Host stopped");
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Remote Handler
// ─────────────────────────────────────────────────────────────────────────────

/// Proxy for a handler living inside a host.
pub struct RemoteHandler {
    host: Arc<ActivationHost>,
    handle: u64,
    info: HandlerInfo,
    released: AtomicBool,
}

impl RemoteHandler {
    pub fn host(&self) -> &Arc<ActivationHost> {
        &self.host
    }

    pub fn handle(&self) -> u64 {
        self.handle
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Handler for RemoteHandler {
    fn type_name(&self) -> &str {
        &self.info.type_name
    }

    fn handled_types(&self) -> &[String] {
        &self.info.handled_types
    }

    async fn can_process(&self, envelope: &Envelope) -> bool {
        let Some(boundary) = self.host.boundary() else {
            return false;
        };
        match boundary.client().can_process(self.handle, envelope).await {
            Ok(eligible) => eligible,
            Err(e) => {
                debug!(handler = %self.info.type_name, "Eligibility check failed: {}", e);
                false
            }
        }
    }

    async fn process(&self, envelope: &Envelope) -> Result<Disposition, HandlerError> {
        let boundary = self.host.boundary().ok_or_else(|| {
            HandlerError::Unavailable(format!("host {} is not running", self.host.id()))
        })?;
        boundary.client().process(self.handle, envelope).await
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(boundary) = self.host.boundary() {
            if let Err(e) = boundary.client().release(self.handle).await {
                debug!(handler = %self.info.type_name, "Release not acknowledged: {}", e);
            }
        }
    }
}
