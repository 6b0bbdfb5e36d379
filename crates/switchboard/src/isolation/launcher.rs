//! Boundary launchers
//!
//! A launcher brings up the far side of an isolation boundary for a host and
//! returns a connected [`Boundary`]. Two kinds exist:
//!
//! - [`ProcessLauncher`] spawns `switchboard-plugin-host` as a child process
//!   and talks to it over stdin/stdout. A crash takes down only the child.
//! - [`ThreadLauncher`] runs the same serve loop on a dedicated thread with
//!   its own runtime, connected through an in-memory pipe. Panics are
//!   contained and reported as faults, but the boundary shares the address
//!   space with the bus.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use switchboard_common::boundary::{self, ConfigureHook, load_host_settings};
use switchboard_common::{EventRelay, RemoteActivator, TypeCatalog};

use super::client::{BoundaryClient, FaultReporter};
use super::error::BoundaryError;
use super::host::HostDescription;

/// Name of the plugin host executable.
pub const HOST_BINARY: &str = "switchboard-plugin-host";

const PIPE_CAPACITY: usize = 256 * 1024;
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// Everything a launcher needs besides the host description.
#[derive(Clone)]
pub struct LaunchContext {
    pub faults: FaultReporter,
    pub events: EventRelay,
    pub startup_timeout: Duration,
    pub call_timeout: Duration,
}

#[async_trait]
pub trait BoundaryLauncher: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn launch(
        &self,
        description: &HostDescription,
        ctx: LaunchContext,
    ) -> Result<Boundary, BoundaryError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Boundary
// ─────────────────────────────────────────────────────────────────────────────

enum Teardown {
    Process(tokio::sync::Mutex<Option<Child>>),
    Thread(parking_lot::Mutex<Option<thread::JoinHandle<()>>>),
}

/// A running boundary: its client plus whatever must be reaped on shutdown.
pub struct Boundary {
    client: BoundaryClient,
    teardown: Teardown,
}

impl Boundary {
    pub fn client(&self) -> &BoundaryClient {
        &self.client
    }

    /// Ask the boundary to exit and reap it.
    pub async fn shutdown(&self) {
        let id = self.client.boundary_id();
        self.client.shutdown().await;

        match &self.teardown {
            Teardown::Process(child) => {
                let Some(mut child) = child.lock().await.take() else {
                    return;
                };
                match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                    Ok(Ok(status)) => info!(boundary = %id, "Host process exited with status: {}", status),
                    Ok(Err(e)) => error!(boundary = %id, "Error waiting for host process: {}", e),
                    Err(_) => {
                        warn!(boundary = %id, "Host process did not exit in time, killing");
                        let _ = child.kill().await;
                    }
                }
            }
            Teardown::Thread(handle) => {
                let Some(handle) = handle.lock().take() else {
                    return;
                };
                let joined = tokio::time::timeout(
                    EXIT_GRACE,
                    tokio::task::spawn_blocking(move || handle.join()),
                )
                .await;
                match joined {
                    Ok(Ok(Ok(()))) => debug!(boundary = %id, "Boundary thread exited"),
                    Ok(Ok(Err(_))) => warn!(boundary = %id, "Boundary thread panicked"),
                    Ok(Err(e)) => warn!(boundary = %id, "Failed to join boundary thread: {}", e),
                    Err(_) => warn!(boundary = %id, "Boundary thread did not exit in time, detaching"),
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process Launcher
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    /// Path to the host binary (defaults to searching next to the current
    /// executable, then PATH)
    host_binary: Option<PathBuf>,
}

impl ProcessLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host_binary(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_binary = Some(path.into());
        self
    }

    /// Resolve the plugin host binary for a host running in `working_dir`.
    ///
    /// A configured relative path is tried under the working directory first.
    /// Without configuration the binary next to the current executable is
    /// preferred, then PATH.
    pub fn host_binary_path(&self, working_dir: &Path) -> PathBuf {
        if let Some(configured) = &self.host_binary {
            if configured.is_relative() {
                let local = working_dir.join(configured);
                if local.exists() {
                    return local;
                }
            }
            return configured.clone();
        }

        // Try to find in same directory as current executable
        let sibling = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(HOST_BINARY)));
        match sibling {
            Some(path) if path.exists() => path,
            // Fall back to PATH
            _ => PathBuf::from(HOST_BINARY),
        }
    }
}

#[async_trait]
impl BoundaryLauncher for ProcessLauncher {
    fn kind(&self) -> &'static str {
        "process"
    }

    async fn launch(
        &self,
        description: &HostDescription,
        ctx: LaunchContext,
    ) -> Result<Boundary, BoundaryError> {
        let host_binary = self.host_binary_path(&description.working_directory);

        info!(
            "Spawning host process: {} in {}",
            host_binary.display(),
            description.working_directory.display()
        );

        let mut cmd = Command::new(&host_binary);
        cmd.arg("--config-base")
            .arg(&description.config_base_name)
            .current_dir(&description.working_directory)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Host stderr goes to our stderr
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BoundaryError::Launch(format!("failed to spawn host process: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BoundaryError::Launch("failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BoundaryError::Launch("failed to get stdout".into()))?;

        let connected = BoundaryClient::connect(
            description.id,
            Box::new(stdout),
            Box::new(stdin),
            ctx.startup_timeout,
            ctx.call_timeout,
            ctx.faults,
            ctx.events,
        )
        .await;

        match connected {
            Ok(client) => Ok(Boundary {
                client,
                teardown: Teardown::Process(tokio::sync::Mutex::new(Some(child))),
            }),
            Err(e) => {
                let _ = child.kill().await;
                Err(e)
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Thread Launcher
// ─────────────────────────────────────────────────────────────────────────────

/// Runs boundaries on dedicated threads using an in-process type catalog.
#[derive(Clone)]
pub struct ThreadLauncher {
    catalog: Arc<TypeCatalog>,
}

impl ThreadLauncher {
    pub fn new(catalog: Arc<TypeCatalog>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl BoundaryLauncher for ThreadLauncher {
    fn kind(&self) -> &'static str {
        "thread"
    }

    async fn launch(
        &self,
        description: &HostDescription,
        ctx: LaunchContext,
    ) -> Result<Boundary, BoundaryError> {
        let settings = load_host_settings(
            &description.working_directory,
            &description.config_base_name,
        )
        .await;
        let activator = RemoteActivator::new(self.catalog.clone())
            .with_hook(Arc::new(ConfigureHook::new(settings)));

        let (bus_side, boundary_side) = tokio::io::duplex(PIPE_CAPACITY);

        let name = format!("boundary-{}", description.id);
        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                debug!("[{}] Thread started", thread_name);

                // Create tokio runtime for this thread
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!("[{}] Failed to build runtime: {}", thread_name, e);
                        return;
                    }
                };

                let (reader, writer) = tokio::io::split(boundary_side);
                if let Err(e) = rt.block_on(boundary::serve(reader, writer, activator)) {
                    warn!("[{}] Boundary stopped with error: {}", thread_name, e);
                }

                rt.shutdown_background();
                debug!("[{}] Thread exiting", thread_name);
            })
            .map_err(|e| BoundaryError::Launch(format!("failed to spawn thread: {}", e)))?;

        let (reader, writer) = tokio::io::split(bus_side);
        let client = BoundaryClient::connect(
            description.id,
            Box::new(reader),
            Box::new(writer),
            ctx.startup_timeout,
            ctx.call_timeout,
            ctx.faults,
            ctx.events,
        )
        .await?;

        Ok(Boundary {
            client,
            teardown: Teardown::Thread(parking_lot::Mutex::new(Some(handle))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_host_binary_prefers_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = ProcessLauncher::new().with_host_binary("bin/host");

        // Not present yet: the configured path is used as given
        assert_eq!(launcher.host_binary_path(dir.path()), PathBuf::from("bin/host"));

        std::fs::create_dir_all(dir.path().join("bin")).unwrap();
        std::fs::write(dir.path().join("bin/host"), b"").unwrap();
        assert_eq!(launcher.host_binary_path(dir.path()), dir.path().join("bin/host"));
    }

    #[test]
    fn test_absolute_host_binary_is_used_verbatim() {
        let launcher = ProcessLauncher::new().with_host_binary("/usr/local/bin/host");
        assert_eq!(
            launcher.host_binary_path(Path::new("/plugins/a")),
            PathBuf::from("/usr/local/bin/host")
        );
    }

    #[test]
    fn test_default_host_binary_name() {
        let path = ProcessLauncher::new().host_binary_path(Path::new("/plugins/a"));
        assert!(path.ends_with(HOST_BINARY));
    }
}
