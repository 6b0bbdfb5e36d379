//! Isolated activation
//!
//! Handlers discovered on disk are untrusted. Each one runs inside an
//! isolation boundary (a child process or a dedicated thread) managed by an
//! [`ActivationHost`]; the [`HostRegistry`] decides which host serves which
//! type and tracks hosts that fault.

mod client;
mod error;
mod host;
mod launcher;
mod part;
mod registry;

pub use client::{BoundaryClient, FaultReporter, FaultSink};
pub use error::{ActivationCause, ActivationError, BoundaryError};
pub use host::{ActivationHost, HostDescription, HostFaulted, RemoteHandler};
pub use launcher::{
    Boundary, BoundaryLauncher, HOST_BINARY, LaunchContext, ProcessLauncher, ThreadLauncher,
};
pub use part::{
    ComposablePart, DEFAULT_CONFIG_BASE_NAME, ExportDefinition, IsolatingPart, IsolationLevel,
    IsolationMetadata, LocalPart, PartDefinition, PartFactory,
};
pub use registry::{HostRegistry, RegistrySettings};
