//! Switchboard common types
//!
//! Everything shared between the bus and the code that runs inside an
//! isolation boundary: the envelope model, the handler contract and its
//! eligibility rule, lifecycle control, boundary-side activation, the IPC
//! framing, and the boundary serve loop.

pub mod activator;
pub mod boundary;
pub mod eligibility;
pub mod envelope;
pub mod handler;
pub mod ipc;
pub mod lifecycle;
pub mod relay;

pub use activator::{ActivationHook, ActivatorError, ContractRef, Instance, RemoteActivator, TypeCatalog};
pub use eligibility::is_eligible;
pub use envelope::{BodyCodec, DecodedBody, Envelope, EnvelopeError, Priority, RetryProvenance};
pub use handler::{
    Disposition, HandlerContext, HandlerError, HandlerInfo, HostSettings, MESSAGE_HANDLER_CONTRACT,
    MessageHandler,
};
pub use lifecycle::{ControlState, Controller, Lifecycle, LifecycleError, StateChange};
pub use relay::{EventRelay, EventSink, RelayEvent};
