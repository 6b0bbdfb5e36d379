//! Bus-side handlers
//!
//! Every activated handler, local or isolated, is driven through the
//! [`Handler`] trait. The [`HandlerManager`] resolves eligible handlers for
//! each message and dispatches to them in parallel.

mod local;
mod manager;

use async_trait::async_trait;

use switchboard_common::{Disposition, Envelope, HandlerError};

pub use local::LocalHandler;
pub use manager::{DispatchReport, HandlerManager};

/// A handler as seen by the dispatcher.
#[async_trait]
pub trait Handler: Send + Sync {
    fn type_name(&self) -> &str;

    fn handled_types(&self) -> &[String];

    /// Eligibility check. Never fails: errors count as "not eligible".
    async fn can_process(&self, envelope: &Envelope) -> bool;

    async fn process(&self, envelope: &Envelope) -> Result<Disposition, HandlerError>;

    /// Explicit release. Only handlers that hold boundary-side state need it.
    async fn release(&self) {}
}
