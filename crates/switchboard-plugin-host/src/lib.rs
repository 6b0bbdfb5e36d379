//! Switchboard plugin host
//!
//! The far side of a process boundary. The host binary links a catalog of
//! handler types and serves activation and invocation requests from the bus
//! over stdin/stdout.

pub mod handlers;

use switchboard_common::TypeCatalog;

/// Every handler type this host can construct.
pub fn catalog() -> TypeCatalog {
    let mut catalog = TypeCatalog::new();
    catalog.register_handler::<handlers::AuditHandler>();
    catalog.register_handler::<handlers::PaymentRetryHandler>();
    catalog.register_handler::<handlers::CrashingHandler>();
    catalog.register_handler::<handlers::EchoHandler>();
    catalog
}
