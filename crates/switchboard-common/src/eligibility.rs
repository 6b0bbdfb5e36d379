//! Retry-aware handler eligibility
//!
//! A handler may take a message when it handles the body's logical type and,
//! for redeliveries, when it is the handler that asked for the retry. First
//! deliveries fan out to every handler of the type; retries go back only to
//! the handler that requested them.

use tracing::debug;

use crate::envelope::{Envelope, EnvelopeError};

/// Decide whether `handler_type` may process `envelope`.
///
/// Any decoding failure makes the handler ineligible.
pub fn is_eligible(
    handler_type: &str,
    handled_types: &[impl AsRef<str>],
    envelope: &Envelope,
) -> bool {
    match evaluate(handler_type, handled_types, envelope) {
        Ok(eligible) => eligible,
        Err(e) => {
            debug!(
                handler = handler_type,
                correlation_id = envelope.correlation_id(),
                "Treating message as ineligible: {}",
                e
            );
            false
        }
    }
}

/// Same rule as [`is_eligible`], surfacing the decode error instead of
/// folding it into `false`.
pub fn evaluate(
    handler_type: &str,
    handled_types: &[impl AsRef<str>],
    envelope: &Envelope,
) -> Result<bool, EnvelopeError> {
    let body = envelope.decode_body()?;
    if !handled_types.iter().any(|t| t.as_ref() == body.type_name) {
        return Ok(false);
    }

    match envelope.retry_provenance()? {
        None => Ok(true),
        Some(provenance) if provenance.is_first_delivery() => Ok(true),
        Some(provenance) => Ok(provenance.retry_source == handler_type),
    }
}
