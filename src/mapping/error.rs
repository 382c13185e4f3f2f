//! Error definitions for the key actuation layer

use thiserror::Error;

/// Failures while turning a mapped key name into an injected key event.
///
/// Actuation errors are never retried. The control that produced them simply
/// has no effect for this message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActuationError {
    /// The mapping names a key the actuator does not know
    #[error("Unknown key name: '{0}'")]
    UnknownKey(String),

    /// The platform refused to inject the event
    #[error("Actuator rejected key '{key}': {reason}")]
    Rejected { key: String, reason: String },
}
