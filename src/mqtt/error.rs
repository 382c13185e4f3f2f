//! Error taxonomy for bus sessions and the two handshake protocols

use crate::controller::registry::RegistryError;
use rumqttc::ConnectionError;
use thiserror::Error;

/// Connection-level failures. Retried with backoff, shown as status only.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    /// The port answered without speaking MQTT, or nothing listens on it
    #[error("No broker running on port {0}")]
    BrokerNotRunning(u16),
}

impl From<ConnectionError> for ConnectError {
    fn from(e: ConnectionError) -> Self {
        match e {
            ConnectionError::ConnectionRefused(code) => {
                ConnectError::Rejected(format!("{:?}", code))
            }
            other => ConnectError::Unreachable(other.to_string()),
        }
    }
}

/// Per-message failures. The message is logged and dropped, the session continues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed payload on {topic}: {reason}")]
    Malformed { topic: String, reason: String },

    #[error("No handler for topic {0}")]
    UnknownTopic(String),

    #[error("Unexpected payload on {topic}: '{payload}'")]
    UnexpectedPayload { topic: String, payload: String },

    #[error("Telemetry for unknown controller {0}")]
    UnknownController(String),

    #[error("Value out of range: {0}")]
    OutOfRange(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Connect(#[from] ConnectError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Terminal: the registry handed out an id twice
    #[error("Identity conflict for controller {0}")]
    IdentityConflict(String),
}

impl From<RegistryError> for SessionError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::IdentityConflict(id) => SessionError::IdentityConflict(id),
            RegistryError::UnknownController(id) => {
                SessionError::Protocol(ProtocolError::UnknownController(id))
            }
            RegistryError::InvalidSample(sample) => {
                SessionError::Protocol(ProtocolError::OutOfRange(sample.to_string()))
            }
        }
    }
}

impl SessionError {
    /// Whether the session must stop instead of dropping the message
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::IdentityConflict(_))
    }
}
