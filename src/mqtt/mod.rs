//! # Message bus integration
//!
//! Two sessions run side by side, each in its own task:
//!
//! ```text
//! central bus ──► BusSession(Central) ──► DiscoveryProtocol ──► BrokerLifecycle
//!                                                 │ (wake)
//! local bus   ──► BusSession(Local) ───► RegistrationProtocol ──► ControllerRegistry
//! ```
//!
//! ```text
//! mqtt/
//! ├── broker.rs           - local broker probe, start and stop
//! ├── config.rs           - endpoints and reconnect backoff
//! ├── discovery.rs        - central bus handshake
//! ├── error.rs            - connect, protocol and session errors
//! ├── fake_server.rs      - in-process MQTT server for tests
//! ├── message_manager.rs  - wire payloads and outbound requests
//! ├── mqtt_handler.rs     - session state machine and reconnect loop
//! ├── registration.rs     - identity assignment and telemetry intake
//! └── topics.rs           - topic names and classification
//! ```

pub mod broker;
pub mod config;
pub mod discovery;
pub mod error;
#[cfg(test)]
pub mod fake_server;
pub mod message_manager;
pub mod mqtt_handler;
pub mod registration;
pub mod topics;
