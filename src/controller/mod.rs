//! Controller subsystem for remote device input
//!
//! 1. [`controller`] - the per-device model (identity, state, mappings, held keys)
//! 2. [`event_processor`] - telemetry samples to key edges with axis hysteresis
//! 3. [`registry`] - shared registry, the single lock around all controller mutation
//!
//! ```text
//! Telemetry ──► Registry ──► InputStateMachine ──► KeyDispatcher
//!                  │              (edges)          (actuation)
//!                  └──► snapshot watch channel
//! ```

pub mod controller;
pub mod event_processor;
pub mod registry;

pub use registry::{ControllerRegistry, RegistryError};
