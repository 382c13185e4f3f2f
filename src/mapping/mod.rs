//! Turns key edges into injected keyboard events.
//!
//! - [`keyboard`] - key names and the [`keyboard::KeyActuator`] capability
//! - [`engine`] - [`engine::KeyDispatcher`], which drives the actuator and tracks held keys
//! - [`error`] - actuation failures

pub mod engine;
pub mod error;
pub mod keyboard;

#[cfg(test)]
pub mod mock;

pub use engine::KeyDispatcher;
pub use error::ActuationError;
pub use keyboard::{KeyActuator, LoggingActuator, RdevActuator};
