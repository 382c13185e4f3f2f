//! Key dispatch: applies key edges to the actuator and keeps `active_keys` honest
//!
//! ```text
//! KeyEdge ──► KeyDispatcher ──► KeyActuator (side effect)
//!                  │
//!                  └──► Controller.active_keys (bookkeeping)
//! ```
//!
//! A press is recorded only once the actuator accepted it. A release always
//! clears the record, so cleanup never releases a key twice.

use crate::controller::controller::Controller;
use crate::controller::event_processor::{EdgeAction, KeyEdge};
use crate::mapping::error::ActuationError;
use crate::mapping::keyboard::KeyActuator;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct KeyDispatcher {
    actuator: Arc<dyn KeyActuator>,
}

impl KeyDispatcher {
    pub fn new(actuator: Arc<dyn KeyActuator>) -> Self {
        Self { actuator }
    }

    /// Issues every edge in order. Failed edges are returned, never retried.
    pub fn dispatch(&self, controller: &mut Controller, edges: &[KeyEdge]) -> Vec<ActuationError> {
        let mut failures = Vec::new();

        for edge in edges {
            match edge.action {
                EdgeAction::Press => match self.actuator.press(&edge.key) {
                    Ok(()) => {
                        debug!(
                            "Controller {}: {} pressed '{}'",
                            controller.id(),
                            edge.control,
                            edge.key
                        );
                        controller.active_keys.insert(edge.key.clone());
                    }
                    Err(e) => {
                        warn!(
                            "Controller {}: {} has no effect: {}",
                            controller.id(),
                            edge.control,
                            e
                        );
                        failures.push(e);
                    }
                },
                EdgeAction::Release => {
                    controller.active_keys.remove(&edge.key);
                    match self.actuator.release(&edge.key) {
                        Ok(()) => debug!(
                            "Controller {}: {} released '{}'",
                            controller.id(),
                            edge.control,
                            edge.key
                        ),
                        Err(e) => {
                            warn!(
                            "Controller {}: {} has no effect: {}",
                            controller.id(),
                            edge.control,
                            e
                        );
                            failures.push(e);
                        }
                    }
                }
            }
        }

        failures
    }

    /// Releases every held key of the controller exactly once and empties the set.
    ///
    /// Returns the number of releases issued.
    pub fn release_all(&self, controller: &mut Controller) -> usize {
        let held = std::mem::take(&mut controller.active_keys);
        if held.is_empty() {
            return 0;
        }

        info!(
            "Releasing {} held key(s) for controller {}",
            held.len(),
            controller.id()
        );
        for key in &held {
            if let Err(e) = self.actuator.release(key) {
                warn!("Release of '{}' failed during cleanup: {}", key, e);
            }
        }
        held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::controller::default_key_mappings;
    use crate::mapping::mock::RecordingActuator;

    fn edge(key: &str, action: EdgeAction) -> KeyEdge {
        KeyEdge {
            control: "button1".to_string(),
            key: key.to_string(),
            action,
        }
    }

    fn setup(actuator: Arc<RecordingActuator>) -> (KeyDispatcher, Controller) {
        (
            KeyDispatcher::new(actuator),
            Controller::new("1".to_string(), default_key_mappings()),
        )
    }

    #[test]
    fn test_press_then_release_leaves_nothing_held() {
        // Arrange
        let actuator = Arc::new(RecordingActuator::new());
        let (dispatcher, mut controller) = setup(actuator.clone());

        // Act
        dispatcher.dispatch(&mut controller, &[edge("space", EdgeAction::Press)]);
        let held_after_press: Vec<String> = controller.active_keys().map(String::from).collect();
        dispatcher.dispatch(&mut controller, &[edge("space", EdgeAction::Release)]);

        // Assert
        assert_eq!(held_after_press, vec!["space".to_string()]);
        assert_eq!(controller.active_keys().count(), 0);
        assert_eq!(actuator.presses(), vec!["space".to_string()]);
        assert_eq!(actuator.releases(), vec!["space".to_string()]);
    }

    #[test]
    fn test_failed_press_is_not_recorded() {
        // Arrange
        let actuator = Arc::new(RecordingActuator::failing());
        let (dispatcher, mut controller) = setup(actuator);

        // Act
        let failures = dispatcher.dispatch(&mut controller, &[edge("space", EdgeAction::Press)]);

        // Assert
        assert_eq!(failures.len(), 1);
        assert_eq!(controller.active_keys().count(), 0);
    }

    #[test]
    fn test_release_all_releases_each_held_key_once() {
        // Arrange
        let actuator = Arc::new(RecordingActuator::new());
        let (dispatcher, mut controller) = setup(actuator.clone());
        dispatcher.dispatch(
            &mut controller,
            &[
                edge("w", EdgeAction::Press),
                edge("d", EdgeAction::Press),
                edge("w", EdgeAction::Press),
                edge("space", EdgeAction::Press),
                edge("space", EdgeAction::Release),
            ],
        );
        actuator.clear();

        // Act
        let released = dispatcher.release_all(&mut controller);
        let second_pass = dispatcher.release_all(&mut controller);

        // Assert
        assert_eq!(released, 2);
        assert_eq!(second_pass, 0);
        let mut releases = actuator.releases();
        releases.sort();
        assert_eq!(releases, vec!["d".to_string(), "w".to_string()]);
        assert!(actuator.presses().is_empty());
    }

    #[test]
    fn test_unknown_key_yields_actuation_error() {
        let actuator = Arc::new(RecordingActuator::new());
        let (dispatcher, mut controller) = setup(actuator);

        let failures = dispatcher.dispatch(&mut controller, &[edge("hyper", EdgeAction::Press)]);

        assert_eq!(failures, vec![ActuationError::UnknownKey("hyper".to_string())]);
    }
}
