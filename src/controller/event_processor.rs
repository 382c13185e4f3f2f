//! Input state machine: raw telemetry samples to discrete key edges
//!
//! Every sample is compared against the state stored for the controller. Buttons
//! map one-to-one onto press/release. Joystick axes go through a two-threshold
//! band per direction:
//!
//! ```text
//!  0 ─────── 200 ─────────────── 800 ─────── 1023
//!  │ active  │     dead zone      │  active  │
//!  │ (left/  │   (no direction)   │ (right/  │
//!  │   up)   │                    │  down)   │
//! ```
//!
//! An edge fires only when a direction's zone membership differs between the
//! stored sample and the new one. Staying inside a zone, or anywhere in the dead
//! zone, never fires. Edge computation is pure; the `apply_*` methods store the
//! new sample afterwards.

use crate::controller::controller::{
    button_control, joystick_control, Controller, Direction, JoystickState, AXIS_CENTER, AXIS_MAX,
    BUTTON_COUNT, JOYSTICK_COUNT,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Button telemetry `{button, pressed}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ButtonSample {
    pub button: u8,
    #[serde(default)]
    pub pressed: bool,
}

/// Joystick telemetry `{joystick, x, y, pressed}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoystickSample {
    pub joystick: u8,
    #[serde(default = "axis_center")]
    pub x: u16,
    #[serde(default = "axis_center")]
    pub y: u16,
    #[serde(default)]
    pub pressed: bool,
}

fn axis_center() -> u16 {
    AXIS_CENTER
}

/// A sample that is well-formed JSON but outside the device's value ranges
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field} out of range: {value}")]
pub struct InvalidSample {
    pub field: &'static str,
    pub value: u32,
}

impl ButtonSample {
    pub fn validate(&self) -> Result<(), InvalidSample> {
        if !(1..=BUTTON_COUNT).contains(&self.button) {
            return Err(InvalidSample {
                field: "button",
                value: self.button as u32,
            });
        }
        Ok(())
    }
}

impl JoystickSample {
    pub fn validate(&self) -> Result<(), InvalidSample> {
        if !(1..=JOYSTICK_COUNT).contains(&self.joystick) {
            return Err(InvalidSample {
                field: "joystick",
                value: self.joystick as u32,
            });
        }
        if self.x > AXIS_MAX {
            return Err(InvalidSample {
                field: "x",
                value: self.x as u32,
            });
        }
        if self.y > AXIS_MAX {
            return Err(InvalidSample {
                field: "y",
                value: self.y as u32,
            });
        }
        Ok(())
    }
}

// Edge action
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeAction {
    Press,
    Release,
}

/// One key transition derived from a sample
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyEdge {
    pub control: String,
    pub key: String,
    pub action: EdgeAction,
}

impl KeyEdge {
    fn new(control: String, key: &str, action: EdgeAction) -> Self {
        Self {
            control,
            key: key.to_string(),
            action,
        }
    }
}

/// Zone boundaries for the joystick hysteresis band
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneThresholds {
    /// Values strictly below this are in the left/up zone
    pub low: u16,
    /// Values strictly above this are in the right/down zone
    pub high: u16,
}

impl Default for ZoneThresholds {
    fn default() -> Self {
        Self {
            low: 200,
            high: 800,
        }
    }
}

impl ZoneThresholds {
    pub fn is_active(&self, direction: Direction, x: u16, y: u16) -> bool {
        match direction {
            Direction::Right => x > self.high,
            Direction::Left => x < self.low,
            Direction::Down => y > self.high,
            Direction::Up => y < self.low,
        }
    }
}

/// Per-controller transformation from telemetry to key edges
#[derive(Clone, Debug, Default)]
pub struct InputStateMachine {
    thresholds: ZoneThresholds,
}

impl InputStateMachine {
    pub fn new(thresholds: ZoneThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> ZoneThresholds {
        self.thresholds
    }

    /// Edges for a button report.
    ///
    /// Repeated identical reports are not suppressed: every report issues the
    /// mapped press or release again.
    pub fn button_edges(&self, controller: &Controller, sample: &ButtonSample) -> Vec<KeyEdge> {
        let control = button_control(sample.button);
        let Some(key) = controller.mapped_key(&control) else {
            debug!(
                "Controller {} button {} is unmapped",
                controller.id(),
                sample.button
            );
            return Vec::new();
        };

        let action = if sample.pressed {
            EdgeAction::Press
        } else {
            EdgeAction::Release
        };
        vec![KeyEdge::new(control, key, action)]
    }

    /// Edges for a joystick report, compared against the stored previous sample.
    ///
    /// Up to four edges, in right, left, down, up order.
    pub fn joystick_edges(&self, controller: &Controller, sample: &JoystickSample) -> Vec<KeyEdge> {
        let previous = controller.joystick_state(sample.joystick);
        let mut edges = Vec::new();

        for direction in Direction::ALL {
            let was_active = self.thresholds.is_active(direction, previous.x, previous.y);
            let is_active = self.thresholds.is_active(direction, sample.x, sample.y);
            if was_active == is_active {
                continue;
            }

            let control = joystick_control(sample.joystick, direction);
            let Some(key) = controller.mapped_key(&control) else {
                debug!(
                    "Controller {} {} crossed its zone but is unmapped",
                    controller.id(),
                    control
                );
                continue;
            };

            let action = if is_active {
                EdgeAction::Press
            } else {
                EdgeAction::Release
            };
            edges.push(KeyEdge::new(control, key, action));
        }

        edges
    }

    /// Computes the edges, then stores the button state.
    pub fn apply_button(&self, controller: &mut Controller, sample: &ButtonSample) -> Vec<KeyEdge> {
        let edges = self.button_edges(controller, sample);
        controller
            .button_states
            .insert(sample.button, sample.pressed);
        edges
    }

    /// Computes the edges, then stores the joystick state unconditionally.
    pub fn apply_joystick(
        &self,
        controller: &mut Controller,
        sample: &JoystickSample,
    ) -> Vec<KeyEdge> {
        let edges = self.joystick_edges(controller, sample);
        controller.joystick_states.insert(
            sample.joystick,
            JoystickState {
                x: sample.x,
                y: sample.y,
                pressed: sample.pressed,
            },
        );
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::controller::default_key_mappings;
    use std::collections::HashMap;

    fn stick(x: u16, y: u16) -> JoystickSample {
        JoystickSample {
            joystick: 1,
            x,
            y,
            pressed: false,
        }
    }

    fn controller() -> Controller {
        Controller::new("1".to_string(), default_key_mappings())
    }

    fn press(control: &str, key: &str) -> KeyEdge {
        KeyEdge::new(control.to_string(), key, EdgeAction::Press)
    }

    fn release(control: &str, key: &str) -> KeyEdge {
        KeyEdge::new(control.to_string(), key, EdgeAction::Release)
    }

    #[test]
    fn test_right_press_hold_release_scenario() {
        let machine = InputStateMachine::default();
        let mut c = controller();

        assert!(machine.apply_joystick(&mut c, &stick(512, 512)).is_empty());
        assert_eq!(
            machine.apply_joystick(&mut c, &stick(900, 512)),
            vec![press("joystick1_right", "d")]
        );
        assert!(machine.apply_joystick(&mut c, &stick(850, 512)).is_empty());
        assert_eq!(
            machine.apply_joystick(&mut c, &stick(512, 512)),
            vec![release("joystick1_right", "d")]
        );
    }

    #[test]
    fn test_same_sample_twice_fires_only_once() {
        let machine = InputStateMachine::default();
        let mut c = controller();

        let first = machine.apply_joystick(&mut c, &stick(100, 512));
        let second = machine.apply_joystick(&mut c, &stick(100, 512));

        assert_eq!(first, vec![press("joystick1_left", "a")]);
        assert!(second.is_empty());
    }

    #[test]
    fn test_dead_zone_never_fires() {
        let machine = InputStateMachine::default();
        let mut c = controller();

        let samples = [
            (200, 200),
            (800, 800),
            (200, 800),
            (800, 200),
            (512, 300),
            (799, 201),
            (650, 512),
        ];
        for (x, y) in samples.iter().cycle().take(70) {
            assert!(machine.apply_joystick(&mut c, &stick(*x, *y)).is_empty());
        }
    }

    #[test]
    fn test_boundary_values_are_inactive() {
        let thresholds = ZoneThresholds::default();

        assert!(!thresholds.is_active(Direction::Right, 800, 512));
        assert!(thresholds.is_active(Direction::Right, 801, 512));
        assert!(!thresholds.is_active(Direction::Left, 200, 512));
        assert!(thresholds.is_active(Direction::Left, 199, 512));
        assert!(thresholds.is_active(Direction::Up, 512, 0));
        assert!(thresholds.is_active(Direction::Down, 512, 1023));
    }

    #[test]
    fn test_diagonal_sample_fires_two_edges() {
        let machine = InputStateMachine::default();
        let mut c = controller();

        let edges = machine.apply_joystick(&mut c, &stick(1000, 0));

        assert_eq!(
            edges,
            vec![press("joystick1_right", "d"), press("joystick1_up", "w")]
        );
    }

    #[test]
    fn test_full_swing_releases_before_pressing_opposite() {
        let machine = InputStateMachine::default();
        let mut c = controller();
        machine.apply_joystick(&mut c, &stick(900, 512));

        let edges = machine.apply_joystick(&mut c, &stick(50, 512));

        assert_eq!(
            edges,
            vec![release("joystick1_right", "d"), press("joystick1_left", "a")]
        );
    }

    #[test]
    fn test_unmapped_direction_produces_no_edge_but_updates_state() {
        let machine = InputStateMachine::default();
        let mut mappings = default_key_mappings();
        mappings.insert("joystick1_right".to_string(), String::new());
        let mut c = Controller::new("1".to_string(), mappings);

        let edges = machine.apply_joystick(&mut c, &stick(900, 512));

        assert!(edges.is_empty());
        assert_eq!(c.joystick_state(1).x, 900);
    }

    #[test]
    fn test_second_joystick_uses_its_own_previous_sample() {
        let machine = InputStateMachine::default();
        let mut c = controller();
        machine.apply_joystick(&mut c, &stick(900, 512));

        let edges = machine.apply_joystick(
            &mut c,
            &JoystickSample {
                joystick: 2,
                x: 900,
                y: 512,
                pressed: true,
            },
        );

        assert_eq!(edges, vec![press("joystick2_right", "right")]);
        assert!(c.joystick_state(2).pressed);
    }

    #[test]
    fn test_button_press_and_release_map_to_key() {
        let machine = InputStateMachine::default();
        let mut c = controller();

        let down = machine.apply_button(&mut c, &ButtonSample { button: 1, pressed: true });
        assert_eq!(down, vec![press("button1", "space")]);
        assert_eq!(c.button_states.get(&1), Some(&true));

        let up = machine.apply_button(&mut c, &ButtonSample { button: 1, pressed: false });
        assert_eq!(up, vec![release("button1", "space")]);
        assert_eq!(c.button_states.get(&1), Some(&false));
    }

    #[test]
    fn test_repeated_button_reports_are_not_deduplicated() {
        let machine = InputStateMachine::default();
        let mut c = controller();
        let sample = ButtonSample { button: 2, pressed: true };

        assert_eq!(machine.apply_button(&mut c, &sample).len(), 1);
        assert_eq!(machine.apply_button(&mut c, &sample).len(), 1);
    }

    #[test]
    fn test_unmapped_button_still_updates_state() {
        let machine = InputStateMachine::default();
        let mut c = Controller::new("1".to_string(), HashMap::new());

        let edges = machine.apply_button(&mut c, &ButtonSample { button: 4, pressed: true });

        assert!(edges.is_empty());
        assert_eq!(c.button_states.get(&4), Some(&true));
    }

    #[test]
    fn test_custom_thresholds() {
        let machine = InputStateMachine::new(ZoneThresholds { low: 100, high: 900 });
        let mut c = controller();

        assert!(machine.apply_joystick(&mut c, &stick(850, 150)).is_empty());
        assert_eq!(
            machine.apply_joystick(&mut c, &stick(950, 150)),
            vec![press("joystick1_right", "d")]
        );
    }

    #[test]
    fn test_sample_validation() {
        assert!(ButtonSample { button: 6, pressed: true }.validate().is_ok());
        assert_eq!(
            ButtonSample { button: 0, pressed: true }.validate(),
            Err(InvalidSample { field: "button", value: 0 })
        );
        assert!(JoystickSample { joystick: 3, x: 0, y: 0, pressed: false }
            .validate()
            .is_err());
        assert_eq!(
            stick(1024, 0).validate(),
            Err(InvalidSample { field: "x", value: 1024 })
        );
    }

    #[test]
    fn test_joystick_sample_defaults() {
        let sample: JoystickSample = serde_json::from_str(r#"{"joystick": 1}"#).unwrap();
        assert_eq!(sample, stick(AXIS_CENTER, AXIS_CENTER));

        let button: ButtonSample = serde_json::from_str(r#"{"button": 3}"#).unwrap();
        assert!(!button.pressed);
    }
}
