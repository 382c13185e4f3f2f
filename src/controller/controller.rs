use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Number of physical buttons on a device, numbered from 1
pub const BUTTON_COUNT: u8 = 6;

/// Number of joysticks on a device, numbered from 1
pub const JOYSTICK_COUNT: u8 = 2;

/// Axis resting position reported by an idle joystick
pub const AXIS_CENTER: u16 = 512;

/// Largest raw axis value a device may report
pub const AXIS_MAX: u16 = 1023;

// Joystick state as last reported by the device
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoystickState {
    pub x: u16,
    pub y: u16,
    pub pressed: bool,
}

impl Default for JoystickState {
    fn default() -> Self {
        Self {
            x: AXIS_CENTER,
            y: AXIS_CENTER,
            pressed: false,
        }
    }
}

// Direction a joystick can be pushed into
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
}

impl Direction {
    /// Evaluation order for a joystick sample
    pub const ALL: [Direction; 4] = [
        Direction::Right,
        Direction::Left,
        Direction::Down,
        Direction::Up,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
            Direction::Left => "left",
            Direction::Right => "right",
        }
    }
}

/// Control name used as key in the mapping table for a button, e.g. `button1`
pub fn button_control(button: u8) -> String {
    format!("button{}", button)
}

/// Control name for a joystick direction, e.g. `joystick1_up`
pub fn joystick_control(joystick: u8, direction: Direction) -> String {
    format!("joystick{}_{}", joystick, direction.suffix())
}

/// Mapping every controller starts with when nothing is stored for it.
pub fn default_key_mappings() -> HashMap<String, String> {
    let pairs = [
        ("button1", "space"),
        ("button2", "x"),
        ("button3", "z"),
        ("button4", "c"),
        ("button5", "l"),
        ("button6", "r"),
        ("joystick1_up", "w"),
        ("joystick1_down", "s"),
        ("joystick1_left", "a"),
        ("joystick1_right", "d"),
        ("joystick2_up", "up"),
        ("joystick2_down", "down"),
        ("joystick2_left", "left"),
        ("joystick2_right", "right"),
    ];
    pairs
        .iter()
        .map(|(control, key)| (control.to_string(), key.to_string()))
        .collect()
}

/// One registered remote device.
///
/// The id is fixed at creation. Button and joystick state is only written by the
/// telemetry path, the mapping table by configuration and administration.
#[derive(Clone, Debug)]
pub struct Controller {
    id: String,
    pub name: String,
    pub button_states: BTreeMap<u8, bool>,
    pub joystick_states: BTreeMap<u8, JoystickState>,
    pub key_mappings: HashMap<String, String>,
    // Keys with an outstanding press issued on behalf of this controller
    pub(crate) active_keys: BTreeSet<String>,
}

impl Controller {
    pub fn new(id: String, key_mappings: HashMap<String, String>) -> Self {
        let button_states = (1..=BUTTON_COUNT).map(|b| (b, false)).collect();
        let joystick_states = (1..=JOYSTICK_COUNT)
            .map(|j| (j, JoystickState::default()))
            .collect();

        Self {
            name: format!("Controller {}", id),
            id,
            button_states,
            joystick_states,
            key_mappings,
            active_keys: BTreeSet::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Key mapped to `control`, ignoring empty (unmapped) entries
    pub fn mapped_key(&self, control: &str) -> Option<&str> {
        self.key_mappings
            .get(control)
            .map(String::as_str)
            .filter(|key| !key.is_empty())
    }

    pub fn update_key_mapping(&mut self, control: impl Into<String>, key: impl Into<String>) {
        self.key_mappings.insert(control.into(), key.into());
    }

    pub fn joystick_state(&self, joystick: u8) -> JoystickState {
        self.joystick_states
            .get(&joystick)
            .copied()
            .unwrap_or_default()
    }

    pub fn active_keys(&self) -> impl Iterator<Item = &str> {
        self.active_keys.iter().map(String::as_str)
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            key_mappings: self.key_mappings.clone(),
            button_states: self.button_states.clone(),
            joystick_states: self.joystick_states.clone(),
            active_keys: self.active_keys.iter().cloned().collect(),
        }
    }
}

/// Read-only copy of a controller handed to observers
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub id: String,
    pub name: String,
    pub key_mappings: HashMap<String, String>,
    pub button_states: BTreeMap<u8, bool>,
    pub joystick_states: BTreeMap<u8, JoystickState>,
    pub active_keys: Vec<String>,
}
