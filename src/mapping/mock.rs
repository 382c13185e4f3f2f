//! Recording actuator for tests

use crate::mapping::error::ActuationError;
use crate::mapping::keyboard::{resolve_key, KeyActuator};
use std::sync::Mutex;

#[derive(Default)]
pub struct RecordingActuator {
    presses: Mutex<Vec<String>>,
    releases: Mutex<Vec<String>>,
    should_fail: bool,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actuator that rejects every call
    pub fn failing() -> Self {
        Self {
            should_fail: true,
            ..Self::default()
        }
    }

    pub fn presses(&self) -> Vec<String> {
        self.presses.lock().unwrap().clone()
    }

    pub fn releases(&self) -> Vec<String> {
        self.releases.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.presses.lock().unwrap().clear();
        self.releases.lock().unwrap().clear();
    }

    fn check(&self, key: &str) -> Result<(), ActuationError> {
        if self.should_fail {
            return Err(ActuationError::Rejected {
                key: key.to_string(),
                reason: "mock failure".to_string(),
            });
        }
        if resolve_key(key).is_none() {
            return Err(ActuationError::UnknownKey(key.to_string()));
        }
        Ok(())
    }
}

impl KeyActuator for RecordingActuator {
    fn press(&self, key: &str) -> Result<(), ActuationError> {
        self.check(key)?;
        self.presses.lock().unwrap().push(key.to_string());
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), ActuationError> {
        self.check(key)?;
        self.releases.lock().unwrap().push(key.to_string());
        Ok(())
    }
}
