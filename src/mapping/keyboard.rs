//! Key injection capability and the key-name vocabulary used by mappings
//!
//! Mappings store plain key names (`"space"`, `"w"`, `"f5"`). This module
//! resolves those names and hands them to a [`KeyActuator`]. The platform
//! backend is picked once at startup; nothing above this module knows which
//! operating system it runs on.

use crate::mapping::error::ActuationError;
use rdev::{simulate, EventType, Key};
use tracing::{debug, info, warn};

/// Capability to hold down and let go of a named key.
///
/// Implementations must be idempotent per call: pressing an already pressed key
/// or releasing a key that is up is harmless.
pub trait KeyActuator: Send + Sync {
    fn press(&self, key: &str) -> Result<(), ActuationError>;

    fn release(&self, key: &str) -> Result<(), ActuationError>;
}

/// Resolves a mapping key name into the backend key.
///
/// Names are case-insensitive. Returns `None` for names outside the supported set.
pub fn resolve_key(name: &str) -> Option<Key> {
    let lowered = name.trim().to_ascii_lowercase();
    let key = match lowered.as_str() {
        "a" => Key::KeyA,
        "b" => Key::KeyB,
        "c" => Key::KeyC,
        "d" => Key::KeyD,
        "e" => Key::KeyE,
        "f" => Key::KeyF,
        "g" => Key::KeyG,
        "h" => Key::KeyH,
        "i" => Key::KeyI,
        "j" => Key::KeyJ,
        "k" => Key::KeyK,
        "l" => Key::KeyL,
        "m" => Key::KeyM,
        "n" => Key::KeyN,
        "o" => Key::KeyO,
        "p" => Key::KeyP,
        "q" => Key::KeyQ,
        "r" => Key::KeyR,
        "s" => Key::KeyS,
        "t" => Key::KeyT,
        "u" => Key::KeyU,
        "v" => Key::KeyV,
        "w" => Key::KeyW,
        "x" => Key::KeyX,
        "y" => Key::KeyY,
        "z" => Key::KeyZ,
        "0" => Key::Num0,
        "1" => Key::Num1,
        "2" => Key::Num2,
        "3" => Key::Num3,
        "4" => Key::Num4,
        "5" => Key::Num5,
        "6" => Key::Num6,
        "7" => Key::Num7,
        "8" => Key::Num8,
        "9" => Key::Num9,
        "space" => Key::Space,
        "enter" => Key::Return,
        "tab" => Key::Tab,
        "escape" => Key::Escape,
        "backspace" => Key::Backspace,
        "up" => Key::UpArrow,
        "down" => Key::DownArrow,
        "left" => Key::LeftArrow,
        "right" => Key::RightArrow,
        "ctrl" => Key::ControlLeft,
        "alt" => Key::Alt,
        "shift" => Key::ShiftLeft,
        "caps_lock" => Key::CapsLock,
        "f1" => Key::F1,
        "f2" => Key::F2,
        "f3" => Key::F3,
        "f4" => Key::F4,
        "f5" => Key::F5,
        "f6" => Key::F6,
        "f7" => Key::F7,
        "f8" => Key::F8,
        "f9" => Key::F9,
        "f10" => Key::F10,
        "f11" => Key::F11,
        "f12" => Key::F12,
        _ => return None,
    };
    Some(key)
}

/// Injects real key events through `rdev` (Windows, macOS, Linux/X11).
#[derive(Debug, Default)]
pub struct RdevActuator;

impl RdevActuator {
    pub fn new() -> Self {
        info!("Using rdev key actuator");
        Self
    }

    fn send(&self, name: &str, event: EventType) -> Result<(), ActuationError> {
        simulate(&event).map_err(|e| ActuationError::Rejected {
            key: name.to_string(),
            reason: format!("{:?}", e),
        })
    }
}

impl KeyActuator for RdevActuator {
    fn press(&self, key: &str) -> Result<(), ActuationError> {
        let resolved =
            resolve_key(key).ok_or_else(|| ActuationError::UnknownKey(key.to_string()))?;
        debug!("Injecting key press: {} ({:?})", key, resolved);
        self.send(key, EventType::KeyPress(resolved))
    }

    fn release(&self, key: &str) -> Result<(), ActuationError> {
        let resolved =
            resolve_key(key).ok_or_else(|| ActuationError::UnknownKey(key.to_string()))?;
        debug!("Injecting key release: {} ({:?})", key, resolved);
        self.send(key, EventType::KeyRelease(resolved))
    }
}

/// Dry-run actuator. Validates key names and logs instead of injecting.
#[derive(Debug, Default)]
pub struct LoggingActuator;

impl KeyActuator for LoggingActuator {
    fn press(&self, key: &str) -> Result<(), ActuationError> {
        if resolve_key(key).is_none() {
            warn!("Dry run: unknown key '{}'", key);
            return Err(ActuationError::UnknownKey(key.to_string()));
        }
        info!("Dry run: press '{}'", key);
        Ok(())
    }

    fn release(&self, key: &str) -> Result<(), ActuationError> {
        if resolve_key(key).is_none() {
            warn!("Dry run: unknown key '{}'", key);
            return Err(ActuationError::UnknownKey(key.to_string()));
        }
        info!("Dry run: release '{}'", key);
        Ok(())
    }
}
