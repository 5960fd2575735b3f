//! Normalized commands produced by the topic router.

use crate::leap::FanSpeed;
use std::fmt;
use std::time::Duration;

/// What a command is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// `device`, `area`, `area/device`, or a button path below a keypad.
    Path(Vec<String>),
    /// Scene by name or virtual button id.
    Scene(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Path(segments) => f.write_str(&segments.join("/")),
            Target::Scene(scene) => write!(f, "scene/{scene}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    On,
    Off,
    Level { level: u8, fade: Option<Duration> },
    Raise,
    Lower,
    Stop,
    Tilt(u8),
    FanSpeed(FanSpeed),
    /// Keypad button press-and-release.
    Press,
    Hold,
    Release,
    ActivateScene,
}

impl Action {
    /// Button actions address a keypad button instead of a device output.
    pub fn is_button_action(&self) -> bool {
        matches!(self, Action::Press | Action::Hold | Action::Release)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::On => f.write_str("ON"),
            Action::Off => f.write_str("OFF"),
            Action::Level {
                level,
                fade: Some(fade),
            } => write!(f, "LEVEL {level} (fade {}s)", fade.as_secs_f64()),
            Action::Level { level, fade: None } => write!(f, "LEVEL {level}"),
            Action::Raise => f.write_str("RAISE"),
            Action::Lower => f.write_str("LOWER"),
            Action::Stop => f.write_str("STOP"),
            Action::Tilt(tilt) => write!(f, "TILT {tilt}"),
            Action::FanSpeed(speed) => write!(f, "FAN {speed}"),
            Action::Press => f.write_str("PRESS"),
            Action::Hold => f.write_str("HOLD"),
            Action::Release => f.write_str("RELEASE"),
            Action::ActivateScene => f.write_str("SCENE"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub target: Target,
    pub action: Action,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.target, self.action)
    }
}
