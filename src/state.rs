//! Device state attributes and the records that carry changes to them.

use crate::leap::message::ZoneStatus;
use crate::registry::DeviceKind;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// LEAP device id (`/device/<id>`).
pub type DeviceId = u32;

/// Last-known attribute values of one device.
pub type DeviceState = BTreeMap<Attribute, AttrValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Attribute {
    State,
    Level,
    FanSpeed,
    Tilt,
    /// Keypad button, by button number.
    Button(u8),
    DoubleClick,
    LongPress,
}

impl Attribute {
    /// Topic segment / JSON key.
    pub fn name(&self) -> String {
        match self {
            Attribute::State => "state".to_string(),
            Attribute::Level => "level".to_string(),
            Attribute::FanSpeed => "fan_speed".to_string(),
            Attribute::Tilt => "tilt".to_string(),
            Attribute::Button(number) => format!("button_{number}"),
            Attribute::DoubleClick => "double_click".to_string(),
            Attribute::LongPress => "long_press".to_string(),
        }
    }

    /// Gestures are published but never cached.
    pub fn is_transient(&self) -> bool {
        matches!(self, Attribute::DoubleClick | Attribute::LongPress)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Number(u8),
    Text(String),
}

impl AttrValue {
    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::Number(n) => Value::from(*n),
            AttrValue::Text(s) => Value::from(s.as_str()),
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Number(n) => write!(f, "{n}"),
            AttrValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<u8> for AttrValue {
    fn from(n: u8) -> Self {
        AttrValue::Number(n)
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

/// Attributes of one device that changed in one bridge event.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChangeRecord {
    pub device: DeviceId,
    pub changes: BTreeMap<Attribute, AttrValue>,
    pub timestamp: DateTime<Utc>,
}

impl StateChangeRecord {
    pub fn new(device: DeviceId) -> Self {
        Self {
            device,
            changes: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with(mut self, attribute: Attribute, value: impl Into<AttrValue>) -> Self {
        self.changes.insert(attribute, value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

fn percent(value: i64) -> u8 {
    value.clamp(0, 100) as u8
}

fn on_off(on: bool) -> &'static str {
    if on { "ON" } else { "OFF" }
}

/// Translate a zone status report into attribute changes for a device of
/// the given kind. Fields the bridge left out stay out.
pub fn changes_from_zone_status(
    kind: DeviceKind,
    status: &ZoneStatus,
) -> BTreeMap<Attribute, AttrValue> {
    let mut changes: BTreeMap<Attribute, AttrValue> = BTreeMap::new();
    let level = status.level.map(percent);

    match kind {
        DeviceKind::Fan => {
            if let Some(speed) = status.fan_speed {
                changes.insert(
                    Attribute::State,
                    on_off(speed != crate::leap::FanSpeed::Off).into(),
                );
                changes.insert(Attribute::FanSpeed, speed.to_string().into());
            } else if let Some(level) = level {
                changes.insert(Attribute::State, on_off(level > 0).into());
            }
            if let Some(level) = level {
                changes.insert(Attribute::Level, level.into());
            }
        }
        DeviceKind::Shade | DeviceKind::TiltShade => {
            if let Some(level) = level {
                let state = if level > 0 { "OPEN" } else { "CLOSED" };
                changes.insert(Attribute::State, state.into());
                changes.insert(Attribute::Level, level.into());
            }
            if let Some(tilt) = status.tilt {
                changes.insert(Attribute::Tilt, percent(tilt).into());
            }
        }
        DeviceKind::Switch => {
            let on = match status.switched_level.as_deref() {
                Some(switched) => Some(switched.eq_ignore_ascii_case("on")),
                None => level.map(|l| l > 0),
            };
            if let Some(on) = on {
                changes.insert(Attribute::State, on_off(on).into());
            }
            if let Some(level) = level {
                changes.insert(Attribute::Level, level.into());
            }
        }
        DeviceKind::Keypad => {}
        DeviceKind::Dimmer | DeviceKind::Other => {
            if let Some(level) = level {
                changes.insert(Attribute::State, on_off(level > 0).into());
                changes.insert(Attribute::Level, level.into());
            }
        }
    }
    changes
}
