//! Topic router: MQTT topic + payload -> [`Command`].
//!
//! The bridge holds one wildcard subscription. Whatever the broker delivers
//! is matched against the configured filter here, and the segments after the
//! filter name the target.
//!
//! Payloads, case-insensitive:
//! - `ON`, `OFF`, `RAISE`, `LOWER`, `STOP`, `PRESS` (or `CLICK`), `HOLD`, `RELEASE`
//! - a number 0-100: level
//! - `[level, fade_seconds]`
//! - a JSON string holding any of the above
//! - `{"action": ..., "level": ..., "fade": ..., "tilt": ..., "speed": ...}`

use crate::command::{Action, Command, Target};
use crate::leap::FanSpeed;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("value {0} out of range")]
    OutOfRange(f64),

    #[error("topic names no target")]
    MissingTarget,

    #[error("topic {0} does not match the command filter")]
    TopicMismatch(String),

    #[error("malformed payload: {0}")]
    InvalidPayload(String),
}

const SCENE_SEGMENT: &str = "scene";

#[derive(Debug, Clone)]
pub struct TopicRouter {
    filter: Vec<String>,
    subscription: String,
}

impl TopicRouter {
    pub fn new(topic: &str) -> Self {
        let base = topic
            .strip_suffix("/#")
            .or_else(|| topic.strip_suffix('#'))
            .unwrap_or(topic);
        let subscription = if topic.ends_with('#') {
            topic.to_string()
        } else {
            format!("{}/#", topic.trim_end_matches('/'))
        };
        let filter = if base.is_empty() {
            Vec::new()
        } else {
            base.trim_end_matches('/')
                .split('/')
                .map(str::to_string)
                .collect()
        };
        Self {
            filter,
            subscription,
        }
    }

    /// The single filter to subscribe to.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn parse(&self, topic: &str, payload: &str) -> Result<Command, ParseError> {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() < self.filter.len()
            || !self
                .filter
                .iter()
                .zip(&segments)
                .all(|(f, s)| f == "+" || f == s)
        {
            return Err(ParseError::TopicMismatch(topic.to_string()));
        }

        let rest: Vec<String> = segments[self.filter.len()..]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        if rest.is_empty() {
            return Err(ParseError::MissingTarget);
        }

        if rest.len() > 1 && rest[0].eq_ignore_ascii_case(SCENE_SEGMENT) {
            return Ok(Command {
                target: Target::Scene(rest[1..].join("/")),
                action: Action::ActivateScene,
            });
        }

        Ok(Command {
            target: Target::Path(rest),
            action: parse_payload(payload)?,
        })
    }
}

pub fn parse_payload(payload: &str) -> Result<Action, ParseError> {
    let payload = payload.trim();
    match payload.chars().next() {
        Some('{') => parse_object(payload),
        Some('[') => parse_tuple(payload),
        Some('"') => {
            let inner: String = serde_json::from_str(payload)
                .map_err(|e| ParseError::InvalidPayload(e.to_string()))?;
            parse_plain(inner.trim())
        }
        _ => parse_plain(payload),
    }
}

fn keyword(word: &str) -> Option<Action> {
    let action = match word.to_ascii_uppercase().as_str() {
        "ON" => Action::On,
        "OFF" => Action::Off,
        "RAISE" => Action::Raise,
        "LOWER" => Action::Lower,
        "STOP" => Action::Stop,
        "PRESS" | "CLICK" => Action::Press,
        "HOLD" => Action::Hold,
        "RELEASE" => Action::Release,
        _ => return None,
    };
    Some(action)
}

fn parse_plain(payload: &str) -> Result<Action, ParseError> {
    if let Some(action) = keyword(payload) {
        return Ok(action);
    }
    match payload.parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(Action::Level {
            level: percent(value)?,
            fade: None,
        }),
        _ => Err(ParseError::UnknownAction(payload.to_string())),
    }
}

fn percent(value: f64) -> Result<u8, ParseError> {
    if (0.0..=100.0).contains(&value) {
        Ok(value.round() as u8)
    } else {
        Err(ParseError::OutOfRange(value))
    }
}

fn fade_duration(seconds: f64) -> Result<Duration, ParseError> {
    Duration::try_from_secs_f64(seconds).map_err(|_| ParseError::OutOfRange(seconds))
}

fn number(value: &Value) -> Result<f64, ParseError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ParseError::InvalidPayload(format!("{n} is not a number"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| ParseError::InvalidPayload(format!("{s:?} is not a number"))),
        other => Err(ParseError::InvalidPayload(format!(
            "{other} is not a number"
        ))),
    }
}

fn parse_tuple(payload: &str) -> Result<Action, ParseError> {
    let values: Vec<Value> =
        serde_json::from_str(payload).map_err(|e| ParseError::InvalidPayload(e.to_string()))?;
    match values.as_slice() {
        [level] => Ok(Action::Level {
            level: percent(number(level)?)?,
            fade: None,
        }),
        [level, seconds] => Ok(Action::Level {
            level: percent(number(level)?)?,
            fade: Some(fade_duration(number(seconds)?)?),
        }),
        _ => Err(ParseError::InvalidPayload(format!(
            "expected [level, fade], got {} values",
            values.len()
        ))),
    }
}

#[derive(Debug, Deserialize)]
struct StructuredPayload {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    level: Option<Value>,
    #[serde(default)]
    fade: Option<Value>,
    #[serde(default)]
    tilt: Option<Value>,
    #[serde(default)]
    speed: Option<String>,
}

fn parse_object(payload: &str) -> Result<Action, ParseError> {
    let fields: StructuredPayload =
        serde_json::from_str(payload).map_err(|e| ParseError::InvalidPayload(e.to_string()))?;

    let fade = fields
        .fade
        .as_ref()
        .map(|f| number(f).and_then(fade_duration))
        .transpose()?;
    let level = fields
        .level
        .as_ref()
        .map(|l| number(l).and_then(percent))
        .transpose()?;
    let tilt = fields
        .tilt
        .as_ref()
        .map(|t| number(t).and_then(percent))
        .transpose()?;
    let speed = fields.speed.as_deref().map(fan_speed).transpose()?;

    let level_action = |level: u8| Action::Level { level, fade };
    let missing = |field: &str| ParseError::InvalidPayload(format!("{field} missing"));

    let Some(action) = fields.action else {
        return match (level, tilt, speed) {
            (Some(level), _, _) => Ok(level_action(level)),
            (None, Some(tilt), _) => Ok(Action::Tilt(tilt)),
            (None, None, Some(speed)) => Ok(Action::FanSpeed(speed)),
            (None, None, None) => Err(missing("action")),
        };
    };

    match action.trim().to_ascii_uppercase().as_str() {
        "LEVEL" => level.map(level_action).ok_or_else(|| missing("level")),
        "TILT" => tilt.map(Action::Tilt).ok_or_else(|| missing("tilt")),
        "FAN" => speed
            .or_else(|| level.map(FanSpeed::from_level))
            .map(Action::FanSpeed)
            .ok_or_else(|| missing("speed")),
        "ON" if fade.is_some() => Ok(level_action(100)),
        "OFF" if fade.is_some() => Ok(level_action(0)),
        other => keyword(other).ok_or_else(|| ParseError::UnknownAction(action.clone())),
    }
}

fn fan_speed(speed: &str) -> Result<FanSpeed, ParseError> {
    speed
        .trim()
        .replace([' ', '_', '-'], "")
        .parse()
        .map_err(|_| ParseError::UnknownAction(speed.to_string()))
}
