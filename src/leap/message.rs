//! LEAP wire types.
//!
//! Only the fields the bridge core reads are modelled; everything else in a
//! body is ignored by serde.

use super::LeapError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommuniqueType {
    ReadRequest,
    ReadResponse,
    CreateRequest,
    CreateResponse,
    UpdateRequest,
    UpdateResponse,
    SubscribeRequest,
    SubscribeResponse,
    UnsubscribeRequest,
    UnsubscribeResponse,
    ExceptionResponse,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Header {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body_type: Option<String>,
}

/// One LEAP message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Communique {
    pub communique_type: CommuniqueType,
    pub header: Header,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Communique {
    fn request(communique_type: CommuniqueType, url: &str, body: Option<Value>) -> Self {
        Self {
            communique_type,
            header: Header {
                url: Some(url.to_string()),
                ..Header::default()
            },
            body,
        }
    }

    pub fn read(url: &str) -> Self {
        Self::request(CommuniqueType::ReadRequest, url, None)
    }

    pub fn create(url: &str, body: Value) -> Self {
        Self::request(CommuniqueType::CreateRequest, url, Some(body))
    }

    pub fn subscribe(url: &str) -> Self {
        Self::request(CommuniqueType::SubscribeRequest, url, None)
    }

    pub fn client_tag(&self) -> Option<&str> {
        self.header.client_tag.as_deref()
    }

    pub fn url(&self) -> Option<&str> {
        self.header.url.as_deref()
    }

    /// Numeric part of the `StatusCode` header ("200 OK" -> 200).
    pub fn status(&self) -> Option<u16> {
        self.header
            .status_code
            .as_deref()
            .and_then(|s| s.split_whitespace().next())
            .and_then(|code| code.parse().ok())
    }

    pub fn is_success(&self) -> bool {
        self.communique_type != CommuniqueType::ExceptionResponse
            && self.status().is_none_or(|code| (200..300).contains(&code))
    }

    pub fn ensure_success(&self, url: &str) -> Result<(), LeapError> {
        if self.is_success() {
            Ok(())
        } else {
            Err(LeapError::Status {
                url: url.to_string(),
                status: self
                    .header
                    .status_code
                    .clone()
                    .unwrap_or_else(|| "ExceptionResponse".to_string()),
            })
        }
    }

    /// Deserialize `Body.<key>`.
    pub fn body_field<T: DeserializeOwned>(&self, key: &str) -> Result<T, LeapError> {
        let value = self
            .body
            .as_ref()
            .and_then(|body| body.get(key))
            .ok_or_else(|| LeapError::Protocol(format!("body has no {key}")))?;
        T::deserialize(value).map_err(|e| LeapError::Protocol(format!("{key}: {e}")))
    }

    pub fn has_body_field(&self, key: &str) -> bool {
        self.body.as_ref().is_some_and(|body| body.get(key).is_some())
    }
}

/// `{"href": "/zone/3"}` link object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Href {
    pub href: String,
}

impl Href {
    /// Trailing numeric id of the link, `/zone/3` -> 3.
    pub fn id(&self) -> Option<u32> {
        parse_href_id(&self.href)
    }
}

pub fn parse_href_id(href: &str) -> Option<u32> {
    href.trim_end_matches('/').rsplit('/').next()?.parse().ok()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AreaDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub device_type: String,
    #[serde(default)]
    pub model_number: Option<String>,
    #[serde(default)]
    pub local_zones: Vec<Href>,
    #[serde(default)]
    pub associated_area: Option<Href>,
    #[serde(default)]
    pub button_groups: Vec<Href>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Engraving {
    #[serde(rename = "Text", default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ButtonDefinition {
    #[serde(rename = "href")]
    pub href: String,
    pub button_number: u8,
    #[serde(default)]
    pub engraving: Option<Engraving>,
    pub parent: Href,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VirtualButtonDefinition {
    #[serde(rename = "href")]
    pub href: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub is_programmed: bool,
}

/// Fan speeds understood by LEAP fan controllers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString,
)]
#[strum(ascii_case_insensitive)]
pub enum FanSpeed {
    Off,
    Low,
    Medium,
    MediumHigh,
    High,
}

impl FanSpeed {
    /// Bucket a 0-100 level onto the five fan speeds.
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => FanSpeed::Off,
            1..=25 => FanSpeed::Low,
            26..=50 => FanSpeed::Medium,
            51..=75 => FanSpeed::MediumHigh,
            _ => FanSpeed::High,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ZoneStatus {
    pub zone: Href,
    #[serde(default)]
    pub level: Option<i64>,
    #[serde(default)]
    pub fan_speed: Option<FanSpeed>,
    #[serde(default)]
    pub tilt: Option<i64>,
    #[serde(default)]
    pub switched_level: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ButtonEventType {
    Press,
    Release,
    LongHold,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ButtonEvent {
    #[serde(rename = "EventType")]
    pub event_type: ButtonEventType,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ButtonStatus {
    pub button: Href,
    pub button_event: ButtonEvent,
}

/// Zone command-processor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneCommand {
    GoToLevel(u8),
    GoToDimmedLevel { level: u8, fade: Duration },
    GoToFanSpeed(FanSpeed),
    GoToTilt(u8),
    Raise,
    Lower,
    Stop,
}

impl ZoneCommand {
    pub fn body(&self) -> Value {
        match self {
            ZoneCommand::GoToLevel(level) => json!({
                "Command": {
                    "CommandType": "GoToLevel",
                    "Parameter": [{"Type": "Level", "Value": level}],
                }
            }),
            ZoneCommand::GoToDimmedLevel { level, fade } => json!({
                "Command": {
                    "CommandType": "GoToDimmedLevel",
                    "DimmedLevelParameters": {"Level": level, "FadeTime": fade_time(*fade)},
                }
            }),
            ZoneCommand::GoToFanSpeed(speed) => json!({
                "Command": {
                    "CommandType": "GoToFanSpeed",
                    "FanSpeedParameters": {"FanSpeed": speed.to_string()},
                }
            }),
            ZoneCommand::GoToTilt(tilt) => json!({
                "Command": {
                    "CommandType": "GoToTilt",
                    "TiltParameters": {"Tilt": tilt},
                }
            }),
            ZoneCommand::Raise => command_type("Raise"),
            ZoneCommand::Lower => command_type("Lower"),
            ZoneCommand::Stop => command_type("Stop"),
        }
    }

    pub fn request(&self, zone: u32) -> Communique {
        Communique::create(&format!("/zone/{zone}/commandprocessor"), self.body())
    }
}

/// Keypad button / scene command-processor operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ButtonCommand {
    PressAndRelease,
    PressAndHold,
    Release,
}

impl ButtonCommand {
    pub fn button_request(&self, button: u32) -> Communique {
        Communique::create(
            &format!("/button/{button}/commandprocessor"),
            command_type(&self.to_string()),
        )
    }

    pub fn scene_request(&self, scene: u32) -> Communique {
        Communique::create(
            &format!("/virtualbutton/{scene}/commandprocessor"),
            command_type(&self.to_string()),
        )
    }
}

fn command_type(name: &str) -> Value {
    json!({"Command": {"CommandType": name}})
}

/// LEAP fade times are `hh:mm:ss`.
fn fade_time(fade: Duration) -> String {
    let secs = fade.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serializes_pascal_case() {
        let mut request = Communique::read("/device");
        request.header.client_tag = Some("abc".to_string());

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(
            value,
            json!({
                "CommuniqueType": "ReadRequest",
                "Header": {"ClientTag": "abc", "Url": "/device"},
            })
        );
    }

    #[test]
    fn test_status_parsing() {
        let line = r#"{"CommuniqueType":"ReadResponse","Header":{"StatusCode":"200 OK","Url":"/zone/1/status","MessageBodyType":"OneZoneStatus"},"Body":{"ZoneStatus":{"Level":40,"Zone":{"href":"/zone/1"}}}}"#;
        let message: Communique = serde_json::from_str(line).unwrap();

        assert_eq!(message.status(), Some(200));
        assert!(message.is_success());
        let status: ZoneStatus = message.body_field("ZoneStatus").unwrap();
        assert_eq!(status.zone.id(), Some(1));
        assert_eq!(status.level, Some(40));
    }

    #[test]
    fn test_error_status_and_exception() {
        let line = r#"{"CommuniqueType":"ReadResponse","Header":{"StatusCode":"404 NotFound","Url":"/button"}}"#;
        let message: Communique = serde_json::from_str(line).unwrap();
        assert!(!message.is_success());
        assert_eq!(
            message.ensure_success("/button"),
            Err(LeapError::Status {
                url: "/button".to_string(),
                status: "404 NotFound".to_string()
            })
        );

        let line = r#"{"CommuniqueType":"ExceptionResponse","Header":{}}"#;
        let message: Communique = serde_json::from_str(line).unwrap();
        assert!(!message.is_success());
    }

    #[test]
    fn test_unknown_communique_type() {
        let line = r#"{"CommuniqueType":"SomethingNew","Header":{}}"#;
        let message: Communique = serde_json::from_str(line).unwrap();
        assert_eq!(message.communique_type, CommuniqueType::Unknown);
    }

    #[test]
    fn test_dimmed_level_body() {
        let body = ZoneCommand::GoToDimmedLevel {
            level: 30,
            fade: Duration::from_secs(3725),
        }
        .body();
        assert_eq!(
            body["Command"]["DimmedLevelParameters"]["FadeTime"],
            json!("01:02:05")
        );
        assert_eq!(body["Command"]["DimmedLevelParameters"]["Level"], json!(30));
    }

    #[test]
    fn test_fan_speed_buckets_and_parsing() {
        assert_eq!(FanSpeed::from_level(0), FanSpeed::Off);
        assert_eq!(FanSpeed::from_level(25), FanSpeed::Low);
        assert_eq!(FanSpeed::from_level(26), FanSpeed::Medium);
        assert_eq!(FanSpeed::from_level(75), FanSpeed::MediumHigh);
        assert_eq!(FanSpeed::from_level(100), FanSpeed::High);
        assert_eq!("mediumhigh".parse::<FanSpeed>().unwrap(), FanSpeed::MediumHigh);
        assert_eq!(FanSpeed::MediumHigh.to_string(), "MediumHigh");
    }

    #[test]
    fn test_button_requests() {
        let request = ButtonCommand::PressAndHold.button_request(101);
        assert_eq!(request.url(), Some("/button/101/commandprocessor"));
        assert_eq!(
            request.body.unwrap()["Command"]["CommandType"],
            json!("PressAndHold")
        );

        let request = ButtonCommand::PressAndRelease.scene_request(3);
        assert_eq!(request.url(), Some("/virtualbutton/3/commandprocessor"));
    }

    #[test]
    fn test_href_id() {
        assert_eq!(parse_href_id("/device/12"), Some(12));
        assert_eq!(parse_href_id("/buttongroup/7/"), Some(7));
        assert_eq!(parse_href_id("/server"), None);
    }
}
