//! Device registry.
//!
//! Built once per session from the bridge inventory. Maps the names people
//! put in MQTT topics onto LEAP ids and holds the last-known state of every
//! device. Only the processing loop touches it, so there is no locking.

use crate::leap::message::{
    AreaDefinition, ButtonDefinition, DeviceDefinition, VirtualButtonDefinition, ZoneStatus,
    parse_href_id,
};
use crate::leap::{LeapError, LeapSession};
use crate::state::{DeviceId, DeviceState, StateChangeRecord, changes_from_zone_status};
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use std::collections::{BTreeMap, HashMap};
use strum::Display;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("no device, area or scene named {0:?}")]
    NotFound(String),
}

/// What a device can do, derived from its LEAP `DeviceType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DeviceKind {
    Dimmer,
    Switch,
    Fan,
    Shade,
    TiltShade,
    Keypad,
    Other,
}

impl DeviceKind {
    pub fn from_device_type(device_type: &str) -> Self {
        match device_type {
            "WallDimmer" | "PlugInDimmer" | "InLineDimmer" | "SunnataDimmer"
            | "TempInWallPaddleDimmer" | "WallDimmerWithPreset" | "Dimmed" | "SpectrumTune"
            | "WhiteTune" | "DivaSmartDimmer" | "CeilingFixture" | "WhiteTuneLight" => {
                DeviceKind::Dimmer
            }
            "WallSwitch" | "OutdoorPlugInSwitch" | "PlugInSwitch" | "InLineSwitch"
            | "PowPakSwitch" | "SunnataSwitch" | "TempInWallPaddleSwitch" | "Switched" => {
                DeviceKind::Switch
            }
            "CasetaFanSpeedController" | "MaestroFanSpeedController" | "FanSpeed" => {
                DeviceKind::Fan
            }
            "SerenaTiltOnlyWoodBlind" | "QsWirelessWoodBlind" | "QsWirelessHorizontalSheerBlind"
            | "Tilt" => DeviceKind::TiltShade,
            "SerenaHoneycombShade" | "SerenaRollerShade" | "TriathlonHoneycombShade"
            | "TriathlonRollerShade" | "QsWirelessShade" | "RightDrawDrape" | "Shade"
            | "PalladiomWireFreeShade" => DeviceKind::Shade,
            other if other.starts_with("Pico")
                || other.contains("Keypad")
                || other == "FourGroupRemote" =>
            {
                DeviceKind::Keypad
            }
            _ => DeviceKind::Other,
        }
    }
}

/// Button names of the Pico remotes, by button number.
fn pico_button_name(device_type: &str, number: u8) -> Option<&'static str> {
    let names: &[&str] = match device_type {
        "Pico1Button" => &["Button"],
        "Pico2Button" => &["On", "Off"],
        "Pico2ButtonRaiseLower" => &["On", "Off", "Raise", "Lower"],
        "Pico3Button" => &["On", "Fav", "Off"],
        "Pico3ButtonRaiseLower" => &["On", "Fav", "Off", "Raise", "Lower"],
        "Pico4Button" => &["1", "2", "3", "4"],
        "Pico4ButtonScene" => &["On", "Off", "Preset 1", "Preset 2"],
        "Pico4Button2Group" => &["Group 1 On", "Group 1 Off 2", "Group 2 On", "Group 2 Off"],
        "FourGroupRemote" => &["Group 1 On", "Group 2 On 2", "Group 3 On", "Group 4 On"],
        _ => return None,
    };
    names.get(usize::from(number)).copied()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Area {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub id: u32,
    pub number: u8,
    pub name: String,
    pub device: DeviceId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scene {
    pub id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub area: Option<u32>,
    pub zone: Option<u32>,
    pub kind: DeviceKind,
    pub device_type: String,
    pub model: Option<String>,
    /// Button ids, in button-number order.
    pub buttons: Vec<u32>,
    pub state: DeviceState,
}

/// Raw bridge inventory, as read from the session.
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    pub areas: Vec<AreaDefinition>,
    pub devices: Vec<DeviceDefinition>,
    pub buttons: Vec<ButtonDefinition>,
    pub scenes: Vec<VirtualButtonDefinition>,
    pub zone_statuses: Vec<ZoneStatus>,
}

impl Inventory {
    /// Read everything the registry needs from the bridge.
    pub async fn read<S: LeapSession + ?Sized>(session: &S) -> Result<Self, LeapError> {
        Ok(Self {
            areas: read_list(session, "/area", "Areas", false).await?,
            devices: read_list(session, "/device", "Devices", false).await?,
            buttons: read_list(session, "/button", "Buttons", true).await?,
            scenes: read_list(session, "/virtualbutton", "VirtualButtons", true).await?,
            zone_statuses: read_list(session, "/zone/status", "ZoneStatuses", true).await?,
        })
    }
}

/// Read a list body. Optional lists tolerate bridges that do not know the
/// URL at all.
async fn read_list<S, T>(
    session: &S,
    url: &str,
    key: &str,
    optional: bool,
) -> Result<Vec<T>, LeapError>
where
    S: LeapSession + ?Sized,
    T: DeserializeOwned,
{
    match session.read(url).await {
        Ok(response) if response.has_body_field(key) => response.body_field(key),
        Ok(_) => {
            debug!("{} returned no {}", url, key);
            Ok(Vec::new())
        }
        Err(LeapError::Status { status, .. }) if optional => {
            warn!("Bridge cannot read {} ({}), skipping", url, status);
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

fn same_name(a: &str, b: &str) -> bool {
    a.trim().eq_ignore_ascii_case(b.trim())
}

pub struct Registry {
    areas: BTreeMap<u32, Area>,
    devices: BTreeMap<DeviceId, Device>,
    buttons: BTreeMap<u32, Button>,
    scenes: BTreeMap<u32, Scene>,
    zones: HashMap<u32, DeviceId>,
}

impl Registry {
    pub async fn load<S: LeapSession + ?Sized>(session: &S) -> Result<Self, LeapError> {
        let inventory = Inventory::read(session).await?;
        let registry = Self::from_inventory(inventory);
        info!(
            "Loaded {} devices in {} areas, {} buttons, {} scenes",
            registry.devices.len(),
            registry.areas.len(),
            registry.buttons.len(),
            registry.scenes.len()
        );
        Ok(registry)
    }

    pub fn from_inventory(inventory: Inventory) -> Self {
        let areas: BTreeMap<u32, Area> = inventory
            .areas
            .into_iter()
            .filter_map(|area| {
                let id = parse_href_id(&area.href)?;
                Some((id, Area { id, name: area.name }))
            })
            .collect();

        let mut devices = BTreeMap::new();
        let mut zones = HashMap::new();
        let mut button_groups: HashMap<u32, DeviceId> = HashMap::new();
        for definition in inventory.devices {
            let Some(id) = parse_href_id(&definition.href) else {
                warn!("Skipping device with unusable href {}", definition.href);
                continue;
            };
            let zone = definition.local_zones.first().and_then(|z| z.id());
            if let Some(zone) = zone {
                zones.insert(zone, id);
            }
            for group in definition.button_groups.iter().filter_map(|g| g.id()) {
                button_groups.insert(group, id);
            }
            let kind = DeviceKind::from_device_type(&definition.device_type);
            devices.insert(
                id,
                Device {
                    id,
                    name: definition.name,
                    area: definition.associated_area.as_ref().and_then(|a| a.id()),
                    zone,
                    kind,
                    device_type: definition.device_type,
                    model: definition.model_number,
                    buttons: Vec::new(),
                    state: DeviceState::new(),
                },
            );
        }

        let mut buttons = BTreeMap::new();
        for definition in inventory.buttons {
            let (Some(id), Some(device_id)) = (
                parse_href_id(&definition.href),
                definition
                    .parent
                    .id()
                    .and_then(|group| button_groups.get(&group).copied()),
            ) else {
                debug!("Button {} has no known keypad", definition.href);
                continue;
            };
            let Some(device) = devices.get_mut(&device_id) else {
                continue;
            };
            let name = pico_button_name(&device.device_type, definition.button_number)
                .map(str::to_string)
                .or_else(|| {
                    definition
                        .engraving
                        .and_then(|e| e.text)
                        .filter(|t| !t.trim().is_empty())
                })
                .unwrap_or_else(|| definition.button_number.to_string());
            device.buttons.push(id);
            buttons.insert(
                id,
                Button {
                    id,
                    number: definition.button_number,
                    name,
                    device: device_id,
                },
            );
        }
        for device in devices.values_mut() {
            device
                .buttons
                .sort_by_key(|id| buttons.get(id).map(|b: &Button| b.number));
        }

        let scenes = inventory
            .scenes
            .into_iter()
            .filter(|scene| scene.is_programmed)
            .filter_map(|scene| {
                let id = parse_href_id(&scene.href)?;
                let name = scene.name.unwrap_or_else(|| format!("Scene {id}"));
                Some((id, Scene { id, name }))
            })
            .collect();

        let mut registry = Self {
            areas,
            devices,
            buttons,
            scenes,
            zones,
        };
        for status in &inventory.zone_statuses {
            if let Some(record) = registry.record_from_zone_status(status) {
                registry.update_state(&record);
            }
        }
        registry
    }

    pub fn device(&self, id: DeviceId) -> Option<&Device> {
        self.devices.get(&id)
    }

    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    pub fn area(&self, id: u32) -> Option<&Area> {
        self.areas.get(&id)
    }

    pub fn area_name(&self, device: &Device) -> Option<&str> {
        device
            .area
            .and_then(|id| self.areas.get(&id))
            .map(|area| area.name.as_str())
    }

    pub fn button(&self, id: u32) -> Option<&Button> {
        self.buttons.get(&id)
    }

    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.buttons.values()
    }

    pub fn device_for_zone(&self, zone: u32) -> Option<&Device> {
        self.zones.get(&zone).and_then(|id| self.devices.get(id))
    }

    /// Turn a zone status report into a record for the owning device.
    pub fn record_from_zone_status(&self, status: &ZoneStatus) -> Option<StateChangeRecord> {
        let device = self.device_for_zone(status.zone.id()?)?;
        let mut record = StateChangeRecord::new(device.id);
        record.changes = changes_from_zone_status(device.kind, status);
        Some(record)
    }

    /// Devices addressed by `device`, `area` or `area/device`.
    pub fn resolve(&self, path: &[String]) -> Result<Vec<DeviceId>, ResolutionError> {
        let not_found = || ResolutionError::NotFound(path.join("/"));
        match path {
            [name] => {
                let by_name: Vec<DeviceId> = self
                    .devices
                    .values()
                    .filter(|d| same_name(&d.name, name))
                    .map(|d| d.id)
                    .collect();
                if !by_name.is_empty() {
                    return Ok(by_name);
                }

                let areas = self.areas_named(name);
                if !areas.is_empty() {
                    let members: Vec<DeviceId> = self
                        .devices
                        .values()
                        .filter(|d| d.zone.is_some() && d.area.is_some_and(|a| areas.contains(&a)))
                        .map(|d| d.id)
                        .collect();
                    return if members.is_empty() {
                        Err(not_found())
                    } else {
                        Ok(members)
                    };
                }

                name.trim()
                    .parse::<DeviceId>()
                    .ok()
                    .filter(|id| self.devices.contains_key(id))
                    .map(|id| vec![id])
                    .ok_or_else(not_found)
            }
            [area, name] => {
                let areas = self.areas_named(area);
                let found: Vec<DeviceId> = self
                    .devices
                    .values()
                    .filter(|d| d.area.is_some_and(|a| areas.contains(&a)) && same_name(&d.name, name))
                    .map(|d| d.id)
                    .collect();
                if found.is_empty() {
                    Err(not_found())
                } else {
                    Ok(found)
                }
            }
            _ => Err(not_found()),
        }
    }

    /// Buttons addressed by `device/button` or `area/device/button`. A
    /// numeric button is a button number, anything else a button name.
    pub fn resolve_button(&self, path: &[String]) -> Result<Vec<u32>, ResolutionError> {
        let not_found = || ResolutionError::NotFound(path.join("/"));
        let Some((button, device_path)) = path.split_last() else {
            return Err(not_found());
        };
        if device_path.is_empty() {
            return Err(not_found());
        }
        let devices = self.resolve(device_path)?;

        let number = button.trim().parse::<u8>().ok();
        let found: Vec<u32> = devices
            .iter()
            .filter_map(|id| self.devices.get(id))
            .flat_map(|device| device.buttons.iter())
            .filter_map(|id| self.buttons.get(id))
            .filter(|b| match number {
                Some(number) => b.number == number,
                None => same_name(&b.name, button),
            })
            .map(|b| b.id)
            .collect();
        if found.is_empty() {
            Err(not_found())
        } else {
            Ok(found)
        }
    }

    /// Programmed scene by name, or by virtual button id.
    pub fn scene(&self, name_or_id: &str) -> Result<&Scene, ResolutionError> {
        self.scenes
            .values()
            .find(|s| same_name(&s.name, name_or_id))
            .or_else(|| {
                name_or_id
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .and_then(|id| self.scenes.get(&id))
            })
            .ok_or_else(|| ResolutionError::NotFound(format!("scene/{name_or_id}")))
    }

    /// Apply a record to the cached state. Only the attributes in the record
    /// change; gestures are skipped. Returns false for unknown devices.
    pub fn update_state(&mut self, record: &StateChangeRecord) -> bool {
        let Some(device) = self.devices.get_mut(&record.device) else {
            debug!("State change for unknown device {}", record.device);
            return false;
        };
        for (attribute, value) in &record.changes {
            if !attribute.is_transient() {
                device.state.insert(*attribute, value.clone());
            }
        }
        true
    }

    fn areas_named(&self, name: &str) -> Vec<u32> {
        self.areas
            .values()
            .filter(|a| same_name(&a.name, name))
            .map(|a| a.id)
            .collect()
    }
}
