//! Command dispatcher: resolve a [`Command`] against the registry and send
//! the LEAP requests for it.
//!
//! Planning is pure. Sending waits only until each request is queued on the
//! session; the bridge's answer is watched by a spawned task that logs
//! failures.

use crate::command::{Action, Command, Target};
use crate::leap::message::{ButtonCommand, ZoneCommand};
use crate::leap::{Communique, FanSpeed, LeapError, LeapSession, PendingResponse};
use crate::registry::{Device, DeviceKind, Registry, ResolutionError};
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("{device} ({kind}) cannot do {action}")]
    CapabilityMismatch {
        device: String,
        kind: DeviceKind,
        action: Action,
    },

    #[error("could not reach bridge: {0}")]
    Transport(#[source] LeapError),
}

/// Result of the command for one device, button or scene.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    pub target: String,
    pub result: Result<(), DispatchError>,
}

pub type DispatchResult = Result<Vec<Outcome>, DispatchError>;

/// A request for one resolved target, or why there is none.
#[derive(Debug, Clone, PartialEq)]
pub struct Planned {
    pub target: String,
    pub request: Result<Communique, DispatchError>,
}

/// Map an output action onto the zone command for a device kind.
fn zone_command(device: &Device, action: Action) -> Result<ZoneCommand, DispatchError> {
    let shade = matches!(device.kind, DeviceKind::Shade | DeviceKind::TiltShade);
    let command = match (device.kind, action) {
        (DeviceKind::Keypad, _) => None,

        (DeviceKind::Fan, Action::On) => Some(ZoneCommand::GoToFanSpeed(FanSpeed::High)),
        (DeviceKind::Fan, Action::Off) => Some(ZoneCommand::GoToFanSpeed(FanSpeed::Off)),
        (DeviceKind::Fan, Action::Level { level, .. }) => {
            Some(ZoneCommand::GoToFanSpeed(FanSpeed::from_level(level)))
        }
        (DeviceKind::Fan, Action::FanSpeed(speed)) => Some(ZoneCommand::GoToFanSpeed(speed)),
        (DeviceKind::Fan, _) => None,

        (_, Action::On) => Some(ZoneCommand::GoToLevel(100)),
        (_, Action::Off) => Some(ZoneCommand::GoToLevel(0)),
        (DeviceKind::Switch, Action::Level { level, .. }) => {
            Some(ZoneCommand::GoToLevel(if level > 0 { 100 } else { 0 }))
        }
        (
            DeviceKind::Dimmer | DeviceKind::Other,
            Action::Level {
                level,
                fade: Some(fade),
            },
        ) => Some(ZoneCommand::GoToDimmedLevel { level, fade }),
        (_, Action::Level { level, .. }) => Some(ZoneCommand::GoToLevel(level)),

        (_, Action::Raise) if shade => Some(ZoneCommand::Raise),
        (_, Action::Lower) if shade => Some(ZoneCommand::Lower),
        (_, Action::Stop) if shade => Some(ZoneCommand::Stop),
        (DeviceKind::TiltShade, Action::Tilt(tilt)) => Some(ZoneCommand::GoToTilt(tilt)),
        _ => None,
    };
    command.ok_or_else(|| mismatch(device, action))
}

fn mismatch(device: &Device, action: Action) -> DispatchError {
    DispatchError::CapabilityMismatch {
        device: device.name.clone(),
        kind: device.kind,
        action,
    }
}

/// The zone request for a device, if it has an output that can do `action`.
fn zone_request(device: &Device, action: Action) -> Result<Communique, DispatchError> {
    let zone = device.zone.ok_or_else(|| mismatch(device, action))?;
    Ok(zone_command(device, action)?.request(zone))
}

fn button_command(action: Action) -> Option<ButtonCommand> {
    match action {
        Action::Press => Some(ButtonCommand::PressAndRelease),
        Action::Hold => Some(ButtonCommand::PressAndHold),
        Action::Release => Some(ButtonCommand::Release),
        _ => None,
    }
}

/// Resolve the command and build one request per target. An unresolvable
/// target fails the whole command; a device that cannot perform the action
/// fails only its own entry.
pub fn plan(command: &Command, registry: &Registry) -> Result<Vec<Planned>, DispatchError> {
    match &command.target {
        Target::Scene(scene) => {
            let scene = registry.scene(scene)?;
            Ok(vec![Planned {
                target: format!("scene {}", scene.name),
                request: Ok(ButtonCommand::PressAndRelease.scene_request(scene.id)),
            }])
        }
        Target::Path(path) => match button_command(command.action) {
            Some(button_command) => {
                let buttons = registry.resolve_button(path)?;
                Ok(buttons
                    .into_iter()
                    .filter_map(|id| registry.button(id))
                    .map(|button| {
                        let device = registry
                            .device(button.device)
                            .map(|d| d.name.as_str())
                            .unwrap_or_default();
                        Planned {
                            target: format!("{}/{}", device, button.name),
                            request: Ok(button_command.button_request(button.id)),
                        }
                    })
                    .collect())
            }
            None => {
                let devices = registry.resolve(path)?;
                Ok(devices
                    .into_iter()
                    .filter_map(|id| registry.device(id))
                    .map(|device| Planned {
                        target: device.name.clone(),
                        request: zone_request(device, command.action),
                    })
                    .collect())
            }
        },
    }
}

/// Queue a request, reconnecting once if the link is down.
async fn send_with_reconnect<S: LeapSession + ?Sized>(
    session: &S,
    request: Communique,
) -> Result<PendingResponse, LeapError> {
    match session.send(request.clone()).await {
        Err(e) if e.is_transport() => {
            warn!("LEAP link down ({}), reconnecting", e);
            session.reconnect().await?;
            session.send(request).await
        }
        other => other,
    }
}

async fn watch_reply(target: String, url: String, pending: PendingResponse) {
    match pending.await {
        Ok(Ok(response)) if response.is_success() => {
            debug!("{}: {} accepted", target, url);
        }
        Ok(Ok(response)) => warn!(
            "{}: bridge refused {} ({})",
            target,
            url,
            response.header.status_code.as_deref().unwrap_or("no status")
        ),
        Ok(Err(e)) => warn!("{}: {} failed: {}", target, url, e),
        Err(_) => debug!("{}: reply to {} abandoned", target, url),
    }
}

/// Plan and send a command. Registry state is not touched; it changes when
/// the bridge reports the new state.
pub async fn dispatch<S: LeapSession + ?Sized>(
    command: &Command,
    registry: &Registry,
    session: &S,
) -> DispatchResult {
    let planned = plan(command, registry)?;
    let mut outcomes = Vec::with_capacity(planned.len());

    for Planned { target, request } in planned {
        let result = match request {
            Ok(request) => {
                let url = request.url().unwrap_or_default().to_string();
                match send_with_reconnect(session, request).await {
                    Ok(pending) => {
                        info!("{}: {}", target, command.action);
                        tokio::spawn(watch_reply(target.clone(), url, pending));
                        Ok(())
                    }
                    Err(e) => Err(DispatchError::Transport(e)),
                }
            }
            Err(e) => Err(e),
        };
        outcomes.push(Outcome { target, result });
    }
    Ok(outcomes)
}
