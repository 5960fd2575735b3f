//! Event subscriber: bridge push messages -> [`StateChangeRecord`]s.
//!
//! Zone status updates become state records for the device that owns the
//! zone. Keypad button events become `button_<n>` records, plus the derived
//! double-click and long-press gestures.

use crate::leap::message::{ButtonEventType, ButtonStatus, ZoneStatus};
use crate::leap::{Communique, LeapError, LeapSession};
use crate::registry::Registry;
use crate::state::{Attribute, StateChangeRecord};
use futures_util::future::join_all;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Second press of the same button within this window is a double click.
pub const DOUBLE_CLICK_WINDOW: Duration = Duration::from_millis(500);
/// A press held this long is a long press.
pub const LONG_PRESS_DELAY: Duration = Duration::from_secs(1);

const ZONE_STATUS_URL: &str = "/zone/status";

/// Expired long-press timer, fed back into the processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LongPressTimer {
    pub button: u32,
    generation: u64,
}

/// Subscribe to zone status and to every keypad button. Returns the
/// subscribe responses, which carry the current state.
///
/// A failed zone subscription is fatal; a button that cannot be subscribed
/// is only logged.
pub async fn subscribe<S: LeapSession + ?Sized>(
    session: &S,
    registry: &Registry,
) -> Result<Vec<Communique>, LeapError> {
    let mut responses = vec![session.subscribe(ZONE_STATUS_URL).await?];

    let urls: Vec<String> = registry
        .buttons()
        .map(|button| format!("/button/{}/status/event", button.id))
        .collect();
    let results = join_all(urls.iter().map(|url| session.subscribe(url))).await;
    let mut subscribed = 0;
    for (url, result) in urls.iter().zip(results) {
        match result {
            Ok(response) => {
                subscribed += 1;
                responses.push(response);
            }
            Err(e) => warn!("Could not subscribe to {}: {}", url, e),
        }
    }
    info!("Subscribed to zone status and {} buttons", subscribed);
    Ok(responses)
}

struct PendingLongPress {
    generation: u64,
    task: JoinHandle<()>,
}

pub struct EventSubscriber {
    timers: mpsc::Sender<LongPressTimer>,
    last_press: HashMap<u32, Instant>,
    long_presses: HashMap<u32, PendingLongPress>,
    generation: u64,
}

impl EventSubscriber {
    pub fn new(timers: mpsc::Sender<LongPressTimer>) -> Self {
        Self {
            timers,
            last_press: HashMap::new(),
            long_presses: HashMap::new(),
            generation: 0,
        }
    }

    /// Translate one bridge message. Messages that are not status updates
    /// yield nothing.
    pub fn handle(&mut self, message: &Communique, registry: &Registry) -> Vec<StateChangeRecord> {
        if message.has_body_field("ButtonStatus") {
            match message.body_field::<ButtonStatus>("ButtonStatus") {
                Ok(status) => self.button_event(&status, registry).into_iter().collect(),
                Err(e) => {
                    warn!("Bad button status: {}", e);
                    Vec::new()
                }
            }
        } else if has_zone_status(message) {
            zone_changes(message, registry)
        } else {
            debug!(
                "Ignoring {:?} for {}",
                message.communique_type,
                message.url().unwrap_or("?")
            );
            Vec::new()
        }
    }

    fn button_event(
        &mut self,
        status: &ButtonStatus,
        registry: &Registry,
    ) -> Option<StateChangeRecord> {
        let id = status.button.id()?;
        let Some(button) = registry.button(id) else {
            debug!("Event for unknown button {}", id);
            return None;
        };
        let gesture_name = button.name.to_uppercase();
        let mut record = StateChangeRecord::new(button.device);

        match status.button_event.event_type {
            ButtonEventType::Press => {
                record = record.with(Attribute::Button(button.number), "ON");
                let now = Instant::now();
                if let Some(previous) = self.last_press.insert(id, now)
                    && now.duration_since(previous) <= DOUBLE_CLICK_WINDOW
                {
                    record = record.with(Attribute::DoubleClick, gesture_name);
                }
                self.start_long_press(id);
            }
            ButtonEventType::Release => {
                record = record.with(Attribute::Button(button.number), "OFF");
                self.cancel_long_press(id);
            }
            ButtonEventType::LongHold => {
                self.cancel_long_press(id);
                record = record.with(Attribute::LongPress, gesture_name);
            }
            ButtonEventType::Unknown => return None,
        }
        Some(record)
    }

    fn start_long_press(&mut self, button: u32) {
        self.cancel_long_press(button);
        self.generation += 1;
        let timer = LongPressTimer {
            button,
            generation: self.generation,
        };
        let timers = self.timers.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(LONG_PRESS_DELAY).await;
            let _ = timers.send(timer).await;
        });
        self.long_presses.insert(
            button,
            PendingLongPress {
                generation: timer.generation,
                task,
            },
        );
    }

    fn cancel_long_press(&mut self, button: u32) {
        if let Some(pending) = self.long_presses.remove(&button) {
            pending.task.abort();
        }
    }

    /// A long-press timer expired. Stale timers (button released or pressed
    /// again since) yield nothing.
    pub fn long_press(
        &mut self,
        timer: LongPressTimer,
        registry: &Registry,
    ) -> Option<StateChangeRecord> {
        let current = self.long_presses.get(&timer.button)?;
        if current.generation != timer.generation {
            return None;
        }
        self.long_presses.remove(&timer.button);
        let button = registry.button(timer.button)?;
        Some(
            StateChangeRecord::new(button.device)
                .with(Attribute::LongPress, button.name.to_uppercase()),
        )
    }

    /// Drop all pending timers.
    pub fn shutdown(&mut self) {
        for (_, pending) in self.long_presses.drain() {
            pending.task.abort();
        }
    }
}

fn has_zone_status(message: &Communique) -> bool {
    message.has_body_field("ZoneStatus") || message.has_body_field("ZoneStatuses")
}

/// Zone state carried by a message (a status update or the response to the
/// zone subscription). Zones nobody owns are skipped.
pub fn zone_changes(message: &Communique, registry: &Registry) -> Vec<StateChangeRecord> {
    let statuses = if message.has_body_field("ZoneStatus") {
        message.body_field::<ZoneStatus>("ZoneStatus").map(|s| vec![s])
    } else if message.has_body_field("ZoneStatuses") {
        message.body_field::<Vec<ZoneStatus>>("ZoneStatuses")
    } else {
        return Vec::new();
    };
    let statuses = match statuses {
        Ok(statuses) => statuses,
        Err(e) => {
            warn!("Bad zone status: {}", e);
            return Vec::new();
        }
    };

    statuses
        .iter()
        .filter_map(|status| {
            let record = registry.record_from_zone_status(status);
            if record.is_none() {
                debug!("Status for unknown zone {}", status.zone.href);
            }
            record
        })
        .filter(|record| !record.is_empty())
        .collect()
}

/// Fold the zone state carried by subscribe responses into the registry.
/// Nothing is published; startup publishes a snapshot afterwards.
pub fn prime(registry: &mut Registry, responses: &[Communique]) {
    for response in responses {
        for record in zone_changes(response, registry) {
            registry.update_state(&record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::leap::fake::FakeSession;
    use crate::registry::test_support::sample_registry;
    use crate::state::AttrValue;
    use serde_json::json;

    fn message(body: serde_json::Value) -> Communique {
        serde_json::from_value(json!({
            "CommuniqueType": "ReadResponse",
            "Header": {"StatusCode": "200 OK", "Url": "/test"},
            "Body": body,
        }))
        .unwrap()
    }

    fn button_message(button: u32, event: &str) -> Communique {
        message(json!({
            "ButtonStatus": {
                "Button": {"href": format!("/button/{button}")},
                "ButtonEvent": {"EventType": event},
            }
        }))
    }

    fn subscriber() -> (EventSubscriber, mpsc::Receiver<LongPressTimer>) {
        let (tx, rx) = mpsc::channel(8);
        (EventSubscriber::new(tx), rx)
    }

    #[tokio::test]
    async fn test_zone_status_record() {
        let registry = sample_registry();
        let (mut events, _rx) = subscriber();
        let update = message(json!({"ZoneStatus": {"Zone": {"href": "/zone/1"}, "Level": 40}}));

        let records = events.handle(&update, &registry);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device, 10);
        assert_eq!(records[0].changes[&Attribute::Level], AttrValue::Number(40));

        // Same event again, same record content
        let again = events.handle(&update, &registry);
        assert_eq!(again[0].changes, records[0].changes);
    }

    #[tokio::test]
    async fn test_multiple_zone_statuses_skip_unknown_zones() {
        let registry = sample_registry();
        let (mut events, _rx) = subscriber();
        let update = message(json!({"ZoneStatuses": [
            {"Zone": {"href": "/zone/4"}, "Level": 100},
            {"Zone": {"href": "/zone/99"}, "Level": 10},
        ]}));

        let records = events.handle(&update, &registry);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].device, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_press_release_and_double_click() {
        let registry = sample_registry();
        let (mut events, _rx) = subscriber();

        let press = events.handle(&button_message(102, "Press"), &registry);
        assert_eq!(press[0].device, 22);
        assert_eq!(press[0].changes[&Attribute::Button(1)], AttrValue::from("ON"));
        assert!(!press[0].changes.contains_key(&Attribute::DoubleClick));

        let release = events.handle(&button_message(102, "Release"), &registry);
        assert_eq!(release[0].changes[&Attribute::Button(1)], AttrValue::from("OFF"));

        tokio::time::advance(Duration::from_millis(200)).await;
        let second = events.handle(&button_message(102, "Press"), &registry);
        assert_eq!(
            second[0].changes[&Attribute::DoubleClick],
            AttrValue::from("FAV")
        );

        tokio::time::advance(Duration::from_millis(600)).await;
        let late = events.handle(&button_message(102, "Press"), &registry);
        assert!(!late[0].changes.contains_key(&Attribute::DoubleClick));
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_press_fires_after_hold() {
        let registry = sample_registry();
        let (mut events, mut rx) = subscriber();

        events.handle(&button_message(104, "Press"), &registry);
        let timer = rx.recv().await.unwrap();
        let record = events.long_press(timer, &registry).unwrap();
        assert_eq!(record.changes[&Attribute::LongPress], AttrValue::from("RAISE"));

        // Already consumed
        assert!(events.long_press(timer, &registry).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_cancels_long_press() {
        let registry = sample_registry();
        let (mut events, mut rx) = subscriber();

        events.handle(&button_message(104, "Press"), &registry);
        tokio::time::advance(Duration::from_millis(300)).await;
        events.handle(&button_message(104, "Release"), &registry);
        tokio::time::advance(Duration::from_secs(2)).await;

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unrelated_messages_ignored() {
        let registry = sample_registry();
        let (mut events, _rx) = subscriber();
        assert!(events.handle(&message(json!({"Foo": 1})), &registry).is_empty());
        assert!(events.handle(&button_message(999, "Press"), &registry).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_zone_and_buttons() {
        let registry = sample_registry();
        let session = FakeSession::default()
            .with_body(ZONE_STATUS_URL, json!({"ZoneStatuses": []}))
            .with_status("/button/105/status/event", "404 NotFound");

        let responses = subscribe(&session, &registry).await.unwrap();
        assert_eq!(responses.len(), 5);
        let subscribed = session.subscribed.lock().clone();
        assert_eq!(subscribed[0], ZONE_STATUS_URL);
        assert!(subscribed.contains(&"/button/101/status/event".to_string()));
        assert!(!subscribed.contains(&"/button/105/status/event".to_string()));
    }

    #[tokio::test]
    async fn test_zone_subscription_failure_is_fatal() {
        let registry = sample_registry();
        let session = FakeSession::default().with_status(ZONE_STATUS_URL, "500 InternalError");
        assert!(subscribe(&session, &registry).await.is_err());
    }
}
