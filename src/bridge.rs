//! The processing loop.
//!
//! One task owns the registry and handles, one at a time: MQTT commands,
//! LEAP session events and expired long-press timers. Nothing else writes
//! device state.

use crate::dispatcher::{DispatchError, Outcome, dispatch};
use crate::events::{EventSubscriber, LongPressTimer};
use crate::feedback::{FeedbackPublisher, FeedbackSink};
use crate::leap::{LeapSession, SessionEvent};
use crate::mqtt::MqttMessage;
use crate::registry::Registry;
use crate::router::{ParseError, TopicRouter};
use crate::state::StateChangeRecord;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Delay between background reconnect attempts after the link drops.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(5);

const TIMER_QUEUE: usize = 32;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

enum Input {
    Mqtt(MqttMessage),
    Leap(SessionEvent),
    Timer(LongPressTimer),
}

pub struct Bridge<S: LeapSession + 'static, K: FeedbackSink> {
    registry: Registry,
    session: Arc<S>,
    router: TopicRouter,
    events: EventSubscriber,
    feedback: FeedbackPublisher<K>,
    timers: mpsc::Receiver<LongPressTimer>,
    reconnect: Option<JoinHandle<()>>,
}

impl<S: LeapSession + 'static, K: FeedbackSink> Bridge<S, K> {
    pub fn new(
        registry: Registry,
        session: Arc<S>,
        router: TopicRouter,
        feedback: FeedbackPublisher<K>,
    ) -> Self {
        let (timer_tx, timers) = mpsc::channel(TIMER_QUEUE);
        Self {
            registry,
            session,
            router,
            events: EventSubscriber::new(timer_tx),
            feedback,
            timers,
            reconnect: None,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn feedback(&self) -> &FeedbackPublisher<K> {
        &self.feedback
    }

    /// Publish the cached state of every device.
    pub fn publish_snapshot(&self) {
        let dropped = self.feedback.publish_snapshot(&self.registry);
        if dropped > 0 {
            warn!("{} snapshot messages were not published", dropped);
        }
    }

    /// Parse and dispatch one MQTT command. Per-target failures are in the
    /// returned outcomes.
    pub async fn handle_mqtt(&self, message: &MqttMessage) -> Result<Vec<Outcome>, CommandError> {
        let command = self.router.parse(&message.topic, &message.payload)?;
        debug!("{} -> {}", message.topic, command);
        let outcomes = dispatch(&command, &self.registry, self.session.as_ref()).await?;
        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                warn!("{}: {}", outcome.target, e);
            }
        }
        Ok(outcomes)
    }

    pub fn handle_leap(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Message(message) => {
                for record in self.events.handle(&message, &self.registry) {
                    self.apply(record);
                }
            }
            SessionEvent::Closed(e) => {
                warn!("LEAP connection lost: {}", e);
                self.schedule_reconnect();
            }
        }
    }

    pub fn handle_timer(&mut self, timer: LongPressTimer) {
        if let Some(record) = self.events.long_press(timer, &self.registry) {
            self.apply(record);
        }
    }

    fn apply(&mut self, record: StateChangeRecord) {
        if self.registry.update_state(&record) {
            self.feedback.publish(&record, &self.registry);
        }
    }

    /// Retry in the background until the session is back. At most one
    /// retry task runs at a time.
    fn schedule_reconnect(&mut self) {
        if self.reconnect.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let session = Arc::clone(&self.session);
        self.reconnect = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(RECONNECT_INTERVAL).await;
                match session.reconnect().await {
                    Ok(()) => {
                        info!("LEAP connection restored");
                        break;
                    }
                    Err(e) => warn!("LEAP reconnect failed: {}", e),
                }
            }
        }));
    }

    /// Run until `cancel` fires. A closed input channel only stops that
    /// input; the loop keeps serving the others.
    pub async fn run(
        mut self,
        mut mqtt_rx: mpsc::Receiver<MqttMessage>,
        mut leap_rx: mpsc::Receiver<SessionEvent>,
        cancel: CancellationToken,
    ) {
        info!("Bridge running");
        loop {
            let input = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(message) = mqtt_rx.recv() => Input::Mqtt(message),
                Some(event) = leap_rx.recv() => Input::Leap(event),
                Some(timer) = self.timers.recv() => Input::Timer(timer),
            };

            match input {
                Input::Mqtt(message) => {
                    if let Err(e) = self.handle_mqtt(&message).await {
                        warn!("Ignoring command on {}: {}", message.topic, e);
                    }
                }
                Input::Leap(event) => self.handle_leap(event),
                Input::Timer(timer) => self.handle_timer(timer),
            }
        }

        self.events.shutdown();
        if let Some(task) = self.reconnect.take() {
            task.abort();
        }
        info!("Bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FeedbackConfig;
    use crate::events;
    use crate::feedback::test_support::RecordingSink;
    use crate::leap::{Communique, LeapError};
    use crate::leap::fake::FakeSession;
    use crate::registry::test_support::sample_registry;
    use crate::state::{AttrValue, Attribute};
    use serde_json::{Value, json};
    use std::sync::atomic::Ordering;

    fn bridge(
        session: FakeSession,
        json: bool,
    ) -> (Bridge<FakeSession, Arc<RecordingSink>>, Arc<FakeSession>, Arc<RecordingSink>) {
        bridge_with(sample_registry(), session, json)
    }

    fn bridge_with(
        registry: Registry,
        session: FakeSession,
        json: bool,
    ) -> (Bridge<FakeSession, Arc<RecordingSink>>, Arc<FakeSession>, Arc<RecordingSink>) {
        let session = Arc::new(session);
        let sink = Arc::new(RecordingSink::default());
        let feedback = FeedbackPublisher::new(
            Arc::clone(&sink),
            &FeedbackConfig {
                root: "/lutron/feedback".to_string(),
                json,
            },
        );
        let bridge = Bridge::new(
            registry,
            Arc::clone(&session),
            TopicRouter::new("/lutron/command"),
            feedback,
        );
        (bridge, session, sink)
    }

    fn mqtt(topic: &str, payload: &str) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_string(),
        }
    }

    fn zone_event(zone: u32, level: i64) -> SessionEvent {
        SessionEvent::Message(
            serde_json::from_value(json!({
                "CommuniqueType": "ReadResponse",
                "Header": {"StatusCode": "200 OK", "Url": format!("/zone/{zone}/status")},
                "Body": {"ZoneStatus": {"Zone": {"href": format!("/zone/{zone}")}, "Level": level}},
            }))
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_command_sends_without_touching_state() {
        let (bridge, session, sink) = bridge(FakeSession::default(), false);
        let outcomes = bridge
            .handle_mqtt(&mqtt("/lutron/command/LivingRoom/MainLights", "ON"))
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 1);
        assert_eq!(session.sent_urls(), vec!["/zone/1/commandprocessor"]);
        assert_eq!(
            bridge.registry().device(10).unwrap().state[&Attribute::Level],
            AttrValue::Number(75)
        );
        assert!(sink.take().is_empty());
    }

    #[tokio::test]
    async fn test_bad_payload_sends_nothing() {
        let (bridge, session, _sink) = bridge(FakeSession::default(), false);
        let result = bridge
            .handle_mqtt(&mqtt("/lutron/command/MainLights", "banana"))
            .await;
        assert_eq!(
            result,
            Err(CommandError::Parse(ParseError::UnknownAction("banana".to_string())))
        );
        assert!(session.sent.lock().is_empty());

        let result = bridge.handle_mqtt(&mqtt("/lutron/command/MainLights", "150")).await;
        assert!(matches!(result, Err(CommandError::Parse(ParseError::OutOfRange(_)))));
    }

    #[tokio::test]
    async fn test_event_updates_state_and_publishes_json() {
        let (mut bridge, _session, sink) = bridge(FakeSession::default(), true);
        bridge.handle_leap(zone_event(1, 40));

        let published = sink.take();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "/lutron/feedback/LivingRoom/MainLights");
        let payload: Value = serde_json::from_str(&published[0].payload).unwrap();
        assert_eq!(payload, json!({"state": "ON", "level": 40}));

        // Duplicate event, duplicate publish
        bridge.handle_leap(zone_event(1, 40));
        assert_eq!(sink.take(), published);
    }

    #[tokio::test]
    async fn test_primed_state_is_in_the_snapshot() {
        let response: Communique = serde_json::from_value(json!({
            "CommuniqueType": "SubscribeResponse",
            "Header": {"StatusCode": "200 OK", "Url": "/zone/status"},
            "Body": {"ZoneStatuses": [{"Zone": {"href": "/zone/4"}, "SwitchedLevel": "On"}]},
        }))
        .unwrap();
        let mut registry = sample_registry();
        events::prime(&mut registry, &[response]);

        let (bridge, _session, sink) = bridge_with(registry, FakeSession::default(), false);
        assert!(sink.take().is_empty());
        assert_eq!(
            bridge.registry().device(20).unwrap().state[&Attribute::State],
            AttrValue::from("ON")
        );

        bridge.publish_snapshot();
        let topics: Vec<String> = sink.take().into_iter().map(|m| m.topic).collect();
        assert!(topics.contains(&"/lutron/feedback/Kitchen/Counter/state".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_link_reconnects_in_background() {
        let session = FakeSession::default();
        *session.reconnect_fails.lock() = true;
        let (mut bridge, session, _sink) = bridge(session, false);

        bridge.handle_leap(SessionEvent::Closed(LeapError::Transport("reset".to_string())));
        // A second report while retrying does not start another task
        bridge.handle_leap(SessionEvent::Closed(LeapError::Closed));

        tokio::time::sleep(RECONNECT_INTERVAL * 2 + Duration::from_millis(10)).await;
        assert_eq!(session.reconnects.load(Ordering::SeqCst), 2);

        *session.reconnect_fails.lock() = false;
        tokio::time::sleep(RECONNECT_INTERVAL).await;
        assert_eq!(session.reconnects.load(Ordering::SeqCst), 3);
        tokio::time::sleep(RECONNECT_INTERVAL * 3).await;
        assert_eq!(session.reconnects.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_handles_inputs_until_cancelled() {
        let (bridge, session, sink) = bridge(FakeSession::default(), false);
        let (mqtt_tx, mqtt_rx) = mpsc::channel(8);
        let (leap_tx, leap_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(mqtt_rx, leap_rx, cancel.clone()));

        mqtt_tx.send(mqtt("/lutron/command/MainLights", "banana")).await.unwrap();
        mqtt_tx.send(mqtt("/lutron/command/Counter", "OFF")).await.unwrap();
        leap_tx.send(zone_event(4, 0)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(session.sent_urls(), vec!["/zone/4/commandprocessor"]);
        let published = sink.take();
        assert!(published.iter().any(|m| {
            m.topic == "/lutron/feedback/Kitchen/Counter/state" && m.payload == "OFF"
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_inputs_do_not_stop_the_loop() {
        let (bridge, _session, _sink) = bridge(FakeSession::default(), false);
        let (mqtt_tx, mqtt_rx) = mpsc::channel::<MqttMessage>(1);
        let (leap_tx, leap_rx) = mpsc::channel::<SessionEvent>(1);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(mqtt_rx, leap_rx, cancel.clone()));

        drop(mqtt_tx);
        drop(leap_tx);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());

        cancel.cancel();
        task.await.unwrap();
    }
}
