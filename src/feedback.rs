//! Feedback publisher: state change records -> MQTT publishes.
//!
//! Individual mode publishes one raw value per changed attribute at
//! `<root>/<area>/<device>/<attribute>`. JSON mode publishes the whole cached
//! state of the device as one object at `<root>/<area>/<device>`.

use crate::config::FeedbackConfig;
use crate::registry::{Device, Registry};
use crate::state::StateChangeRecord;
use log::{debug, warn};
use rumqttc::{AsyncClient, QoS};
use serde_json::{Map, Value};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("MQTT publish to {topic} failed: {reason}")]
    Rejected { topic: String, reason: String },
}

/// Where feedback goes. Publishing only queues the message.
pub trait FeedbackSink: Send + Sync {
    fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError>;
}

impl FeedbackSink for AsyncClient {
    fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        self.try_publish(topic, QoS::AtMostOnce, false, payload)
            .map_err(|e| PublishError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

impl<T: FeedbackSink + ?Sized> FeedbackSink for Arc<T> {
    fn publish(&self, topic: &str, payload: String) -> Result<(), PublishError> {
        (**self).publish(topic, payload)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackMessage {
    pub topic: String,
    pub payload: String,
}

/// MQTT wildcards and separators cannot appear inside a topic segment.
fn segment(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '+' | '#' | '/' => '_',
            c => c,
        })
        .collect()
}

pub struct FeedbackPublisher<K> {
    sink: K,
    root: String,
    json: bool,
}

impl<K: FeedbackSink> FeedbackPublisher<K> {
    pub fn new(sink: K, config: &FeedbackConfig) -> Self {
        Self {
            sink,
            root: config.root.trim_end_matches('/').to_string(),
            json: config.json,
        }
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    fn device_topic(&self, device: &Device, registry: &Registry) -> String {
        match registry.area_name(device) {
            Some(area) => format!("{}/{}/{}", self.root, segment(area), segment(&device.name)),
            None => format!("{}/{}", self.root, segment(&device.name)),
        }
    }

    /// Messages for one record. The registry must already hold the record's
    /// changes; JSON mode reads the merged state from it.
    pub fn messages(&self, record: &StateChangeRecord, registry: &Registry) -> Vec<FeedbackMessage> {
        let Some(device) = registry.device(record.device) else {
            debug!("No feedback for unknown device {}", record.device);
            return Vec::new();
        };
        let topic = self.device_topic(device, registry);

        if self.json {
            let mut object = Map::new();
            for (attribute, value) in device.state.iter().chain(record.changes.iter()) {
                object.insert(attribute.name(), value.to_json());
            }
            vec![FeedbackMessage {
                topic,
                payload: Value::Object(object).to_string(),
            }]
        } else {
            record
                .changes
                .iter()
                .map(|(attribute, value)| FeedbackMessage {
                    topic: format!("{}/{}", topic, attribute.name()),
                    payload: value.to_string(),
                })
                .collect()
        }
    }

    /// Publish one record. Failures are logged and dropped; returns how
    /// many messages were dropped.
    pub fn publish(&self, record: &StateChangeRecord, registry: &Registry) -> usize {
        let mut dropped = 0;
        for message in self.messages(record, registry) {
            debug!("Publishing to {}: {}", message.topic, message.payload);
            if let Err(e) = self.sink.publish(&message.topic, message.payload) {
                warn!("{}", e);
                dropped += 1;
            }
        }
        dropped
    }

    /// Publish the cached state of every device that has one. Returns how
    /// many messages were dropped.
    pub fn publish_snapshot(&self, registry: &Registry) -> usize {
        registry
            .devices()
            .filter(|d| !d.state.is_empty())
            .map(|device| {
                let mut record = StateChangeRecord::new(device.id);
                record.changes = device.state.clone();
                self.publish(&record, registry)
            })
            .sum()
    }
}

/// Number of messages a snapshot of `registry` publishes. The MQTT request
/// queue must hold at least this many, since the snapshot is queued before
/// the event loop gets a chance to drain it.
pub fn snapshot_size(registry: &Registry, json: bool) -> usize {
    registry
        .devices()
        .filter(|d| !d.state.is_empty())
        .map(|d| if json { 1 } else { d.state.len() })
        .sum()
}
