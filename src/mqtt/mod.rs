//! MQTT side of the bridge: the broker connection and the feedback sink.

mod client;

pub use client::{MqttClient, MqttMessage};
