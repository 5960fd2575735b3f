//! lutron-mqtt library.
//!
//! Bridges an MQTT broker and a Lutron Caseta bridge speaking LEAP: commands
//! published under the command topic become LEAP requests, and bridge status
//! events come back out as feedback topics.

pub mod bridge;
pub mod command;
pub mod config;
pub mod credentials;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod feedback;
pub mod instance_lock;
pub mod leap;
pub mod logging;
pub mod mqtt;
pub mod pairing;
pub mod registry;
pub mod router;
pub mod state;
