use thiserror::Error as ThisError;

use crate::instance_lock::InstanceLockError;
use crate::leap::LeapError;
use crate::pairing::PairingError;

/// Startup failures. Every variant is fatal: the process logs it and exits
/// with a non-zero status.
#[derive(ThisError, Debug)]
pub enum BridgeError {
    #[error("Pairing failed: {0}")]
    Pairing(#[from] PairingError),

    #[error("Failed to load bridge inventory: {0}")]
    RegistryLoad(#[source] LeapError),

    #[error("Failed to subscribe to bridge events: {0}")]
    EventSubscription(#[source] LeapError),

    #[error("MQTT broker {0} not reachable")]
    BrokerUnreachable(String),

    #[error("Log file {path} not writable: {source}")]
    LogFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    InstanceLock(#[from] InstanceLockError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
