//! LEAP (Lutron Extensible Application Protocol) client.
//!
//! LEAP is line-delimited JSON over TLS. Every request carries a client tag
//! and the bridge echoes it on the matching response; subscription updates
//! keep arriving with the tag of the original subscribe request.

mod client;
#[cfg(test)]
pub(crate) mod fake;
pub mod message;
pub mod tls;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::oneshot;

pub use client::{LeapClient, LeapConnector, SessionEvent};
pub use message::{Communique, CommuniqueType, FanSpeed, Header};

/// Reply slot for a queued request.
pub type PendingResponse = oneshot::Receiver<Result<Communique, LeapError>>;

/// Error types for LEAP operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LeapError {
    /// The bridge refused our client certificate, or its own certificate
    /// does not chain to the stored CA. Re-pairing is required.
    #[error("bridge rejected the session credentials: {0}")]
    Rejected(String),

    /// Socket-level failure or a dead connection.
    #[error("LEAP transport error: {0}")]
    Transport(String),

    /// The session was closed locally.
    #[error("LEAP session closed")]
    Closed,

    /// The bridge answered with a non-success status.
    #[error("LEAP request {url} failed: {status}")]
    Status { url: String, status: String },

    /// Certificates or keys could not be parsed.
    #[error("invalid LEAP credentials: {0}")]
    Credentials(String),

    /// The bridge sent something we could not interpret.
    #[error("malformed LEAP message: {0}")]
    Protocol(String),
}

impl LeapError {
    /// True when the failure is about the link rather than the request.
    pub fn is_transport(&self) -> bool {
        matches!(self, LeapError::Transport(_) | LeapError::Closed)
    }
}

/// The operations the bridge core needs from a live LEAP session.
#[async_trait]
pub trait LeapSession: Send + Sync {
    /// Queue a request. Resolves once the request is handed to the
    /// connection, not when the bridge answers.
    async fn send(&self, request: Communique) -> Result<PendingResponse, LeapError>;

    /// Subscribe to a status URL. Later updates arrive as session events.
    async fn subscribe(&self, url: &str) -> Result<Communique, LeapError>;

    /// Replace a dead connection with a fresh one.
    async fn reconnect(&self) -> Result<(), LeapError>;

    /// Send a request and wait for a successful reply.
    async fn request(&self, request: Communique) -> Result<Communique, LeapError> {
        let url = request.header.url.clone().unwrap_or_default();
        let pending = self.send(request).await?;
        let response = pending
            .await
            .map_err(|_| LeapError::Transport("connection dropped before reply".to_string()))??;
        response.ensure_success(&url)?;
        Ok(response)
    }

    /// `ReadRequest` shorthand.
    async fn read(&self, url: &str) -> Result<Communique, LeapError> {
        self.request(Communique::read(url)).await
    }
}
