//! In-memory [`LeapSession`] for unit tests.

use super::message::{Communique, CommuniqueType, Header};
use super::{LeapError, LeapSession, PendingResponse};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::oneshot;

#[derive(Default)]
pub struct FakeSession {
    /// Every request handed to `send`, in order.
    pub sent: Mutex<Vec<Communique>>,
    pub subscribed: Mutex<Vec<String>>,
    /// Bodies returned for reads and subscribes, by URL.
    pub bodies: Mutex<HashMap<String, Value>>,
    /// Status line returned for these URLs instead of success.
    pub statuses: Mutex<HashMap<String, String>>,
    /// Number of upcoming sends that fail with a transport error.
    pub failing_sends: AtomicUsize,
    pub reconnect_fails: Mutex<bool>,
    pub reconnects: AtomicUsize,
}

impl FakeSession {
    pub fn with_body(self, url: &str, body: Value) -> Self {
        self.bodies.lock().insert(url.to_string(), body);
        self
    }

    pub fn with_status(self, url: &str, status: &str) -> Self {
        self.statuses
            .lock()
            .insert(url.to_string(), status.to_string());
        self
    }

    pub fn sent_urls(&self) -> Vec<String> {
        self.sent
            .lock()
            .iter()
            .filter_map(|c| c.url().map(str::to_string))
            .collect()
    }

    fn response(&self, request: &Communique, communique_type: CommuniqueType) -> Communique {
        let url = request.url().unwrap_or_default().to_string();
        let status = self
            .statuses
            .lock()
            .get(&url)
            .cloned()
            .unwrap_or_else(|| "200 OK".to_string());
        Communique {
            communique_type,
            header: Header {
                client_tag: request.header.client_tag.clone(),
                url: Some(url.clone()),
                status_code: Some(status),
                message_body_type: None,
            },
            body: self.bodies.lock().get(&url).cloned(),
        }
    }
}

#[async_trait]
impl LeapSession for FakeSession {
    async fn send(&self, request: Communique) -> Result<PendingResponse, LeapError> {
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(LeapError::Transport("link down".to_string()));
        }
        let communique_type = match request.communique_type {
            CommuniqueType::CreateRequest => CommuniqueType::CreateResponse,
            _ => CommuniqueType::ReadResponse,
        };
        let response = self.response(&request, communique_type);
        self.sent.lock().push(request);
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Ok(response));
        Ok(rx)
    }

    async fn subscribe(&self, url: &str) -> Result<Communique, LeapError> {
        let response = self.response(&Communique::subscribe(url), CommuniqueType::SubscribeResponse);
        response.ensure_success(url)?;
        self.subscribed.lock().push(url.to_string());
        Ok(response)
    }

    async fn reconnect(&self) -> Result<(), LeapError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        if *self.reconnect_fails.lock() {
            Err(LeapError::Transport("bridge unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}
