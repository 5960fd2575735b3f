//! LEAP session over TLS.
//!
//! A connection task owns the socket: it writes queued requests, routes
//! replies back by client tag, forwards subscription updates and unsolicited
//! messages as [`SessionEvent`]s, and pings the bridge to notice dead links.
//! [`LeapClient`] is the cloneable handle the rest of the bridge talks to.

use super::message::Communique;
use super::{LeapError, LeapSession, PendingResponse, tls};
use crate::credentials::PairingCredentials;
use crate::pairing::SessionOpener;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::ClientConfig;
use uuid::Uuid;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(60);
const PING_URL: &str = "/server/1/status/ping";
const PING_TAG: &str = "keepalive-ping";
const REQUEST_QUEUE: usize = 64;

/// Something the bridge pushed to us outside a request/reply pair.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Subscription update or unsolicited message.
    Message(Communique),
    /// The connection died; requests fail until `reconnect` succeeds.
    Closed(LeapError),
}

struct Outgoing {
    message: Communique,
    reply: Option<oneshot::Sender<Result<Communique, LeapError>>>,
}

struct Link {
    requests: mpsc::Sender<Outgoing>,
    task: JoinHandle<()>,
}

impl Link {
    fn is_alive(&self) -> bool {
        !self.requests.is_closed()
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    tag: String,
    url: String,
}

struct Inner {
    address: String,
    port: u16,
    tls: Arc<ClientConfig>,
    events: mpsc::Sender<SessionEvent>,
    link: Mutex<Option<Link>>,
    subscriptions: parking_lot::Mutex<Vec<Subscription>>,
}

/// Handle to the single LEAP session of this process.
#[derive(Clone)]
pub struct LeapClient {
    inner: Arc<Inner>,
}

impl LeapClient {
    /// Open a session and confirm the bridge accepts our certificate.
    pub async fn connect(
        address: &str,
        port: u16,
        credentials: &PairingCredentials,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<Self, LeapError> {
        let tls = tls::session_config(credentials)?;
        let client = Self {
            inner: Arc::new(Inner {
                address: address.to_string(),
                port,
                tls,
                events,
                link: Mutex::new(None),
                subscriptions: parking_lot::Mutex::new(Vec::new()),
            }),
        };

        let link = client.open_link().await?;
        *client.inner.link.lock().await = Some(link);

        // TLS 1.3 reports a refused client certificate only on the first read
        client.ping().await?;
        info!("LEAP session open to {}:{}", address, port);
        Ok(client)
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub async fn ping(&self) -> Result<Communique, LeapError> {
        self.read(PING_URL).await
    }

    pub async fn is_connected(&self) -> bool {
        self.inner
            .link
            .lock()
            .await
            .as_ref()
            .is_some_and(Link::is_alive)
    }

    /// Close the session. In-flight requests are abandoned.
    pub async fn close(&self) {
        let link = self.inner.link.lock().await.take();
        if let Some(link) = link {
            drop(link.requests);
            if tokio::time::timeout(Duration::from_secs(2), link.task)
                .await
                .is_err()
            {
                debug!("LEAP connection task did not stop in time");
            }
            info!("LEAP session to {} closed", self.inner.address);
        }
    }

    async fn open_link(&self) -> Result<Link, LeapError> {
        let addr = format!("{}:{}", self.inner.address, self.inner.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| LeapError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| LeapError::Transport(format!("connect to {addr} failed: {e}")))?;
        let connector = TlsConnector::from(self.inner.tls.clone());
        let tls = connector
            .connect(tls::server_name(&self.inner.address)?, stream)
            .await
            .map_err(tls::classify_io_error)?;

        let (requests, rx) = mpsc::channel(REQUEST_QUEUE);
        let events = self.inner.events.clone();
        let task = tokio::spawn(run_connection(tls, rx, events));
        Ok(Link { requests, task })
    }

    async fn queue(&self, mut message: Communique, tag: String) -> Result<PendingResponse, LeapError> {
        message.header.client_tag = Some(tag);
        let (reply, pending) = oneshot::channel();
        let requests = {
            let link = self.inner.link.lock().await;
            match link.as_ref() {
                Some(link) if link.is_alive() => link.requests.clone(),
                _ => return Err(LeapError::Transport("not connected".to_string())),
            }
        };
        requests
            .send(Outgoing {
                message,
                reply: Some(reply),
            })
            .await
            .map_err(|_| LeapError::Transport("connection task stopped".to_string()))?;
        Ok(pending)
    }

    async fn resubscribe(&self) -> Result<(), LeapError> {
        let subscriptions = self.inner.subscriptions.lock().clone();
        for subscription in subscriptions {
            let pending = self
                .queue(Communique::subscribe(&subscription.url), subscription.tag.clone())
                .await?;
            let response = pending
                .await
                .map_err(|_| LeapError::Transport("connection dropped".to_string()))??;
            response.ensure_success(&subscription.url)?;
            // The subscribe reply carries current state; let the loop refresh from it
            if self
                .inner
                .events
                .try_send(SessionEvent::Message(response))
                .is_err()
            {
                warn!("LEAP event queue full, dropping refreshed state");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl LeapSession for LeapClient {
    async fn send(&self, request: Communique) -> Result<PendingResponse, LeapError> {
        self.queue(request, Uuid::new_v4().to_string()).await
    }

    async fn subscribe(&self, url: &str) -> Result<Communique, LeapError> {
        let tag = Uuid::new_v4().to_string();
        let pending = self.queue(Communique::subscribe(url), tag.clone()).await?;
        let response = pending
            .await
            .map_err(|_| LeapError::Transport("connection dropped".to_string()))??;
        response.ensure_success(url)?;
        self.inner.subscriptions.lock().push(Subscription {
            tag,
            url: url.to_string(),
        });
        debug!("Subscribed to {}", url);
        Ok(response)
    }

    async fn reconnect(&self) -> Result<(), LeapError> {
        {
            let mut link = self.inner.link.lock().await;
            if link.as_ref().is_some_and(Link::is_alive) {
                return Ok(());
            }
            if let Some(old) = link.take() {
                old.task.abort();
            }
            info!("Reconnecting to bridge {}", self.inner.address);
            *link = Some(self.open_link().await?);
        }
        self.resubscribe().await?;
        info!("Reconnected to bridge {}", self.inner.address);
        Ok(())
    }
}

async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Communique,
) -> Result<(), LeapError> {
    let mut line =
        serde_json::to_string(message).map_err(|e| LeapError::Protocol(e.to_string()))?;
    line.push_str("\r\n");
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(tls::classify_io_error)?;
    writer.flush().await.map_err(tls::classify_io_error)
}

fn forward(events: &mpsc::Sender<SessionEvent>, message: Communique) {
    if events.try_send(SessionEvent::Message(message)).is_err() {
        warn!("LEAP event queue full, dropping message");
    }
}

async fn run_connection(
    stream: TlsStream<TcpStream>,
    mut requests: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<SessionEvent>,
) {
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();
    let mut pending: HashMap<String, oneshot::Sender<Result<Communique, LeapError>>> =
        HashMap::new();
    let mut ping = tokio::time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping_outstanding = false;

    let reason = loop {
        tokio::select! {
            outgoing = requests.recv() => {
                let Some(outgoing) = outgoing else {
                    break LeapError::Closed;
                };
                let tag = outgoing.message.client_tag().unwrap_or_default().to_string();
                if let Some(reply) = outgoing.reply {
                    pending.insert(tag, reply);
                }
                debug!("LEAP -> {:?} {}", outgoing.message.communique_type, outgoing.message.url().unwrap_or_default());
                if let Err(e) = write_message(&mut writer, &outgoing.message).await {
                    break e;
                }
            }
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break LeapError::Transport("bridge closed the connection".to_string()),
                    Err(e) => break tls::classify_io_error(e),
                };
                if line.trim().is_empty() {
                    continue;
                }
                let message = match serde_json::from_str::<Communique>(&line) {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("Ignoring unparseable LEAP line ({}): {}", e, line);
                        continue;
                    }
                };
                let tag = message.client_tag().map(str::to_string);
                match tag {
                    Some(tag) if tag == PING_TAG => ping_outstanding = false,
                    Some(tag) if pending.contains_key(&tag) => {
                        if let Some(reply) = pending.remove(&tag) {
                            let _ = reply.send(Ok(message));
                        }
                    }
                    _ => forward(&events, message),
                }
            }
            _ = ping.tick() => {
                if ping_outstanding {
                    break LeapError::Transport("bridge stopped answering pings".to_string());
                }
                let mut message = Communique::read(PING_URL);
                message.header.client_tag = Some(PING_TAG.to_string());
                ping_outstanding = true;
                if let Err(e) = write_message(&mut writer, &message).await {
                    break e;
                }
            }
        }
    };

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(reason.clone()));
    }
    let _ = writer.shutdown().await;

    if reason == LeapError::Closed {
        debug!("LEAP connection task finished");
    } else {
        warn!("LEAP connection lost: {}", reason);
        report_loss(&events, reason).await;
    }
}

/// Unlike status messages, a loss notice waits for queue space: the
/// processing loop schedules the reconnect from it.
async fn report_loss(events: &mpsc::Sender<SessionEvent>, reason: LeapError) {
    if events.send(SessionEvent::Closed(reason)).await.is_err() {
        debug!("No listener for LEAP connection loss");
    }
}

/// Opens [`LeapClient`] sessions for the pairing manager.
pub struct LeapConnector {
    address: String,
    port: u16,
    events: mpsc::Sender<SessionEvent>,
}

impl LeapConnector {
    pub fn new(address: impl Into<String>, port: u16, events: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            address: address.into(),
            port,
            events,
        }
    }
}

#[async_trait]
impl SessionOpener for LeapConnector {
    type Session = LeapClient;

    async fn open(&self, credentials: &PairingCredentials) -> Result<LeapClient, LeapError> {
        LeapClient::connect(&self.address, self.port, credentials, self.events.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_write_message_is_crlf_terminated_json() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let mut message = Communique::read("/device");
        message.header.client_tag = Some("t1".to_string());

        write_message(&mut client, &message).await.unwrap();
        drop(client);

        let mut written = String::new();
        server.read_to_string(&mut written).await.unwrap();
        assert!(written.ends_with("\r\n"));
        let parsed: Communique = serde_json::from_str(written.trim_end()).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_forward_drops_when_queue_full() {
        let (tx, mut rx) = mpsc::channel(1);
        forward(&tx, Communique::read("/a"));
        forward(&tx, Communique::read("/b"));

        match rx.try_recv().unwrap() {
            SessionEvent::Message(message) => assert_eq!(message.url(), Some("/a")),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_loss_waits_for_a_full_queue() {
        let (tx, mut rx) = mpsc::channel(1);
        forward(&tx, Communique::read("/a"));
        let report = tokio::spawn(async move {
            report_loss(&tx, LeapError::Transport("reset".to_string())).await;
        });

        assert!(matches!(rx.recv().await, Some(SessionEvent::Message(_))));
        match rx.recv().await {
            Some(SessionEvent::Closed(reason)) => {
                assert_eq!(reason, LeapError::Transport("reset".to_string()))
            }
            other => panic!("unexpected event {other:?}"),
        }
        report.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_bridge_is_transport_error() {
        let credentials = crate::credentials::test_support::sample_credentials();
        let (tx, _rx) = mpsc::channel(4);
        // Port 9 on localhost is closed in test environments
        let result = LeapClient::connect("127.0.0.1", 9, &credentials, tx).await;
        assert!(matches!(result, Err(LeapError::Transport(_))));
    }
}
