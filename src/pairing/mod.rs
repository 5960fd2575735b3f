//! Session bootstrap: open a LEAP session with stored credentials, or pair
//! with the bridge first when there are none or the bridge refuses them.

mod lap;

pub use lap::LapPairing;

use crate::credentials::{CredentialError, CredentialStore, PairingCredentials};
use crate::leap::LeapError;
use async_trait::async_trait;
use log::{error, info, warn};
use std::time::Duration;
use thiserror::Error;

/// Operator instruction logged while the exchange waits for the button press.
pub const PRESS_BUTTON_PROMPT: &str = "Press the small black button on the back of the bridge.";

/// Error types for pairing.
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("nobody pressed the bridge button within {0:?}")]
    Timeout(Duration),

    #[error("bridge rejected pairing: {0}")]
    Rejected(String),

    #[error("could not store credentials: {0}")]
    CredentialWrite(#[source] CredentialError),

    #[error("bridge not reachable: {0}")]
    Unreachable(#[source] LeapError),

    #[error("pairing connection failed: {0}")]
    Transport(String),

    #[error("pairing (LAP) certificate unusable: {0}")]
    LapCredentials(String),
}

/// Opens an authenticated LEAP session.
#[async_trait]
pub trait SessionOpener: Send + Sync {
    type Session: Send;

    async fn open(&self, credentials: &PairingCredentials) -> Result<Self::Session, LeapError>;
}

/// Performs the certificate exchange with the bridge. `ready` is called once
/// the bridge is waiting for the physical button press.
#[async_trait]
pub trait PairingExchange: Send + Sync {
    async fn pair(
        &self,
        ready: &(dyn Fn() + Send + Sync),
    ) -> Result<PairingCredentials, PairingError>;
}

pub struct PairingManager<O, X> {
    opener: O,
    exchange: X,
    store: CredentialStore,
    window: Duration,
}

impl<O: SessionOpener, X: PairingExchange> PairingManager<O, X> {
    pub fn new(opener: O, exchange: X, store: CredentialStore, window: Duration) -> Self {
        Self {
            opener,
            exchange,
            store,
            window,
        }
    }

    /// Return a live session, pairing first if needed.
    pub async fn ensure_session(&self) -> Result<O::Session, PairingError> {
        match self.store.load() {
            Ok(Some(credentials)) => match self.opener.open(&credentials).await {
                Ok(session) => return Ok(session),
                Err(LeapError::Rejected(reason)) => {
                    warn!("Bridge rejected stored credentials ({}), pairing again", reason);
                }
                Err(e) => return Err(PairingError::Unreachable(e)),
            },
            Ok(None) => info!("Bridge not paired yet"),
            Err(e) => warn!("Ignoring unusable credentials: {}", e),
        }

        let credentials = self.pair().await?;
        self.store
            .save(&credentials)
            .map_err(PairingError::CredentialWrite)?;

        match self.opener.open(&credentials).await {
            Ok(session) => Ok(session),
            Err(LeapError::Rejected(reason)) => Err(PairingError::Rejected(reason)),
            Err(e) => Err(PairingError::Unreachable(e)),
        }
    }

    async fn pair(&self) -> Result<PairingCredentials, PairingError> {
        let ready = || info!("{}", PRESS_BUTTON_PROMPT);
        match tokio::time::timeout(self.window, self.exchange.pair(&ready)).await {
            Ok(Ok(credentials)) => {
                info!("Paired with bridge");
                Ok(credentials)
            }
            Ok(Err(e)) => {
                error!("Error pairing: {}", e);
                Err(e)
            }
            Err(_) => Err(PairingError::Timeout(self.window)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::test_support::sample_credentials;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Accepts only the credentials it was told about.
    struct FakeOpener {
        accepted: parking_lot::Mutex<Option<PairingCredentials>>,
        opens: AtomicUsize,
        unreachable: bool,
    }

    impl FakeOpener {
        fn accepting(credentials: Option<PairingCredentials>) -> Self {
            Self {
                accepted: parking_lot::Mutex::new(credentials),
                opens: AtomicUsize::new(0),
                unreachable: false,
            }
        }
    }

    #[async_trait]
    impl SessionOpener for Arc<FakeOpener> {
        type Session = PairingCredentials;

        async fn open(&self, credentials: &PairingCredentials) -> Result<Self::Session, LeapError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if self.unreachable {
                return Err(LeapError::Transport("connection refused".to_string()));
            }
            match self.accepted.lock().as_ref() {
                Some(accepted) if accepted == credentials => Ok(credentials.clone()),
                _ => Err(LeapError::Rejected("bad certificate".to_string())),
            }
        }
    }

    enum Behaviour {
        Succeed(PairingCredentials),
        Reject,
        Hang,
    }

    struct FakeExchange {
        behaviour: Behaviour,
        calls: AtomicUsize,
    }

    impl FakeExchange {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PairingExchange for Arc<FakeExchange> {
        async fn pair(
            &self,
            ready: &(dyn Fn() + Send + Sync),
        ) -> Result<PairingCredentials, PairingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            ready();
            match &self.behaviour {
                Behaviour::Succeed(credentials) => Ok(credentials.clone()),
                Behaviour::Reject => Err(PairingError::Rejected("not admin".to_string())),
                Behaviour::Hang => std::future::pending().await,
            }
        }
    }

    fn store(dir: &tempfile::TempDir) -> CredentialStore {
        CredentialStore::for_bridge(dir.path(), "10.0.0.5")
    }

    #[tokio::test]
    async fn test_stored_credentials_skip_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = sample_credentials();
        store(&dir).save(&credentials).unwrap();

        let opener = Arc::new(FakeOpener::accepting(Some(credentials.clone())));
        let exchange = FakeExchange::new(Behaviour::Reject);
        let manager = PairingManager::new(
            opener.clone(),
            exchange.clone(),
            store(&dir),
            Duration::from_secs(180),
        );

        assert_eq!(manager.ensure_session().await.unwrap(), credentials);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_first_run_pairs_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let credentials = sample_credentials();
        let opener = Arc::new(FakeOpener::accepting(Some(credentials.clone())));
        let exchange = FakeExchange::new(Behaviour::Succeed(credentials.clone()));
        let manager = PairingManager::new(
            opener.clone(),
            exchange.clone(),
            store(&dir),
            Duration::from_secs(180),
        );

        manager.ensure_session().await.unwrap();
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store(&dir).load().unwrap(), Some(credentials));

        // A second run finds the file and does not pair again
        let manager = PairingManager::new(
            opener.clone(),
            exchange.clone(),
            store(&dir),
            Duration::from_secs(180),
        );
        manager.ensure_session().await.unwrap();
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials_trigger_repairing() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).save(&sample_credentials()).unwrap();
        let fresh = sample_credentials();

        let opener = Arc::new(FakeOpener::accepting(Some(fresh.clone())));
        let exchange = FakeExchange::new(Behaviour::Succeed(fresh.clone()));
        let manager = PairingManager::new(
            opener.clone(),
            exchange.clone(),
            store(&dir),
            Duration::from_secs(180),
        );

        assert_eq!(manager.ensure_session().await.unwrap(), fresh);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(store(&dir).load().unwrap(), Some(fresh));
    }

    #[tokio::test]
    async fn test_exchange_rejection_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(FakeOpener::accepting(None));
        let manager = PairingManager::new(
            opener,
            FakeExchange::new(Behaviour::Reject),
            store(&dir),
            Duration::from_secs(180),
        );

        assert!(matches!(
            manager.ensure_session().await,
            Err(PairingError::Rejected(_))
        ));
        assert!(store(&dir).load().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_new_credentials_refused_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(FakeOpener::accepting(None));
        let manager = PairingManager::new(
            opener.clone(),
            FakeExchange::new(Behaviour::Succeed(sample_credentials())),
            store(&dir),
            Duration::from_secs(180),
        );

        assert!(matches!(
            manager.ensure_session().await,
            Err(PairingError::Rejected(_))
        ));
        // Exactly one retry after pairing
        assert_eq!(opener.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_button_press_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PairingManager::new(
            Arc::new(FakeOpener::accepting(None)),
            FakeExchange::new(Behaviour::Hang),
            store(&dir),
            Duration::from_secs(180),
        );

        match manager.ensure_session().await {
            Err(PairingError::Timeout(window)) => assert_eq!(window, Duration::from_secs(180)),
            other => panic!("expected timeout, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_unreachable_bridge_does_not_pair() {
        let dir = tempfile::tempdir().unwrap();
        store(&dir).save(&sample_credentials()).unwrap();
        let mut opener = FakeOpener::accepting(None);
        opener.unreachable = true;
        let exchange = FakeExchange::new(Behaviour::Reject);
        let manager = PairingManager::new(
            Arc::new(opener),
            exchange.clone(),
            store(&dir),
            Duration::from_secs(180),
        );

        assert!(matches!(
            manager.ensure_session().await,
            Err(PairingError::Unreachable(_))
        ));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unwritable_store_is_credential_write_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"").unwrap();
        // Parent "directory" is a regular file
        let store = CredentialStore::for_bridge(&blocker, "10.0.0.5");
        let credentials = sample_credentials();
        let manager = PairingManager::new(
            Arc::new(FakeOpener::accepting(Some(credentials.clone()))),
            FakeExchange::new(Behaviour::Succeed(credentials)),
            store,
            Duration::from_secs(180),
        );

        assert!(matches!(
            manager.ensure_session().await,
            Err(PairingError::CredentialWrite(_))
        ));
    }
}
