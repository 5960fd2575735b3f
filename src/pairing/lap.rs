//! Certificate exchange on the bridge's pairing port.
//!
//! We connect with the Lutron pairing ("LAP") client certificate, wait until
//! the bridge reports physical access (somebody pressed the button), then send
//! a CSR for a freshly generated key and receive the signed certificate plus
//! the bridge CA.

use super::{PairingError, PairingExchange};
use crate::credentials::PairingCredentials;
use crate::leap::{LeapError, tls};
use async_trait::async_trait;
use log::{debug, info};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PAIR_TAG: &str = "get-cert";
const CERT_COMMON_NAME: &str = "lutron-mqtt";
const DEVICE_UID: &str = "000000000000";

/// Pairing over TLS with LAP credentials read from disk.
pub struct LapPairing {
    address: String,
    port: u16,
    lap_cert: PathBuf,
    lap_key: PathBuf,
}

impl LapPairing {
    pub fn new(address: impl Into<String>, port: u16, lap_cert: PathBuf, lap_key: PathBuf) -> Self {
        Self {
            address: address.into(),
            port,
            lap_cert,
            lap_key,
        }
    }

    fn read_lap_file(path: &Path) -> Result<String, PairingError> {
        std::fs::read_to_string(path)
            .map_err(|e| PairingError::LapCredentials(format!("{}: {e}", path.display())))
    }
}

#[async_trait]
impl PairingExchange for LapPairing {
    async fn pair(
        &self,
        ready: &(dyn Fn() + Send + Sync),
    ) -> Result<PairingCredentials, PairingError> {
        let cert = Self::read_lap_file(&self.lap_cert)?;
        let key = Self::read_lap_file(&self.lap_key)?;
        let config = tls::pairing_config(&cert, &key)
            .map_err(|e| PairingError::LapCredentials(e.to_string()))?;

        let (csr, private_key) = generate_csr()?;

        let addr = format!("{}:{}", self.address, self.port);
        info!("Connecting to bridge pairing port {}", addr);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| PairingError::Transport(format!("connect to {addr} timed out")))?
            .map_err(|e| PairingError::Transport(format!("connect to {addr} failed: {e}")))?;
        let server_name = tls::server_name(&self.address).map_err(leap_to_pairing)?;
        let stream = TlsConnector::from(config)
            .connect(server_name, stream)
            .await
            .map_err(|e| leap_to_pairing(tls::classify_io_error(e)))?;

        let display_name = gethostname::gethostname().to_string_lossy().into_owned();
        let signed = exchange(stream, &csr, &display_name, ready).await?;

        Ok(PairingCredentials {
            ca: signed.root_certificate,
            cert: signed.certificate,
            key: private_key,
        })
    }
}

fn leap_to_pairing(err: LeapError) -> PairingError {
    match err {
        LeapError::Rejected(reason) => PairingError::Rejected(reason),
        other => PairingError::Transport(other.to_string()),
    }
}

/// New ECDSA P-256 key and a CSR for it, both PEM.
fn generate_csr() -> Result<(String, String), PairingError> {
    let key = KeyPair::generate().map_err(|e| PairingError::Transport(e.to_string()))?;
    let mut params = CertificateParams::new(Vec::<String>::new())
        .map_err(|e| PairingError::Transport(e.to_string()))?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, CERT_COMMON_NAME);
    params.distinguished_name = name;
    let csr = params
        .serialize_request(&key)
        .and_then(|csr| csr.pem())
        .map_err(|e| PairingError::Transport(e.to_string()))?;
    Ok((csr, key.serialize_pem()))
}

#[derive(Debug)]
struct SigningResult {
    certificate: String,
    root_certificate: String,
}

/// Run the exchange on an established stream.
async fn exchange<S>(
    stream: S,
    csr: &str,
    display_name: &str,
    ready: &(dyn Fn() + Send + Sync),
) -> Result<SigningResult, PairingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = BufReader::new(reader).lines();

    // Wait for the button press
    loop {
        let message = next_message(&mut lines).await?;
        let is_status = message["Header"]["ContentType"]
            .as_str()
            .is_some_and(|t| t.starts_with("status;"));
        if !is_status {
            continue;
        }
        let permissions = message["Body"]["Status"]["Permissions"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        if permissions.iter().any(|p| p == "PhysicalAccess") {
            info!("Bridge button pressed, requesting certificate");
            break;
        }
        ready();
    }

    let request = json!({
        "Header": {
            "RequestType": "Execute",
            "Url": "/pair",
            "ClientTag": PAIR_TAG,
        },
        "Body": {
            "CommandType": "CSR",
            "Parameters": {
                "CSR": csr,
                "DisplayName": display_name,
                "DeviceUID": DEVICE_UID,
                "Role": "Admin",
            }
        }
    });
    let mut line = request.to_string();
    line.push_str("\r\n");
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| leap_to_pairing(tls::classify_io_error(e)))?;
    writer
        .flush()
        .await
        .map_err(|e| leap_to_pairing(tls::classify_io_error(e)))?;

    let response = loop {
        let message = next_message(&mut lines).await?;
        if message["Header"]["ClientTag"] == PAIR_TAG {
            break message;
        }
    };

    let status = response["Header"]["StatusCode"].as_str().unwrap_or_default();
    let success = status
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .is_some_and(|code| (200..300).contains(&code));
    if !success {
        return Err(PairingError::Rejected(format!(
            "certificate request answered with {status:?}"
        )));
    }

    let result = &response["Body"]["SigningResult"];
    match (
        result["Certificate"].as_str(),
        result["RootCertificate"].as_str(),
    ) {
        (Some(certificate), Some(root)) => Ok(SigningResult {
            certificate: certificate.to_string(),
            root_certificate: root.to_string(),
        }),
        _ => Err(PairingError::Rejected(
            "signing result has no certificate".to_string(),
        )),
    }
}

async fn next_message<R>(lines: &mut tokio::io::Lines<R>) -> Result<Value, PairingError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| leap_to_pairing(tls::classify_io_error(e)))?
            .ok_or_else(|| {
                PairingError::Transport("bridge closed the pairing connection".to_string())
            })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(value) => return Ok(value),
            Err(e) => debug!("Skipping unparseable pairing line ({}): {}", e, line),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAITING: &str = r#"{"Header":{"StatusCode":"200 OK","ContentType":"status;plurality=single"},"Body":{"Status":{"Permissions":["Public"]}}}"#;
    const PRESSED: &str = r#"{"Header":{"StatusCode":"200 OK","ContentType":"status;plurality=single"},"Body":{"Status":{"Permissions":["Public","PhysicalAccess"]}}}"#;

    #[test]
    fn test_generated_csr_and_key() {
        let (csr, key) = generate_csr().unwrap();
        assert!(csr.starts_with("-----BEGIN CERTIFICATE REQUEST-----"));
        assert!(tls::load_private_key(&key).is_ok());
    }

    #[tokio::test]
    async fn test_exchange_after_button_press() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        let bridge = tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(server);
            writer.write_all(format!("{WAITING}\r\n").as_bytes()).await.unwrap();
            writer.write_all(format!("{PRESSED}\r\n").as_bytes()).await.unwrap();

            let mut lines = BufReader::new(reader).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            let request: Value = serde_json::from_str(&line).unwrap();
            let reply = json!({
                "Header": {"StatusCode": "200 OK", "ClientTag": request["Header"]["ClientTag"]},
                "Body": {"SigningResult": {"Certificate": "CERT", "RootCertificate": "ROOT"}},
            });
            writer.write_all(format!("{reply}\r\n").as_bytes()).await.unwrap();
            request
        });

        let prompts = AtomicUsize::new(0);
        let ready = || {
            prompts.fetch_add(1, Ordering::SeqCst);
        };
        let result = exchange(client, "CSR-PEM", "host", &ready).await.unwrap();
        let request = bridge.await.unwrap();

        assert_eq!(result.certificate, "CERT");
        assert_eq!(result.root_certificate, "ROOT");
        assert_eq!(prompts.load(Ordering::SeqCst), 1);
        assert_eq!(request["Header"]["Url"], "/pair");
        assert_eq!(request["Body"]["Parameters"]["CSR"], "CSR-PEM");
        assert_eq!(request["Body"]["Parameters"]["Role"], "Admin");
    }

    #[tokio::test]
    async fn test_error_status_is_rejection() {
        let (client, server) = tokio::io::duplex(16 * 1024);
        tokio::spawn(async move {
            let (reader, mut writer) = tokio::io::split(server);
            writer.write_all(format!("{PRESSED}\r\n").as_bytes()).await.unwrap();
            let mut lines = BufReader::new(reader).lines();
            let _ = lines.next_line().await;
            let reply = r#"{"Header":{"StatusCode":"400 BadRequest","ClientTag":"get-cert"}}"#;
            writer.write_all(format!("{reply}\r\n").as_bytes()).await.unwrap();
            // Keep the pipe open until the client is done
            let _ = lines.next_line().await;
        });

        let result = exchange(client, "CSR-PEM", "host", &|| {}).await;
        assert!(matches!(result, Err(PairingError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_next_message_skips_noise() {
        let stream = tokio_test::io::Builder::new()
            .read(b"\r\n")
            .read(b"not json\r\n")
            .read(format!("{WAITING}\r\n").as_bytes())
            .build();
        let mut lines = BufReader::new(stream).lines();

        let message = next_message(&mut lines).await.unwrap();
        assert_eq!(message["Body"]["Status"]["Permissions"][0], "Public");
        assert!(matches!(
            next_message(&mut lines).await,
            Err(PairingError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_closed_before_press() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let result = exchange(client, "CSR-PEM", "host", &|| {}).await;
        assert!(matches!(result, Err(PairingError::Transport(_))));
    }

    #[tokio::test]
    async fn test_missing_lap_files() {
        let dir = tempfile::tempdir().unwrap();
        let pairing = LapPairing::new(
            "127.0.0.1",
            8083,
            dir.path().join("lap.crt"),
            dir.path().join("lap.key"),
        );
        assert!(matches!(
            pairing.pair(&|| {}).await,
            Err(PairingError::LapCredentials(_))
        ));
    }
}
