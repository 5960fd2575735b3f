//! TLS configuration for the LEAP and pairing sockets.
//!
//! Bridges present certificates issued by their own CA for a host name that
//! never matches the IP we dial, so the session verifier checks the chain
//! against the paired CA and ignores the name. The pairing socket is opened
//! before we know that CA and is not verified at all.

use super::LeapError;
use crate::credentials::PairingCredentials;
use std::io::{self, Cursor};
use std::sync::Arc;
use tokio_rustls::rustls::client::WebPkiServerVerifier;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{self, CryptoProvider, ring};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{
    self, CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};

pub fn load_certs(pem: &str) -> Result<Vec<CertificateDer<'static>>, LeapError> {
    let mut cursor = Cursor::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| LeapError::Credentials(format!("invalid certificate: {e}")))?;
    if certs.is_empty() {
        return Err(LeapError::Credentials("no certificate found".to_string()));
    }
    Ok(certs)
}

pub fn load_private_key(pem: &str) -> Result<PrivateKeyDer<'static>, LeapError> {
    let mut cursor = Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| LeapError::Credentials(format!("invalid private key: {e}")))?
        .ok_or_else(|| LeapError::Credentials("private key missing".to_string()))
}

pub fn server_name(address: &str) -> Result<ServerName<'static>, LeapError> {
    ServerName::try_from(address.to_string())
        .map_err(|e| LeapError::Transport(format!("invalid bridge address {address}: {e}")))
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Client config for an established (paired) LEAP session.
pub fn session_config(credentials: &PairingCredentials) -> Result<Arc<ClientConfig>, LeapError> {
    let certs = load_certs(&credentials.cert)?;
    let key = load_private_key(&credentials.key)?;

    let mut roots = RootCertStore::empty();
    for cert in load_certs(&credentials.ca)? {
        roots
            .add(cert)
            .map_err(|e| LeapError::Credentials(format!("invalid bridge CA: {e}")))?;
    }

    let provider = provider();
    let inner = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider.clone())
        .build()
        .map_err(|e| LeapError::Credentials(format!("invalid bridge CA: {e}")))?;

    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| LeapError::Credentials(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(BridgeCertVerifier { inner }))
        .with_client_auth_cert(certs, key)
        .map_err(|e| LeapError::Credentials(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Client config for the pairing socket, authenticated with the LAP
/// certificate every Lutron integration uses for the exchange.
pub fn pairing_config(cert_pem: &str, key_pem: &str) -> Result<Arc<ClientConfig>, LeapError> {
    let certs = load_certs(cert_pem)?;
    let key = load_private_key(key_pem)?;
    let provider = provider();

    let config = ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| LeapError::Credentials(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(UnverifiedBridge { provider }))
        .with_client_auth_cert(certs, key)
        .map_err(|e| LeapError::Credentials(e.to_string()))?;
    Ok(Arc::new(config))
}

/// Map a socket error onto [`LeapError`], separating credential rejection
/// (which sends us back to pairing) from ordinary transport failures.
pub fn classify_io_error(err: io::Error) -> LeapError {
    let tls_error = err
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls_error {
        Some(rustls::Error::AlertReceived(alert)) => {
            LeapError::Rejected(format!("bridge sent TLS alert {alert:?}"))
        }
        Some(rustls::Error::InvalidCertificate(reason)) => {
            LeapError::Rejected(format!("bridge certificate not trusted: {reason:?}"))
        }
        _ => LeapError::Transport(err.to_string()),
    }
}

/// Chain verification against the paired CA, without the name check.
#[derive(Debug)]
struct BridgeCertVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for BridgeCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForName | CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

/// Accepts whatever certificate the bridge presents on the pairing port.
/// Handshake signatures are still checked.
#[derive(Debug)]
struct UnverifiedBridge {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for UnverifiedBridge {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
