use crate::constants::transport::ALPN;
use crate::network::cert::{cert_hash, CertificateBundle};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TlsError {
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("No initial QUIC cipher suite: {0}")]
    NoInitialCipherSuite(String),
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn transport_config(keep_alive: Duration) -> Arc<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(keep_alive));
    // Peers talk over a single bidirectional stream
    transport.max_concurrent_uni_streams(0u8.into());
    Arc::new(transport)
}

/// Client config for one dial: the server must present a certificate whose
/// SHA-256 is in `accepted`.
pub fn client_config(
    accepted: Vec<[u8; 32]>,
    keep_alive: Duration,
) -> Result<quinn::ClientConfig, TlsError> {
    let provider = provider();
    let verifier = PinnedCertVerifier::new(accepted, provider.clone());

    let mut tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicClientConfig::try_from(tls).map_err(|e| TlsError::NoInitialCipherSuite(e.to_string()))?;
    let mut config = quinn::ClientConfig::new(Arc::new(crypto));
    config.transport_config(transport_config(keep_alive));
    Ok(config)
}

/// Server config presenting one window's certificate
pub fn server_config(
    bundle: &CertificateBundle,
    keep_alive: Duration,
) -> Result<quinn::ServerConfig, TlsError> {
    let cert = CertificateDer::from(bundle.cert_der.clone());
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(bundle.key_der.clone()));

    let mut tls = rustls::ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)
        .map_err(|e| match e {
            rustls::Error::General(_) => TlsError::InvalidPrivateKey,
            other => TlsError::Tls(other),
        })?;
    tls.alpn_protocols = vec![ALPN.to_vec()];

    let crypto = QuicServerConfig::try_from(tls).map_err(|e| TlsError::NoInitialCipherSuite(e.to_string()))?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));
    config.transport_config(transport_config(keep_alive));
    Ok(config)
}

/// Certificate verifier for self-signed rotating peer certificates.
/// Trust comes from the pinned hash set, not from a CA chain or the name.
#[derive(Debug)]
struct PinnedCertVerifier {
    accepted: Vec<[u8; 32]>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    fn new(accepted: Vec<[u8; 32]>, provider: Arc<CryptoProvider>) -> Self {
        Self { accepted, provider }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer,
        _intermediates: &[CertificateDer],
        _server_name: &ServerName,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let presented = cert_hash(end_entity.as_ref());
        if self.accepted.iter().any(|hash| *hash == presented) {
            Ok(ServerCertVerified::assertion())
        } else {
            tracing::debug!(
                "🔒 Rejecting certificate {} (not in pinned set)",
                hex::encode(presented)
            );
            Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::cert::issue_at;

    const T: i64 = 1_760_000_000_000;

    fn verify(verifier: &PinnedCertVerifier, der: &[u8]) -> bool {
        let name = ServerName::try_from("1.2.3.4").unwrap();
        verifier
            .verify_server_cert(
                &CertificateDer::from(der.to_vec()),
                &[],
                &name,
                &[],
                UnixTime::now(),
            )
            .is_ok()
    }

    #[test]
    fn test_pinned_verifier_accepts_only_pinned_hashes() {
        let current = issue_at(T, 0).unwrap();
        let far = issue_at(T, 5).unwrap();
        let verifier = PinnedCertVerifier::new(vec![current.hash()], provider());

        assert!(verify(&verifier, &current.cert_der));
        assert!(!verify(&verifier, &far.cert_der));
    }

    #[test]
    fn test_server_config_loads_window_key() {
        let bundle = issue_at(T, 0).unwrap();
        assert!(server_config(&bundle, Duration::from_secs(10)).is_ok());
    }

    #[test]
    fn test_client_config_builds() {
        assert!(client_config(vec![[0u8; 32]], Duration::from_secs(10)).is_ok());
    }
}
