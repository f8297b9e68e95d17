//! TLS for the direct channel.
//!
//! ```text
//! storage node                          client
//! ────────────                          ──────
//! TlsIdentity::generate()               grant.serverPublicKey (base64 DER)
//!   self-signed cert (rcgen)                 │
//!   └─► server_config()                      ▼
//!        rustls ServerConfig            pinned_client_config()
//!                                         accepts exactly that certificate
//! ```
//!
//! There is no CA: the certificate travels to the client over the
//! authenticated relay connection and is pinned byte for byte.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rcgen::CertifiedKey;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};

use crate::error::{SyncError, SyncResult};

/// The ring provider used on both ends.
pub fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Self-signed certificate and key of a storage node.
#[derive(Clone)]
pub struct TlsIdentity {
    cert: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl TlsIdentity {
    /// Generates a new identity valid for `names`.
    pub fn generate(names: Vec<String>) -> SyncResult<Self> {
        let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)
            .map_err(|e| SyncError::TlsError(format!("certificate generation failed: {}", e)))?;
        Ok(TlsIdentity {
            cert: cert.der().clone(),
            key_der: key_pair.serialize_der(),
        })
    }

    /// Certificate DER as sent in `serverPublicKey`.
    pub fn public_key(&self) -> String {
        STANDARD.encode(self.cert.as_ref())
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.cert
    }

    pub fn server_config(&self) -> SyncResult<Arc<ServerConfig>> {
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()));
        let mut config = ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(vec![self.cert.clone()], key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_len", &self.cert.as_ref().len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pinned verification (client)
// =============================================================================

/// Accepts exactly one certificate, whatever name the server is reached by.
#[derive(Debug)]
pub struct PinnedCertVerifier {
    expected: CertificateDer<'static>,
    provider: Arc<CryptoProvider>,
}

impl PinnedCertVerifier {
    pub fn new(expected: CertificateDer<'static>) -> Self {
        PinnedCertVerifier {
            expected,
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if end_entity.as_ref() == self.expected.as_ref() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            ))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
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
        verify_tls13_signature(
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

/// Client config trusting only the certificate in `server_public_key`.
pub fn pinned_client_config(server_public_key: &str) -> SyncResult<ClientConfig> {
    let der = STANDARD
        .decode(server_public_key.trim())
        .map_err(|e| SyncError::TlsError(format!("serverPublicKey is not base64: {}", e)))?;
    let verifier = PinnedCertVerifier::new(CertificateDer::from(der));

    let mut config = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_round_trips_through_grant() {
        let identity = TlsIdentity::generate(vec!["localhost".into()]).unwrap();
        assert!(identity.server_config().is_ok());

        let decoded = STANDARD.decode(identity.public_key()).unwrap();
        assert_eq!(decoded, identity.certificate().as_ref());
        assert!(pinned_client_config(&identity.public_key()).is_ok());
    }

    #[test]
    fn test_pinned_verifier_rejects_other_certificates() {
        let pinned = TlsIdentity::generate(vec!["localhost".into()]).unwrap();
        let other = TlsIdentity::generate(vec!["localhost".into()]).unwrap();
        let verifier = PinnedCertVerifier::new(pinned.certificate().clone());
        let name = ServerName::try_from("localhost").unwrap();

        assert!(verifier
            .verify_server_cert(pinned.certificate(), &[], &name, &[], UnixTime::now())
            .is_ok());
        assert!(verifier
            .verify_server_cert(other.certificate(), &[], &name, &[], UnixTime::now())
            .is_err());
    }

    #[test]
    fn test_garbage_public_key_is_a_tls_error() {
        assert!(matches!(
            pinned_client_config("%%%"),
            Err(SyncError::TlsError(_))
        ));
    }
}
