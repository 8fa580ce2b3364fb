//! rustls configuration built from endpoint TLS material

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use sockbridge_proto::TlsMaterial;

use crate::{TransportError, TransportResult};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn roots_with(anchor: &CertificateDer<'static>) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots
        .add(anchor.clone())
        .map_err(|e| TransportError::Tls(format!("Invalid trust anchor: {}", e)))?;
    Ok(roots)
}

fn check_anchor(material: &TlsMaterial) -> TransportResult<()> {
    if material.is_missing_anchor() {
        return Err(TransportError::Tls(
            "Peer verification required but no trusted certificate configured".to_string(),
        ));
    }
    Ok(())
}

/// Server config for a TLS listener; client certificates are required when
/// the material asks for peer verification
pub fn server_config(material: &TlsMaterial) -> TransportResult<Arc<ServerConfig>> {
    check_anchor(material)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let builder = match material.peer_anchor() {
        Some(anchor) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(roots_with(anchor)?), provider())
                    .build()
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };

    let config = builder
        .with_single_cert(material.cert_chain.clone(), material.private_key.clone_key())
        .map_err(|e| TransportError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(Arc::new(config))
}

/// Client config for a TLS dialer; always presents the local certificate
pub fn client_config(material: &TlsMaterial) -> TransportResult<Arc<ClientConfig>> {
    check_anchor(material)?;

    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| TransportError::Tls(e.to_string()))?;

    let builder = match material.peer_anchor() {
        Some(anchor) => builder.with_root_certificates(roots_with(anchor)?),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(SkipVerification::new()),
    };

    let config = builder
        .with_client_auth_cert(material.cert_chain.clone(), material.private_key.clone_key())
        .map_err(|e| TransportError::Tls(format!("Invalid cert/key: {}", e)))?;

    Ok(Arc::new(config))
}

/// Accepts any server certificate. Used when a route disables outbound
/// verification.
#[derive(Debug)]
struct SkipVerification {
    schemes: Vec<SignatureScheme>,
}

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            schemes: provider()
                .signature_verification_algorithms
                .supported_schemes(),
        })
    }
}

impl ServerCertVerifier for SkipVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockbridge_cert::CertificateAuthority;

    fn material(ca: &CertificateAuthority) -> TlsMaterial {
        let (chain, key) = ca.issue_leaf("localhost", &[]).unwrap().into_parts();
        TlsMaterial::new(chain, key)
    }

    #[test]
    fn test_configs_without_verification() {
        let ca = CertificateAuthority::generate().unwrap();
        let material = material(&ca);

        assert!(server_config(&material).is_ok());
        assert!(client_config(&material).is_ok());
    }

    #[test]
    fn test_configs_with_verification() {
        let ca = CertificateAuthority::generate().unwrap();
        let material = material(&ca).with_peer_verification(ca.cert_der().clone());

        assert!(server_config(&material).is_ok());
        assert!(client_config(&material).is_ok());
    }

    #[test]
    fn test_missing_anchor_rejected() {
        let ca = CertificateAuthority::generate().unwrap();
        let mut material = material(&ca);
        material.verify_peer = true;

        assert!(matches!(server_config(&material), Err(TransportError::Tls(_))));
        assert!(matches!(client_config(&material), Err(TransportError::Tls(_))));
    }
}
