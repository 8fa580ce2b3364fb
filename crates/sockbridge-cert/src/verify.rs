//! Chain verification against a single trust anchor

use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::RootCertStore;

use crate::CertError;

/// Check that `chain` is valid for `name` when trusting only `anchor`.
///
/// This runs the same webpki verification a TLS client performs during the
/// handshake.
pub fn verify_leaf(
    chain: &[CertificateDer<'static>],
    anchor: &CertificateDer<'static>,
    name: &str,
) -> Result<(), CertError> {
    let (leaf, intermediates) = chain
        .split_first()
        .ok_or_else(|| CertError::VerificationFailed("empty certificate chain".to_string()))?;

    let mut roots = RootCertStore::empty();
    roots
        .add(anchor.clone())
        .map_err(|e| CertError::VerificationFailed(format!("invalid trust anchor: {}", e)))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| CertError::VerificationFailed(e.to_string()))?;

    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| CertError::VerificationFailed(format!("invalid name {}: {}", name, e)))?;

    verifier
        .verify_server_cert(leaf, intermediates, &server_name, &[], UnixTime::now())
        .map(|_| ())
        .map_err(|e| CertError::VerificationFailed(e.to_string()))
}
