//! Certificate management for sockbridge routes
//!
//! Provides the process certificate authority, leaf issuance, loading of
//! operator-supplied PEM material and the per-route provisioning policy that
//! decides which certificate a TLS endpoint presents and what it trusts.

pub mod authority;
pub mod loader;
pub mod provision;
pub mod verify;

pub use authority::{CertificateAuthority, IssuedCertificate};
pub use loader::{load_cert, load_cert_key_pair, load_certs, load_private_key};
pub use provision::{provision, PeerRole, SecurityPolicy, TlsSettings, TRUST_INNER};
pub use verify::verify_leaf;

use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CertError {
    #[error("{role} TLS config has only one of certificate and key")]
    IncompleteCertConfig { role: PeerRole },

    #[error("{role} peer verification is required but no trusted certificate is configured")]
    MissingTrustAnchor { role: PeerRole },

    #[error("Failed to load {path}: {reason}")]
    CertificateLoadError { path: String, reason: String },

    #[error("Certificate issuance failed: {0}")]
    CertificateIssuanceFailed(String),

    #[error("CA generation failed: {0}")]
    CaGenerationFailed(String),

    #[error("Invalid IP address for certificate: {0:?}")]
    InvalidIp(String),

    #[error("Certificate verification failed: {0}")]
    VerificationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CertError {
    pub(crate) fn load(path: &Path, reason: impl ToString) -> Self {
        CertError::CertificateLoadError {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}
