//! TLS material attached to an endpoint

use std::fmt;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Local certificate chain and key, plus the peer trust requirement.
///
/// When `verify_peer` is set the trust anchor must be present; listeners and
/// dialers refuse to build a TLS config otherwise.
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub private_key: PrivateKeyDer<'static>,
    pub verify_peer: bool,
    pub trust_anchor: Option<CertificateDer<'static>>,
}

impl TlsMaterial {
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
    ) -> Self {
        Self {
            cert_chain,
            private_key,
            verify_peer: false,
            trust_anchor: None,
        }
    }

    /// Require the peer to present a certificate issued by `anchor`
    pub fn with_peer_verification(mut self, anchor: CertificateDer<'static>) -> Self {
        self.verify_peer = true;
        self.trust_anchor = Some(anchor);
        self
    }

    /// Anchor to verify the peer against, `None` when verification is off
    pub fn peer_anchor(&self) -> Option<&CertificateDer<'static>> {
        if self.verify_peer {
            self.trust_anchor.as_ref()
        } else {
            None
        }
    }

    /// Verification is requested but nothing to verify against
    pub fn is_missing_anchor(&self) -> bool {
        self.verify_peer && self.trust_anchor.is_none()
    }
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("cert_chain_len", &self.cert_chain.len())
            .field("verify_peer", &self.verify_peer)
            .field("has_trust_anchor", &self.trust_anchor.is_some())
            .finish()
    }
}
