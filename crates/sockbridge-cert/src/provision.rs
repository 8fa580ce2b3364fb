//! Per-route TLS provisioning

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use rustls::pki_types::CertificateDer;
use sockbridge_proto::TlsMaterial;
use tracing::{info, warn};

use crate::authority::CertificateAuthority;
use crate::loader::{load_cert, load_cert_key_pair};
use crate::CertError;

/// Trust selector naming the process CA
pub const TRUST_INNER: &str = "inner";

/// Host name given to auto-issued leaves
const AUTO_LEAF_NAME: &str = "localhost";

/// Which side of a route the material is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// The listener side; presents a server certificate
    Inbound,
    /// The dialer side; presents a client certificate
    Outbound,
}

impl fmt::Display for PeerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerRole::Inbound => write!(f, "inbound"),
            PeerRole::Outbound => write!(f, "outbound"),
        }
    }
}

/// TLS options configured for one direction of a route
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    /// `"inner"` or a path to a PEM certificate
    pub trust: Option<String>,
    pub skip_verify: bool,
    /// Extra IP SAN for an auto-issued inbound certificate
    pub extra_ip: Option<IpAddr>,
}

/// Process-wide verification overrides. A set switch always wins over the
/// route's own `skip_verify`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub force_verify_inbound: bool,
    pub force_verify_outbound: bool,
    pub force_verify_both: bool,
}

impl SecurityPolicy {
    pub fn forces(&self, role: PeerRole) -> bool {
        self.force_verify_both
            || match role {
                PeerRole::Inbound => self.force_verify_inbound,
                PeerRole::Outbound => self.force_verify_outbound,
            }
    }
}

/// Build the TLS material for one direction of a route
pub fn provision(
    role: PeerRole,
    settings: &TlsSettings,
    ca: &CertificateAuthority,
    policy: &SecurityPolicy,
) -> Result<TlsMaterial, CertError> {
    let (cert_chain, private_key) = match (&settings.cert_path, &settings.key_path) {
        (Some(cert), Some(key)) => load_cert_key_pair(cert, key)?,
        (None, None) => {
            let issued = match role {
                PeerRole::Inbound => ca.issue_server_leaf(AUTO_LEAF_NAME, settings.extra_ip)?,
                PeerRole::Outbound => ca.issue_leaf(AUTO_LEAF_NAME, &[])?,
            };
            info!(%role, "Using auto-issued certificate");
            issued.into_parts()
        }
        _ => return Err(CertError::IncompleteCertConfig { role }),
    };

    let forced = policy.forces(role);
    if forced && settings.skip_verify {
        warn!(%role, "Peer verification forced on despite route setting");
    }
    let verify_peer = !settings.skip_verify || forced;

    let trust_anchor = if verify_peer {
        Some(resolve_trust(role, settings.trust.as_deref(), ca)?)
    } else {
        None
    };

    Ok(TlsMaterial {
        cert_chain,
        private_key,
        verify_peer,
        trust_anchor,
    })
}

fn resolve_trust(
    role: PeerRole,
    trust: Option<&str>,
    ca: &CertificateAuthority,
) -> Result<CertificateDer<'static>, CertError> {
    match trust.map(str::trim) {
        None | Some("") => Err(CertError::MissingTrustAnchor { role }),
        Some(selector) if selector.eq_ignore_ascii_case(TRUST_INNER) => Ok(ca.cert_der().clone()),
        Some(path) => load_cert(Path::new(path)),
    }
}
