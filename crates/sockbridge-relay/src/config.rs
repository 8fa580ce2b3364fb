//! Route configuration records

use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sockbridge_cert::{CertError, TlsSettings};

/// One route: an inbound address relayed to an outbound address.
///
/// Field names on the wire follow the route file format (`in`, `out`,
/// `incert`, ...).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Route name; taken from the key in the route file
    #[serde(skip)]
    pub name: String,

    #[serde(rename = "in")]
    pub inbound: String,

    #[serde(rename = "out")]
    pub outbound: String,

    /// Server certificate presented by a TLS inbound
    #[serde(rename = "incert", default, skip_serializing_if = "Option::is_none")]
    pub inbound_cert: Option<PathBuf>,

    #[serde(rename = "inkey", default, skip_serializing_if = "Option::is_none")]
    pub inbound_key: Option<PathBuf>,

    /// Extra IP SAN for the auto-issued inbound certificate
    #[serde(rename = "inip", default, skip_serializing_if = "Option::is_none")]
    pub inbound_ip: Option<String>,

    /// Trust for inbound clients: `inner` or a PEM path
    #[serde(rename = "clientca", default, skip_serializing_if = "Option::is_none")]
    pub client_ca: Option<String>,

    #[serde(rename = "nocheckin", default)]
    pub skip_verify_inbound: bool,

    /// Client certificate presented by a TLS outbound
    #[serde(rename = "outcert", default, skip_serializing_if = "Option::is_none")]
    pub outbound_cert: Option<PathBuf>,

    #[serde(rename = "outkey", default, skip_serializing_if = "Option::is_none")]
    pub outbound_key: Option<PathBuf>,

    /// Trust for the outbound server: `inner` or a PEM path
    #[serde(rename = "serverca", default, skip_serializing_if = "Option::is_none")]
    pub server_ca: Option<String>,

    #[serde(rename = "nocheckout", default)]
    pub skip_verify_outbound: bool,
}

fn non_empty_path(path: &Option<PathBuf>) -> Option<PathBuf> {
    path.as_ref()
        .filter(|p| !p.as_os_str().is_empty())
        .cloned()
}

impl RouteConfig {
    pub fn new(name: impl Into<String>, inbound: impl Into<String>, outbound: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inbound: inbound.into(),
            outbound: outbound.into(),
            ..Default::default()
        }
    }

    /// TLS settings for the listener side
    pub fn inbound_tls(&self) -> Result<TlsSettings, CertError> {
        let extra_ip = match self.inbound_ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(ip) => Some(
                ip.parse::<IpAddr>()
                    .map_err(|_| CertError::InvalidIp(ip.to_string()))?,
            ),
        };

        Ok(TlsSettings {
            cert_path: non_empty_path(&self.inbound_cert),
            key_path: non_empty_path(&self.inbound_key),
            trust: self.client_ca.clone(),
            skip_verify: self.skip_verify_inbound,
            extra_ip,
        })
    }

    /// TLS settings for the dialer side
    pub fn outbound_tls(&self) -> TlsSettings {
        TlsSettings {
            cert_path: non_empty_path(&self.outbound_cert),
            key_path: non_empty_path(&self.outbound_key),
            trust: self.server_ca.clone(),
            skip_verify: self.skip_verify_outbound,
            extra_ip: None,
        }
    }
}
