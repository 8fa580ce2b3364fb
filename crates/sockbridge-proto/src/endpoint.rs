//! Endpoint descriptors and route string resolution

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::tls::TlsMaterial;
use crate::DEFAULT_SCHEME;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid address: {0:?}")]
    InvalidAddress(String),

    #[error("Failed to resolve {address}: {reason}")]
    AddressResolutionFailed { address: String, reason: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Unsupported direction: {inbound} -> {outbound}")]
    UnsupportedDirection { inbound: String, outbound: String },
}

/// Stable identity of a descriptor, assigned at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{}", self.0)
    }
}

/// Resolved transport of an endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Unix(PathBuf),
    /// TLS over TCP
    Tls(SocketAddr),
}

impl Transport {
    /// UDP is the only transport without connections
    pub fn is_connectionless(&self) -> bool {
        matches!(self, Transport::Udp(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transport::Tcp(_) => "tcp",
            Transport::Udp(_) => "udp",
            Transport::Unix(_) => "unix",
            Transport::Tls(_) => "tls",
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Transport::Tcp(addr) | Transport::Udp(addr) | Transport::Tls(addr) => Some(*addr),
            Transport::Unix(_) => None,
        }
    }
}

/// A normalized endpoint.
///
/// Descriptors are shared behind an `Arc` once resolved and never mutated after
/// that point. Identity is carried by [`EndpointId`], not by the allocation.
#[derive(Debug)]
pub struct EndpointDescriptor {
    id: EndpointId,
    raw: String,
    scheme: String,
    address: String,
    host: String,
    transport: Option<Transport>,
    tls: Option<Arc<TlsMaterial>>,
}

impl EndpointDescriptor {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    /// The route string as configured
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Host part of the address, used as the TLS server name
    pub fn host(&self) -> &str {
        &self.host
    }

    /// `None` when the scheme is not one of tcp/udp/unix/tls
    pub fn transport(&self) -> Option<&Transport> {
        self.transport.as_ref()
    }

    /// Returns the transport or an `UnsupportedProtocol` error
    pub fn require_transport(&self) -> Result<&Transport, AddressError> {
        self.transport
            .as_ref()
            .ok_or_else(|| AddressError::UnsupportedProtocol(self.scheme.clone()))
    }

    pub fn is_tls(&self) -> bool {
        matches!(self.transport, Some(Transport::Tls(_)))
    }

    pub fn is_connectionless(&self) -> bool {
        self.transport
            .as_ref()
            .map(Transport::is_connectionless)
            .unwrap_or(false)
    }

    pub fn tls(&self) -> Option<&Arc<TlsMaterial>> {
        self.tls.as_ref()
    }

    /// Attach TLS material. Only meaningful before the descriptor is shared.
    pub fn with_tls(mut self, material: TlsMaterial) -> Self {
        self.tls = Some(Arc::new(material));
        self
    }

    /// Normalized `scheme://address`
    pub fn addr(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.address)
    }
}

/// Parse a route string into an endpoint descriptor.
///
/// Accepted forms are `scheme://address`, `//address` and a bare `address`,
/// the latter two defaulting to TCP. Schemes are matched by prefix so that
/// `tcp4`, `udp6` and similar select an address family.
pub fn resolve_endpoint(route: &str) -> Result<EndpointDescriptor, AddressError> {
    let trimmed = route.trim();
    let (scheme, address) = split_route(trimmed)?;

    let transport = if scheme.starts_with("tcp") {
        Some(Transport::Tcp(resolve_socket_addr(scheme, address)?))
    } else if scheme.starts_with("udp") {
        Some(Transport::Udp(resolve_socket_addr(scheme, address)?))
    } else if scheme.starts_with("unix") {
        Some(Transport::Unix(PathBuf::from(address)))
    } else if scheme.starts_with("tls") {
        Some(Transport::Tls(resolve_socket_addr(scheme, address)?))
    } else {
        tracing::debug!(scheme, "Unrecognized scheme, endpoint has no transport");
        None
    };

    let host = match transport {
        Some(Transport::Unix(_)) | None => address.to_string(),
        Some(_) => host_part(address).to_string(),
    };

    Ok(EndpointDescriptor {
        id: EndpointId::next(),
        raw: route.to_string(),
        scheme: scheme.to_string(),
        address: address.to_string(),
        host,
        transport,
        tls: None,
    })
}

fn split_route(route: &str) -> Result<(&str, &str), AddressError> {
    let (scheme, address) = if let Some(rest) = route.strip_prefix("//") {
        (DEFAULT_SCHEME, rest)
    } else {
        match route.split_once("://") {
            // An explicit separator demands an explicit scheme
            Some(("", _)) => return Err(AddressError::InvalidAddress(route.to_string())),
            Some((scheme, rest)) => (scheme, rest.strip_prefix("//").unwrap_or(rest)),
            None => (DEFAULT_SCHEME, route),
        }
    };

    if address.is_empty() {
        return Err(AddressError::InvalidAddress(route.to_string()));
    }

    Ok((scheme, address))
}

fn resolve_socket_addr(scheme: &str, address: &str) -> Result<SocketAddr, AddressError> {
    let want_v4 = scheme.ends_with('4');
    let want_v6 = scheme.ends_with('6');

    let target = if address.starts_with(':') {
        let unspecified = if want_v6 { "[::]" } else { "0.0.0.0" };
        format!("{}{}", unspecified, address)
    } else {
        address.to_string()
    };

    let failed = |reason: String| AddressError::AddressResolutionFailed {
        address: address.to_string(),
        reason,
    };

    let candidates = target
        .to_socket_addrs()
        .map_err(|e| failed(e.to_string()))?;

    pick_candidate(candidates, want_v4, want_v6)
        .ok_or_else(|| failed(format!("no address matching scheme {}", scheme)))
}

/// Without an explicit family, IPv4 wins over the resolver's order
fn pick_candidate(
    candidates: impl IntoIterator<Item = SocketAddr>,
    want_v4: bool,
    want_v6: bool,
) -> Option<SocketAddr> {
    let candidates: Vec<SocketAddr> = candidates.into_iter().collect();

    if want_v4 {
        candidates.into_iter().find(SocketAddr::is_ipv4)
    } else if want_v6 {
        candidates.into_iter().find(SocketAddr::is_ipv6)
    } else {
        candidates
            .iter()
            .copied()
            .find(SocketAddr::is_ipv4)
            .or_else(|| candidates.first().copied())
    }
}

fn host_part(address: &str) -> &str {
    let host = match address.rsplit_once(':') {
        Some((host, _port)) => host,
        None => address,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        "localhost"
    } else {
        host
    }
}
