//! Outbound dialers and the per-route dialer pool

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rustls::pki_types::ServerName;
use sockbridge_proto::{EndpointDescriptor, EndpointId, Transport};
use tokio::net::{TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::connection::OutboundConnection;
use crate::stream::BoxedStream;
use crate::{tls, TransportError, TransportResult};

/// Opens outbound connections for one endpoint
pub enum Dialer {
    Tcp {
        endpoint: Arc<EndpointDescriptor>,
        addr: SocketAddr,
    },
    Udp {
        endpoint: Arc<EndpointDescriptor>,
        addr: SocketAddr,
    },
    Unix {
        endpoint: Arc<EndpointDescriptor>,
        path: PathBuf,
    },
    Tls {
        endpoint: Arc<EndpointDescriptor>,
        addr: SocketAddr,
        connector: TlsConnector,
        server_name: ServerName<'static>,
    },
}

impl Dialer {
    /// Build the dialer for an endpoint. TLS endpoints must carry material.
    pub fn for_endpoint(endpoint: &Arc<EndpointDescriptor>) -> TransportResult<Self> {
        let transport = endpoint
            .transport()
            .ok_or_else(|| TransportError::UnsupportedProtocol(endpoint.scheme().to_string()))?;
        let endpoint = endpoint.clone();

        let dialer = match transport {
            Transport::Tcp(addr) => Dialer::Tcp {
                addr: *addr,
                endpoint,
            },
            Transport::Udp(addr) => Dialer::Udp {
                addr: *addr,
                endpoint,
            },
            Transport::Unix(path) => Dialer::Unix {
                path: path.clone(),
                endpoint,
            },
            Transport::Tls(addr) => {
                let material = endpoint.tls().ok_or_else(|| {
                    TransportError::Tls(format!("No TLS material for {}", endpoint))
                })?;
                let connector = TlsConnector::from(tls::client_config(material)?);
                let server_name = ServerName::try_from(endpoint.host().to_string())
                    .map_err(|e| TransportError::Tls(format!("Invalid server name: {}", e)))?;
                Dialer::Tls {
                    addr: *addr,
                    connector,
                    server_name,
                    endpoint,
                }
            }
        };

        Ok(dialer)
    }

    pub fn endpoint(&self) -> &Arc<EndpointDescriptor> {
        match self {
            Dialer::Tcp { endpoint, .. }
            | Dialer::Udp { endpoint, .. }
            | Dialer::Unix { endpoint, .. }
            | Dialer::Tls { endpoint, .. } => endpoint,
        }
    }

    /// Whether one connection can carry several logical streams. No current
    /// transport can.
    pub fn supports_multiplex(&self) -> bool {
        false
    }

    pub fn is_connectionless(&self) -> bool {
        matches!(self, Dialer::Udp { .. })
    }

    fn dial_failed(&self, reason: impl ToString) -> TransportError {
        TransportError::DialFailed {
            address: self.endpoint().addr(),
            reason: reason.to_string(),
        }
    }

    /// Open a new connection. Every call dials afresh.
    pub async fn connect(&self) -> TransportResult<OutboundConnection> {
        let connection = match self {
            Dialer::Tcp { addr, .. } => {
                let stream = TcpStream::connect(addr)
                    .await
                    .map_err(|e| self.dial_failed(e))?;
                let _ = stream.set_nodelay(true);
                OutboundConnection::Stream(Box::new(stream))
            }
            Dialer::Udp { addr, .. } => {
                let local: SocketAddr = if addr.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local)
                    .await
                    .map_err(|e| self.dial_failed(e))?;
                socket
                    .connect(addr)
                    .await
                    .map_err(|e| self.dial_failed(e))?;
                OutboundConnection::Datagram(socket)
            }
            #[cfg(unix)]
            Dialer::Unix { path, .. } => {
                let stream = UnixStream::connect(path)
                    .await
                    .map_err(|e| self.dial_failed(e))?;
                OutboundConnection::Stream(Box::new(stream))
            }
            #[cfg(not(unix))]
            Dialer::Unix { .. } => {
                return Err(TransportError::UnsupportedProtocol(
                    self.endpoint().scheme().to_string(),
                ))
            }
            Dialer::Tls {
                addr,
                connector,
                server_name,
                ..
            } => {
                let tcp = TcpStream::connect(addr)
                    .await
                    .map_err(|e| self.dial_failed(e))?;
                let _ = tcp.set_nodelay(true);
                let stream = connector
                    .connect(server_name.clone(), tcp)
                    .await
                    .map_err(|e| self.dial_failed(format!("TLS handshake failed: {}", e)))?;
                OutboundConnection::Stream(Box::new(stream))
            }
        };

        debug!(endpoint = %self.endpoint(), "Dialed outbound connection");
        Ok(connection)
    }

    /// Open a logical stream on a shared connection
    pub async fn open_stream(&self) -> TransportResult<BoxedStream> {
        Err(TransportError::MultiplexUnsupported)
    }
}

impl std::fmt::Debug for Dialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialer")
            .field("endpoint", &self.endpoint().addr())
            .field("id", &self.endpoint().id())
            .finish()
    }
}

/// Dialers keyed by endpoint identity, created lazily and never evicted
#[derive(Debug, Default)]
pub struct DialerPool {
    dialers: Mutex<HashMap<EndpointId, Arc<Dialer>>>,
}

impl DialerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the dialer registered for this endpoint, creating it on first use
    pub fn get_dialer(&self, endpoint: &Arc<EndpointDescriptor>) -> TransportResult<Arc<Dialer>> {
        let mut dialers = self
            .dialers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(dialer) = dialers.get(&endpoint.id()) {
            return Ok(dialer.clone());
        }

        let dialer = Arc::new(Dialer::for_endpoint(endpoint)?);
        debug!(endpoint = %endpoint, id = %endpoint.id(), "Registered dialer");
        dialers.insert(endpoint.id(), dialer.clone());
        Ok(dialer)
    }

    pub fn len(&self) -> usize {
        self.dialers
            .lock()
            .map(|dialers| dialers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
