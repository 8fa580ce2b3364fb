//! Listeners for each transport kind
//!
//! A bound [`Listener`] is turned into a [`ListenerTask`] by [`Listener::serve`]:
//! an accept loop running on its own task and publishing every accepted
//! connection on a channel. The loop waits with a per-transport deadline so it
//! notices shutdown and performs housekeeping even when no client connects.

use std::io;
use std::net::SocketAddr;
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sockbridge_proto::{EndpointDescriptor, Transport, DATAGRAM_BUFFER_SIZE};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::connection::{ConnectionHandle, ConnectionTracker, InboundConnection, PeerAddr};
use crate::stream::BoxedStream;
use crate::{
    tls, TransportError, TransportResult, SWEEP_AFTER_TIMEOUTS, TCP_ACCEPT_DEADLINE,
    TLS_ACCEPT_DEADLINE, TLS_HANDSHAKE_TIMEOUT, UDP_RECV_DEADLINE, UNIX_ACCEPT_DEADLINE,
};

/// Accepted connections waiting for the orchestrator
const CONNECTION_BACKLOG: usize = 128;

enum ListenerKind {
    Tcp(TcpListener),
    Udp(Arc<UdpSocket>),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
    Tls(TcpListener, TlsAcceptor),
}

/// A bound inbound endpoint
pub struct Listener {
    endpoint: Arc<EndpointDescriptor>,
    kind: ListenerKind,
}

/// A running accept loop
pub struct ListenerTask {
    /// Closed once the accept loop and any pending TLS handshakes are done
    pub connections: mpsc::Receiver<InboundConnection>,
    pub handle: JoinHandle<()>,
}

fn listen_failed(endpoint: &EndpointDescriptor, e: impl ToString) -> TransportError {
    TransportError::ListenFailed {
        address: endpoint.addr(),
        reason: e.to_string(),
    }
}

impl Listener {
    /// Bind the endpoint immediately. TLS endpoints must carry material.
    pub async fn bind(endpoint: Arc<EndpointDescriptor>) -> TransportResult<Self> {
        let transport = endpoint
            .transport()
            .ok_or_else(|| TransportError::UnsupportedProtocol(endpoint.scheme().to_string()))?;

        let kind = match transport {
            Transport::Tcp(addr) => ListenerKind::Tcp(
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| listen_failed(&endpoint, e))?,
            ),
            Transport::Udp(addr) => ListenerKind::Udp(Arc::new(
                UdpSocket::bind(addr)
                    .await
                    .map_err(|e| listen_failed(&endpoint, e))?,
            )),
            #[cfg(unix)]
            Transport::Unix(path) => ListenerKind::Unix(
                bind_unix(path)
                    .await
                    .map_err(|e| listen_failed(&endpoint, e))?,
                path.clone(),
            ),
            #[cfg(not(unix))]
            Transport::Unix(_) => {
                return Err(TransportError::UnsupportedProtocol(
                    endpoint.scheme().to_string(),
                ))
            }
            Transport::Tls(addr) => {
                let material = endpoint.tls().ok_or_else(|| {
                    TransportError::Tls(format!("No TLS material for {}", endpoint))
                })?;
                let acceptor = TlsAcceptor::from(tls::server_config(material)?);
                let listener = TcpListener::bind(addr)
                    .await
                    .map_err(|e| listen_failed(&endpoint, e))?;
                ListenerKind::Tls(listener, acceptor)
            }
        };

        info!(endpoint = %endpoint, "Listening");

        Ok(Self { endpoint, kind })
    }

    pub fn endpoint(&self) -> &Arc<EndpointDescriptor> {
        &self.endpoint
    }

    /// Bound socket address; `None` for Unix listeners
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(listener) | ListenerKind::Tls(listener, _) => {
                listener.local_addr().ok()
            }
            ListenerKind::Udp(socket) => socket.local_addr().ok(),
            #[cfg(unix)]
            ListenerKind::Unix(..) => None,
        }
    }

    /// Start the accept loop. It exits when `shutdown` is cancelled or the
    /// receiving side of the channel is dropped.
    pub fn serve(self, shutdown: CancellationToken) -> ListenerTask {
        let (tx, rx) = mpsc::channel(CONNECTION_BACKLOG);
        let endpoint = self.endpoint;

        let handle = match self.kind {
            ListenerKind::Udp(socket) => tokio::spawn(run_udp(socket, endpoint, tx, shutdown)),
            ListenerKind::Tcp(listener) => tokio::spawn(run_stream(
                StreamSource::Tcp(listener),
                endpoint,
                tx,
                shutdown,
            )),
            ListenerKind::Tls(listener, acceptor) => tokio::spawn(run_stream(
                StreamSource::Tls(listener, acceptor),
                endpoint,
                tx,
                shutdown,
            )),
            #[cfg(unix)]
            ListenerKind::Unix(listener, path) => tokio::spawn(async move {
                run_stream(StreamSource::Unix(listener), endpoint, tx, shutdown).await;
                remove_socket_file(&path);
            }),
        };

        ListenerTask {
            connections: rx,
            handle,
        }
    }
}

#[cfg(unix)]
async fn bind_unix(path: &Path) -> io::Result<UnixListener> {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(metadata) = std::fs::symlink_metadata(path) {
        if !metadata.file_type().is_socket() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} exists and is not a socket", path.display()),
            ));
        }

        // A socket nobody answers on is left over from a previous run
        match UnixStream::connect(path).await {
            Ok(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("socket at {} is active", path.display()),
                ));
            }
            Err(_) => {
                debug!(path = %path.display(), "Removing stale socket");
                std::fs::remove_file(path)?;
            }
        }
    }

    UnixListener::bind(path)
}

#[cfg(unix)]
fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}

async fn publish(
    tx: &mpsc::Sender<InboundConnection>,
    shutdown: &CancellationToken,
    connection: InboundConnection,
) -> bool {
    // Nothing is handed out once shutdown has started; the tracker may
    // already have been drained
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        sent = tx.send(connection) => sent.is_ok(),
    }
}

async fn run_udp(
    socket: Arc<UdpSocket>,
    endpoint: Arc<EndpointDescriptor>,
    tx: mpsc::Sender<InboundConnection>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = timeout(UDP_RECV_DEADLINE, socket.recv_from(&mut buf)) => result,
        };

        let (n, sender) = match received {
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "UDP receive failed");
                continue;
            }
            Ok(Ok((0, _))) => continue,
            Ok(Ok(received)) => received,
        };

        trace!(endpoint = %endpoint, %sender, bytes = n, "Datagram received");

        let datagram = InboundConnection::Datagram {
            socket: socket.clone(),
            sender,
            payload: Bytes::copy_from_slice(&buf[..n]),
            handle: ConnectionHandle::new(),
        };
        if !publish(&tx, &shutdown, datagram).await {
            break;
        }
    }

    debug!(endpoint = %endpoint, "UDP listener stopped");
}

enum StreamSource {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
    Tls(TcpListener, TlsAcceptor),
}

enum Accepted {
    Ready(BoxedStream, PeerAddr),
    /// Raw TCP stream still owing a TLS handshake
    Handshake(TcpStream, SocketAddr),
}

impl StreamSource {
    fn deadline(&self) -> Duration {
        match self {
            StreamSource::Tcp(_) => TCP_ACCEPT_DEADLINE,
            #[cfg(unix)]
            StreamSource::Unix(_) => UNIX_ACCEPT_DEADLINE,
            StreamSource::Tls(..) => TLS_ACCEPT_DEADLINE,
        }
    }

    /// Unix connections are not tracked for sweeping or shutdown abort
    fn tracks_connections(&self) -> bool {
        match self {
            StreamSource::Tcp(_) | StreamSource::Tls(..) => true,
            #[cfg(unix)]
            StreamSource::Unix(_) => false,
        }
    }

    async fn accept(&self) -> io::Result<Accepted> {
        match self {
            StreamSource::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                Ok(Accepted::Ready(Box::new(stream), PeerAddr::Socket(peer)))
            }
            #[cfg(unix)]
            StreamSource::Unix(listener) => {
                let (stream, addr) = listener.accept().await?;
                let peer = PeerAddr::Unix(addr.as_pathname().map(Path::to_path_buf));
                Ok(Accepted::Ready(Box::new(stream), peer))
            }
            StreamSource::Tls(listener, _) => {
                let (stream, peer) = listener.accept().await?;
                Ok(Accepted::Handshake(stream, peer))
            }
        }
    }
}

async fn run_stream(
    source: StreamSource,
    endpoint: Arc<EndpointDescriptor>,
    tx: mpsc::Sender<InboundConnection>,
    shutdown: CancellationToken,
) {
    let tracker = Arc::new(ConnectionTracker::new());
    let tracking = source.tracks_connections();
    let deadline = source.deadline();
    let mut consecutive_timeouts: u32 = 0;

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = timeout(deadline, source.accept()) => result,
        };

        let accepted = match accepted {
            Err(_) => {
                consecutive_timeouts += 1;
                if tracking && consecutive_timeouts >= SWEEP_AFTER_TIMEOUTS {
                    let swept = tracker.sweep();
                    if swept > 0 {
                        trace!(endpoint = %endpoint, swept, "Swept closed connections");
                    }
                }
                continue;
            }
            Ok(Err(e)) => {
                warn!(endpoint = %endpoint, error = %e, "Accept failed");
                continue;
            }
            Ok(Ok(accepted)) => accepted,
        };
        consecutive_timeouts = 0;

        match accepted {
            Accepted::Ready(stream, peer) => {
                debug!(endpoint = %endpoint, peer_addr = %peer, "Accepted connection");
                let handle = ConnectionHandle::new();
                if tracking {
                    tracker.track(handle.clone());
                }
                let connection = InboundConnection::Stream {
                    stream,
                    peer,
                    handle,
                };
                if !publish(&tx, &shutdown, connection).await {
                    break;
                }
            }
            Accepted::Handshake(stream, peer) => {
                if let StreamSource::Tls(_, acceptor) = &source {
                    tokio::spawn(complete_handshake(
                        acceptor.clone(),
                        stream,
                        peer,
                        tx.clone(),
                        shutdown.clone(),
                        tracker.clone(),
                    ));
                }
            }
        }
    }

    if tracking {
        let aborted = tracker.abort_all();
        if aborted > 0 {
            info!(endpoint = %endpoint, aborted, "Closing tracked connections");
        }
    }
    debug!(endpoint = %endpoint, "Listener stopped");
}

async fn complete_handshake(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer: SocketAddr,
    tx: mpsc::Sender<InboundConnection>,
    shutdown: CancellationToken,
    tracker: Arc<ConnectionTracker>,
) {
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)) => result,
    };

    let tls_stream = match handshake {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => {
            warn!(peer_addr = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer_addr = %peer, "TLS handshake timed out");
            return;
        }
    };

    debug!(peer_addr = %peer, "TLS handshake complete");

    if shutdown.is_cancelled() {
        return;
    }

    let handle = ConnectionHandle::new();
    tracker.track(handle.clone());
    let connection = InboundConnection::Stream {
        stream: Box::new(tls_stream),
        peer: PeerAddr::Socket(peer),
        handle,
    };
    publish(&tx, &shutdown, connection).await;
}
