//! Inbound and outbound connection types and their lifecycle handles

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::stream::BoxedStream;

/// Address of the remote side of an accepted connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    Socket(SocketAddr),
    /// Unix peers are usually unnamed
    Unix(Option<PathBuf>),
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Socket(addr) => write!(f, "{}", addr),
            PeerAddr::Unix(Some(path)) => write!(f, "{}", path.display()),
            PeerAddr::Unix(None) => write!(f, "unix:unnamed"),
        }
    }
}

/// Lifecycle of one relayed connection.
///
/// The exchange marks it finished when the relay is over; the listener can
/// abort it on shutdown. Both operations are idempotent.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    finished: AtomicBool,
    abort: CancellationToken,
}

impl ConnectionHandle {
    pub fn new() -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            finished: AtomicBool::new(false),
            abort: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Mark the connection closed. Returns `true` only for the first call.
    pub fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::AcqRel)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Ask the relay owning this connection to stop
    pub fn abort(&self) {
        self.abort.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once [`abort`](Self::abort) has been called
    pub fn aborted(&self) -> WaitForCancellationFuture<'_> {
        self.abort.cancelled()
    }
}

/// Handles of the connections a stream listener has accepted
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    handles: Mutex<Vec<Arc<ConnectionHandle>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, handle: Arc<ConnectionHandle>) {
        if let Ok(mut handles) = self.handles.lock() {
            handles.push(handle);
        }
    }

    /// Drop handles of finished connections, returning how many were removed
    pub fn sweep(&self) -> usize {
        match self.handles.lock() {
            Ok(mut handles) => {
                let before = handles.len();
                handles.retain(|handle| !handle.is_finished());
                before - handles.len()
            }
            Err(_) => 0,
        }
    }

    /// Abort every connection still tracked
    pub fn abort_all(&self) -> usize {
        match self.handles.lock() {
            Ok(mut handles) => {
                let live: Vec<_> = handles.drain(..).filter(|h| !h.is_finished()).collect();
                for handle in &live {
                    handle.abort();
                }
                live.len()
            }
            Err(_) => 0,
        }
    }

    pub fn len(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A connection produced by a listener, owned by one exchange
pub enum InboundConnection {
    /// An accepted TCP, Unix or TLS stream
    Stream {
        stream: BoxedStream,
        peer: PeerAddr,
        handle: Arc<ConnectionHandle>,
    },
    /// One datagram received on a shared UDP socket
    Datagram {
        socket: Arc<UdpSocket>,
        sender: SocketAddr,
        payload: Bytes,
        handle: Arc<ConnectionHandle>,
    },
}

impl InboundConnection {
    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        match self {
            InboundConnection::Stream { handle, .. } | InboundConnection::Datagram { handle, .. } => {
                handle
            }
        }
    }

    pub fn peer(&self) -> PeerAddr {
        match self {
            InboundConnection::Stream { peer, .. } => peer.clone(),
            InboundConnection::Datagram { sender, .. } => PeerAddr::Socket(*sender),
        }
    }

    pub fn is_datagram(&self) -> bool {
        matches!(self, InboundConnection::Datagram { .. })
    }
}

impl fmt::Debug for InboundConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InboundConnection::Stream { peer, handle, .. } => f
                .debug_struct("Stream")
                .field("peer", peer)
                .field("id", &handle.id())
                .finish(),
            InboundConnection::Datagram {
                sender,
                payload,
                handle,
                ..
            } => f
                .debug_struct("Datagram")
                .field("sender", sender)
                .field("len", &payload.len())
                .field("id", &handle.id())
                .finish(),
        }
    }
}

/// A connection opened by a dialer
pub enum OutboundConnection {
    Stream(BoxedStream),
    /// A UDP socket connected to the outbound address
    Datagram(UdpSocket),
}

impl OutboundConnection {
    /// Write `buf` in a single call, returning how much was accepted
    pub async fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            OutboundConnection::Stream(stream) => {
                let n = stream.write(buf).await?;
                stream.flush().await?;
                Ok(n)
            }
            OutboundConnection::Datagram(socket) => socket.send(buf).await,
        }
    }

    /// One read; `Ok(0)` on a stream means EOF
    pub async fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OutboundConnection::Stream(stream) => stream.read(buf).await,
            OutboundConnection::Datagram(socket) => socket.recv(buf).await,
        }
    }

    /// Shut the connection down. Datagram sockets are just dropped.
    pub async fn close(self) -> io::Result<()> {
        match self {
            OutboundConnection::Stream(mut stream) => stream.shutdown().await,
            OutboundConnection::Datagram(_) => Ok(()),
        }
    }

    pub fn into_stream(self) -> Option<BoxedStream> {
        match self {
            OutboundConnection::Stream(stream) => Some(stream),
            OutboundConnection::Datagram(_) => None,
        }
    }
}
