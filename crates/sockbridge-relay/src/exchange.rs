//! Exchange engine: moves bytes between one inbound connection and a freshly
//! dialed outbound connection
//!
//! Stream pairs run two copy loops. Each read waits at most one read
//! deadline. A deadline expiry ends the loop if the other direction has
//! already terminated the pair; otherwise it counts as one idle window, and
//! too many consecutive idle windows stop that direction from our side. The
//! relay is over once both directions have stopped.
//!
//! Datagrams get exactly one write to the outbound and at most one response
//! sent back to the original sender.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use sockbridge_proto::{EndpointDescriptor, DATAGRAM_BUFFER_SIZE};
use sockbridge_transport::{
    BoxedStream, ConnectionHandle, DialerPool, InboundConnection, OutboundConnection,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::error::ExchangeError;

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Timing limits for exchanges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayLimits {
    /// Longest a single read waits in a duplex copy loop
    pub read_deadline: Duration,
    /// Consecutive empty read windows before the relay gives up
    pub max_idle_windows: u32,
    /// Longest a single-shot exchange waits for the outbound reply
    pub response_timeout: Duration,
}

impl Default for RelayLimits {
    fn default() -> Self {
        Self {
            read_deadline: Duration::from_secs(3),
            max_idle_windows: 600,
            response_timeout: Duration::from_secs(3),
        }
    }
}

/// Why one copy direction stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// The reading side sent EOF
    PeerClosed,
    /// The opposite direction ended first
    PairTerminated,
    ReadFailed,
    WriteFailed,
    /// Too long without traffic; a server-side timeout, not a peer close
    IdleCeiling,
    /// The listener aborted the connection on shutdown
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpReport {
    pub bytes: u64,
    pub end: PumpEnd,
}

/// Outcome of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeReport {
    Duplex {
        /// inbound -> outbound
        upstream: PumpReport,
        /// outbound -> inbound
        downstream: PumpReport,
    },
    SingleShot {
        request_bytes: usize,
        /// Bytes sent back, `None` if nothing came back in time
        response_bytes: Option<usize>,
    },
}

impl fmt::Display for ExchangeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeReport::Duplex {
                upstream,
                downstream,
            } => write!(
                f,
                "up {} bytes ({:?}), down {} bytes ({:?})",
                upstream.bytes, upstream.end, downstream.bytes, downstream.end
            ),
            ExchangeReport::SingleShot {
                request_bytes,
                response_bytes: Some(n),
            } => write!(f, "request {} bytes, response {} bytes", request_bytes, n),
            ExchangeReport::SingleShot {
                request_bytes,
                response_bytes: None,
            } => write!(f, "request {} bytes, no response", request_bytes),
        }
    }
}

/// Relays inbound connections of one route to its outbound endpoint
pub struct ExchangeEngine {
    outbound: Arc<EndpointDescriptor>,
    pool: Arc<DialerPool>,
    limits: RelayLimits,
}

impl ExchangeEngine {
    pub fn new(outbound: Arc<EndpointDescriptor>, pool: Arc<DialerPool>, limits: RelayLimits) -> Self {
        Self {
            outbound,
            pool,
            limits,
        }
    }

    pub fn limits(&self) -> RelayLimits {
        self.limits
    }

    /// Run one exchange to completion. The connection handle is marked
    /// finished whatever the outcome.
    pub async fn run(&self, connection: InboundConnection) -> Result<ExchangeReport, ExchangeError> {
        let handle = connection.handle().clone();

        let result = match connection {
            InboundConnection::Stream { stream, .. } => self.relay_duplex(stream, &handle).await,
            InboundConnection::Datagram {
                socket,
                sender,
                payload,
                ..
            } => self.relay_datagram(&socket, sender, payload).await,
        };

        handle.finish();
        result
    }

    async fn relay_duplex(
        &self,
        inbound: BoxedStream,
        handle: &ConnectionHandle,
    ) -> Result<ExchangeReport, ExchangeError> {
        let dialer = self.pool.get_dialer(&self.outbound)?;
        let outbound = dialer
            .connect()
            .await?
            .into_stream()
            .ok_or(ExchangeError::UnsupportedDirection)?;

        let (mut in_read, mut in_write) = tokio::io::split(inbound);
        let (mut out_read, mut out_write) = tokio::io::split(outbound);
        let terminated = AtomicBool::new(false);

        let (upstream, downstream) = tokio::join!(
            pump(&mut in_read, &mut out_write, &terminated, handle, &self.limits),
            pump(&mut out_read, &mut in_write, &terminated, handle, &self.limits),
        );

        trace!(id = handle.id(), "Closing both sides");
        let mut inbound = in_read.unsplit(in_write);
        let mut outbound = out_read.unsplit(out_write);
        let _ = timeout(self.limits.read_deadline, inbound.shutdown()).await;
        let _ = timeout(self.limits.read_deadline, outbound.shutdown()).await;

        Ok(ExchangeReport::Duplex {
            upstream,
            downstream,
        })
    }

    async fn relay_datagram(
        &self,
        socket: &UdpSocket,
        sender: SocketAddr,
        payload: Bytes,
    ) -> Result<ExchangeReport, ExchangeError> {
        let dialer = self.pool.get_dialer(&self.outbound)?;
        let mut outbound = dialer.connect().await?;

        match outbound.send(&payload).await {
            Ok(n) if n == payload.len() => {}
            Ok(n) => {
                close_quietly(outbound).await;
                return Err(ExchangeError::RelayWriteFailed(format!(
                    "short write: {} of {} bytes",
                    n,
                    payload.len()
                )));
            }
            Err(e) => {
                close_quietly(outbound).await;
                return Err(ExchangeError::RelayWriteFailed(e.to_string()));
            }
        }

        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];
        let received = match timeout(self.limits.response_timeout, outbound.recv(&mut buf)).await {
            Err(_) => {
                debug!(%sender, "No response before deadline");
                None
            }
            Ok(Ok(n)) => Some(n),
            Ok(Err(e)) => {
                // Relay read failures still answer the sender, with nothing
                warn!(%sender, error = %e, "Relay read failed");
                Some(0)
            }
        };

        if let Some(n) = received {
            match socket.send_to(&buf[..n], sender).await {
                Ok(sent) if sent < n => {
                    warn!(%sender, sent, expected = n, "Short write back to sender")
                }
                Ok(_) => {}
                Err(e) => warn!(%sender, error = %e, "Failed to write back to sender"),
            }
        }

        close_quietly(outbound).await;

        Ok(ExchangeReport::SingleShot {
            request_bytes: payload.len(),
            response_bytes: received,
        })
    }
}

async fn close_quietly(connection: OutboundConnection) {
    if let Err(e) = connection.close().await {
        trace!(error = %e, "Outbound close failed");
    }
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    terminated: &AtomicBool,
    handle: &ConnectionHandle,
    limits: &RelayLimits,
) -> PumpReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut bytes: u64 = 0;
    let mut idle_windows: u32 = 0;

    let end = loop {
        let read = tokio::select! {
            _ = handle.aborted() => break PumpEnd::Shutdown,
            result = timeout(limits.read_deadline, reader.read(&mut buf)) => result,
        };

        match read {
            Err(_) => {
                if terminated.load(Ordering::Acquire) {
                    break PumpEnd::PairTerminated;
                }
                idle_windows += 1;
                if idle_windows >= limits.max_idle_windows {
                    break PumpEnd::IdleCeiling;
                }
            }
            Ok(Ok(0)) => break PumpEnd::PeerClosed,
            Ok(Ok(n)) => {
                idle_windows = 0;
                if writer.write_all(&buf[..n]).await.is_err() || writer.flush().await.is_err() {
                    break PumpEnd::WriteFailed;
                }
                bytes += n as u64;
            }
            Ok(Err(e)) => {
                trace!(error = %e, "Read failed");
                break PumpEnd::ReadFailed;
            }
        }
    };

    // Only a closed or broken side ends the pair; an idle ceiling or a
    // shutdown stops this direction alone
    if matches!(
        end,
        PumpEnd::PeerClosed | PumpEnd::ReadFailed | PumpEnd::WriteFailed
    ) {
        terminated.store(true, Ordering::Release);
    }
    PumpReport { bytes, end }
}
