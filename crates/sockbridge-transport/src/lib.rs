//! Socket transports for sockbridge routes
//!
//! One listener and one dialer per transport kind (TCP, UDP, Unix, TLS over
//! TCP), dispatched through closed enums rather than trait objects:
//!
//! ```text
//!   Listener::bind ──> accept loop ──> mpsc<InboundConnection>
//!                                            │
//!                                            ↓
//!                                      exchange engine
//!                                            │
//!   DialerPool::get_dialer ──> Dialer::connect ──> OutboundConnection
//! ```

pub mod connection;
pub mod dialer;
pub mod listener;
pub mod stream;
pub mod tls;

pub use connection::{
    ConnectionHandle, ConnectionTracker, InboundConnection, OutboundConnection, PeerAddr,
};
pub use dialer::{Dialer, DialerPool};
pub use listener::{Listener, ListenerTask};
pub use stream::{BoxedStream, RelayStream};

use std::time::Duration;
use thiserror::Error;

/// Accept deadline for TCP listeners
pub const TCP_ACCEPT_DEADLINE: Duration = Duration::from_secs(10);

/// Accept deadline for Unix listeners
pub const UNIX_ACCEPT_DEADLINE: Duration = Duration::from_secs(10);

/// Accept deadline for TLS listeners
pub const TLS_ACCEPT_DEADLINE: Duration = Duration::from_secs(1);

/// Receive deadline for UDP listeners
pub const UDP_RECV_DEADLINE: Duration = Duration::from_secs(3);

/// Upper bound on a single inbound TLS handshake
pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive accept timeouts before closed connections are swept
pub const SWEEP_AFTER_TIMEOUTS: u32 = 3;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Failed to listen on {address}: {reason}")]
    ListenFailed { address: String, reason: String },

    #[error("Failed to dial {address}: {reason}")]
    DialFailed { address: String, reason: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Transport does not support stream multiplexing")]
    MultiplexUnsupported,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;
