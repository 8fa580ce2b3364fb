//! Type-erased byte streams

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the duplex relay can copy bytes through
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// TCP, Unix and TLS streams all travel as this type
pub type BoxedStream = Box<dyn RelayStream>;
