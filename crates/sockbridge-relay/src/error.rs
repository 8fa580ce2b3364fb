use sockbridge_cert::CertError;
use sockbridge_proto::AddressError;
use sockbridge_transport::TransportError;
use thiserror::Error;

/// Errors that stop a route from starting
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Address error: {0}")]
    Address(#[from] AddressError),

    #[error("Certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors that end a single exchange
#[derive(Error, Debug)]
pub enum ExchangeError {
    #[error("Dial error: {0}")]
    Dial(#[from] TransportError),

    #[error("Relay write failed: {0}")]
    RelayWriteFailed(String),

    #[error("Outbound is connectionless, cannot relay a stream")]
    UnsupportedDirection,
}
