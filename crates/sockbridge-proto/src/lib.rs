//! Sockbridge endpoint definitions
//!
//! This crate defines how route strings such as `tls://0.0.0.0:8443` or
//! `unix:///run/app.sock` are normalized into typed endpoints, the TLS material
//! attached to them, and the relay policy derived from an inbound/outbound pair.

pub mod endpoint;
pub mod policy;
pub mod tls;

pub use endpoint::{resolve_endpoint, AddressError, EndpointDescriptor, EndpointId, Transport};
pub use policy::RelayMode;
pub use tls::TlsMaterial;

/// Scheme assumed when a route string carries none
pub const DEFAULT_SCHEME: &str = "tcp";

/// Largest datagram relayed in a single UDP exchange
pub const DATAGRAM_BUFFER_SIZE: usize = 1500;
