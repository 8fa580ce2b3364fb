//! Route orchestration for sockbridge
//!
//! A [`Tunnel`] ties one inbound listener to one outbound endpoint. Every
//! accepted connection is handed to the [`ExchangeEngine`], which relays it in
//! full duplex or as a single datagram request/response depending on the
//! transport pair.

pub mod config;
pub mod error;
pub mod exchange;
pub mod tunnel;

pub use config::RouteConfig;
pub use error::{ExchangeError, TunnelError};
pub use exchange::{ExchangeEngine, ExchangeReport, PumpEnd, PumpReport, RelayLimits};
pub use tunnel::{BoundTunnel, Tunnel};
