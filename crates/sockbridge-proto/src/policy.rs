//! Relay policy for an inbound/outbound transport pair

use tracing::warn;

use crate::endpoint::{AddressError, EndpointDescriptor};

/// How payload is moved between the two sides of a route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMode {
    /// Two concurrent copy loops until the pair terminates
    Duplex,
    /// One datagram in, at most one response out
    SingleShot,
}

impl RelayMode {
    /// Decide the relay mode for a route, rejecting stream-to-datagram routes.
    pub fn for_endpoints(
        inbound: &EndpointDescriptor,
        outbound: &EndpointDescriptor,
    ) -> Result<Self, AddressError> {
        let inbound_udp = inbound.require_transport()?.is_connectionless();
        let outbound_udp = outbound.require_transport()?.is_connectionless();

        match (inbound_udp, outbound_udp) {
            (false, false) => Ok(RelayMode::Duplex),
            (false, true) => Err(AddressError::UnsupportedDirection {
                inbound: inbound.addr(),
                outbound: outbound.addr(),
            }),
            (true, false) => {
                warn!(
                    inbound = %inbound,
                    outbound = %outbound,
                    "UDP inbound relays one response per datagram; stream semantics are not preserved"
                );
                Ok(RelayMode::SingleShot)
            }
            (true, true) => Ok(RelayMode::SingleShot),
        }
    }
}
