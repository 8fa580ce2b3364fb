//! Tunnel orchestrator: one listener, one dialer pool, one exchange per
//! accepted connection

use std::net::SocketAddr;
use std::sync::Arc;

use sockbridge_cert::{provision, CertificateAuthority, PeerRole, SecurityPolicy};
use sockbridge_proto::{resolve_endpoint, EndpointDescriptor, RelayMode};
use sockbridge_transport::{DialerPool, Listener};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RouteConfig;
use crate::error::TunnelError;
use crate::exchange::{ExchangeEngine, RelayLimits};

/// A configured route, validated but not yet listening
#[derive(Debug)]
pub struct Tunnel {
    name: String,
    inbound: Arc<EndpointDescriptor>,
    outbound: Arc<EndpointDescriptor>,
    mode: RelayMode,
    limits: RelayLimits,
}

impl Tunnel {
    /// Resolve both endpoints, check the transport pair and provision TLS
    /// material for whichever side speaks TLS.
    pub fn from_route(
        route: &RouteConfig,
        ca: &CertificateAuthority,
        policy: &SecurityPolicy,
    ) -> Result<Self, TunnelError> {
        let mut inbound = resolve_endpoint(&route.inbound)?;
        let mut outbound = resolve_endpoint(&route.outbound)?;

        let mode = RelayMode::for_endpoints(&inbound, &outbound)?;

        if inbound.is_tls() {
            let settings = route.inbound_tls()?;
            inbound = inbound.with_tls(provision(PeerRole::Inbound, &settings, ca, policy)?);
        }
        if outbound.is_tls() {
            let settings = route.outbound_tls();
            outbound = outbound.with_tls(provision(PeerRole::Outbound, &settings, ca, policy)?);
        }

        debug!(route = %route.name, inbound = %inbound, outbound = %outbound, ?mode, "Route configured");

        Ok(Self {
            name: route.name.clone(),
            inbound: Arc::new(inbound),
            outbound: Arc::new(outbound),
            mode,
            limits: RelayLimits::default(),
        })
    }

    pub fn with_limits(mut self, limits: RelayLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inbound(&self) -> &Arc<EndpointDescriptor> {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<EndpointDescriptor> {
        &self.outbound
    }

    pub fn mode(&self) -> RelayMode {
        self.mode
    }

    /// Bind the inbound listener
    pub async fn bind(self) -> Result<BoundTunnel, TunnelError> {
        let listener = Listener::bind(self.inbound.clone()).await?;
        Ok(BoundTunnel {
            tunnel: self,
            listener,
        })
    }

    /// Bind and serve until `shutdown` is cancelled
    pub async fn serve(
        self,
        pool: Arc<DialerPool>,
        shutdown: CancellationToken,
    ) -> Result<(), TunnelError> {
        self.bind().await?.serve(pool, shutdown).await;
        Ok(())
    }
}

/// A route whose listener is bound
pub struct BoundTunnel {
    tunnel: Tunnel,
    listener: Listener,
}

impl BoundTunnel {
    pub fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    /// Bound inbound address; `None` for Unix sockets
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr()
    }

    /// Relay connections until shutdown. Returns only once the accept loop
    /// has stopped and every exchange it started has finished.
    pub async fn serve(self, pool: Arc<DialerPool>, shutdown: CancellationToken) {
        let BoundTunnel { tunnel, listener } = self;
        let name: Arc<str> = Arc::from(tunnel.name.as_str());

        info!(
            route = %name,
            inbound = %tunnel.inbound,
            outbound = %tunnel.outbound,
            "Route started"
        );

        let engine = Arc::new(ExchangeEngine::new(
            tunnel.outbound.clone(),
            pool,
            tunnel.limits,
        ));
        let mut task = listener.serve(shutdown);
        let exchanges = TaskTracker::new();

        while let Some(connection) = task.connections.recv().await {
            let engine = engine.clone();
            let name = name.clone();

            exchanges.spawn(async move {
                let peer = connection.peer();
                let id = connection.handle().id();
                match engine.run(connection).await {
                    Ok(report) => {
                        info!(route = %name, peer_addr = %peer, id, "Exchange finished: {}", report)
                    }
                    Err(e) => warn!(route = %name, peer_addr = %peer, id, error = %e, "Exchange failed"),
                }
            });
        }

        if let Err(e) = task.handle.await {
            error!(route = %name, error = %e, "Listener task failed");
        }

        exchanges.close();
        if !exchanges.is_empty() {
            debug!(route = %name, pending = exchanges.len(), "Waiting for exchanges");
        }
        exchanges.wait().await;

        info!(route = %name, "Route stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sockbridge_cert::CertError;
    use sockbridge_proto::AddressError;

    #[test]
    fn test_stream_to_udp_rejected() {
        let ca = CertificateAuthority::generate().unwrap();
        let route = RouteConfig::new("bad", "tcp://127.0.0.1:0", "udp://127.0.0.1:53");

        assert!(matches!(
            Tunnel::from_route(&route, &ca, &SecurityPolicy::default()),
            Err(TunnelError::Address(AddressError::UnsupportedDirection { .. }))
        ));
    }

    #[test]
    fn test_udp_to_stream_accepted() {
        let ca = CertificateAuthority::generate().unwrap();
        let route = RouteConfig::new("dns", "udp://127.0.0.1:0", "tcp://127.0.0.1:53");

        let tunnel = Tunnel::from_route(&route, &ca, &SecurityPolicy::default()).unwrap();
        assert_eq!(tunnel.mode(), RelayMode::SingleShot);
        assert_eq!(tunnel.name(), "dns");
    }

    #[test]
    fn test_tls_inbound_provisioned() {
        let ca = CertificateAuthority::generate().unwrap();
        let route = RouteConfig {
            client_ca: Some("inner".to_string()),
            ..RouteConfig::new("tls", "tls://127.0.0.1:0", "tcp://127.0.0.1:80")
        };

        let tunnel = Tunnel::from_route(&route, &ca, &SecurityPolicy::default()).unwrap();
        let material = tunnel.inbound().tls().unwrap();
        assert!(material.verify_peer);
        assert!(tunnel.outbound().tls().is_none());
    }

    #[test]
    fn test_tls_without_trust_fails() {
        let ca = CertificateAuthority::generate().unwrap();
        let route = RouteConfig::new("tls", "tcp://127.0.0.1:0", "tls://127.0.0.1:443");

        assert!(matches!(
            Tunnel::from_route(&route, &ca, &SecurityPolicy::default()),
            Err(TunnelError::Cert(CertError::MissingTrustAnchor { .. }))
        ));
    }
}
