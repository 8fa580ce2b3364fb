//! End-to-end routes over loopback

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sockbridge_cert::{CertificateAuthority, SecurityPolicy};
use sockbridge_proto::{resolve_endpoint, TlsMaterial};
use sockbridge_relay::{RelayLimits, RouteConfig, Tunnel};
use sockbridge_transport::{DialerPool, InboundConnection, Listener};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("sockbridge_relay=debug,sockbridge_transport=debug")
        .with_test_writer()
        .try_init();
}

fn fast_limits() -> RelayLimits {
    RelayLimits {
        read_deadline: Duration::from_millis(200),
        max_idle_windows: 600,
        response_timeout: Duration::from_millis(300),
    }
}

/// TCP backend echoing everything back; reports when a client hangs up
async fn spawn_tcp_echo() -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (done_tx, done_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match socket.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    seen.extend_from_slice(&buf[..n]);
                    if socket.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = done_tx.send(seen);
    });

    (addr, done_rx)
}

/// UDP backend answering each datagram with `reply:` + payload, or never
async fn spawn_udp_backend(answer: bool) -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                break;
            };
            if answer {
                let mut reply = b"reply:".to_vec();
                reply.extend_from_slice(&buf[..n]);
                let _ = socket.send_to(&reply, from).await;
            }
        }
    });

    addr
}

/// TLS backend on a sockbridge listener, echoing its first connection
async fn spawn_tls_echo(material: TlsMaterial) -> (SocketAddr, CancellationToken) {
    let endpoint = resolve_endpoint("tls://127.0.0.1:0")
        .unwrap()
        .with_tls(material);
    let listener = Listener::bind(Arc::new(endpoint)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let mut task = listener.serve(shutdown.clone());

    tokio::spawn(async move {
        if let Some(InboundConnection::Stream { mut stream, .. }) = task.connections.recv().await {
            let mut buf = [0u8; 1024];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    });

    (addr, shutdown)
}

async fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
        .await
        .expect("no echo through the outbound TLS leg")
        .unwrap();
    echoed
}

async fn start(
    route: RouteConfig,
    ca: &CertificateAuthority,
    limits: RelayLimits,
) -> (SocketAddr, CancellationToken, JoinHandle<()>) {
    let tunnel = Tunnel::from_route(&route, ca, &SecurityPolicy::default())
        .expect("route config")
        .with_limits(limits);
    let bound = tunnel.bind().await.expect("bind");
    let addr = bound.local_addr().expect("socket listener");

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(bound.serve(Arc::new(DialerPool::new()), shutdown.clone()));
    (addr, shutdown, handle)
}

#[tokio::test]
async fn test_tcp_duplex_relay() {
    init_tracing();
    let ca = CertificateAuthority::generate().unwrap();
    let (backend, backend_done) = spawn_tcp_echo().await;

    let route = RouteConfig::new("echo", "tcp://127.0.0.1:0", format!("tcp://{}", backend));
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    for chunk in [&b"first "[..], b"second ", b"third"] {
        client.write_all(chunk).await.unwrap();
        let mut echoed = vec![0u8; chunk.len()];
        timeout(TEST_TIMEOUT, client.read_exact(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed, chunk);
    }

    // Closing the client ends the exchange and closes the backend side
    drop(client);
    let seen = timeout(Duration::from_secs(2), backend_done)
        .await
        .expect("backend connection not closed within the read window")
        .unwrap();
    assert_eq!(seen, b"first second third");

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_backend_close_ends_relay() {
    let ca = CertificateAuthority::generate().unwrap();

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_addr = backend.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        socket.write_all(b"bye").await.unwrap();
        // Dropping closes the outbound side
    });

    let route = RouteConfig::new("bye", "tcp://127.0.0.1:0", format!("tcp://{}", backend_addr));
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut received = Vec::new();
    timeout(Duration::from_secs(2), client.read_to_end(&mut received))
        .await
        .expect("inbound not closed after backend hung up")
        .unwrap();
    assert_eq!(received, b"bye");

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_idle_ceiling_closes_connection() {
    let ca = CertificateAuthority::generate().unwrap();
    let (backend, backend_done) = spawn_tcp_echo().await;

    let limits = RelayLimits {
        read_deadline: Duration::from_millis(50),
        max_idle_windows: 4,
        response_timeout: Duration::from_millis(100),
    };
    let route = RouteConfig::new("idle", "tcp://127.0.0.1:0", format!("tcp://{}", backend));
    let (addr, shutdown, handle) = start(route, &ca, limits).await;

    // Connect and stay silent; the relay gives up on its own
    let mut client = TcpStream::connect(addr).await.unwrap();
    let mut buf = [0u8; 8];
    let n = timeout(Duration::from_secs(3), client.read(&mut buf))
        .await
        .expect("idle connection was not closed")
        .unwrap();
    assert_eq!(n, 0);
    assert!(timeout(TEST_TIMEOUT, backend_done).await.unwrap().unwrap().is_empty());

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_udp_single_shot_reply() {
    let ca = CertificateAuthority::generate().unwrap();
    let backend = spawn_udp_backend(true).await;

    let route = RouteConfig::new("dns", "udp://127.0.0.1:0", format!("udp://{}", backend));
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"query", addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, from) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, addr);
    assert_eq!(&buf[..n], b"reply:query");

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_udp_no_reply_sends_nothing_back() {
    let ca = CertificateAuthority::generate().unwrap();
    let backend = spawn_udp_backend(false).await;

    let route = RouteConfig::new("silent", "udp://127.0.0.1:0", format!("udp://{}", backend));
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"anyone?", addr).await.unwrap();

    let mut buf = [0u8; 64];
    let result = timeout(Duration::from_secs(1), client.recv_from(&mut buf)).await;
    assert!(result.is_err(), "no datagram expected, got {:?}", result);

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_udp_to_tcp_single_shot() {
    let ca = CertificateAuthority::generate().unwrap();
    let (backend, _backend_done) = spawn_tcp_echo().await;

    let route = RouteConfig::new("u2t", "udp://127.0.0.1:0", format!("tcp://{}", backend));
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(b"ping", addr).await.unwrap();

    let mut buf = [0u8; 64];
    let (n, _) = timeout(TEST_TIMEOUT, client.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"ping");

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[cfg(unix)]
#[tokio::test]
async fn test_tcp_to_unix_relay() {
    let ca = CertificateAuthority::generate().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("backend.sock");

    let backend = tokio::net::UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        socket.write_all(&buf[..n]).await.unwrap();
    });

    let route = RouteConfig::new(
        "to-unix",
        "tcp://127.0.0.1:0",
        format!("unix://{}", path.display()),
    );
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"over unix").await.unwrap();
    let mut buf = [0u8; 9];
    timeout(TEST_TIMEOUT, client.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"over unix");

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_mutual_tls_inbound_with_inner_ca() {
    init_tracing();
    let ca = CertificateAuthority::generate().unwrap();
    let (backend, _backend_done) = spawn_tcp_echo().await;

    let route = RouteConfig {
        client_ca: Some("inner".to_string()),
        ..RouteConfig::new("mtls", "tls://127.0.0.1:0", format!("tcp://{}", backend))
    };
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    // Client with a leaf from the same CA, verifying the server against it
    let (chain, key) = ca.issue_leaf("client", &[]).unwrap().into_parts();
    let material = TlsMaterial::new(chain, key).with_peer_verification(ca.cert_der().clone());
    let client_endpoint = resolve_endpoint(&format!("tls://127.0.0.1:{}", addr.port()))
        .unwrap()
        .with_tls(material);
    let pool = DialerPool::new();
    let dialer = pool.get_dialer(&Arc::new(client_endpoint)).unwrap();

    let mut client = timeout(TEST_TIMEOUT, dialer.connect())
        .await
        .unwrap()
        .expect("mutual TLS dial");
    client.send(b"through tls").await.unwrap();

    let mut buf = [0u8; 64];
    let n = timeout(TEST_TIMEOUT, client.recv(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf[..n], b"through tls");

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_serving() {
    let ca = CertificateAuthority::generate().unwrap();
    let route = RouteConfig::new("idle", "tcp://127.0.0.1:0", "tcp://127.0.0.1:9");
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    shutdown.cancel();
    timeout(TEST_TIMEOUT, handle)
        .await
        .expect("serve did not return after shutdown")
        .unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_tls_outbound_with_inner_ca() {
    init_tracing();
    let ca = CertificateAuthority::generate().unwrap();

    // Backend presents a leaf from the process CA and requires a client
    // certificate from it as well
    let (chain, key) = ca.issue_server_leaf("localhost", None).unwrap().into_parts();
    let backend_material =
        TlsMaterial::new(chain, key).with_peer_verification(ca.cert_der().clone());
    let (backend, backend_shutdown) = spawn_tls_echo(backend_material).await;

    let route = RouteConfig {
        server_ca: Some("inner".to_string()),
        ..RouteConfig::new(
            "to-tls",
            "tcp://127.0.0.1:0",
            format!("tls://127.0.0.1:{}", backend.port()),
        )
    };
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    assert_eq!(round_trip(addr, b"re-encrypted").await, b"re-encrypted");

    shutdown.cancel();
    backend_shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_tls_outbound_skip_verify_accepts_foreign_server() {
    let ca = CertificateAuthority::generate().unwrap();
    let foreign = CertificateAuthority::generate().unwrap();

    let (chain, key) = foreign
        .issue_server_leaf("localhost", None)
        .unwrap()
        .into_parts();
    let (backend, backend_shutdown) = spawn_tls_echo(TlsMaterial::new(chain, key)).await;

    let route = RouteConfig {
        skip_verify_outbound: true,
        ..RouteConfig::new(
            "no-check",
            "tcp://127.0.0.1:0",
            format!("tls://127.0.0.1:{}", backend.port()),
        )
    };
    let (addr, shutdown, handle) = start(route, &ca, fast_limits()).await;

    assert_eq!(round_trip(addr, b"ping").await, b"ping");

    shutdown.cancel();
    backend_shutdown.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap();
}
