//! Integration tests for the worker-side proxy: a live ProxyServer routes to
//! a mock upstream over loopback sockets.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use switchyard::config::{Config, ServiceDefinition};
use switchyard::proxy::ProxyServer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct MockUpstream {
    addr: SocketAddr,
    hits: Arc<AtomicUsize>,
}

/// Start an upstream that answers every request with a body describing the
/// request line and Host header it saw.
async fn start_mock_upstream() -> MockUpstream {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_accept = Arc::clone(&hits);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            let hits = Arc::clone(&hits_accept);
            tokio::spawn(async move {
                hits.fetch_add(1, Ordering::SeqCst);
                let Some(head) = read_head(&mut stream).await else {
                    return;
                };
                let request_line = head.lines().next().unwrap_or("").to_string();
                let host = header_value(&head, "host").unwrap_or_default();
                let body = format!("request_line={}\nhost={}\n", request_line, host);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });

    MockUpstream { addr, hits }
}

/// Start an upstream that accepts WebSocket-style upgrades and then echoes
/// every byte back.
async fn start_mock_ws_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                if read_head(&mut stream).await.is_none() {
                    return;
                }
                let response =
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// Read a request or response head (through the blank line).
async fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = vec![0u8; 8192];
    let mut read = 0;
    loop {
        let n = stream.read(&mut buf[read..]).await.ok()?;
        if n == 0 {
            return None;
        }
        read += n;
        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        if read == buf.len() {
            return None;
        }
    }
    Some(String::from_utf8_lossy(&buf[..read]).to_string())
}

fn header_value(head: &str, name: &str) -> Option<String> {
    head.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

fn test_config(services: Vec<ServiceDefinition>) -> Config {
    Config {
        services,
        cluster_size: 1,
        ..Config::default()
    }
}

fn service(slug: &str, target: String) -> ServiceDefinition {
    ServiceDefinition {
        slug: slug.to_string(),
        target,
    }
}

/// Bind a ProxyServer on an ephemeral loopback port and run it.
fn start_proxy(config: Config) -> (SocketAddr, watch::Sender<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = ProxyServer::bind(
        "127.0.0.1:0".parse().unwrap(),
        Arc::new(config),
        shutdown_rx,
    )
    .unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    (addr, shutdown_tx)
}

/// Send a simple HTTP request and return the whole raw response.
async fn http_get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8_lossy(&response).to_string()
}

fn status_of(response: &str) -> u16 {
    response
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .unwrap_or(0)
}

#[tokio::test]
async fn proxies_request_and_strips_slug() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/api/x").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("request_line=GET /api/x HTTP/1.1"));
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn returns_404_for_unknown_slug() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/nope/api/x").await;
    assert_eq!(status_of(&response), 404);
    assert!(header_value(&response, "x-proxy-error")
        .is_some_and(|v| v == "ROUTE_NOT_FOUND"));
    // No proxying was attempted
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn returns_404_for_root_path() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/").await;
    assert_eq!(status_of(&response), 404);
    assert_eq!(upstream.hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn slug_retained_when_strip_disabled() {
    let upstream = start_mock_upstream().await;
    let mut config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    config.remove_route_slug = false;
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/api/x").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("request_line=GET /svc/api/x HTTP/1.1"));
}

#[tokio::test]
async fn doubled_slash_forwarded_unnormalized() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}/", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/a").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("request_line=GET //a HTTP/1.1"));
}

#[tokio::test]
async fn query_string_forwarded() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/api?x=1&y=2").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains("request_line=GET /api?x=1&y=2 HTTP/1.1"));
}

#[tokio::test]
async fn preserves_client_host_by_default() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/a").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains(&format!("host={}", addr)));
}

#[tokio::test]
async fn change_origin_rewrites_host() {
    let upstream = start_mock_upstream().await;
    let mut config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    config.change_origin = true;
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/a").await;
    assert_eq!(status_of(&response), 200);
    assert!(response.contains(&format!("host={}", upstream.addr)));
}

#[tokio::test]
async fn bad_gateway_when_upstream_unreachable() {
    // Grab a port that nothing is listening on
    let closed_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let config = test_config(vec![service(
        "svc",
        format!("http://127.0.0.1:{}", closed_port),
    )]);
    let (addr, _shutdown) = start_proxy(config);

    let response = http_get(addr, "/svc/a").await;
    assert_eq!(status_of(&response), 502);
    assert!(header_value(&response, "x-proxy-error")
        .is_some_and(|v| v == "UPSTREAM_UNREACHABLE"));
}

#[tokio::test]
async fn websocket_upgrade_relays_bytes() {
    let upstream_addr = start_mock_ws_upstream().await;
    let mut config = test_config(vec![service("svc", format!("http://{}", upstream_addr))]);
    config.enable_ws = true;
    let (addr, _shutdown) = start_proxy(config);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /svc/ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 101"));

    // After the handshake the relay is a plain byte pipe to the echo server
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
}

#[tokio::test]
async fn upgrade_forwarded_as_plain_http_when_ws_disabled() {
    let upstream = start_mock_upstream().await;
    let config = test_config(vec![service("svc", format!("http://{}", upstream.addr))]);
    let (addr, _shutdown) = start_proxy(config);

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET /svc/ws HTTP/1.1\r\nHost: {}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
        addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let head = read_head(&mut stream).await.unwrap();
    // enableWS is off, so the request went through the plain HTTP path
    assert!(head.starts_with("HTTP/1.1 200"));
}
