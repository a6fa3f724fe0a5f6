//! The relay boundary: sends a routed request to its resolved target URL.
//!
//! The dispatcher treats `ForwardPlan::target_url` as the complete final URL
//! and never re-derives a path from the inbound request. Plain requests go
//! through a pooled HTTP client; WebSocket upgrades are relayed over a raw
//! TCP connection for the lifetime of the socket.

use crate::router::ForwardPlan;
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error};

/// Maximum idle upstream connections kept per host
const POOL_MAX_IDLE_PER_HOST: usize = 10;
/// Idle upstream connection timeout
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Error type for dispatch operations. Every variant is recovered per-request
/// at the server boundary; none may crash the worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The assembled target URL did not parse
    #[error("invalid target url '{0}'")]
    InvalidTarget(String),
    /// The upstream request could not be constructed
    #[error("failed to build upstream request: {0}")]
    RequestBuild(String),
    /// The pooled client failed to complete the exchange
    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),
    /// The raw upstream connection failed
    #[error("upstream connection failed: {0}")]
    Connect(#[source] std::io::Error),
    /// The upstream mishandled the upgrade handshake
    #[error("upgrade handshake failed: {0}")]
    UpgradeHandshake(String),
}

/// Relays requests to upstream targets through a pooled client.
pub struct Dispatcher {
    client: Client<HttpConnector, Incoming>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        Self { client }
    }

    /// Send the request to the plan's target URL and return the upstream
    /// response. Upgrade requests are relayed bidirectionally when the plan
    /// enables WebSocket proxying; otherwise they are forwarded as plain
    /// HTTP, matching a relay that never listens for upgrade events.
    pub async fn dispatch(
        &self,
        req: Request<Incoming>,
        plan: &ForwardPlan,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, DispatchError> {
        let uri: Uri = plan
            .target_url
            .parse()
            .map_err(|_| DispatchError::InvalidTarget(plan.target_url.clone()))?;

        if plan.enable_websocket && is_upgrade_request(&req) {
            self.dispatch_upgrade(req, plan, &uri).await
        } else {
            self.dispatch_http(req, plan, uri).await
        }
    }

    async fn dispatch_http(
        &self,
        req: Request<Incoming>,
        plan: &ForwardPlan,
        uri: Uri,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, DispatchError> {
        let host_override = if plan.change_origin {
            Some(authority_of(&uri).ok_or_else(|| {
                DispatchError::InvalidTarget(plan.target_url.clone())
            })?)
        } else {
            None
        };

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(uri);

        for (key, value) in parts.headers.iter() {
            if host_override.is_some() && key == hyper::header::HOST {
                continue;
            }
            builder = builder.header(key, value);
        }

        if let Some(host) = host_override {
            builder = builder.header(hyper::header::HOST, host);
        }

        let upstream_req = builder
            .body(body)
            .map_err(|e| DispatchError::RequestBuild(e.to_string()))?;

        let response = self.client.request(upstream_req).await?;

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Relay a WebSocket (or other HTTP upgrade) request over a raw TCP
    /// connection: forward the handshake, relay the 101 response, then copy
    /// bytes in both directions until either side closes.
    async fn dispatch_upgrade(
        &self,
        req: Request<Incoming>,
        plan: &ForwardPlan,
        uri: &Uri,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, DispatchError> {
        let host = uri
            .host()
            .ok_or_else(|| DispatchError::InvalidTarget(plan.target_url.clone()))?;
        let port = uri.port_u16().unwrap_or(80);
        let upstream_addr = format!("{}:{}", host, port);

        let host_header = if plan.change_origin {
            authority_of(uri).unwrap_or_else(|| upstream_addr.clone())
        } else {
            req.headers()
                .get(hyper::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(String::from)
                .unwrap_or_else(|| upstream_addr.clone())
        };

        let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
        let raw_request = build_upgrade_request(&req, path, &host_header);

        let mut upstream = TcpStream::connect(&upstream_addr)
            .await
            .map_err(DispatchError::Connect)?;

        upstream
            .write_all(&raw_request)
            .await
            .map_err(DispatchError::Connect)?;

        let mut response_buf = vec![0u8; 4096];
        let n = upstream
            .read(&mut response_buf)
            .await
            .map_err(DispatchError::Connect)?;
        if n == 0 {
            return Err(DispatchError::UpgradeHandshake(
                "upstream closed the connection before responding".to_string(),
            ));
        }

        let (status, response_headers) =
            parse_upgrade_response(&response_buf[..n]).ok_or_else(|| {
                DispatchError::UpgradeHandshake("unparseable upgrade response".to_string())
            })?;

        let mut response = Response::builder().status(status);
        for (name, value) in &response_headers {
            // Hop-by-hop framing headers are hyper's concern on our side
            let name_lower = name.to_lowercase();
            if name_lower == "content-length" || name_lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .expect("valid response builder");

        if status != StatusCode::SWITCHING_PROTOCOLS {
            // The upstream refused the upgrade; relay its answer as-is
            debug!(%status, "Upstream rejected upgrade request");
            return Ok(response);
        }

        // Relay runs for the connection lifetime; the response goes back now
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => forward_bidirectional(upgraded, upstream).await,
                Err(e) => {
                    error!(error = %e, "Failed to upgrade client connection");
                }
            }
        });

        Ok(response)
    }
}

/// host:port of the target (the Host header value under changeOrigin)
fn authority_of(uri: &Uri) -> Option<String> {
    uri.authority().map(|a| a.as_str().to_string())
}

/// Check if a request is an HTTP upgrade request
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    let has_upgrade_header = req.headers().contains_key(hyper::header::UPGRADE);

    has_upgrade_connection && has_upgrade_header
}

/// Build the raw HTTP/1.1 upgrade request to send upstream, with the computed
/// route path and the chosen Host header.
fn build_upgrade_request<B>(req: &Request<B>, path: &str, host_header: &str) -> Vec<u8> {
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }

    request.push_str(&format!("Host: {}\r\n", host_header));
    request.push_str("\r\n");

    request.into_bytes()
}

/// Parse the status line and headers of the upstream's upgrade response.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let response_str = std::str::from_utf8(data).ok()?;
    let mut lines = response_str.lines();

    // Status line: HTTP/1.1 101 Switching Protocols
    let status_line = lines.next()?;
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 2 {
        return None;
    }

    let status_code: u16 = parts[1].parse().ok()?;
    let status = StatusCode::from_u16(status_code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some((status, headers))
}

/// Forward bytes bidirectionally between the upgraded client connection and
/// the upstream socket until either side closes.
async fn forward_bidirectional(client: Upgraded, upstream: TcpStream) {
    let mut client_io = TokioIo::new(client);
    let mut upstream_io = upstream;

    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream_io).await {
        Ok((client_to_upstream, upstream_to_client)) => {
            debug!(
                client_to_upstream,
                upstream_to_client, "Relayed connection closed normally"
            );
        }
        Err(e) => {
            debug!(error = %e, "Relayed connection closed with error");
        }
    }
}
