use crate::config::Config;
use crate::dispatch::{DispatchError, Dispatcher};
use crate::error::{error_response, ProxyErrorCode};
use crate::registry::ServiceRegistry;
use crate::router::{self, RouteError};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The worker-side proxy server: owns the shared listening socket and glues
/// routing to dispatch for every inbound request.
pub struct ProxyServer {
    listener: TcpListener,
    registry: Arc<ServiceRegistry>,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    /// Bind the listening socket and build the per-process registry.
    ///
    /// The socket is opened with `SO_REUSEPORT` so that every worker process
    /// can bind the same port and the kernel spreads connections across them.
    pub fn bind(
        bind_addr: SocketAddr,
        config: Arc<Config>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let registry = Arc::new(ServiceRegistry::build(&config.services));
        let listener = bind_reuseport(bind_addr)?;

        Ok(Self {
            listener,
            registry,
            config,
            dispatcher: Arc::new(Dispatcher::new()),
            shutdown_rx,
        })
    }

    /// The actually bound address (resolves an OS-assigned port)
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(%addr, services = self.registry.len(), "Worker serving (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let registry = Arc::clone(&self.registry);
                            let config = Arc::clone(&self.config);
                            let dispatcher = Arc::clone(&self.dispatcher);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, client_addr, registry, config, dispatcher).await {
                                    debug!(addr = %client_addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Worker shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Open a nonblocking listener with SO_REUSEADDR and, on unix, SO_REUSEPORT.
fn bind_reuseport(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nodelay(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    Ok(TcpListener::from_std(socket.into())?)
}

async fn handle_connection(
    stream: tokio::net::TcpStream,
    client_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        let dispatcher = Arc::clone(&dispatcher);
        async move { handle_request(req, registry, config, dispatcher, client_addr).await }
    });

    // auto::Builder supports HTTP/1.1 (with WebSocket upgrades) and h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    mut req: Request<Incoming>,
    registry: Arc<ServiceRegistry>,
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    // Generate or propagate request ID
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let plan = match router::route(&path_and_query, &registry, &config) {
        Ok(plan) => plan,
        Err(RouteError::NotFound) => {
            debug!(path = %path_and_query, request_id, "No service matches request path");
            return Ok(error_response(
                ProxyErrorCode::RouteNotFound,
                "No service configured for this path",
            ));
        }
    };

    // Overwrite X-Forwarded-* rather than appending: this proxy is assumed
    // to be the first trusted hop, and client-supplied values are spoofable.
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    debug!(
        method = %req.method(),
        path = %path_and_query,
        target = %plan.target_url,
        request_id,
        "Proxying request"
    );

    match dispatcher.dispatch(req, &plan).await {
        Ok(response) => Ok(response),
        Err(e) => {
            error!(target = %plan.target_url, request_id, error = %e, "Dispatch failed");
            Ok(dispatch_error_response(&e))
        }
    }
}

/// Translate a dispatch failure into the client-facing error response.
fn dispatch_error_response(err: &DispatchError) -> Response<BoxBody<Bytes, hyper::Error>> {
    match err {
        DispatchError::InvalidTarget(_) | DispatchError::RequestBuild(_) => error_response(
            ProxyErrorCode::InternalError,
            "Failed to construct upstream request",
        ),
        DispatchError::Upstream(_) | DispatchError::Connect(_) => error_response(
            ProxyErrorCode::UpstreamUnreachable,
            "Failed to reach upstream",
        ),
        DispatchError::UpgradeHandshake(_) => error_response(
            ProxyErrorCode::BadUpstreamResponse,
            "Upstream mishandled the upgrade handshake",
        ),
    }
}
