use crate::config::Config;
use crate::registry::ServiceRegistry;
use thiserror::Error;

/// The only routing error: no configured service matches the request path.
/// Maps to HTTP 404 at the server boundary.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    #[error("no service matches the request path")]
    NotFound,
}

/// The resolved forwarding decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardPlan {
    /// Complete final URL to contact (host + path + query); the relay must
    /// use it verbatim instead of re-deriving a path from the request
    pub target_url: String,

    /// Path found in the target URL is part of the final path (always true)
    pub prepend_path: bool,

    /// The original request path is not re-applied by the relay (always true)
    pub ignore_path: bool,

    /// Rewrite the upstream Host header to the target's host
    pub change_origin: bool,

    /// Relay WebSocket upgrade requests instead of plain request/response
    pub enable_websocket: bool,
}

/// Resolve a request path against the registry and compute the forward plan.
///
/// `path_and_query` is the request target as received (path plus optional
/// query string). The first path segment is the service slug; when slug
/// stripping is enabled, the first occurrence of the literal `/<slug>` is
/// removed from the whole string. This is a single non-regex substring
/// removal, so a slug value that recurs later in the path or query string is
/// left untouched. The target URL is assembled by plain concatenation with no
/// slash deduplication; existing deployments depend on the unnormalized form.
pub fn route(
    path_and_query: &str,
    registry: &ServiceRegistry,
    config: &Config,
) -> Result<ForwardPlan, RouteError> {
    let slug = first_segment(path_and_query).ok_or(RouteError::NotFound)?;
    let service = registry.lookup(slug).ok_or(RouteError::NotFound)?;

    let route_path = if config.remove_route_slug {
        path_and_query.replacen(&format!("/{}", slug), "", 1)
    } else {
        path_and_query.to_string()
    };

    Ok(ForwardPlan {
        target_url: format!("{}{}", service.target, route_path),
        prepend_path: true,
        ignore_path: true,
        change_origin: config.change_origin,
        enable_websocket: config.enable_ws,
    })
}

/// Extract the first non-empty path segment after the leading `/`, ignoring
/// the query string.
fn first_segment(path_and_query: &str) -> Option<&str> {
    let path = path_and_query
        .split('?')
        .next()
        .unwrap_or(path_and_query);
    let rest = path.strip_prefix('/')?;
    let segment = rest.split('/').next().unwrap_or("");
    if segment.is_empty() {
        None
    } else {
        Some(segment)
    }
}
