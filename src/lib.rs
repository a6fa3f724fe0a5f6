//! Switchyard - a clustered slug-routing reverse proxy
//!
//! This library provides a configuration-driven reverse proxy front-end that:
//! - Routes requests whose first path segment matches a configured service slug
//! - Strips the slug (configurable) and forwards to the service's upstream target
//! - Relays WebSocket upgrades bidirectionally when enabled
//! - Runs N worker processes sharing one listening port via SO_REUSEPORT
//! - Supervises workers: restarts on exit, or escalates a single exit to a
//!   full shutdown when configured

pub mod config;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod role;
pub mod router;
pub mod supervisor;
