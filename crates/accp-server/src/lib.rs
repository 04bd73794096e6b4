//! Access control caching proxy.
//!
//! A reverse proxy that sits in front of upstream HTTP services and, per
//! route, introspects bearer tokens, enforces limits, verifies captchas,
//! caches responses in a memory tier backed by a shared secondary store,
//! refreshes cached entries in the background and publishes one event per
//! request to a message bus.
//!
//! The pieces are wired in [`server::AccpServer::bootstrap`]; per-request
//! behavior lives in [`route::Route::handle`].

pub mod admin;
pub mod cache;
pub mod captcha;
pub mod error;
pub mod introspect;
pub mod limiter;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod pool;
pub mod publisher;
pub mod record;
pub mod route;
pub mod router;
pub mod server;
pub mod store;

pub use admin::{AdminState, admin_routes};
pub use error::ProxyError;
pub use observability::init_tracing;
pub use route::{Dependencies, Route};
pub use router::{Router, RouterError};
pub use server::{AccpServer, AppState, BoundServer, build_app};
