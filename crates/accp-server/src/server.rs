use std::net::SocketAddr;
use std::sync::Arc;

use accp_config::{AppConfig, resolve_routes};
use anyhow::Context;
use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware,
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, admin_routes};
use crate::captcha::{CaptchaGuard, RecaptchaVerifier};
use crate::error::ProxyError;
use crate::introspect::Introspector;
use crate::middleware as app_middleware;
use crate::publisher::{AmqpPublisher, Publisher};
use crate::route::Dependencies;
use crate::router::Router;
use crate::store::{RedisStore, SecondaryStore};

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<Router>,
}

/// Proxy application: every path goes through the route table.
pub fn build_app(state: AppState, request_id: bool) -> axum::Router {
    // request_id wraps the trace layer so generated ids land in the span
    let app = axum::Router::new().fallback(proxy).with_state(state).layer(
        TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                let req_id = req
                    .headers()
                    .get(app_middleware::REQUEST_ID_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("")
                    .to_string();
                tracing::info_span!(
                    "http.request",
                    http.method = %req.method(),
                    http.target = %req.uri().path(),
                    http.status_code = tracing::field::Empty,
                    request_id = %req_id
                )
            })
            .on_response(
                |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                    span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                    tracing::debug!(
                        http.status = %res.status().as_u16(),
                        elapsed_ms = %latency.as_millis(),
                        "request handled"
                    );
                },
            ),
    );
    if request_id {
        app.layer(middleware::from_fn(app_middleware::request_id))
    } else {
        app
    }
}

async fn proxy(State(state): State<AppState>, req: Request<Body>) -> Response {
    match state.router.find(req.uri().path()) {
        Some(route) => route.handle(req).await,
        None => {
            tracing::info!(path = %req.uri().path(), "no route");
            ProxyError::RouteNotFound.into_response()
        }
    }
}

/// Everything wired from configuration, not yet listening.
pub struct AccpServer {
    listen: SocketAddr,
    admin_listen: Option<SocketAddr>,
    app: axum::Router,
    admin: Option<axum::Router>,
    publisher: Option<Arc<dyn Publisher>>,
    cancel: CancellationToken,
}

impl AccpServer {
    /// Connect the shared services and build the route table.
    pub async fn bootstrap(config: &AppConfig) -> anyhow::Result<Self> {
        let cancel = CancellationToken::new();

        let store: Option<Arc<dyn SecondaryStore>> = if config.redis.enabled {
            let store = RedisStore::connect(&config.redis)
                .await
                .context("secondary store unavailable")?;
            Some(Arc::new(store))
        } else {
            tracing::info!("secondary store disabled, memory tier only");
            None
        };

        let publisher: Option<Arc<dyn Publisher>> = if config.rabbitmq.enabled {
            let publisher = AmqpPublisher::connect(&config.rabbitmq, cancel.clone())
                .await
                .context("message bus unavailable")?;
            Some(publisher)
        } else {
            tracing::info!("event publishing disabled");
            None
        };

        let mut deps = Dependencies::new(config.proxy.body_limit_bytes, cancel.clone());
        if let Some(store) = &store {
            deps = deps.with_store(store.clone());
        }
        if let Some(publisher) = &publisher {
            deps = deps.with_publisher(publisher.clone());
        }
        if !config.introspector.dsn.is_empty() {
            let introspector =
                Introspector::new(&config.introspector).context("invalid introspector")?;
            deps = deps.with_introspector(Arc::new(introspector));
        }
        if config.captcha.is_configured() {
            let verifier = RecaptchaVerifier::new(&config.captcha)?;
            deps = deps.with_captcha(Arc::new(CaptchaGuard::new(
                Arc::new(verifier),
                &config.captcha.jwt_secret,
                config.captcha.jwt_ttl,
            )));
        }

        let routes = resolve_routes(&config.proxy.routes)?;
        let router = Router::from_routes(&routes, &deps)?;

        let app = build_app(
            AppState {
                router: Arc::new(router),
            },
            config.proxy.request_id,
        );
        let (admin_listen, admin) = if config.admin.enabled {
            let state = AdminState {
                store,
                publisher: publisher.clone(),
            };
            (Some(config.admin.listen_addr()?), Some(admin_routes(state)))
        } else {
            (None, None)
        };

        Ok(Self {
            listen: config.proxy.listen_addr()?,
            admin_listen,
            app,
            admin,
            publisher,
            cancel,
        })
    }

    pub async fn bind(self) -> anyhow::Result<BoundServer> {
        let listener = TcpListener::bind(self.listen)
            .await
            .with_context(|| format!("failed to bind {}", self.listen))?;
        let admin = match (self.admin_listen, self.admin) {
            (Some(addr), Some(app)) => {
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("failed to bind admin {addr}"))?;
                Some((listener, app))
            }
            _ => None,
        };
        Ok(BoundServer {
            listener,
            app: self.app,
            admin,
            publisher: self.publisher,
            cancel: self.cancel,
        })
    }
}

pub struct BoundServer {
    listener: TcpListener,
    app: axum::Router,
    admin: Option<(TcpListener, axum::Router)>,
    publisher: Option<Arc<dyn Publisher>>,
    cancel: CancellationToken,
}

impl BoundServer {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.admin
            .as_ref()
            .and_then(|(listener, _)| listener.local_addr().ok())
    }

    /// Serve until SIGINT/SIGTERM, then stop background tasks and the publisher.
    pub async fn serve(self) -> anyhow::Result<()> {
        self.serve_until(shutdown_signal()).await
    }

    pub async fn serve_until(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();

        let admin = self.admin.map(|(listener, app)| {
            let cancel = cancel.clone();
            tracing::info!(addr = ?listener.local_addr().ok(), "admin listening");
            tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { cancel.cancelled().await })
                    .await
            })
        });

        tracing::info!(addr = ?self.listener.local_addr().ok(), "proxy listening");
        let served = axum::serve(self.listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await;

        cancel.cancel();
        if let Some(publisher) = &self.publisher {
            publisher.shutdown().await;
        }
        if let Some(admin) = admin {
            match admin.await {
                Ok(Err(e)) => tracing::warn!(error = %e, "admin listener failed"),
                Err(e) => tracing::warn!(error = %e, "admin task failed"),
                Ok(Ok(())) => {}
            }
        }
        tracing::info!("shutdown complete");
        served.context("proxy listener failed")
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
