//! Shared helpers: build the proxy app from YAML and drive it in-process.

#![allow(dead_code)]

use accp_config::{load_config_from_str, resolve_routes};
use accp_server::{AppState, Dependencies, Router, build_app};
use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::{Request as MockRequest, Respond, ResponseTemplate};

pub struct TestProxy {
    pub app: axum::Router,
    pub router: Arc<Router>,
    pub cancel: CancellationToken,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn proxy(yaml: &str) -> TestProxy {
    proxy_with(yaml, |deps| deps)
}

pub fn proxy_with(yaml: &str, wire: impl FnOnce(Dependencies) -> Dependencies) -> TestProxy {
    let cfg = load_config_from_str(yaml).expect("valid config");
    let routes = resolve_routes(&cfg.proxy.routes).expect("routes");
    let cancel = CancellationToken::new();
    let deps = wire(Dependencies::new(cfg.proxy.body_limit_bytes, cancel.clone()));
    let router = Arc::new(Router::from_routes(&routes, &deps).expect("router"));
    let app = build_app(
        AppState {
            router: router.clone(),
        },
        cfg.proxy.request_id,
    );
    TestProxy {
        app,
        router,
        cancel,
    }
}

pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub async fn send(app: &axum::Router, req: Request<Body>) -> Reply {
    let res = app.clone().oneshot(req).await.expect("infallible");
    let status = res.status();
    let headers = res.headers().clone();
    let body = axum::body::to_bytes(res.into_body(), 1 << 20)
        .await
        .expect("body");
    Reply {
        status,
        headers,
        body,
    }
}

pub async fn get(app: &axum::Router, uri: &str) -> Reply {
    send(app, Request::get(uri).body(Body::empty()).unwrap()).await
}

pub async fn get_with(app: &axum::Router, uri: &str, headers: &[(&str, &str)]) -> Reply {
    let mut builder = Request::get(uri);
    for (k, v) in headers {
        builder = builder.header(*k, *v);
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

/// Upstream answering `v=<n>` with an increasing `n` per call.
#[derive(Clone, Default)]
pub struct Counting {
    calls: Arc<AtomicUsize>,
}

impl Counting {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Respond for Counting {
    fn respond(&self, _: &MockRequest) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        ResponseTemplate::new(200).set_body_string(format!("v={n}"))
    }
}

/// Poll `cond` every 20ms for up to two seconds.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if cond() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    cond()
}
