//! Admin listener: liveness, readiness and Prometheus metrics.

use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::metrics::render_metrics;
use crate::publisher::Publisher;
use crate::store::SecondaryStore;

#[derive(Clone, Default)]
pub struct AdminState {
    pub store: Option<Arc<dyn SecondaryStore>>,
    pub publisher: Option<Arc<dyn Publisher>>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    checks: BTreeMap<&'static str, String>,
}

pub fn admin_routes(state: AdminState) -> Router {
    Router::new()
        .route("/health/alive", get(alive))
        .route("/health/ready", get(ready))
        .route("/metrics", get(metrics))
        .with_state(state)
}

async fn alive() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            checks: BTreeMap::new(),
        }),
    )
}

async fn ready(State(state): State<AdminState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();
    let mut healthy = true;

    if let Some(store) = &state.store {
        match store.ping().await {
            Ok(()) => {
                checks.insert("store", "ok".to_string());
            }
            Err(e) => {
                healthy = false;
                checks.insert("store", e.to_string());
            }
        }
    }
    if let Some(publisher) = &state.publisher {
        match publisher.ping().await {
            Ok(()) => {
                checks.insert("publisher", "ok".to_string());
            }
            Err(e) => {
                healthy = false;
                checks.insert("publisher", e.to_string());
            }
        }
    }

    if healthy {
        (StatusCode::OK, Json(HealthResponse { status: "ready", checks }))
    } else {
        tracing::warn!(?checks, "readiness check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse {
                status: "unavailable",
                checks,
            }),
        )
    }
}

async fn metrics() -> Response {
    match render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), 1 << 16).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_alive() {
        let (status, body) = get_json(admin_routes(AdminState::default()), "/health/alive").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready_with_store() {
        let state = AdminState {
            store: Some(Arc::new(MemoryStore::new())),
            publisher: None,
        };
        let (status, body) = get_json(admin_routes(state), "/health/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["store"], "ok");
    }
}
