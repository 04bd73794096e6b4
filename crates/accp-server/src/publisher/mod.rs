//! Request event publication.
//!
//! Every completed request on a route with a `route_key` produces a
//! [`RequestEvent`] that is published to the message bus in a spawned task.
//! Publication never fails or delays the client response.

mod amqp;

pub use self::amqp::AmqpPublisher;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::metrics;
use crate::record::{RequestRecord, ResponseSource};

#[derive(Debug, Clone, thiserror::Error)]
pub enum PublishError {
    #[error("message bus connection failed: {0}")]
    Connection(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("publisher is shut down")]
    Shutdown,

    #[error("failed to encode event: {0}")]
    Encode(String),
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, payload: &[u8], routing_key: &str) -> Result<(), PublishError>;

    /// Dial the bus and hang up.
    async fn ping(&self) -> Result<(), PublishError>;

    async fn shutdown(&self);
}

/// Payload published for every served request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub route: String,
    pub routing_key: String,
    pub request: RequestRecord,
    pub status_code: u16,
    pub source: ResponseSource,
    pub uuid: Uuid,
    pub timestamp_unix: i64,
}

/// Publish `event` in the background; failures are logged and counted.
pub fn spawn_publish(publisher: Arc<dyn Publisher>, event: RequestEvent) {
    tokio::spawn(async move {
        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(route = %event.route, error = %e, "failed to encode request event");
                return;
            }
        };
        if let Err(e) = publisher.publish(&payload, &event.routing_key).await {
            metrics::record_publish_failure();
            tracing::warn!(
                route = %event.route,
                routing_key = %event.routing_key,
                error = %e,
                "request event not published"
            );
        }
    });
}

/// Run `attempt(0)`; on failure retry once after each delay of `backoff`
/// and then one final time, returning the last error. A `Shutdown` error
/// stops retrying immediately.
pub(crate) async fn with_backoff<F, Fut>(backoff: &[Duration], mut attempt: F) -> Result<(), PublishError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<(), PublishError>>,
{
    let mut last = match attempt(0).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    for (i, delay) in backoff.iter().enumerate() {
        if matches!(last, PublishError::Shutdown) {
            return Err(last);
        }
        tracing::debug!(attempt = i + 1, delay = ?delay, error = %last, "retrying publish");
        tokio::time::sleep(*delay).await;
        last = match attempt(i + 1).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
    }
    if matches!(last, PublishError::Shutdown) {
        return Err(last);
    }
    attempt(backoff.len() + 1).await
}
