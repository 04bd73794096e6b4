//! Bounded HTTP client pool.
//!
//! Checkout waits for one of `size` slots (at most the pool timeout); the
//! slot is returned when the [`PooledClient`] is dropped.

use accp_config::PoolParameters;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Underlying clients shared round-robin by the slots
const MAX_CLIENTS: usize = 8;

const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no HTTP client available within {0:?}")]
    Exhausted(Duration),

    #[error("HTTP pool closed")]
    Closed,

    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

#[derive(Debug)]
pub struct HttpPool {
    clients: Vec<reqwest::Client>,
    next: AtomicUsize,
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl HttpPool {
    pub fn new(params: &PoolParameters) -> Result<Self, PoolError> {
        let size = params.size.max(1);
        let clients = (0..size.min(MAX_CLIENTS))
            .map(|_| {
                reqwest::Client::builder()
                    .timeout(params.timeout)
                    .connect_timeout(params.timeout)
                    .pool_idle_timeout(IDLE_TIMEOUT)
                    .pool_max_idle_per_host(size)
                    .redirect(reqwest::redirect::Policy::none())
                    .build()
                    .map_err(|e| PoolError::Build(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
            permits: Arc::new(Semaphore::new(size)),
            timeout: params.timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn checkout(&self) -> Result<PooledClient, PoolError> {
        let permit = tokio::time::timeout(self.timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| PoolError::Exhausted(self.timeout))?
            .map_err(|_| PoolError::Closed)?;
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        Ok(PooledClient {
            client: self.clients[index].clone(),
            _permit: permit,
        })
    }
}

/// A checked-out client; dropping it checks the slot back in.
#[derive(Debug)]
pub struct PooledClient {
    client: reqwest::Client,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledClient {
    type Target = reqwest::Client;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(size: usize, timeout_ms: u64) -> PoolParameters {
        PoolParameters {
            size,
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    #[tokio::test]
    async fn test_checkout_and_checkin() {
        let pool = HttpPool::new(&params(2, 100)).unwrap();
        let a = pool.checkout().await.unwrap();
        let _b = pool.checkout().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(a);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_after_timeout() {
        let pool = HttpPool::new(&params(1, 50)).unwrap();
        let _held = pool.checkout().await.unwrap();
        assert!(matches!(
            pool.checkout().await,
            Err(PoolError::Exhausted(_))
        ));
    }
}
