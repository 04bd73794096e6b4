//! AMQP 0-9-1 publisher (RabbitMQ) on a single connection and channel.

use accp_config::RabbitmqConfig;
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::publisher_confirm::Confirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use super::{PublishError, Publisher, with_backoff};

const CONNECTION_NAME: &str = "accp-publisher";

struct Link {
    connection: Connection,
    channel: Channel,
}

/// State shared with the lapin error callbacks and the reconnect task
struct Health {
    broken: AtomicBool,
    wake: Notify,
    shutdown: CancellationToken,
}

impl Health {
    fn mark_broken(&self, what: &str, error: &lapin::Error) {
        if self.shutdown.is_cancelled() {
            return;
        }
        tracing::warn!(error = %error, "AMQP {} error, scheduling reconnect", what);
        self.broken.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }
}

pub struct AmqpPublisher {
    url: String,
    exchange: String,
    backoff: Vec<Duration>,
    link: RwLock<Option<Link>>,
    health: Arc<Health>,
}

impl std::fmt::Debug for AmqpPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpPublisher")
            .field("exchange", &self.exchange)
            .field("backoff", &self.backoff)
            .field("broken", &self.health.broken.load(Ordering::Relaxed))
            .finish()
    }
}

impl AmqpPublisher {
    /// Dial the bus, declare the exchange and start the reconnect task. The
    /// task stops when `cancel` fires or the publisher is shut down.
    pub async fn connect(
        config: &RabbitmqConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, PublishError> {
        let publisher = Arc::new(Self {
            url: config.url.clone(),
            exchange: config.exchange.clone(),
            backoff: config.backoff(),
            link: RwLock::new(None),
            health: Arc::new(Health {
                broken: AtomicBool::new(false),
                wake: Notify::new(),
                shutdown: cancel.child_token(),
            }),
        });
        publisher.reconnect().await?;
        tracing::info!(exchange = %publisher.exchange, "AMQP publisher connected");

        let task = publisher.clone();
        tokio::spawn(async move { task.watch().await });
        Ok(publisher)
    }

    async fn dial(&self) -> Result<Link, PublishError> {
        let connection = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
        )
        .await
        .map_err(|e| PublishError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PublishError::Connection(format!("channel creation failed: {e}")))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| PublishError::Connection(format!("confirm select failed: {e}")))?;

        channel
            .exchange_declare(
                &self.exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PublishError::Connection(format!("exchange declare failed: {e}")))?;

        let health = self.health.clone();
        connection.on_error(move |e| health.mark_broken("connection", &e));
        let health = self.health.clone();
        channel.on_error(move |e| health.mark_broken("channel", &e));

        Ok(Link {
            connection,
            channel,
        })
    }

    /// Replace the current link with a fresh one.
    async fn reconnect(&self) -> Result<(), PublishError> {
        if self.health.shutdown.is_cancelled() {
            return Err(PublishError::Shutdown);
        }
        let link = self.dial().await?;
        let old = self.link.write().await.replace(link);
        self.health.broken.store(false, Ordering::SeqCst);
        if let Some(old) = old {
            let _ = old.connection.close(200, "reconnect").await;
        }
        Ok(())
    }

    /// Reconnect in the background whenever an error callback fires.
    async fn watch(&self) {
        loop {
            tokio::select! {
                _ = self.health.shutdown.cancelled() => break,
                _ = self.health.wake.notified() => {}
            }
            for delay in &self.backoff {
                if !self.health.broken.load(Ordering::SeqCst) {
                    break;
                }
                match self.reconnect().await {
                    Ok(()) => {
                        tracing::info!("AMQP publisher reconnected");
                        break;
                    }
                    Err(PublishError::Shutdown) => return,
                    Err(e) => {
                        tracing::warn!(error = %e, retry_in = ?delay, "AMQP reconnect failed");
                        tokio::select! {
                            _ = self.health.shutdown.cancelled() => return,
                            _ = tokio::time::sleep(*delay) => {}
                        }
                    }
                }
            }
        }
    }

    async fn publish_once(&self, payload: &[u8], routing_key: &str) -> Result<(), PublishError> {
        if self.health.shutdown.is_cancelled() {
            return Err(PublishError::Shutdown);
        }
        let guard = self.link.read().await;
        let link = guard
            .as_ref()
            .ok_or_else(|| PublishError::Connection("not connected".into()))?;

        // Persistent delivery, confirmed by the broker
        let confirm = link
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(2)
                    .with_content_type("text/plain".into()),
            )
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;
        let confirmation = confirm
            .await
            .map_err(|e| PublishError::Publish(format!("confirmation failed: {e}")))?;
        confirmed(confirmation)
    }
}

/// Only a broker ack counts as delivered.
fn confirmed(confirmation: Confirmation) -> Result<(), PublishError> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(PublishError::Publish("broker nacked the event".into())),
        Confirmation::NotRequested => Err(PublishError::Publish(
            "publisher confirms not enabled on the channel".into(),
        )),
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn publish(&self, payload: &[u8], routing_key: &str) -> Result<(), PublishError> {
        with_backoff(&self.backoff, move |attempt| async move {
            if attempt > 0 {
                self.reconnect().await?;
            }
            self.publish_once(payload, routing_key).await
        })
        .await
    }

    async fn ping(&self) -> Result<(), PublishError> {
        let connection = Connection::connect(
            &self.url,
            ConnectionProperties::default().with_connection_name(CONNECTION_NAME.into()),
        )
        .await
        .map_err(|e| PublishError::Connection(e.to_string()))?;
        connection
            .close(200, "ping")
            .await
            .map_err(|e| PublishError::Connection(e.to_string()))
    }

    async fn shutdown(&self) {
        self.health.shutdown.cancel();
        if let Some(link) = self.link.write().await.take() {
            if let Err(e) = link.channel.close(200, "shutdown").await {
                tracing::debug!(error = %e, "AMQP channel close failed");
            }
            if let Err(e) = link.connection.close(200, "shutdown").await {
                tracing::debug!(error = %e, "AMQP connection close failed");
            }
        }
        tracing::info!("AMQP publisher shut down");
    }
}
