//! Broker hand-off between the watch backend and the update consumer.
//!
//! The live watcher and the consumer are separate processes; events cross
//! between them as plain-text `"PUT /a/c/o"` / `"DELETE /a/c/o"` payloads on
//! a durable AMQP queue. The [`Broker`] trait is the seam: production uses
//! [`AmqpBroker`], tests use the in-process [`MemoryBroker`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
  BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
  options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, QueueDeclareOptions},
  types::FieldTable,
};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use driftsync_core::config::BrokerConfig;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
  #[error("broker connection failed: {0}")]
  Connect(#[source] lapin::Error),

  #[error("publish failed: {0}")]
  Publish(#[source] lapin::Error),

  #[error("consume failed: {0}")]
  Consume(#[source] lapin::Error),

  #[error("publish gave up after {attempts} attempts")]
  Exhausted { attempts: u32 },
}

/// Transport for event payloads between capture and consumption.
#[async_trait]
pub trait Broker: Send + Sync {
  /// Publish one payload (single attempt).
  async fn publish(&self, payload: &str) -> Result<(), BrokerError>;

  /// Receive and acknowledge the next payload. `None` means the stream
  /// closed and no more messages will arrive.
  async fn next_message(&mut self) -> Result<Option<String>, BrokerError>;
}

/// Publish with bounded retry and exponential backoff.
///
/// A broker outage must not silently drop events, so exhausting the attempts
/// is an error the caller treats as fatal.
pub async fn publish_with_retry(broker: &dyn Broker, payload: &str, config: &BrokerConfig) -> Result<(), BrokerError> {
  let attempts = config.publish_attempts.max(1);
  let mut backoff = std::time::Duration::from_millis(config.retry_backoff_ms);

  for attempt in 1..=attempts {
    match broker.publish(payload).await {
      Ok(()) => return Ok(()),
      Err(e) if attempt < attempts => {
        warn!(attempt, error = %e, "Publish failed, backing off");
        tokio::time::sleep(backoff).await;
        backoff *= 2;
      }
      Err(e) => {
        warn!(attempt, error = %e, "Publish failed, giving up");
      }
    }
  }

  Err(BrokerError::Exhausted { attempts })
}

// ============================================================================
// AMQP broker
// ============================================================================

/// Durable-queue AMQP broker.
pub struct AmqpBroker {
  channel: Channel,
  queue: String,
  consumer: Option<Consumer>,
  // Connection must outlive the channel
  _connection: Connection,
}

impl AmqpBroker {
  /// Connect and declare the durable queue.
  pub async fn connect(config: &BrokerConfig) -> Result<Self, BrokerError> {
    let connection = Connection::connect(&config.url, ConnectionProperties::default())
      .await
      .map_err(BrokerError::Connect)?;
    let channel = connection.create_channel().await.map_err(BrokerError::Connect)?;
    channel
      .queue_declare(
        &config.queue,
        QueueDeclareOptions {
          durable: true,
          ..Default::default()
        },
        FieldTable::default(),
      )
      .await
      .map_err(BrokerError::Connect)?;

    debug!(url = %config.url, queue = %config.queue, "Broker connected");
    Ok(Self {
      channel,
      queue: config.queue.clone(),
      consumer: None,
      _connection: connection,
    })
  }

  async fn create_consumer(&self) -> Result<Consumer, BrokerError> {
    self
      .channel
      .basic_consume(
        &self.queue,
        "driftsync-consumer",
        BasicConsumeOptions::default(),
        FieldTable::default(),
      )
      .await
      .map_err(BrokerError::Consume)
  }
}

#[async_trait]
impl Broker for AmqpBroker {
  async fn publish(&self, payload: &str) -> Result<(), BrokerError> {
    let confirm = self
      .channel
      .basic_publish(
        "",
        &self.queue,
        BasicPublishOptions::default(),
        payload.as_bytes(),
        BasicProperties::default().with_delivery_mode(2), // persistent
      )
      .await
      .map_err(BrokerError::Publish)?;
    confirm.await.map_err(BrokerError::Publish)?;
    Ok(())
  }

  async fn next_message(&mut self) -> Result<Option<String>, BrokerError> {
    if self.consumer.is_none() {
      self.consumer = Some(self.create_consumer().await?);
    }
    let Some(consumer) = self.consumer.as_mut() else {
      return Ok(None);
    };
    match consumer.next().await {
      Some(Ok(delivery)) => {
        let payload = String::from_utf8_lossy(&delivery.data).into_owned();
        delivery.ack(BasicAckOptions::default()).await.map_err(BrokerError::Consume)?;
        Ok(Some(payload))
      }
      Some(Err(e)) => Err(BrokerError::Consume(e)),
      None => Ok(None),
    }
  }
}

// ============================================================================
// In-process broker
// ============================================================================

/// Channel-backed broker for tests and single-process runs.
#[derive(Clone)]
pub struct MemoryBroker {
  tx: mpsc::UnboundedSender<String>,
  rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
}

impl MemoryBroker {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      tx,
      rx: Arc::new(Mutex::new(rx)),
    }
  }
}

impl Default for MemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

#[async_trait]
impl Broker for MemoryBroker {
  async fn publish(&self, payload: &str) -> Result<(), BrokerError> {
    // Receiver dropped means the consumer is gone; surface as exhausted
    self
      .tx
      .send(payload.to_string())
      .map_err(|_| BrokerError::Exhausted { attempts: 1 })
  }

  async fn next_message(&mut self) -> Result<Option<String>, BrokerError> {
    Ok(self.rx.lock().await.recv().await)
  }
}
