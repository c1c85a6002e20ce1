//! Broker-fed update consumer.
//!
//! The out-of-process half of the live watch pipeline: receives
//! `"PUT /a/c/o"` / `"DELETE /a/c/o"` payloads from the broker, builds the
//! full update record (checksum, stat), and applies it directly against the
//! index. When every replica refuses the update, the record falls back into
//! the durable queue so the index's own sweeper retries it later. A flaky
//! index degrades to eventual consistency instead of losing the update.
//!
//! Payload validation repeats the watcher's filters. The broker queue is a
//! public surface; anything malformed or out of scope is dropped here with
//! a warning rather than trusted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftsync_core::{Config, ObjectPath, Operation, UpdateRecord};

use crate::{
  broker::{Broker, BrokerError},
  builder::{BuildError, RecordBuilder},
  index_client::{IndexClient, IndexError},
  queue::{QueueError, UpdateQueue},
};

#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
  #[error(transparent)]
  Broker(#[from] BrokerError),

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error(transparent)]
  Index(#[from] IndexError),

  #[error("blocking task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// Parse a broker payload into its operation and volume-relative path.
fn parse_payload(payload: &str) -> Option<(Operation, &str)> {
  let (verb, path) = payload.split_once(' ')?;
  let op = Operation::parse(verb)?;
  let path = path.trim();
  if path.is_empty() {
    return None;
  }
  Some((op, path))
}

/// Drains broker payloads into applied index updates.
pub struct UpdateConsumer {
  config: Arc<Config>,
  broker: Box<dyn Broker>,
  builder: RecordBuilder,
  index: IndexClient,
  queue: UpdateQueue,
}

impl UpdateConsumer {
  pub fn new(config: Arc<Config>, broker: Box<dyn Broker>) -> Result<Self, ConsumeError> {
    let builder = RecordBuilder::new(config.storage_policy_index);
    let index = IndexClient::new(&config.index)?;
    let queue = UpdateQueue::new(&config);
    Ok(Self {
      config,
      broker,
      builder,
      index,
      queue,
    })
  }

  /// Consume until cancelled or the broker stream closes.
  pub async fn run(mut self, cancel: CancellationToken) -> Result<(), ConsumeError> {
    info!("Consumer started");
    loop {
      let payload = tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        message = self.broker.next_message() => message?,
      };
      let Some(payload) = payload else {
        info!("Broker stream closed");
        break;
      };
      if let Err(e) = self.handle(&payload).await {
        // One bad message must not stop consumption
        warn!(payload = %payload, error = %e, "Failed to handle payload");
      }
    }

    info!("Consumer stopped");
    Ok(())
  }

  async fn handle(&self, payload: &str) -> Result<(), ConsumeError> {
    let Some(record) = self.build_record(payload).await? else {
      return Ok(());
    };

    match self.index.apply(&record).await {
      Ok(()) => Ok(()),
      Err(IndexError::AllReplicasFailed { .. }) => {
        warn!(object = %record.object_path(), "Index unreachable, queueing for retry");
        self.queue.enqueue(&record).await?;
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Validate the payload and build the full record. `None` means the
  /// payload was dropped (malformed, out of scope, or the file vanished).
  async fn build_record(&self, payload: &str) -> Result<Option<UpdateRecord>, ConsumeError> {
    let Some((op, relative)) = parse_payload(payload) else {
      warn!(payload = %payload, "Malformed payload, dropping");
      return Ok(None);
    };
    if self.config.is_reserved(relative) {
      return Ok(None);
    }
    let Some(object) = ObjectPath::parse(relative) else {
      debug!(payload = %payload, "Path too shallow to address an object, dropping");
      return Ok(None);
    };
    if !object.is_object_account(&self.config.reseller_prefix) {
      return Ok(None);
    }

    match op {
      Operation::Delete => Ok(Some(self.builder.build_delete(&object))),
      Operation::Create => {
        let file = self.config.volume_root.join(relative.trim_start_matches('/'));
        match self.builder.build_create(&object, &file).await {
          Ok(record) => Ok(Some(record)),
          Err(BuildError::Gone { path, .. }) => {
            debug!(path = %path.display(), "File vanished before consumption, dropping");
            Ok(None)
          }
          Err(BuildError::Join(e)) => Err(ConsumeError::Join(e)),
        }
      }
    }
  }
}
