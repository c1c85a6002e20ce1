//! Live filesystem watch backend.
//!
//! Subscribes to kernel notifications over the whole volume and forwards
//! classified foreign mutations to the broker as `"PUT /a/c/o"` /
//! `"DELETE /a/c/o"` payloads. The out-of-process [`crate::consumer`] does
//! the expensive work (checksum, index calls); this loop stays cheap so the
//! kernel's event buffer never backs up.
//!
//! A create is only forwarded once the writer closes the file (close-write)
//! or the file is renamed into place; a bare create event would race the
//! content still being written.

use std::sync::Arc;

use async_trait::async_trait;
use notify::{
  Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
  event::{AccessKind, AccessMode, ModifyKind, RemoveKind, RenameMode},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftsync_core::{Config, ObjectPath, Operation};

use crate::{
  broker::{Broker, BrokerError, publish_with_retry},
  capture::{CaptureBackend, CaptureError, ChangeEvent, SourceTag},
  classify,
  resolve::{Ident, relative_to_root},
};

/// Bound on the notify-to-async bridge channel.
const EVENT_CHANNEL_SIZE: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
  #[error("failed to watch volume: {0}")]
  Notify(#[from] notify::Error),

  #[error(transparent)]
  Broker(#[from] BrokerError),
}

/// Map a notification kind onto the operation it represents, if any.
///
/// Directory events and in-progress writes are not operations: only a
/// completed write (close-write or rename-to) or a removal counts.
fn classify_event(kind: &EventKind) -> Option<Operation> {
  match kind {
    EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(Operation::Create),
    EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Operation::Create),
    EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Operation::Delete),
    EventKind::Remove(RemoveKind::File) | EventKind::Remove(RemoveKind::Any) => Some(Operation::Delete),
    _ => None,
  }
}

/// Forwards foreign mutations to the broker.
pub struct WatchSource {
  config: Arc<Config>,
  broker: Box<dyn Broker>,
}

impl WatchSource {
  pub fn new(config: Arc<Config>, broker: Box<dyn Broker>) -> Self {
    Self { config, broker }
  }

  /// Filter and publish one observed mutation. Returns whether a payload
  /// was published. Only a broker failure is an error; everything else is a
  /// skip.
  async fn process(&self, event: &ChangeEvent) -> Result<bool, WatchError> {
    let op = event.op;
    let Ident::Path(ref path) = event.ident else {
      return Ok(false);
    };
    let Some(relative) = relative_to_root(&self.config.volume_root, path) else {
      return Ok(false);
    };
    if self.config.is_reserved(&relative) {
      return Ok(false);
    }
    let Some(object) = ObjectPath::parse(&relative) else {
      return Ok(false);
    };
    if !object.is_object_account(&self.config.reseller_prefix) {
      return Ok(false);
    }
    if op == Operation::Create && path.is_dir() {
      return Ok(false);
    }
    if !classify::is_foreign_write(op, path, &self.config.classify) {
      debug!(object = %object, op = %op, "Self-write, not forwarding");
      return Ok(false);
    }

    let payload = format!("{} {}", op.as_str(), relative);
    publish_with_retry(self.broker.as_ref(), &payload, &self.config.broker).await?;
    debug!(payload = %payload, "Forwarded event");
    Ok(true)
  }
}

#[async_trait]
impl CaptureBackend for WatchSource {
  fn name(&self) -> &'static str {
    "watch"
  }

  async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), CaptureError> {
    let (tx, mut rx) = mpsc::channel::<Event>(EVENT_CHANNEL_SIZE);

    // notify delivers on its own thread; bridge into the async loop. A full
    // channel drops the event - the crawler reconciles anything missed.
    let mut watcher = RecommendedWatcher::new(
      move |result: Result<Event, notify::Error>| match result {
        Ok(event) => {
          if let Err(e) = tx.try_send(event) {
            warn!(error = %e, "Event channel full, dropping event");
          }
        }
        Err(e) => warn!(error = %e, "Watch error"),
      },
      notify::Config::default(),
    )
    .map_err(WatchError::from)?;

    watcher
      .watch(&self.config.volume_root, RecursiveMode::Recursive)
      .map_err(WatchError::from)?;
    info!(root = %self.config.volume_root.display(), "Watch backend started");

    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        event = rx.recv() => {
          let Some(event) = event else { break };
          let Some(op) = classify_event(&event.kind) else { continue };
          for path in &event.paths {
            let change = ChangeEvent::new(op, Ident::Path(path.clone()), SourceTag::Watch);
            self.process(&change).await.map_err(CaptureError::from)?;
          }
        }
      }
    }

    info!("Watch backend stopped");
    Ok(())
  }
}
