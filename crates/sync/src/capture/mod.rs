//! Capture backends - producers of change events.
//!
//! Three independent implementations of one producer contract:
//!
//! - [`changelog::ChangelogSource`]: tails the storage layer's ordered,
//!   ack-able change log
//! - [`watch::WatchSource`]: live filesystem notifications forwarded over
//!   the broker
//! - [`crawl::CrawlSource`]: periodic full-tree diff against the index
//!
//! One tokio task per backend; no backend depends on another's internal
//! state. The only shared pieces are the stateless resolver and classifier
//! plus the immutable config.

pub mod changelog;
pub mod crawl;
pub mod watch;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use driftsync_core::Operation;

pub use crate::resolve::Ident;

/// Which backend observed a mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceTag {
  Changelog,
  Watch,
  Crawl,
}

/// A raw filesystem mutation as observed by a capture backend.
///
/// Immutable once emitted; downstream stages derive new values from it.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
  pub op: Operation,
  pub ident: Ident,
  pub source: SourceTag,
  pub observed_at: DateTime<Utc>,
}

impl ChangeEvent {
  pub fn new(op: Operation, ident: Ident, source: SourceTag) -> Self {
    Self {
      op,
      ident,
      source,
      observed_at: Utc::now(),
    }
  }
}

/// Errors a backend can terminate with.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
  #[error(transparent)]
  Changelog(#[from] changelog::ChangelogError),
  #[error(transparent)]
  Watch(#[from] watch::WatchError),
  #[error(transparent)]
  Crawl(#[from] crate::reconcile::CrawlError),
}

/// Common contract for a long-running change producer.
///
/// `run` drives the backend until the token is cancelled (clean exit) or an
/// unrecoverable error occurs (the supervisor logs it; other backends keep
/// running).
#[async_trait]
pub trait CaptureBackend: Send {
  fn name(&self) -> &'static str;

  async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), CaptureError>;
}
