//! Periodic reconciliation backend.
//!
//! Thin scheduling shell around [`crate::reconcile::Reconciler`]: optionally
//! run a pass at startup, then one pass per interval. An interval of zero
//! means run once and stop, which is what the one-shot CLI command uses.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use driftsync_core::Config;

use crate::{
  capture::{CaptureBackend, CaptureError},
  index_client::IndexLister,
  reconcile::Reconciler,
};

pub struct CrawlSource<L: IndexLister + 'static> {
  config: Arc<Config>,
  reconciler: Reconciler<L>,
}

impl<L: IndexLister + 'static> CrawlSource<L> {
  pub fn new(config: Arc<Config>, lister: Arc<L>) -> Self {
    let reconciler = Reconciler::new(config.clone(), lister);
    Self { config, reconciler }
  }
}

#[async_trait]
impl<L: IndexLister + 'static> CaptureBackend for CrawlSource<L> {
  fn name(&self) -> &'static str {
    "crawl"
  }

  async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<(), CaptureError> {
    let interval_secs = self.config.crawl.interval_secs;
    info!(interval_secs, "Crawl backend started");

    if self.config.crawl.run_at_startup {
      if let Err(e) = self.reconciler.run_once().await {
        // A failed pass is retried at the next interval
        warn!(error = %e, "Startup reconciliation pass failed");
      }
    }

    if interval_secs == 0 {
      info!("Crawl backend finished (one-shot)");
      return Ok(());
    }

    let interval = std::time::Duration::from_secs(interval_secs);
    loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(interval) => {
          if let Err(e) = self.reconciler.run_once().await {
            warn!(error = %e, "Reconciliation pass failed");
          }
        }
      }
    }

    info!("Crawl backend stopped");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::index_client::IndexError;
  use driftsync_core::Operation;
  use pretty_assertions::assert_eq;

  struct EmptyLister;

  #[async_trait]
  impl IndexLister for EmptyLister {
    async fn list(&self, _account: &str, _container: &str) -> Result<Vec<String>, IndexError> {
      Ok(Vec::new())
    }
  }

  #[tokio::test]
  async fn test_one_shot_runs_startup_pass_and_exits() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.volume_root = dir.path().join("volume");
    config.queue_root = Some(dir.path().join("queue"));
    config.crawl.interval_secs = 0;
    config.crawl.run_at_startup = true;
    let config = Arc::new(config);

    std::fs::create_dir_all(config.volume_root.join("AUTH_test/c")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/c/o.jpg"), b"x").unwrap();

    let source = Box::new(CrawlSource::new(config.clone(), Arc::new(EmptyLister)));
    source.run(CancellationToken::new()).await.unwrap();

    // The startup pass queued the unindexed file
    let async_dir = config.queue_root().join(config.async_dir_name());
    let mut found = Vec::new();
    for shard in std::fs::read_dir(&async_dir).unwrap() {
      for entry in std::fs::read_dir(shard.unwrap().path()).unwrap() {
        let bytes = std::fs::read(entry.unwrap().path()).unwrap();
        found.push(driftsync_core::UpdateRecord::from_bytes(&bytes).unwrap());
      }
    }
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].op, Operation::Create);
    assert_eq!(found[0].object, "o.jpg");
  }

  #[tokio::test]
  async fn test_cancel_stops_interval_loop() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.volume_root = dir.path().join("volume");
    config.queue_root = Some(dir.path().join("queue"));
    config.crawl.interval_secs = 3600;
    config.crawl.run_at_startup = false;
    std::fs::create_dir_all(&config.volume_root).unwrap();

    let source = Box::new(CrawlSource::new(Arc::new(config), Arc::new(EmptyLister)));
    let cancel = CancellationToken::new();
    cancel.cancel();
    // Returns promptly instead of sleeping out the interval
    source.run(cancel).await.unwrap();
  }
}
