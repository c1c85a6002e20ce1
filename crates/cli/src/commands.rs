//! Command implementations.

use anyhow::{Context, Result, bail};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use driftsync::{
  broker::AmqpBroker,
  capture::{changelog::ChangelogSource, crawl::CrawlSource, watch::WatchSource},
  consumer::UpdateConsumer,
  index_client::IndexClient,
  reconcile::Reconciler,
  supervisor::Supervisor,
};
use driftsync_core::Config;

/// Token that fires on ctrl-c.
fn shutdown_token() -> CancellationToken {
  let cancel = CancellationToken::new();
  let trigger = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      info!("Shutdown signal received");
      trigger.cancel();
    }
  });
  cancel
}

/// Run the selected capture backends until shutdown.
pub async fn cmd_run(config: Arc<Config>, changelog: bool, watch: bool, crawl: bool) -> Result<()> {
  let mut supervisor = Supervisor::new();

  if changelog {
    supervisor.register(Box::new(ChangelogSource::new(config.clone())));
  }
  if watch {
    let broker = AmqpBroker::connect(&config.broker)
      .await
      .context("connecting to broker")?;
    supervisor.register(Box::new(WatchSource::new(config.clone(), Box::new(broker))));
  }
  if crawl {
    let lister = Arc::new(IndexClient::new(&config.index)?);
    supervisor.register(Box::new(CrawlSource::new(config.clone(), lister)));
  }

  if supervisor.is_empty() {
    bail!("no backends enabled");
  }

  supervisor.run(shutdown_token()).await?;
  Ok(())
}

/// Run a single reconciliation pass and report what it queued.
pub async fn cmd_crawl_once(config: Arc<Config>) -> Result<()> {
  let lister = Arc::new(IndexClient::new(&config.index)?);
  let reconciler = Reconciler::new(config, lister);
  let stats = reconciler.run_once().await?;

  println!(
    "containers: {}  creates: {}  deletes: {}  skipped: {}",
    stats.containers, stats.creates, stats.deletes, stats.skipped
  );
  Ok(())
}

/// Drain broker events into index updates until shutdown.
pub async fn cmd_consume(config: Arc<Config>) -> Result<()> {
  let broker = AmqpBroker::connect(&config.broker)
    .await
    .context("connecting to broker")?;
  let consumer = UpdateConsumer::new(config, Box::new(broker))?;
  consumer.run(shutdown_token()).await?;
  Ok(())
}
