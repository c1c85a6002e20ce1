//! End-to-end pipeline tests for driftsync
//!
//! Tests: reconciliation against a canned index listing, self-write
//! filtering, duplicate-safe repeated passes, and the consumer's durable
//! fallback when the index is unreachable.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use driftsync::{
  broker::{Broker, MemoryBroker},
  consumer::UpdateConsumer,
  index_client::{IndexError, IndexLister},
  reconcile::Reconciler,
};
use driftsync_core::{Config, Operation, UpdateRecord};

/// Canned index listings keyed by "account/container".
struct FixedLister {
  listings: Vec<(String, Vec<String>)>,
}

impl FixedLister {
  fn new(entries: &[(&str, &[&str])]) -> Self {
    Self {
      listings: entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect(),
    }
  }
}

#[async_trait]
impl IndexLister for FixedLister {
  async fn list(&self, account: &str, container: &str) -> Result<Vec<String>, IndexError> {
    let key = format!("{account}/{container}");
    Ok(
      self
        .listings
        .iter()
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v.clone())
        .unwrap_or_default(),
    )
  }
}

fn test_config(dir: &tempfile::TempDir) -> Arc<Config> {
  let mut config = Config::default();
  config.volume_root = dir.path().join("volume");
  config.queue_root = Some(dir.path().join("queue"));
  Arc::new(config)
}

fn queued_records(config: &Config) -> Vec<UpdateRecord> {
  let async_dir = config.queue_root().join(config.async_dir_name());
  let mut records = Vec::new();
  if !async_dir.exists() {
    return records;
  }
  for shard in std::fs::read_dir(&async_dir).unwrap() {
    for entry in std::fs::read_dir(shard.unwrap().path()).unwrap() {
      let bytes = std::fs::read(entry.unwrap().path()).unwrap();
      records.push(UpdateRecord::from_bytes(&bytes).unwrap());
    }
  }
  records
}

fn write_file(root: &Path, relative: &str, content: &[u8]) {
  let path = root.join(relative);
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, content).unwrap();
}

/// A full crawl queues well-formed create and delete records for exactly
/// the differences between disk and index.
#[tokio::test]
async fn test_crawl_reconciles_volume_against_index() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  write_file(&config.volume_root, "AUTH_acme/photos/new.jpg", b"fresh content");
  write_file(&config.volume_root, "AUTH_acme/photos/albums/trip.jpg", b"nested");
  write_file(&config.volume_root, "AUTH_acme/photos/seen.jpg", b"already indexed");

  let lister = Arc::new(FixedLister::new(&[(
    "AUTH_acme/photos",
    &["seen.jpg", "stale.jpg"][..],
  )]));
  let stats = Reconciler::new(config.clone(), lister).run_once().await.unwrap();

  assert_eq!(stats.creates, 2);
  assert_eq!(stats.deletes, 1);

  let records = queued_records(&config);
  assert_eq!(records.len(), 3);
  for record in &records {
    assert_eq!(record.account, "AUTH_acme");
    assert_eq!(record.container, "photos");
    // Fixed-width timestamps keep same-object updates lexicographically ordered
    assert_eq!(record.headers.timestamp.len(), 16);
    match record.op {
      Operation::Create => {
        assert_eq!(record.headers.etag.as_ref().unwrap().len(), 32);
        assert!(record.headers.size.is_some());
      }
      Operation::Delete => {
        assert_eq!(record.object, "stale.jpg");
        assert!(record.headers.etag.is_none());
      }
    }
  }
}

/// Writes performed by the index service itself (temp-name convention) and
/// non-object trees never produce queue entries.
#[tokio::test]
async fn test_crawl_ignores_index_owned_writes() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  write_file(
    &config.volume_root,
    "AUTH_acme/photos/.upload.0123456789abcdef0123456789abcdef",
    b"in progress",
  );
  write_file(&config.volume_root, "shared/notes/todo.txt", b"not an object account");
  write_file(&config.volume_root, "async_pending-0/abc/queued", b"bookkeeping");

  let lister = Arc::new(FixedLister::new(&[]));
  let stats = Reconciler::new(config.clone(), lister).run_once().await.unwrap();

  assert_eq!(stats.creates, 0);
  assert_eq!(stats.deletes, 0);
  assert!(queued_records(&config).is_empty());
}

/// Repeating a pass over an unchanged volume queues the same correction
/// again in a fresh entry - duplicates are tolerated because the index
/// resolves them by timestamp, and no entry is ever overwritten.
#[tokio::test]
async fn test_repeated_crawl_never_overwrites_entries() {
  let dir = tempfile::tempdir().unwrap();
  let config = test_config(&dir);
  write_file(&config.volume_root, "AUTH_acme/c/o.jpg", b"content");

  let lister = Arc::new(FixedLister::new(&[]));
  let reconciler = Reconciler::new(config.clone(), lister);
  reconciler.run_once().await.unwrap();
  reconciler.run_once().await.unwrap();

  let records = queued_records(&config);
  assert_eq!(records.len(), 2);
  assert_eq!(records[0].object, records[1].object);
  assert_eq!(records[0].op, records[1].op);
  assert_eq!(records[0].headers.etag, records[1].headers.etag);
}

/// When every index replica is unreachable the consumer parks the record in
/// the durable queue instead of dropping it.
#[tokio::test]
async fn test_consumer_parks_updates_when_index_unreachable() {
  let dir = tempfile::tempdir().unwrap();
  let mut config = Config::default();
  config.volume_root = dir.path().join("volume");
  config.queue_root = Some(dir.path().join("queue"));
  // Port 1 refuses connections immediately
  config.index.base_url = "http://127.0.0.1:1".into();
  config.index.request_timeout_secs = 1;
  let config = Arc::new(config);

  write_file(&config.volume_root, "AUTH_acme/c/o.jpg", b"data");

  let broker = MemoryBroker::new();
  broker.publish("PUT /AUTH_acme/c/o.jpg").await.unwrap();

  let consumer = UpdateConsumer::new(config.clone(), Box::new(broker.clone())).unwrap();
  let cancel = CancellationToken::new();
  let handle = tokio::spawn(consumer.run(cancel.clone()));

  // Wait for the fallback entry to land
  let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
  loop {
    let records = queued_records(&config);
    if !records.is_empty() {
      assert_eq!(records.len(), 1);
      assert_eq!(records[0].op, Operation::Create);
      assert_eq!(records[0].object, "o.jpg");
      assert_eq!(records[0].headers.size, Some(4));
      break;
    }
    assert!(std::time::Instant::now() < deadline, "no queue entry appeared");
    tokio::time::sleep(std::time::Duration::from_millis(25)).await;
  }

  cancel.cancel();
  handle.await.unwrap().unwrap();
}
