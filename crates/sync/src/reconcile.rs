//! Filesystem-vs-index reconciliation.
//!
//! The changelog and watch backends can both miss mutations (downtime,
//! dropped events, disabled changelogs), so the [`Reconciler`] periodically
//! walks every container on the volume, lists the same container from the
//! index, and queues updates for the differences: on disk but not indexed
//! means a missed create, indexed but not on disk means a missed delete.
//!
//! Both listings are materialized fully before diffing; a file created or
//! deleted mid-crawl may produce a stale update, which the index resolves by
//! timestamp. Containers are diffed concurrently under a semaphore, and one
//! container's failure never aborts the pass.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use driftsync_core::{Config, ObjectPath, Operation};

use crate::{
  builder::{BuildError, RecordBuilder},
  classify,
  index_client::{IndexError, IndexLister},
  queue::{QueueError, UpdateQueue},
};

#[derive(Debug, thiserror::Error)]
pub enum CrawlError {
  #[error("crawl io failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Index(#[from] IndexError),

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error("blocking task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// Outcome of one full reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CrawlStats {
  /// Containers diffed
  pub containers: usize,
  /// Create records queued
  pub creates: usize,
  /// Delete records queued
  pub deletes: usize,
  /// Differences skipped (self-writes, in-progress temp files, vanished files)
  pub skipped: usize,
}

impl CrawlStats {
  fn absorb(&mut self, other: CrawlStats) {
    self.containers += other.containers;
    self.creates += other.creates;
    self.deletes += other.deletes;
    self.skipped += other.skipped;
  }
}

/// Diffs the volume against the index and queues the corrections.
pub struct Reconciler<L: IndexLister + 'static> {
  config: Arc<Config>,
  lister: Arc<L>,
  builder: RecordBuilder,
  queue: Arc<UpdateQueue>,
}

impl<L: IndexLister + 'static> Reconciler<L> {
  pub fn new(config: Arc<Config>, lister: Arc<L>) -> Self {
    let builder = RecordBuilder::new(config.storage_policy_index);
    let queue = Arc::new(UpdateQueue::new(&config));
    Self {
      config,
      lister,
      builder,
      queue,
    }
  }

  /// Run one full pass over every account and container on the volume.
  pub async fn run_once(&self) -> Result<CrawlStats, CrawlError> {
    let semaphore = Arc::new(Semaphore::new(self.config.crawl.max_concurrent_containers.max(1)));
    let mut tasks: JoinSet<(String, String, Result<CrawlStats, CrawlError>)> = JoinSet::new();

    for (account, container) in self.discover_containers().await? {
      let permit_source = semaphore.clone();
      let config = self.config.clone();
      let lister = self.lister.clone();
      let builder = self.builder.clone();
      let queue = self.queue.clone();

      tasks.spawn(async move {
        let _permit = permit_source.acquire_owned().await;
        let result = reconcile_container(&config, lister.as_ref(), &builder, &queue, &account, &container).await;
        (account, container, result)
      });
    }

    let mut stats = CrawlStats::default();
    while let Some(joined) = tasks.join_next().await {
      let (account, container, result) = joined?;
      match result {
        Ok(container_stats) => stats.absorb(container_stats),
        // One broken container must not abort the pass
        Err(e) => warn!(account = %account, container = %container, error = %e, "Container reconciliation failed"),
      }
    }

    info!(
      containers = stats.containers,
      creates = stats.creates,
      deletes = stats.deletes,
      skipped = stats.skipped,
      "Reconciliation pass complete"
    );
    Ok(stats)
  }

  /// Enumerate (account, container) pairs on the volume, skipping reserved
  /// subtrees and accounts without the object-store prefix.
  async fn discover_containers(&self) -> Result<Vec<(String, String)>, CrawlError> {
    let root = self.config.volume_root.clone();
    let reseller_prefix = self.config.reseller_prefix.clone();
    let reserved = self.config.reserved_prefixes.clone();

    tokio::task::spawn_blocking(move || -> Result<Vec<(String, String)>, CrawlError> {
      let mut out = Vec::new();
      for account_entry in list_dirs(&root)? {
        let account = account_entry.to_string_lossy().into_owned();
        if !account.starts_with(&reseller_prefix) {
          continue;
        }
        if reserved.iter().any(|p| account.starts_with(p.as_str())) {
          continue;
        }
        // One unreadable account must not abort discovery for the rest
        match list_dirs(&root.join(&account)) {
          Ok(containers) => {
            for container_entry in containers {
              out.push((account.clone(), container_entry.to_string_lossy().into_owned()));
            }
          }
          Err(e) => warn!(account = %account, error = %e, "Failed to list account directory, skipping"),
        }
      }
      out.sort();
      Ok(out)
    })
    .await?
  }
}

fn list_dirs(dir: &Path) -> Result<Vec<std::ffi::OsString>, CrawlError> {
  let mut names = Vec::new();
  let entries = std::fs::read_dir(dir).map_err(|source| CrawlError::Io {
    path: dir.to_path_buf(),
    source,
  })?;
  for entry in entries {
    let entry = entry.map_err(|source| CrawlError::Io {
      path: dir.to_path_buf(),
      source,
    })?;
    if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
      names.push(entry.file_name());
    }
  }
  Ok(names)
}

/// Diff one container and queue the corrections.
async fn reconcile_container<L: IndexLister>(
  config: &Config,
  lister: &L,
  builder: &RecordBuilder,
  queue: &UpdateQueue,
  account: &str,
  container: &str,
) -> Result<CrawlStats, CrawlError> {
  let container_dir = config.volume_root.join(account).join(container);

  let on_disk = {
    let dir = container_dir.clone();
    tokio::task::spawn_blocking(move || list_files(&dir)).await??
  };
  let indexed: HashSet<String> = lister.list(account, container).await?.into_iter().collect();

  let mut stats = CrawlStats {
    containers: 1,
    ..Default::default()
  };

  for name in on_disk.difference(&indexed) {
    let object = ObjectPath::new(account, container, name.as_str());
    let file = container_dir.join(name);
    if !classify::is_foreign_write(Operation::Create, &file, &config.classify) {
      stats.skipped += 1;
      continue;
    }
    match builder.build_create(&object, &file).await {
      Ok(record) => {
        queue.enqueue(&record).await?;
        stats.creates += 1;
      }
      Err(BuildError::Gone { path, .. }) => {
        debug!(path = %path.display(), "File vanished mid-crawl");
        stats.skipped += 1;
      }
      Err(BuildError::Join(e)) => return Err(CrawlError::Join(e)),
    }
  }

  for name in indexed.difference(&on_disk) {
    let object = ObjectPath::new(account, container, name.as_str());
    let record = builder.build_delete(&object);
    queue.enqueue(&record).await?;
    stats.deletes += 1;
  }

  debug!(
    account,
    container,
    creates = stats.creates,
    deletes = stats.deletes,
    "Container diffed"
  );
  Ok(stats)
}

/// All regular files under a container directory, as container-relative
/// names with `/` separators. Every file counts, dot-named objects
/// included: a name present on both sides must land in the intersection so
/// the diff leaves it alone. In-progress temp writes are dropped later by
/// the create-side classifier.
fn list_files(container_dir: &Path) -> Result<HashSet<String>, CrawlError> {
  let mut names = HashSet::new();
  for entry in WalkDir::new(container_dir).follow_links(false) {
    let entry = entry.map_err(|e| {
      let path = e.path().unwrap_or(container_dir).to_path_buf();
      match e.into_io_error() {
        Some(source) => CrawlError::Io { path, source },
        None => CrawlError::Io {
          path,
          source: std::io::Error::other("walk cycle"),
        },
      }
    })?;
    if !entry.file_type().is_file() {
      continue;
    }
    if let Ok(rel) = entry.path().strip_prefix(container_dir) {
      names.insert(rel.to_string_lossy().into_owned());
    }
  }
  Ok(names)
}

#[cfg(test)]
mod tests {
  use super::*;
  use async_trait::async_trait;
  use pretty_assertions::assert_eq;
  use std::collections::HashMap;

  /// Canned index listings keyed by "account/container".
  struct MemoryLister {
    listings: HashMap<String, Vec<String>>,
  }

  impl MemoryLister {
    fn new(entries: &[(&str, &[&str])]) -> Self {
      let listings = entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect();
      Self { listings }
    }
  }

  #[async_trait]
  impl IndexLister for MemoryLister {
    async fn list(&self, account: &str, container: &str) -> Result<Vec<String>, IndexError> {
      Ok(
        self
          .listings
          .get(&format!("{account}/{container}"))
          .cloned()
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

  fn queued_records(config: &Config) -> Vec<driftsync_core::UpdateRecord> {
    let async_dir = config.queue_root().join(config.async_dir_name());
    let mut records = Vec::new();
    if !async_dir.exists() {
      return records;
    }
    for shard in std::fs::read_dir(&async_dir).unwrap() {
      for entry in std::fs::read_dir(shard.unwrap().path()).unwrap() {
        let bytes = std::fs::read(entry.unwrap().path()).unwrap();
        records.push(driftsync_core::UpdateRecord::from_bytes(&bytes).unwrap());
      }
    }
    records
  }

  #[tokio::test]
  async fn test_diff_queues_creates_and_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/photos/cats")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/photos/new.jpg"), b"new").unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/photos/cats/deep.jpg"), b"deep").unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/photos/both.jpg"), b"both").unwrap();

    let lister = Arc::new(MemoryLister::new(&[(
      "AUTH_test/photos",
      &["both.jpg", "removed.jpg"][..],
    )]));
    let reconciler = Reconciler::new(config.clone(), lister);
    let stats = reconciler.run_once().await.unwrap();

    assert_eq!(stats.containers, 1);
    assert_eq!(stats.creates, 2);
    assert_eq!(stats.deletes, 1);

    let records = queued_records(&config);
    assert_eq!(records.len(), 3);
    let deletes: Vec<_> = records.iter().filter(|r| r.op == Operation::Delete).collect();
    assert_eq!(deletes.len(), 1);
    assert_eq!(deletes[0].object, "removed.jpg");
    let mut creates: Vec<_> = records
      .iter()
      .filter(|r| r.op == Operation::Create)
      .map(|r| r.object.clone())
      .collect();
    creates.sort();
    assert_eq!(creates, vec!["cats/deep.jpg", "new.jpg"]);
  }

  #[tokio::test]
  async fn test_matching_sides_queue_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/c")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/c/o.jpg"), b"x").unwrap();

    let lister = Arc::new(MemoryLister::new(&[("AUTH_test/c", &["o.jpg"][..])]));
    let reconciler = Reconciler::new(config.clone(), lister);
    let stats = reconciler.run_once().await.unwrap();

    assert_eq!(stats.creates, 0);
    assert_eq!(stats.deletes, 0);
    assert!(queued_records(&config).is_empty());
  }

  #[tokio::test]
  async fn test_dot_named_object_in_both_listings_is_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/c")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/c/.hidden"), b"dot-named object").unwrap();

    let lister = Arc::new(MemoryLister::new(&[("AUTH_test/c", &[".hidden"][..])]));
    let reconciler = Reconciler::new(config.clone(), lister);
    let stats = reconciler.run_once().await.unwrap();

    // Present on both sides: no corrective record of either kind
    assert_eq!(stats.creates, 0);
    assert_eq!(stats.deletes, 0);
    assert!(queued_records(&config).is_empty());
  }

  #[tokio::test]
  async fn test_unindexed_dot_named_object_is_created_not_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/c")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/c/.hidden"), b"dot-named object").unwrap();

    let lister = Arc::new(MemoryLister::new(&[]));
    let reconciler = Reconciler::new(config.clone(), lister);
    let stats = reconciler.run_once().await.unwrap();

    // A leading dot alone does not mark a temp write; only the full
    // temp-name convention does
    assert_eq!(stats.creates, 1);
    let records = queued_records(&config);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].object, ".hidden");
  }

  #[tokio::test]
  async fn test_skips_non_prefixed_accounts_reserved_trees_and_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    // Non-prefixed account and reserved trees must not be crawled
    std::fs::create_dir_all(config.volume_root.join("scratch/c")).unwrap();
    std::fs::write(config.volume_root.join("scratch/c/o.jpg"), b"x").unwrap();
    std::fs::create_dir_all(config.volume_root.join("async_pending-0/abc")).unwrap();
    std::fs::write(config.volume_root.join("async_pending-0/abc/entry"), b"x").unwrap();
    std::fs::create_dir_all(config.volume_root.join(".glusterfs/00")).unwrap();
    // In-progress temp write inside a real container
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/c")).unwrap();
    std::fs::write(
      config
        .volume_root
        .join("AUTH_test/c/.o.0123456789abcdef0123456789abcdef"),
      b"partial",
    )
    .unwrap();

    let lister = Arc::new(MemoryLister::new(&[]));
    let reconciler = Reconciler::new(config.clone(), lister);
    let stats = reconciler.run_once().await.unwrap();

    assert_eq!(stats.containers, 1); // only AUTH_test/c
    assert_eq!(stats.creates, 0);
    assert_eq!(stats.deletes, 0);
    assert!(queued_records(&config).is_empty());
  }

  #[tokio::test]
  async fn test_unreadable_account_does_not_abort_discovery() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/c")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/c/o.jpg"), b"x").unwrap();
    let broken = config.volume_root.join("AUTH_broken");
    std::fs::create_dir(&broken).unwrap();
    std::fs::set_permissions(&broken, std::fs::Permissions::from_mode(0o000)).unwrap();

    let lister = Arc::new(MemoryLister::new(&[]));
    let reconciler = Reconciler::new(config.clone(), lister);
    let result = reconciler.run_once().await;
    std::fs::set_permissions(&broken, std::fs::Permissions::from_mode(0o755)).unwrap();

    // Running as root the 0o000 directory still lists (empty); otherwise
    // listing it fails and is skipped. Either way the healthy account must
    // be reconciled.
    let stats = result.unwrap();
    assert_eq!(stats.creates, 1);
  }

  #[tokio::test]
  async fn test_failing_container_does_not_abort_pass() {
    struct HalfBroken;

    #[async_trait]
    impl IndexLister for HalfBroken {
      async fn list(&self, _account: &str, container: &str) -> Result<Vec<String>, IndexError> {
        if container == "broken" {
          Err(IndexError::AllReplicasFailed {
            object: "listing".into(),
          })
        } else {
          Ok(Vec::new())
        }
      }
    }

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/broken")).unwrap();
    std::fs::create_dir_all(config.volume_root.join("AUTH_test/healthy")).unwrap();
    std::fs::write(config.volume_root.join("AUTH_test/healthy/o.jpg"), b"x").unwrap();

    let reconciler = Reconciler::new(config.clone(), Arc::new(HalfBroken));
    let stats = reconciler.run_once().await.unwrap();

    // Healthy container still reconciled
    assert_eq!(stats.containers, 1);
    assert_eq!(stats.creates, 1);
  }
}
