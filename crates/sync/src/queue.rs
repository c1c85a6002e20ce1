//! Durable on-disk update queue.
//!
//! Records land under `<queue_root>/async_pending-<policy>/<suffix>/` where
//! the suffix is the last three hex characters of the object path's MD5.
//! This is the sharded layout the index service's own updater already
//! sweeps, so queued records are drained by existing machinery.
//!
//! Writes are atomic: serialize into a dot-prefixed temp file in the final
//! directory, fsync, rename. A crash leaves either nothing or a complete
//! entry, never a torn one.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use md5::{Digest, Md5};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use driftsync_core::{Config, UpdateRecord, record::normalized_now};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  #[error("failed to serialize record: {0}")]
  Serialize(#[from] serde_json::Error),

  #[error("queue write failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Writes update records into the sharded pending directory.
///
/// The per-process counter disambiguates records for the same object queued
/// within one timestamp tick, so no enqueue ever overwrites another.
#[derive(Debug)]
pub struct UpdateQueue {
  async_dir: PathBuf,
  counter: AtomicU64,
}

impl UpdateQueue {
  pub fn new(config: &Config) -> Self {
    Self {
      async_dir: config.queue_root().join(config.async_dir_name()),
      counter: AtomicU64::new(0),
    }
  }

  /// Root directory entries are written under (for inspection and tests).
  pub fn async_dir(&self) -> &Path {
    &self.async_dir
  }

  /// Persist one record. Returns the final entry path.
  pub async fn enqueue(&self, record: &UpdateRecord) -> Result<PathBuf, QueueError> {
    let hash = object_hash(&record.object_path().to_string());
    let shard = self.async_dir.join(&hash[hash.len() - 3..]);
    let seq = self.counter.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-{}-{:06}", hash, normalized_now(), seq);
    let finalpath = shard.join(&name);
    let temp = shard.join(format!(".{name}"));

    fs::create_dir_all(&shard).await.map_err(|source| QueueError::Io {
      path: shard.clone(),
      source,
    })?;

    let bytes = record.to_bytes()?;
    let mut file = fs::File::create(&temp).await.map_err(|source| QueueError::Io {
      path: temp.clone(),
      source,
    })?;
    file.write_all(&bytes).await.map_err(|source| QueueError::Io {
      path: temp.clone(),
      source,
    })?;
    file.sync_all().await.map_err(|source| QueueError::Io {
      path: temp.clone(),
      source,
    })?;
    fs::rename(&temp, &finalpath).await.map_err(|source| QueueError::Io {
      path: finalpath.clone(),
      source,
    })?;

    debug!(entry = %finalpath.display(), op = %record.op, "Queued update");
    Ok(finalpath)
  }
}

/// MD5 of the `/account/container/object` string, hex encoded.
fn object_hash(object_path: &str) -> String {
  let mut hasher = Md5::new();
  hasher.update(object_path.as_bytes());
  hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use driftsync_core::{
    Operation, UpdateHeaders,
    record::{generate_trans_id, normalized_now},
  };
  use pretty_assertions::assert_eq;

  fn record(object: &str) -> UpdateRecord {
    UpdateRecord {
      op: Operation::Create,
      account: "AUTH_test".into(),
      container: "c".into(),
      object: object.into(),
      headers: UpdateHeaders {
        etag: Some("d41d8cd98f00b204e9800998ecf8427e".into()),
        size: Some(0),
        timestamp: normalized_now(),
        content_type: Some("application/octet-stream".into()),
        trans_id: generate_trans_id(),
        policy_index: 0,
      },
    }
  }

  fn queue(root: &Path) -> UpdateQueue {
    let mut config = Config::default();
    config.queue_root = Some(root.to_path_buf());
    UpdateQueue::new(&config)
  }

  #[tokio::test]
  async fn test_enqueue_lands_in_hash_shard() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let entry = q.enqueue(&record("o")).await.unwrap();

    let hash = object_hash("/AUTH_test/c/o");
    let shard = entry.parent().unwrap().file_name().unwrap().to_str().unwrap();
    assert_eq!(shard, &hash[29..]);
    assert!(entry.starts_with(dir.path().join("async_pending-0")));

    let name = entry.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with(&hash));
    // No temp file left behind
    let leftovers: Vec<_> = std::fs::read_dir(entry.parent().unwrap())
      .unwrap()
      .filter(|e| e.as_ref().unwrap().file_name().to_string_lossy().starts_with('.'))
      .collect();
    assert!(leftovers.is_empty());
  }

  #[tokio::test]
  async fn test_enqueue_roundtrips_record() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let original = record("photos/cat.jpg");
    let entry = q.enqueue(&original).await.unwrap();

    let bytes = std::fs::read(&entry).unwrap();
    let decoded = UpdateRecord::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, original);
  }

  #[tokio::test]
  async fn test_same_object_twice_yields_two_entries() {
    let dir = tempfile::tempdir().unwrap();
    let q = queue(dir.path());
    let first = q.enqueue(&record("o")).await.unwrap();
    let second = q.enqueue(&record("o")).await.unwrap();
    assert_ne!(first, second);
    assert!(first.exists());
    assert!(second.exists());
    // The shard depends only on the object path, never on op or timestamp
    assert_eq!(first.parent(), second.parent());

    let mut delete = record("o");
    delete.op = Operation::Delete;
    let third = q.enqueue(&delete).await.unwrap();
    assert_eq!(third.parent(), first.parent());
  }
}
