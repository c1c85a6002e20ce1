//! Update record builder.
//!
//! Turns a classified mutation into a complete [`UpdateRecord`]. Building a
//! Create record streams the whole file through MD5 (cost proportional to
//! file size), so the blocking work runs on the blocking pool, never on a
//! capture hot path. A file that vanishes between discovery and build is an
//! expected outcome of concurrent activity: the record is dropped, logged,
//! never fatal.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use md5::{Digest, Md5};
use tracing::debug;

use driftsync_core::{
  ObjectPath, Operation, UpdateHeaders, UpdateRecord,
  record::{DEFAULT_CONTENT_TYPE, generate_trans_id, normalize_timestamp, normalized_now},
};

/// Chunk size for streaming checksum computation.
const DISK_READ_CHUNK_SIZE: usize = 65536;

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
  /// The file vanished or cannot be opened. Expected under concurrent
  /// activity; the caller drops the record.
  #[error("file gone or unreadable: {path}: {source}")]
  Gone {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("blocking task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

/// Builds update records with a fixed storage policy.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
  policy_index: u32,
}

impl RecordBuilder {
  pub fn new(policy_index: u32) -> Self {
    Self { policy_index }
  }

  /// Build a record for `op` on `object`, statting `file` for Create.
  pub async fn build(&self, op: Operation, object: &ObjectPath, file: &Path) -> Result<UpdateRecord, BuildError> {
    match op {
      Operation::Create => self.build_create(object, file).await,
      Operation::Delete => Ok(self.build_delete(object)),
    }
  }

  /// Build a Create record: stat size, stream the checksum, stamp the
  /// file's mtime (not wall-clock; the index orders updates by it).
  pub async fn build_create(&self, object: &ObjectPath, file: &Path) -> Result<UpdateRecord, BuildError> {
    let path = file.to_path_buf();
    let policy_index = self.policy_index;
    let object = object.clone();

    let record = tokio::task::spawn_blocking(move || -> Result<UpdateRecord, BuildError> {
      let mut f = File::open(&path).map_err(|source| BuildError::Gone {
        path: path.clone(),
        source,
      })?;
      let meta = f.metadata().map_err(|source| BuildError::Gone {
        path: path.clone(),
        source,
      })?;
      let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
      let etag = compute_etag(&mut f).map_err(|source| BuildError::Gone {
        path: path.clone(),
        source,
      })?;

      Ok(UpdateRecord {
        op: Operation::Create,
        account: object.account,
        container: object.container,
        object: object.object,
        headers: UpdateHeaders {
          etag: Some(etag),
          size: Some(meta.len()),
          timestamp: normalize_timestamp(mtime),
          content_type: Some(DEFAULT_CONTENT_TYPE.into()),
          trans_id: generate_trans_id(),
          policy_index,
        },
      })
    })
    .await??;

    debug!(object = %record.object_path(), size = record.headers.size, "Built create record");
    Ok(record)
  }

  /// Build a Delete record: capture-time timestamp, no checksum or size.
  pub fn build_delete(&self, object: &ObjectPath) -> UpdateRecord {
    UpdateRecord {
      op: Operation::Delete,
      account: object.account.clone(),
      container: object.container.clone(),
      object: object.object.clone(),
      headers: UpdateHeaders {
        etag: None,
        size: None,
        timestamp: normalized_now(),
        content_type: None,
        trans_id: generate_trans_id(),
        policy_index: self.policy_index,
      },
    }
  }
}

/// Stream the full file content through MD5 in fixed-size chunks.
fn compute_etag(file: &mut File) -> std::io::Result<String> {
  let mut hasher = Md5::new();
  let mut buf = [0u8; DISK_READ_CHUNK_SIZE];
  loop {
    let n = file.read(&mut buf)?;
    if n == 0 {
      break;
    }
    hasher.update(&buf[..n]);
  }
  Ok(hex::encode(hasher.finalize()))
}
