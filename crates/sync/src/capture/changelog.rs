//! Changelog capture backend.
//!
//! The storage layer publishes ordered changelog segments as files in a
//! directory; each segment holds one line per namespace operation. This
//! backend polls for new segments, extracts entry operations, resolves their
//! opaque identifiers to paths, and queues update records for foreign
//! creates. A segment is acknowledged (moved to a scratch directory) only
//! after every line has been processed, so a crash re-processes the segment
//! rather than losing it; downstream queueing tolerates the repeat.
//!
//! Deletes in the changelog carry only the identifier, and the reverse
//! lookup requires the file to still exist; by the time an unlink is read
//! here the path is gone. Those entries are skipped and the crawler picks up
//! the deletion on its next pass.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use driftsync_core::{Config, ObjectPath, Operation};

use crate::{
  builder::{BuildError, RecordBuilder},
  capture::{CaptureBackend, CaptureError, ChangeEvent, SourceTag},
  classify,
  queue::{QueueError, UpdateQueue},
  resolve::{Ident, PathResolver, ResolveError},
};

#[derive(Debug, thiserror::Error)]
pub enum ChangelogError {
  #[error("changelog io failed at {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error("blocking task failed: {0}")]
  Join(#[from] tokio::task::JoinError),
}

// ============================================================================
// Segment tailing
// ============================================================================

/// Source of changelog segments. The seam exists so tests can feed segments
/// without a real storage layer publishing them.
pub trait ChangelogTailer: Send + Sync {
  /// Unprocessed segments, oldest first.
  fn scan(&mut self) -> std::io::Result<Vec<PathBuf>>;

  /// Acknowledge a fully-processed segment so it is never scanned again.
  fn done(&mut self, segment: &Path) -> std::io::Result<()>;
}

/// Tails a directory of segment files; acknowledged segments move into a
/// scratch directory.
#[derive(Debug)]
pub struct DirTailer {
  dir: PathBuf,
  scratch_dir: PathBuf,
}

impl DirTailer {
  pub fn new(dir: PathBuf, scratch_dir: PathBuf) -> Self {
    Self { dir, scratch_dir }
  }
}

impl ChangelogTailer for DirTailer {
  fn scan(&mut self) -> std::io::Result<Vec<PathBuf>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(&self.dir)? {
      let entry = entry?;
      if !entry.file_type()?.is_file() {
        continue;
      }
      // Dot files are in-progress segments the publisher has not renamed yet
      if entry.file_name().to_string_lossy().starts_with('.') {
        continue;
      }
      segments.push(entry.path());
    }
    // Segment names are timestamped; name order is publish order
    segments.sort();
    Ok(segments)
  }

  fn done(&mut self, segment: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(&self.scratch_dir)?;
    let name = segment.file_name().unwrap_or_default();
    std::fs::rename(segment, self.scratch_dir.join(name))
  }
}

// ============================================================================
// Line format
// ============================================================================

/// A parsed changelog line this backend cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogEntry {
  pub ident: String,
  pub kind: EntryKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  Create,
  Unlink,
  Other,
}

/// Parse one changelog line.
///
/// Lines are whitespace-separated: a one-letter record class, the file
/// identifier, then the operation type and its arguments. Only entry-class
/// (`E`) records describe namespace operations; data and metadata records
/// are ignored.
pub fn parse_line(line: &str) -> Option<ChangelogEntry> {
  let mut fields = line.split_whitespace();
  let class = fields.next()?;
  if class != "E" {
    return None;
  }
  let ident = fields.next()?;
  let kind = match fields.next()? {
    "CREATE" | "MKNOD" => EntryKind::Create,
    "UNLINK" => EntryKind::Unlink,
    _ => EntryKind::Other,
  };
  Some(ChangelogEntry {
    ident: ident.to_string(),
    kind,
  })
}

// ============================================================================
// Backend
// ============================================================================

/// Polls changelog segments and queues update records for foreign creates.
pub struct ChangelogSource<T: ChangelogTailer> {
  config: Arc<Config>,
  tailer: T,
  resolver: PathResolver,
  builder: RecordBuilder,
  queue: UpdateQueue,
}

impl ChangelogSource<DirTailer> {
  pub fn new(config: Arc<Config>) -> Self {
    let tailer = DirTailer::new(config.changelog.dir.clone(), config.changelog.scratch_dir.clone());
    Self::with_tailer(config, tailer)
  }
}

impl<T: ChangelogTailer> ChangelogSource<T> {
  pub fn with_tailer(config: Arc<Config>, tailer: T) -> Self {
    let resolver = PathResolver::new(&config);
    let builder = RecordBuilder::new(config.storage_policy_index);
    let queue = UpdateQueue::new(&config);
    Self {
      config,
      tailer,
      resolver,
      builder,
      queue,
    }
  }

  /// Process every pending segment once. Returns the number of records
  /// queued.
  pub async fn run_once(&mut self) -> Result<usize, ChangelogError> {
    let segments = self.tailer.scan().map_err(|source| ChangelogError::Io {
      path: self.config.changelog.dir.clone(),
      source,
    })?;

    let mut queued = 0;
    for segment in segments {
      queued += self.process_segment(&segment).await?;
      self.tailer.done(&segment).map_err(|source| ChangelogError::Io {
        path: segment.clone(),
        source,
      })?;
    }
    Ok(queued)
  }

  async fn process_segment(&mut self, segment: &Path) -> Result<usize, ChangelogError> {
    let content = tokio::fs::read_to_string(segment)
      .await
      .map_err(|source| ChangelogError::Io {
        path: segment.to_path_buf(),
        source,
      })?;

    let mut queued = 0;
    for line in content.lines().filter(|l| !l.trim().is_empty()) {
      let Some(entry) = parse_line(line) else {
        continue;
      };
      match entry.kind {
        EntryKind::Create => {
          let event = ChangeEvent::new(Operation::Create, Ident::Opaque(entry.ident), SourceTag::Changelog);
          if self.handle_create(&event).await? {
            queued += 1;
          }
        }
        EntryKind::Unlink => {
          // The file is already gone, so the identifier cannot be resolved
          // to a path here. The crawler reconciles the deletion.
          debug!(ident = %entry.ident, "Skipping unlink entry (deletes are reconciled by crawl)");
        }
        EntryKind::Other => {}
      }
    }

    debug!(segment = %segment.display(), queued, "Processed changelog segment");
    Ok(queued)
  }

  /// Resolve, filter, classify, build, queue. Returns whether a record was
  /// queued; per-entry failures are skipped so one bad entry never stalls
  /// the segment.
  async fn handle_create(&self, event: &ChangeEvent) -> Result<bool, ChangelogError> {
    let relative = match self.resolver.resolve(&event.ident) {
      Ok(path) => path,
      Err(ResolveError::NotFound { .. }) => {
        debug!(ident = ?event.ident, "Identifier no longer resolvable, skipping");
        return Ok(false);
      }
      Err(e) => {
        warn!(ident = ?event.ident, error = %e, "Resolve failed, skipping entry");
        return Ok(false);
      }
    };

    let relative = relative.to_string_lossy().into_owned();
    if self.config.is_reserved(&relative) {
      return Ok(false);
    }
    let Some(object) = ObjectPath::parse(&relative) else {
      // Account or container level entries carry no object
      return Ok(false);
    };
    if !object.is_object_account(&self.config.reseller_prefix) {
      return Ok(false);
    }

    let file = self.config.volume_root.join(relative.trim_start_matches('/'));
    if !classify::is_foreign_write(Operation::Create, &file, &self.config.classify) {
      debug!(object = %object, "Self-write, skipping");
      return Ok(false);
    }

    match self.builder.build_create(&object, &file).await {
      Ok(record) => {
        self.queue.enqueue(&record).await?;
        Ok(true)
      }
      Err(BuildError::Gone { path, .. }) => {
        debug!(path = %path.display(), "File vanished before building record");
        Ok(false)
      }
      Err(BuildError::Join(e)) => Err(ChangelogError::Join(e)),
    }
  }
}

#[async_trait]
impl<T: ChangelogTailer + 'static> CaptureBackend for ChangelogSource<T> {
  fn name(&self) -> &'static str {
    "changelog"
  }

  async fn run(mut self: Box<Self>, cancel: CancellationToken) -> Result<(), CaptureError> {
    info!(dir = %self.config.changelog.dir.display(), "Changelog backend started");
    let poll = std::time::Duration::from_secs(self.config.changelog.poll_interval_secs.max(1));

    loop {
      match self.run_once().await {
        Ok(0) => {}
        Ok(queued) => info!(queued, "Changelog pass complete"),
        // A missing changelog directory just means the storage layer has
        // not published anything yet
        Err(ChangelogError::Io { ref path, ref source })
          if source.kind() == std::io::ErrorKind::NotFound && path == &self.config.changelog.dir =>
        {
          debug!(dir = %path.display(), "Changelog directory absent, waiting");
        }
        Err(e) => return Err(e.into()),
      }

      tokio::select! {
        biased;
        _ = cancel.cancelled() => break,
        _ = tokio::time::sleep(poll) => {}
      }
    }

    info!("Changelog backend stopped");
    Ok(())
  }
}
