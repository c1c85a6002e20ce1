//! Path resolution for low-level file identifiers.
//!
//! Changelog entries carry an opaque per-file identifier rather than a path.
//! The storage layer exposes a reverse lookup: each identifier has an entry
//! under a well-known directory whose extended attribute holds the logical
//! path. Paths that arrive as paths resolve to themselves.

use std::path::{Path, PathBuf};

/// A raw identifier attached to a change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ident {
  /// Already a usable volume-relative path
  Path(PathBuf),
  /// Opaque id requiring a reverse lookup
  Opaque(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
  /// The reverse-path attribute is absent. Non-fatal: the caller skips the
  /// event. Usually means reverse-path tracking is not enabled on the volume.
  #[error("attribute {attr} not set on {path} (is reverse-path tracking enabled on the volume?)")]
  NotFound { attr: String, path: PathBuf },

  #[error("failed to read attribute on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
}

/// Resolves identifiers to volume-relative paths.
///
/// Stateless and side-effect free; safe to share across backends.
#[derive(Debug, Clone)]
pub struct PathResolver {
  volume_root: PathBuf,
  ident_dir: String,
  reverse_path_attr: String,
}

impl PathResolver {
  pub fn new(config: &driftsync_core::Config) -> Self {
    Self {
      volume_root: config.volume_root.clone(),
      ident_dir: config.resolver.ident_dir.clone(),
      reverse_path_attr: config.resolver.reverse_path_attr.clone(),
    }
  }

  /// Resolve an identifier to a volume-relative path.
  ///
  /// Identity for `Ident::Path`. For opaque identifiers, reads the
  /// reverse-path attribute off the identifier's entry; a missing attribute
  /// yields [`ResolveError::NotFound`].
  pub fn resolve(&self, ident: &Ident) -> Result<PathBuf, ResolveError> {
    match ident {
      Ident::Path(path) => Ok(path.clone()),
      Ident::Opaque(id) => self.reverse_lookup(id),
    }
  }

  fn reverse_lookup(&self, id: &str) -> Result<PathBuf, ResolveError> {
    let entry = self.volume_root.join(&self.ident_dir).join(id);
    match xattr::get(&entry, &self.reverse_path_attr) {
      Ok(Some(raw)) => Ok(decode_path(&raw)),
      Ok(None) => Err(ResolveError::NotFound {
        attr: self.reverse_path_attr.clone(),
        path: entry,
      }),
      // ENODATA surfaces as Ok(None) on most platforms, but a vanished
      // entry or permission problem lands here
      Err(source) => {
        if source.raw_os_error() == Some(libc_enodata()) {
          Err(ResolveError::NotFound {
            attr: self.reverse_path_attr.clone(),
            path: entry,
          })
        } else {
          Err(ResolveError::Io { path: entry, source })
        }
      }
    }
  }
}

/// The attribute value may carry a trailing NUL; strip it.
fn decode_path(raw: &[u8]) -> PathBuf {
  let text = String::from_utf8_lossy(raw);
  PathBuf::from(text.trim_end_matches('\0'))
}

#[cfg(target_os = "linux")]
fn libc_enodata() -> i32 {
  61 // ENODATA
}

#[cfg(not(target_os = "linux"))]
fn libc_enodata() -> i32 {
  93 // ENOATTR on BSD/macOS
}

/// Make a volume-relative path (leading slash) from an absolute path.
///
/// Returns `None` when the path is not under the root.
pub fn relative_to_root(root: &Path, path: &Path) -> Option<String> {
  let rel = path.strip_prefix(root).ok()?;
  let rel = rel.to_string_lossy();
  if rel.is_empty() {
    return None;
  }
  Some(format!("/{}", rel))
}
