//! Self-write classification.
//!
//! The index service writes to the same volume we watch, so every observed
//! mutation must be classified before it feeds back into the index. Writes
//! the service performed itself are recognized by its atomic-rename
//! convention (dot-prefixed temp name with a 32-hex tag), by the ownership
//! attribute it stamps on finished files, or, for deletions, by its
//! rename-to-tombstone pattern. Only foreign writes proceed to record
//! building; this is what breaks the feedback loop.
//!
//! Both predicates are pure and stateless; safe to call from any backend
//! concurrently.

use std::path::Path;

use driftsync_core::{Operation, config::ClassifyConfig};

/// Whether a file name matches the index service's managed temp-file
/// convention: dot prefix, then anything, then a dot and exactly 32
/// lowercase hex characters.
pub fn is_managed_temp_name(name: &str) -> bool {
  let Some(rest) = name.strip_prefix('.') else {
    return false;
  };
  let Some(dot) = rest.rfind('.') else {
    return false;
  };
  let tag = &rest[dot + 1..];
  tag.len() == 32 && tag.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Decide whether an observed mutation came from outside the index service.
///
/// - Create: not foreign when the base name is a managed temp name or the
///   ownership attribute is present on the file.
/// - Delete: not foreign when the path carries the tombstone suffix
///   (the service renames before unlinking, so a genuine service deletion
///   is observed as a tombstone delete).
pub fn is_foreign_write(op: Operation, path: &Path, config: &ClassifyConfig) -> bool {
  match op {
    Operation::Create => {
      let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
      if is_managed_temp_name(name) {
        return false;
      }
      !has_ownership_attr(path, &config.ownership_attr)
    }
    Operation::Delete => !path
      .to_str()
      .map(|p| p.trim_end().ends_with(&config.tombstone_suffix))
      .unwrap_or(false),
  }
}

fn has_ownership_attr(path: &Path, attr: &str) -> bool {
  matches!(xattr::get(path, attr), Ok(Some(_)))
}
