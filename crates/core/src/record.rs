//! Value types for index update records.
//!
//! Everything here is immutable once constructed: a capture backend emits a
//! `ChangeEvent` (defined in the sync crate), the builder turns it into an
//! [`UpdateRecord`], and the durable queue serializes that record verbatim.
//! Header names and wire values (`PUT`/`DELETE`) match what the index servers
//! already accept, so the serialized form is a compatibility surface.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Fixed content type stamped on every Create record (no sniffing).
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// User-Agent sent with direct index update calls.
pub const USER_AGENT: &str = "driftsync-watcher";

// ============================================================================
// Operation
// ============================================================================

/// A filesystem mutation kind as seen by the index.
///
/// Only creation and deletion exist; in-place modification and renames are
/// out of scope (a rename is observed as a delete plus a create).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
  Create,
  Delete,
}

impl Operation {
  /// Wire form used on the broker payload and the index HTTP API.
  pub fn as_str(&self) -> &'static str {
    match self {
      Operation::Create => "PUT",
      Operation::Delete => "DELETE",
    }
  }

  /// Parse the wire form back into an operation.
  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "PUT" => Some(Operation::Create),
      "DELETE" => Some(Operation::Delete),
      _ => None,
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

// ============================================================================
// ObjectPath
// ============================================================================

/// The (account, container, object) triple addressed by an update.
///
/// Parsed from a volume-relative path. The object component may itself
/// contain `/`: directories below the container level are part of the
/// object name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectPath {
  pub account: String,
  pub container: String,
  pub object: String,
}

impl ObjectPath {
  pub fn new(account: impl Into<String>, container: impl Into<String>, object: impl Into<String>) -> Self {
    Self {
      account: account.into(),
      container: container.into(),
      object: object.into(),
    }
  }

  /// Split a volume-relative path into account/container/object.
  ///
  /// Returns `None` when the path has fewer than three non-empty segments;
  /// such a path cannot address an object and the event is discarded.
  pub fn parse(relative: &str) -> Option<Self> {
    let trimmed = relative.trim_start_matches('/');
    let mut parts = trimmed.splitn(3, '/');
    let account = parts.next().filter(|s| !s.is_empty())?;
    let container = parts.next().filter(|s| !s.is_empty())?;
    let object = parts.next().filter(|s| !s.is_empty())?;
    Some(Self::new(account, container, object))
  }

  /// Whether the account carries the prefix marking object-store accounts.
  ///
  /// Paths under other top-level directories share the volume but are not
  /// index objects.
  pub fn is_object_account(&self, reseller_prefix: &str) -> bool {
    self.account.starts_with(reseller_prefix)
  }

  /// Base name of the object (the last path segment).
  pub fn object_basename(&self) -> &str {
    self.object.rsplit('/').next().unwrap_or(&self.object)
  }
}

impl fmt::Display for ObjectPath {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "/{}/{}/{}", self.account, self.container, self.object)
  }
}

// ============================================================================
// Timestamps and transaction ids
// ============================================================================

/// Normalize a unix timestamp to the fixed-width form the index expects.
///
/// 10 integer digits, 5 decimal digits, zero padded. Same-object updates are
/// ordered by lexicographic comparison of this string, which is why the
/// width is fixed.
pub fn normalize_timestamp(secs: f64) -> String {
  format!("{:016.5}", secs.max(0.0))
}

/// Normalized current wall-clock time.
pub fn normalized_now() -> String {
  let now = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs_f64();
  normalize_timestamp(now)
}

/// Generate a fresh transaction id: `tx` + 21 hex chars + hex time suffix.
pub fn generate_trans_id() -> String {
  let uid = uuid::Uuid::new_v4().simple().to_string();
  let secs = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs();
  format!("tx{}-{:010x}", &uid[..21], secs)
}

// ============================================================================
// UpdateRecord
// ============================================================================

/// Header set carried by an update record.
///
/// Field order here is the serialization order. `None` fields are omitted
/// entirely (a Delete carries no etag, size, or content type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateHeaders {
  #[serde(rename = "X-Etag", skip_serializing_if = "Option::is_none", default)]
  pub etag: Option<String>,
  #[serde(rename = "X-Size", skip_serializing_if = "Option::is_none", default)]
  pub size: Option<u64>,
  #[serde(rename = "X-Timestamp")]
  pub timestamp: String,
  #[serde(rename = "X-Content-Type", skip_serializing_if = "Option::is_none", default)]
  pub content_type: Option<String>,
  #[serde(rename = "X-Trans-Id")]
  pub trans_id: String,
  #[serde(rename = "X-Backend-Storage-Policy-Index")]
  pub policy_index: u32,
}

impl UpdateHeaders {
  /// Flatten into (name, value) pairs for an outgoing HTTP request.
  pub fn pairs(&self) -> Vec<(&'static str, String)> {
    let mut out = Vec::with_capacity(6);
    if let Some(ref etag) = self.etag {
      out.push(("X-Etag", etag.clone()));
    }
    if let Some(size) = self.size {
      out.push(("X-Size", size.to_string()));
    }
    out.push(("X-Timestamp", self.timestamp.clone()));
    if let Some(ref ct) = self.content_type {
      out.push(("X-Content-Type", ct.clone()));
    }
    out.push(("X-Trans-Id", self.trans_id.clone()));
    out.push(("X-Backend-Storage-Policy-Index", self.policy_index.to_string()));
    out
  }
}

/// A complete index update, ready to be queued or applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
  pub op: Operation,
  pub account: String,
  pub container: String,
  #[serde(rename = "obj")]
  pub object: String,
  pub headers: UpdateHeaders,
}

impl UpdateRecord {
  pub fn object_path(&self) -> ObjectPath {
    ObjectPath::new(&self.account, &self.container, &self.object)
  }

  /// Serialize for the durable queue.
  pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(self)
  }

  /// Deserialize a queued record.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
    serde_json::from_slice(bytes)
  }
}
