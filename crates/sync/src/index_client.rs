//! HTTP client for the object-metadata index.
//!
//! Two call sites: the reconciliation crawler lists a container's indexed
//! objects, and the consumer applies update records directly against the
//! index servers. Application fans out to every configured replica; the
//! update counts as applied when at least one replica accepted it (the
//! index's own replication repairs the rest).

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use tracing::{debug, warn};

use driftsync_core::{Operation, UpdateRecord, config::IndexConfig, record::USER_AGENT};

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
  #[error("index request failed: {0}")]
  Http(#[from] reqwest::Error),

  #[error("index returned {status} for {url}")]
  Status { url: String, status: StatusCode },

  #[error("no replica accepted update for {object}")]
  AllReplicasFailed { object: String },
}

/// Read side of the index used by the crawler. A trait so reconciliation
/// tests can run against a canned listing.
#[async_trait]
pub trait IndexLister: Send + Sync {
  /// Object names currently indexed under `account/container`.
  async fn list(&self, account: &str, container: &str) -> Result<Vec<String>, IndexError>;
}

fn listing_url(base: &str, account: &str, container: &str) -> String {
  format!("{}/v1/{}/{}", base.trim_end_matches('/'), account, container)
}

fn object_url(base: &str, record: &UpdateRecord) -> String {
  format!(
    "{}/v1/{}/{}/{}",
    base.trim_end_matches('/'),
    record.account,
    record.container,
    record.object
  )
}

/// Plain-text listings are one object name per line.
fn parse_listing(body: &str) -> Vec<String> {
  body.lines().filter(|l| !l.is_empty()).map(str::to_string).collect()
}

/// Client for the index listing and update APIs.
pub struct IndexClient {
  http: reqwest::Client,
  base_url: String,
  replicas: Vec<String>,
}

impl IndexClient {
  pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
    let http = reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(config.request_timeout_secs))
      .user_agent(USER_AGENT)
      .build()?;
    Ok(Self {
      http,
      base_url: config.base_url.clone(),
      replicas: config.replicas.clone(),
    })
  }

  fn update_targets(&self) -> &[String] {
    if self.replicas.is_empty() {
      std::slice::from_ref(&self.base_url)
    } else {
      &self.replicas
    }
  }

  /// Apply one update record, fanning out to all replicas. Succeeds when at
  /// least one replica accepts.
  pub async fn apply(&self, record: &UpdateRecord) -> Result<(), IndexError> {
    let method = match record.op {
      Operation::Create => Method::PUT,
      Operation::Delete => Method::DELETE,
    };

    let mut accepted = 0usize;
    for base in self.update_targets() {
      let url = object_url(base, record);
      let mut request = self.http.request(method.clone(), &url);
      for (name, value) in record.headers.pairs() {
        request = request.header(name, value);
      }

      match request.send().await {
        Ok(response) if response.status().is_success() => accepted += 1,
        // Deleting an object the index never had is already the desired state
        Ok(response) if record.op == Operation::Delete && response.status() == StatusCode::NOT_FOUND => accepted += 1,
        Ok(response) => {
          warn!(url = %url, status = %response.status(), "Replica rejected update");
        }
        Err(e) => {
          warn!(url = %url, error = %e, "Replica unreachable");
        }
      }
    }

    if accepted == 0 {
      return Err(IndexError::AllReplicasFailed {
        object: record.object_path().to_string(),
      });
    }
    debug!(object = %record.object_path(), op = %record.op, accepted, "Applied update");
    Ok(())
  }
}

#[async_trait]
impl IndexLister for IndexClient {
  async fn list(&self, account: &str, container: &str) -> Result<Vec<String>, IndexError> {
    let url = listing_url(&self.base_url, account, container);
    let response = self.http.get(&url).send().await?;

    match response.status() {
      status if status.is_success() => Ok(parse_listing(&response.text().await?)),
      // A container the index has never seen lists as empty
      StatusCode::NOT_FOUND => Ok(Vec::new()),
      status => Err(IndexError::Status { url, status }),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use driftsync_core::{UpdateHeaders, record::generate_trans_id, record::normalized_now};
  use pretty_assertions::assert_eq;

  #[test]
  fn test_urls() {
    assert_eq!(
      listing_url("http://127.0.0.1:8080/", "AUTH_test", "photos"),
      "http://127.0.0.1:8080/v1/AUTH_test/photos"
    );

    let record = UpdateRecord {
      op: Operation::Create,
      account: "AUTH_test".into(),
      container: "photos".into(),
      object: "cats/tabby.jpg".into(),
      headers: UpdateHeaders {
        etag: None,
        size: None,
        timestamp: normalized_now(),
        content_type: None,
        trans_id: generate_trans_id(),
        policy_index: 0,
      },
    };
    assert_eq!(
      object_url("http://idx:8080", &record),
      "http://idx:8080/v1/AUTH_test/photos/cats/tabby.jpg"
    );
  }

  #[test]
  fn test_parse_listing() {
    assert_eq!(parse_listing("a.jpg\nb/c.jpg\n\n"), vec!["a.jpg", "b/c.jpg"]);
    assert_eq!(parse_listing(""), Vec::<String>::new());
  }

  #[test]
  fn test_update_targets_fall_back_to_base() {
    let client = IndexClient::new(&IndexConfig::default()).unwrap();
    assert_eq!(client.update_targets(), &["http://127.0.0.1:8080".to_string()]);

    let config = IndexConfig {
      replicas: vec!["http://a:8080".into(), "http://b:8080".into()],
      ..Default::default()
    };
    let client = IndexClient::new(&config).unwrap();
    assert_eq!(client.update_targets().len(), 2);
  }
}
