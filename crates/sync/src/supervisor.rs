//! Backend supervision.
//!
//! Runs any combination of capture backends, each on its own task with a
//! child cancellation token. Backends are deliberately isolated: one
//! crashing backend is logged and the rest keep running, because a dead
//! watcher with a live crawler still converges (slower), while taking
//! everything down loses coverage entirely.

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::capture::CaptureBackend;

#[derive(Debug, thiserror::Error)]
pub enum SuperviseError {
  #[error("backends failed: {names}")]
  BackendsFailed { names: String },
}

/// Owns the registered backends and drives them to completion.
#[derive(Default)]
pub struct Supervisor {
  backends: Vec<Box<dyn CaptureBackend>>,
}

impl Supervisor {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(&mut self, backend: Box<dyn CaptureBackend>) {
    self.backends.push(backend);
  }

  pub fn is_empty(&self) -> bool {
    self.backends.is_empty()
  }

  /// Run every backend until `cancel` fires or each finishes on its own.
  /// Returns an error naming the backends that failed, after all of them
  /// have stopped.
  pub async fn run(self, cancel: CancellationToken) -> Result<(), SuperviseError> {
    let mut tasks: JoinSet<(&'static str, Result<(), crate::capture::CaptureError>)> = JoinSet::new();

    for backend in self.backends {
      let name = backend.name();
      let child = cancel.child_token();
      info!(backend = name, "Starting backend");
      tasks.spawn(async move { (name, backend.run(child).await) });
    }

    let mut failed: Vec<&'static str> = Vec::new();
    while let Some(joined) = tasks.join_next().await {
      match joined {
        Ok((name, Ok(()))) => info!(backend = name, "Backend finished"),
        Ok((name, Err(e))) => {
          error!(backend = name, error = %e, "Backend failed");
          failed.push(name);
        }
        Err(e) => {
          error!(error = %e, "Backend task panicked");
          failed.push("unknown");
        }
      }
    }

    if failed.is_empty() {
      Ok(())
    } else {
      Err(SuperviseError::BackendsFailed {
        names: failed.join(", "),
      })
    }
  }
}
