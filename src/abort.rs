//! Cooperative cancellation flag shared between a run and its controllers.

use std::sync::Arc;

use tokio::sync::watch;

/// Once raised, stays raised. Clones observe the same flag.
#[derive(Debug, Clone)]
pub struct AbortSignal {
  tx: Arc<watch::Sender<bool>>,
}

impl AbortSignal {
  pub fn new() -> Self {
    let (tx, _) = watch::channel(false);
    Self { tx: Arc::new(tx) }
  }

  pub fn abort(&self) {
    self.tx.send_replace(true);
  }

  pub fn is_aborted(&self) -> bool {
    *self.tx.borrow()
  }

  /// Resolves once the flag is raised.
  pub async fn aborted(&self) {
    let mut rx = self.tx.subscribe();
    // The sender lives in `self`, so the channel cannot close while we wait.
    let _ = rx.wait_for(|raised| *raised).await;
  }
}

impl Default for AbortSignal {
  fn default() -> Self {
    Self::new()
  }
}
