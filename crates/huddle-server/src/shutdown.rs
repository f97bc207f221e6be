//! Shutdown signalling for the listener and every live session.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Owns the token that sessions and the serve loop watch.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a coordinator with an uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// A clone of the shared token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token, then wait up to `timeout` for the server task.
    ///
    /// Returns `false` if the task was still running when the timeout hit.
    pub async fn drain(&self, server: JoinHandle<()>, timeout: Duration) -> bool {
        self.token.cancel();
        info!(?timeout, "draining sessions");

        if tokio::time::timeout(timeout, server).await.is_err() {
            warn!(?timeout, "shutdown timed out, server task still running");
            return false;
        }
        true
    }
}
