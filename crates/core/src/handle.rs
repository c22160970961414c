// Running tunnel handle

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Owns the accept loop of one started tunnel. Dropping the handle leaves the
/// tunnel running; call `shutdown` for an orderly stop.
#[derive(Debug)]
pub struct TunnelHandle {
    name: String,
    endpoint: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TunnelHandle {
    pub(crate) fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            cancel,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description of what the tunnel listens on
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The accept loop ended on its own (transport lost) or after shutdown
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the accept loop and its relays to stop, then wait for them.
    /// Relays observe the signal within one poll interval.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.wait().await;
    }

    /// Like `shutdown`, but gives up waiting after `grace`
    pub async fn shutdown_timeout(self, grace: Duration) {
        self.cancel.cancel();
        let name = self.name.clone();
        if tokio::time::timeout(grace, self.wait()).await.is_err() {
            warn!("Tunnel {} did not stop within {:?}", name, grace);
        }
    }

    /// Wait for the accept loop to end
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            if e.is_panic() {
                warn!("Tunnel {} task panicked: {}", self.name, e);
            } else {
                debug!("Tunnel {} task was aborted", self.name);
            }
        }
    }
}
