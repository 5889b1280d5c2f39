// src/services/network.rs

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::services::backend::Backend;

/// Connectivity as seen by the browser plus an active backend probe.
///
/// The browser signal is reported by the UI; transitions are broadcast
/// through a watch channel so the submission flow can resync on reconnect.
#[derive(Clone)]
pub struct NetworkMonitor {
    online: Arc<watch::Sender<bool>>,
    backend: Arc<dyn Backend>,
}

impl NetworkMonitor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let (tx, _rx) = watch::channel(true);
        Self {
            online: Arc::new(tx),
            backend,
        }
    }

    /// Last known browser signal.
    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    /// Records a browser connectivity change.
    /// Returns true when the signal actually changed.
    pub fn report(&self, online: bool) -> bool {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            tracing::info!(online, "Connectivity changed");
        }
        changed
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Bounded probe against the backend. Never errors: anything but a
    /// timely answer counts as unreachable.
    pub async fn check_reachable(&self, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, self.backend.ping()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("Reachability probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!("Reachability probe timed out after {:?}", timeout);
                false
            }
        }
    }
}
