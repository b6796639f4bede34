use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::download_state::DownloadState;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// How often the stall check runs.
    pub check_interval: Duration,
    /// Number of idle peer sessions tolerated before recovery kicks in.
    pub min_idle_peers: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(3),
            min_idle_peers: 1,
        }
    }
}

/// Watchdog for stalled downloads. When several sessions sit idle while the
/// shared queue is empty, pieces are stuck behind stale claims or were lost
/// with a dropped connection; the monitor re-injects every piece that is not
/// yet downloaded so active sessions can pick them up again.
#[derive(Debug)]
pub struct IdleMonitor {
    config: MonitorConfig,
    download_state: Arc<DownloadState>,
}

impl IdleMonitor {
    pub fn new(download_state: Arc<DownloadState>, config: MonitorConfig) -> Self {
        Self {
            config,
            download_state,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.check_interval);
        // The first tick completes immediately; skip it so the first check
        // runs a full period after startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if self.download_state.is_complete().await {
                        break;
                    }

                    if self.stalled().await {
                        let requeued = self.download_state.requeue_missing_pieces().await;
                        if requeued > 0 {
                            info!(requeued, "Idle peers detected, requeued missing pieces");
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Idle monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn stalled(&self) -> bool {
        if self.download_state.is_complete().await {
            return false;
        }

        self.download_state.idle_peers_count().await > self.config.min_idle_peers
            && self.download_state.queue_is_empty().await
    }
}
