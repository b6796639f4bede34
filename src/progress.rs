use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::info;

use crate::download_state::DownloadState;

/// Periodically logs piece completion and transfer rate for the current
/// download. Runs until the download completes or shutdown is signalled.
#[derive(Debug)]
pub struct ProgressReporter {
    interval: Duration,
    download_state: Arc<DownloadState>,
}

impl ProgressReporter {
    pub fn new(download_state: Arc<DownloadState>, interval: Duration) -> Self {
        Self {
            interval,
            download_state,
        }
    }

    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.tick().await;

        let mut last_bytes = self.download_state.downloaded_bytes();
        let mut last_tick = Instant::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let bytes = self.download_state.downloaded_bytes();
                    let rate = transfer_rate_kib(bytes - last_bytes, last_tick.elapsed());
                    last_bytes = bytes;
                    last_tick = Instant::now();

                    let downloaded_pieces = self.download_state.downloaded_pieces_count().await;
                    let total_pieces = self.download_state.total_pieces();
                    let percent = completion_percent(downloaded_pieces, total_pieces);

                    let percent = format!("{:.1}", percent);
                    let rate = format!("{:.1}", rate);
                    info!(
                        downloaded_pieces,
                        total_pieces,
                        percent = %percent,
                        rate_kib_s = %rate,
                        "Download progress"
                    );

                    if self.download_state.is_complete().await {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    }
}

fn transfer_rate_kib(bytes: u64, elapsed: Duration) -> f64 {
    if elapsed.is_zero() {
        return 0.0;
    }

    bytes as f64 / 1024.0 / elapsed.as_secs_f64()
}

fn completion_percent(downloaded_pieces: usize, total_pieces: usize) -> f64 {
    if total_pieces == 0 {
        return 100.0;
    }

    downloaded_pieces as f64 * 100.0 / total_pieces as f64
}
