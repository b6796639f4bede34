use std::{
    collections::{HashMap, VecDeque},
    io,
    sync::Arc,
    time::Duration,
};

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use protocol::piece::{Piece, BLOCK_SIZE};

use crate::{
    disk::FileManager,
    download_state::DownloadState,
    monitor::{IdleMonitor, MonitorConfig},
    p2p::connection::PeerConnection,
    progress::ProgressReporter,
    tracker::Peer,
};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Client {
    download_path: String,
    file_name: String,
    total_length: u64,
    piece_count: u32,
    blocks_per_piece: usize,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    peers: Vec<Peer>,
    max_peer_connections: usize,
    timeout_threshold: u64,
    connection_retries: u32,
    download_state: Arc<DownloadState>,
}

impl Client {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        download_path: String,
        file_name: String,
        total_length: u64,
        piece_length: u64,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        peers: Vec<Peer>,
        pieces: HashMap<u32, Piece>,
        max_peer_connections: usize,
        timeout_threshold: u64,
        connection_retries: u32,
    ) -> Self {
        let piece_count = pieces.len() as u32;
        let blocks_per_piece = (piece_length as usize + BLOCK_SIZE - 1) / BLOCK_SIZE;

        Self {
            download_path,
            file_name,
            total_length,
            piece_count,
            blocks_per_piece,
            info_hash,
            peer_id,
            peers,
            max_peer_connections,
            timeout_threshold,
            connection_retries,
            download_state: Arc::new(DownloadState::new(pieces)),
        }
    }

    pub async fn run(self) -> io::Result<()> {
        let file_manager = FileManager::new(&self.download_path, &self.file_name)?;

        // Pick up piece fragments left behind by a previous run
        let restored = restore_downloaded_pieces(&self.download_state, &file_manager).await;
        if restored > 0 {
            info!(restored, "Restored pieces found on disk");
        }
        self.download_state.requeue_missing_pieces().await;

        if self.download_state.is_complete().await {
            info!("All pieces already present on disk");
            if !file_manager.is_merged(self.total_length) {
                file_manager
                    .merge(self.piece_count as usize, self.total_length)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            }
            return Ok(());
        }

        let (disk_tx, disk_rx) = mpsc::channel(50);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        // Background tasks stopped once the peer workers are done
        let monitor = IdleMonitor::new(Arc::clone(&self.download_state), MonitorConfig::default());
        let monitor_task = tokio::spawn(monitor.run(shutdown_tx.subscribe()));

        let reporter = ProgressReporter::new(Arc::clone(&self.download_state), PROGRESS_INTERVAL);
        let progress_task = tokio::spawn(reporter.run(shutdown_tx.subscribe()));

        // Disk writer task; hands the file manager back when the channel closes
        let disk_task = tokio::spawn(async move {
            debug!("Disk writer task initialized");

            let mut receiver: mpsc::Receiver<(Piece, Vec<u8>)> = disk_rx;
            while let Some((piece, assembled_piece)) = receiver.recv().await {
                match file_manager.save_piece(piece.index(), &assembled_piece) {
                    Ok(_) => {
                        debug!(piece_index = piece.index(), "Piece written to disk")
                    }
                    Err(e) => {
                        error!(piece_index = piece.index(), error = %e, "Error writing piece to disk")
                    }
                }
            }

            info!("Disk writer task shutting down");
            file_manager
        });

        // Spawn tasks for peer sessions
        let connection_count = self.max_peer_connections.min(self.peers.len());
        let peers_queue = Arc::new(Mutex::new(VecDeque::from(self.peers.clone())));
        let mut worker_handles = Vec::new();

        for i in 0..connection_count {
            let peers_queue = Arc::clone(&peers_queue);
            let disk_tx = disk_tx.clone();
            let download_state = Arc::clone(&self.download_state);
            let info_hash = self.info_hash;
            let peer_id = self.peer_id;
            let blocks_per_piece = self.blocks_per_piece;
            let timeout_threshold = self.timeout_threshold;
            let connection_retries = self.connection_retries;

            let worker_task = tokio::spawn(async move {
                debug!(worker_index = i, "Peer worker started");

                loop {
                    if download_state.is_complete().await {
                        break;
                    }

                    let peer = {
                        let mut queue = peers_queue.lock().await;
                        queue.pop_front()
                    };

                    match peer {
                        Some(peer) => {
                            let (io_wtx, io_rx) = mpsc::channel(50);
                            let mut connection = PeerConnection::new(
                                peer.address(),
                                blocks_per_piece,
                                Duration::from_secs(timeout_threshold),
                                io_wtx,
                                disk_tx.clone(),
                                Arc::clone(&download_state),
                            );

                            info!(
                                worker_index = i,
                                peer_address = %peer.address(),
                                session_id = %connection.session_id(),
                                "Starting peer session"
                            );
                            match connection
                                .run(
                                    io_rx,
                                    info_hash,
                                    peer_id,
                                    Duration::from_secs(timeout_threshold),
                                    connection_retries,
                                )
                                .await
                            {
                                Ok(_) => {
                                    info!(worker_index = i, peer_address = %peer.address(), "Peer session completed")
                                }
                                Err(e) => {
                                    warn!(worker_index = i, peer_address = %peer.address(), error = %e, "Peer session ended with error")
                                }
                            }
                        }
                        None => {
                            debug!(worker_index = i, "No more peers available, exiting");
                            break;
                        }
                    }
                }
            });
            worker_handles.push(worker_task);
        }

        // Await workers
        for handle in worker_handles {
            if let Err(e) = handle.await {
                error!(error = ?e, "Error in one of the peer worker tasks");
            }
        }

        // Closing the channel lets the disk task drain and return
        drop(disk_tx);
        let file_manager = match disk_task.await {
            Ok(file_manager) => file_manager,
            Err(e) => {
                error!(error = ?e, "Disk writer task failed");
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    "Disk writer task failed",
                ));
            }
        };

        let _ = shutdown_tx.send(());
        for handle in [monitor_task, progress_task] {
            if let Err(e) = handle.await {
                error!(error = ?e, "Error in one of the background tasks");
            }
        }

        if self.download_state.is_complete().await {
            info!("All pieces downloaded, merging fragments");
            file_manager
                .merge(self.piece_count as usize, self.total_length)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            info!(file = %self.file_name, "Download finished");
        } else {
            warn!(
                downloaded = self.download_state.downloaded_pieces_count().await,
                total = self.piece_count,
                "Download incomplete, ran out of peers"
            );
        }

        Ok(())
    }
}

/// Seeds the shared bitfield from piece fragments already on disk.
async fn restore_downloaded_pieces(
    download_state: &DownloadState,
    file_manager: &FileManager,
) -> usize {
    let downloaded = file_manager.downloaded_pieces(&download_state.piece_sizes());
    for &piece_index in &downloaded {
        download_state.mark_piece_downloaded(piece_index).await;
    }

    downloaded.len()
}
