use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use rand::{distributions::Alphanumeric, Rng};
use sha1::{Digest, Sha1};
use tokio::io::{self, AsyncReadExt, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use protocol::bitfield::Bitfield;
use protocol::error::ProtocolError;
use protocol::handshake::{Handshake, HANDSHAKE_LENGTH};
use protocol::message::{Message, MessageId, PiecePayload, TransferPayload};
use protocol::piece::{Piece, BLOCK_SIZE};

use crate::download_state::DownloadState;

use super::io::{read_message, send_message};

/// Maximum number of block requests kept in flight per peer.
const REQUEST_WINDOW: usize = 5;

/// Corrupted pieces tolerated from a peer before the session is dropped.
const MAX_STRIKES: u8 = 3;

/// Read deadline used while negotiating and while choked. Once the peer
/// unchokes us the deadline is extended to the configured idle timeout.
const CHOKED_READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    AwaitingBitfield,
    Ready,
    Closed,
}

/// A single peer session: dials, handshakes, then drives the message loop
/// until the download completes, the peer turns out useless or an error
/// closes the stream. All block requests flow through a bounded pipeline
/// keyed by `(piece index, begin offset)`.
#[derive(Debug)]
pub struct PeerConnection {
    session_id: String,
    peer_addr: String,
    state: ConnectionState,
    is_choked: bool,
    is_interested: bool,
    peer_choked: bool,
    peer_interested: bool,
    peer_bitfield: Bitfield,
    active_pieces: HashMap<u32, Piece>,
    block_queue: VecDeque<TransferPayload>,
    outstanding_requests: HashSet<(u32, u32)>,
    blocks_per_piece: usize,
    base_read_timeout: Duration,
    read_deadline: Duration,
    strikes: u8,
    io_wtx: mpsc::Sender<Message>,
    disk_tx: mpsc::Sender<(Piece, Vec<u8>)>,
    download_state: Arc<DownloadState>,
}

impl PeerConnection {
    pub fn new(
        peer_addr: String,
        blocks_per_piece: usize,
        read_timeout: Duration,
        io_wtx: mpsc::Sender<Message>,
        disk_tx: mpsc::Sender<(Piece, Vec<u8>)>,
        download_state: Arc<DownloadState>,
    ) -> Self {
        let total_pieces = download_state.total_pieces();

        Self {
            session_id: Uuid::new_v4().to_string(),
            peer_addr,
            state: ConnectionState::Connecting,
            is_choked: true,
            is_interested: false,
            peer_choked: true,
            peer_interested: false,
            peer_bitfield: Bitfield::new(total_pieces),
            active_pieces: HashMap::new(),
            block_queue: VecDeque::new(),
            outstanding_requests: HashSet::new(),
            blocks_per_piece,
            base_read_timeout: read_timeout,
            read_deadline: CHOKED_READ_TIMEOUT,
            strikes: 0,
            io_wtx,
            disk_tx,
            download_state,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Runs the session end to end: connect, handshake, message loop. The
    /// writer half is serviced by its own task fed from `io_rx`, and any
    /// claimed work is returned to the shared queue before this returns.
    #[instrument(skip(self, io_rx, info_hash, peer_id), fields(session_id = %self.session_id, peer_addr = %self.peer_addr))]
    pub async fn run(
        &mut self,
        mut io_rx: mpsc::Receiver<Message>,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        connect_timeout: Duration,
        connection_retries: u32,
    ) -> Result<(), ConnectionError> {
        let mut stream = match self.establish(connect_timeout, connection_retries).await {
            Ok(stream) => stream,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(e);
            }
        };

        if let Err(e) = self.exchange_handshake(&mut stream, info_hash, peer_id).await {
            self.state = ConnectionState::Closed;
            return Err(e);
        }

        let (mut read_half, mut write_half) = io::split(stream);
        let writer_handle = tokio::spawn(async move {
            while let Some(message) = io_rx.recv().await {
                if let Err(e) = send_message(&mut write_half, message).await {
                    debug!(error = %e, "Peer writer task ended");
                    break;
                }
            }
        });

        let result = self.drive(&mut read_half).await;
        self.close().await;
        writer_handle.abort();

        result
    }

    async fn establish(
        &mut self,
        connect_timeout: Duration,
        connection_retries: u32,
    ) -> Result<TcpStream, ConnectionError> {
        self.state = ConnectionState::Connecting;

        let mut attempts = 0;
        while attempts < connection_retries {
            match timeout(connect_timeout, TcpStream::connect(&self.peer_addr)).await {
                Ok(Ok(stream)) => {
                    debug!("TCP connection established");
                    self.state = ConnectionState::Handshaking;
                    return Ok(stream);
                }
                Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    warn!("Connection refused by peer");
                    return Err(ConnectionError::ConnectionRefused(e));
                }
                Ok(Err(e)) => {
                    warn!("Failed to connect to peer: {}", e);
                    return Err(e.into());
                }
                Err(_) => {
                    // Timeout elapsed
                    attempts += 1;
                    warn!("Attempt {} timed out, retrying...", attempts);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }

        Err(ConnectionError::ConnectTimeout)
    }

    async fn exchange_handshake(
        &mut self,
        stream: &mut TcpStream,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
    ) -> Result<(), ConnectionError> {
        let handshake = Handshake::new(info_hash, peer_id);
        stream.write_all(&handshake.serialize()).await?;

        let mut buffer = vec![0u8; HANDSHAKE_LENGTH];
        let mut bytes_read = 0;

        // Loop until we've read the full handshake response
        while bytes_read < HANDSHAKE_LENGTH {
            match timeout(CHOKED_READ_TIMEOUT, stream.read(&mut buffer[bytes_read..])).await {
                Ok(Ok(0)) => return Err(ConnectionError::ConnectionClosed),
                Ok(Ok(n)) => bytes_read += n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => return Err(ConnectionError::ReadTimeout),
            }
        }

        let response = Handshake::deserialize(&buffer)?;
        if response.info_hash != info_hash {
            return Err(ConnectionError::InfoHashMismatch);
        }

        debug!(
            remote_peer_id = %String::from_utf8_lossy(&response.peer_id),
            "Handshake completed"
        );
        self.state = ConnectionState::AwaitingBitfield;

        Ok(())
    }

    /// Message loop: tops up the request pipeline, publishes the idle flag
    /// and waits for the next message under the current read deadline.
    async fn drive(&mut self, read_half: &mut ReadHalf<TcpStream>) -> Result<(), ConnectionError> {
        loop {
            if self.download_state.is_complete().await {
                info!("Download complete, closing peer session");
                return Ok(());
            }

            if self.state == ConnectionState::Ready {
                self.fill_block_queue().await;
                self.pump_requests().await?;
            }

            self.download_state
                .set_peer_idle(&self.session_id, self.is_idle())
                .await;

            // Nothing left to do here or anywhere else
            if self.state == ConnectionState::Ready
                && !self.has_local_work()
                && !self.download_state.has_remaining_work().await
            {
                return Ok(());
            }

            let message = match timeout(self.read_deadline, read_message(read_half)).await {
                Ok(Ok(message)) => message,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(ConnectionError::ReadTimeout),
            };

            self.handle_message(message).await?;
        }
    }

    #[instrument(skip(self, message), fields(session_id = %self.session_id, message_type = ?message.message_id))]
    pub async fn handle_message(&mut self, message: Message) -> Result<(), ConnectionError> {
        match message.message_id {
            MessageId::KeepAlive => {
                debug!("Received KeepAlive message");
                self.read_deadline = self.base_read_timeout;
            }
            MessageId::Choke => {
                self.is_choked = true;
                self.read_deadline = CHOKED_READ_TIMEOUT;
                info!("Choked by peer");

                // Optimistic unchoke so transfers can resume quickly
                self.peer_choked = false;
                self.io_wtx
                    .send(Message::new(MessageId::Unchoke, None))
                    .await?;
            }
            MessageId::Unchoke => {
                self.is_choked = false;
                self.read_deadline = self.base_read_timeout;
                info!("Unchoked by peer");
            }
            MessageId::Interested => {
                self.peer_interested = true;
                info!("Peer expressed interest");

                if self.peer_choked {
                    self.peer_choked = false;
                    self.io_wtx
                        .send(Message::new(MessageId::Unchoke, None))
                        .await?;
                }
            }
            MessageId::NotInterested => {
                self.peer_interested = false;
                info!("Peer no longer interested");
            }
            MessageId::Have => {
                let piece_index = message.parse_have()?;
                debug!(piece_index, "'Have' message received from peer");
                self.peer_bitfield.set_piece(piece_index as usize);

                // A Have before any Bitfield still tells us what the peer serves
                if self.state == ConnectionState::AwaitingBitfield {
                    self.announce_interest().await?;
                }
            }
            MessageId::Bitfield => {
                let payload = message.payload.ok_or(ConnectionError::EmptyPayload)?;
                let bitfield = Bitfield::from(&payload, self.download_state.total_pieces());
                debug!(pieces = bitfield.count(), "Received peer bitfield");

                self.peer_bitfield = bitfield;
                self.announce_interest().await?;
            }
            MessageId::Piece => {
                self.download(message.payload.as_deref()).await?;
            }
            MessageId::Request | MessageId::Cancel | MessageId::Port => {
                debug!("Ignoring unsupported message");
            }
        }

        Ok(())
    }

    /// Checks whether the peer serves anything we still miss; if so,
    /// declares interest and promotes the session to `Ready`.
    async fn announce_interest(&mut self) -> Result<(), ConnectionError> {
        if !self
            .download_state
            .has_missing_pieces(&self.peer_bitfield)
            .await
        {
            info!("Peer has no pieces we need, closing session");
            return Err(ConnectionError::NoUsefulPieces);
        }

        if !self.is_interested {
            self.io_wtx
                .send(Message::new(MessageId::Unchoke, None))
                .await?;
            self.io_wtx
                .send(Message::new(MessageId::Interested, None))
                .await?;
            self.is_interested = true;
        }

        if self.state == ConnectionState::AwaitingBitfield {
            self.state = ConnectionState::Ready;
        }

        Ok(())
    }

    async fn download(&mut self, payload: Option<&[u8]>) -> Result<(), ConnectionError> {
        let bytes = payload.ok_or(ConnectionError::EmptyPayload)?;
        let payload = PiecePayload::deserialize(bytes)?;

        // The pipeline is keyed by piece index and begin offset only, so a
        // response frees its slot regardless of the delivered block length.
        self.outstanding_requests
            .remove(&(payload.index, payload.begin));

        let piece = match self.active_pieces.get_mut(&payload.index) {
            Some(piece) => piece,
            None => {
                debug!(piece_index = ?payload.index, "Ignoring block for inactive piece");
                return Ok(());
            }
        };

        debug!(piece_index = ?payload.index, block_offset = ?payload.begin, "Downloading piece block");
        piece.add_block(&payload)?;
        self.download_state
            .add_downloaded_bytes(payload.block.len() as u64);

        if piece.is_ready() && !piece.is_finalized() {
            let buffer = piece.assemble()?;
            debug!(piece_index = ?payload.index, "Piece ready. Verifying hash...");

            if is_valid_piece(*piece.hash(), &buffer) {
                debug!(piece_index = ?payload.index, "Piece hash verified. Sending to disk");
                piece.mark_finalized();
                self.disk_tx.send((piece.clone(), buffer)).await?;
                self.download_state.complete_piece(payload.index).await;
                self.active_pieces.remove(&payload.index);
            } else {
                warn!(piece_index = ?payload.index, "Piece hash verification failed, requeuing");
                self.discard_piece(payload.index).await;

                self.strikes += 1;
                if self.strikes >= MAX_STRIKES {
                    return Err(ConnectionError::CorruptedPiece(payload.index));
                }
            }
        }

        Ok(())
    }

    /// Drops all local state for a piece and hands it back to the shared
    /// queue so another session can retry it from scratch.
    async fn discard_piece(&mut self, piece_index: u32) {
        self.active_pieces.remove(&piece_index);
        self.block_queue.retain(|request| request.index != piece_index);
        self.outstanding_requests
            .retain(|&(index, _)| index != piece_index);
        self.download_state.redistribute_pieces(&[piece_index]).await;
    }

    /// Claims pieces from the shared queue until roughly one piece's worth
    /// of block requests is queued locally.
    async fn fill_block_queue(&mut self) {
        if self.is_choked {
            return;
        }

        while self.block_queue.len() < self.blocks_per_piece {
            match self.download_state.assign_piece(&self.peer_bitfield).await {
                Some(piece) => {
                    debug!(piece_index = ?piece.index(), "Claimed piece");
                    self.block_queue.extend(expand_block_requests(&piece));
                    self.active_pieces.insert(piece.index(), piece);
                }
                None => break,
            }
        }
    }

    /// Moves queued block requests onto the wire until the pipeline holds
    /// `REQUEST_WINDOW` outstanding requests.
    async fn pump_requests(&mut self) -> Result<(), ConnectionError> {
        if self.is_choked {
            return Ok(());
        }

        while self.outstanding_requests.len() < REQUEST_WINDOW {
            let Some(request) = self.block_queue.pop_front() else {
                break;
            };

            debug!(
                piece_index = ?request.index, block_offset = ?request.begin, block_size = ?request.length,
                "Sending block request"
            );
            self.outstanding_requests
                .insert((request.index, request.begin));
            self.io_wtx
                .send(Message::new(MessageId::Request, Some(request.serialize())))
                .await?;
        }

        Ok(())
    }

    /// A session is idle when it has nothing queued and nothing in flight,
    /// or when the peer has choked us.
    fn is_idle(&self) -> bool {
        (self.block_queue.is_empty() && self.outstanding_requests.is_empty()) || self.is_choked
    }

    fn has_local_work(&self) -> bool {
        !self.block_queue.is_empty() || !self.outstanding_requests.is_empty()
    }

    /// Returns claimed work to the shared queue and clears session state.
    pub async fn close(&mut self) {
        let mut indices: Vec<u32> = self.block_queue.iter().map(|request| request.index).collect();
        indices.extend(self.outstanding_requests.iter().map(|&(index, _)| index));

        if !indices.is_empty() {
            let requeued = self.download_state.redistribute_pieces(&indices).await;
            info!(requeued, "Returned in-flight pieces to the shared queue");
        }

        self.block_queue.clear();
        self.outstanding_requests.clear();
        self.active_pieces.clear();
        self.download_state
            .set_peer_idle(&self.session_id, false)
            .await;
        self.state = ConnectionState::Closed;
    }
}

/// Expands a piece into its block requests: full-size blocks except for a
/// short final block when the piece size is not a multiple of `BLOCK_SIZE`.
fn expand_block_requests(piece: &Piece) -> Vec<TransferPayload> {
    let total_blocks = piece.total_blocks();
    let mut requests = Vec::with_capacity(total_blocks);

    for block_index in 0..total_blocks {
        let block_offset = (block_index * BLOCK_SIZE) as u32;
        let block_size = BLOCK_SIZE.min(piece.size() - block_index * BLOCK_SIZE) as u32;

        requests.push(TransferPayload::new(piece.index(), block_offset, block_size));
    }

    requests
}

#[derive(Debug)]
pub enum ConnectionError {
    ConnectTimeout,
    ConnectionRefused(io::Error),
    ConnectionClosed,
    ReadTimeout,
    InfoHashMismatch,
    EmptyPayload,
    NoUsefulPieces,
    CorruptedPiece(u32),
    Protocol(ProtocolError),
    DiskTxError(mpsc::error::SendError<(Piece, Vec<u8>)>),
    IoTxError(mpsc::error::SendError<Message>),
    IoError(io::Error),
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::ConnectTimeout => write!(f, "Connection attempt timed out"),
            ConnectionError::ConnectionRefused(err) => {
                write!(f, "Peer refused connection: {}", err)
            }
            ConnectionError::ConnectionClosed => write!(f, "Connection closed by peer"),
            ConnectionError::ReadTimeout => write!(f, "Timed out waiting for peer message"),
            ConnectionError::InfoHashMismatch => {
                write!(f, "Peer responded with a different info hash")
            }
            ConnectionError::EmptyPayload => write!(f, "Empty payload"),
            ConnectionError::NoUsefulPieces => write!(f, "Peer has no pieces we need"),
            ConnectionError::CorruptedPiece(index) => {
                write!(f, "Too many corrupted pieces, last was {}", index)
            }
            ConnectionError::Protocol(err) => write!(f, "Protocol error: {}", err),
            ConnectionError::DiskTxError(err) => write!(f, "Disk tx error: {}", err),
            ConnectionError::IoTxError(err) => write!(f, "IO tx error: {}", err),
            ConnectionError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl From<ProtocolError> for ConnectionError {
    fn from(err: ProtocolError) -> Self {
        ConnectionError::Protocol(err)
    }
}

impl From<mpsc::error::SendError<(Piece, Vec<u8>)>> for ConnectionError {
    fn from(err: mpsc::error::SendError<(Piece, Vec<u8>)>) -> Self {
        ConnectionError::DiskTxError(err)
    }
}

impl From<mpsc::error::SendError<Message>> for ConnectionError {
    fn from(err: mpsc::error::SendError<Message>) -> Self {
        ConnectionError::IoTxError(err)
    }
}

impl From<io::Error> for ConnectionError {
    fn from(err: io::Error) -> Self {
        ConnectionError::IoError(err)
    }
}

impl Error for ConnectionError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConnectionError::ConnectionRefused(err) => Some(err),
            ConnectionError::Protocol(err) => Some(err),
            ConnectionError::DiskTxError(err) => Some(err),
            ConnectionError::IoTxError(err) => Some(err),
            ConnectionError::IoError(err) => Some(err),
            _ => None,
        }
    }
}

fn client_version() -> String {
    let version_tag = env!("CARGO_PKG_VERSION").replace(".", "");
    let version = version_tag
        .chars()
        .filter(|c| c.is_digit(10))
        .take(4)
        .collect::<String>();

    // Ensure exactly 4 characters, padding with "0" if necessary
    format!("{:0<4}", version)
}

pub fn generate_peer_id() -> [u8; 20] {
    let version = client_version();
    let client_id = "SH";

    // Generate a 12-character random alphanumeric sequence
    let random_seq: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(12)
        .map(char::from)
        .collect();

    let format = format!("-{}{}-{}", client_id, version, random_seq);

    let mut id = [0u8; 20];
    id.copy_from_slice(format.as_bytes());

    id
}

fn is_valid_piece(piece_hash: [u8; 20], piece_bytes: &[u8]) -> bool {
    let mut hasher = Sha1::new();
    hasher.update(piece_bytes);
    let hash = hasher.finalize();

    piece_hash == hash.as_slice()
}
