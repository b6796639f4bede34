use crate::error::ProtocolError;
use crate::message::PiecePayload;

/// Transfer block size used when requesting piece data from peers.
pub const BLOCK_SIZE: usize = 16384;

/// Assembly state for a single piece: a piece-sized buffer plus one
/// received flag per block. Block positions are derived from the `begin`
/// offset of each incoming payload, so blocks may arrive in any order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    index: u32,
    size: usize,
    hash: [u8; 20],
    buffer: Vec<u8>,
    received: Vec<bool>,
    is_finalized: bool,
}

impl Piece {
    pub fn new(index: u32, size: usize, hash: [u8; 20]) -> Self {
        let total_blocks = (size + BLOCK_SIZE - 1) / BLOCK_SIZE;

        Self {
            index,
            size,
            hash,
            buffer: vec![0u8; size],
            received: vec![false; total_blocks],
            is_finalized: false,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn hash(&self) -> &[u8; 20] {
        &self.hash
    }

    pub fn total_blocks(&self) -> usize {
        self.received.len()
    }

    pub fn blocks_received(&self) -> usize {
        self.received.iter().filter(|&&received| received).count()
    }

    /// Copies a validated block payload into the piece buffer and marks
    /// its block position received. Re-delivery of a block is harmless.
    pub fn add_block(&mut self, payload: &PiecePayload) -> Result<(), ProtocolError> {
        if payload.index != self.index {
            return Err(ProtocolError::PieceIndexMismatch {
                expected: self.index,
                found: payload.index,
            });
        }

        let begin = payload.begin as usize;
        if begin >= self.size || begin + payload.block.len() > self.size {
            return Err(ProtocolError::BlockOutOfBounds {
                begin,
                length: payload.block.len(),
                capacity: self.size,
            });
        }

        self.buffer[begin..begin + payload.block.len()].copy_from_slice(&payload.block);
        self.received[begin / BLOCK_SIZE] = true;

        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.received.iter().all(|&received| received)
    }

    /// Returns the assembled piece bytes once every block has arrived.
    pub fn assemble(&self) -> Result<Vec<u8>, ProtocolError> {
        if !self.is_ready() {
            return Err(ProtocolError::PieceMissingBlocks);
        }

        Ok(self.buffer.clone())
    }

    pub fn is_finalized(&self) -> bool {
        self.is_finalized
    }

    pub fn mark_finalized(&mut self) {
        self.is_finalized = true;
    }
}
