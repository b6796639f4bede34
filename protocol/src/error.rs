use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    // Errors from the `Handshake` module
    InvalidHandshake,

    // Errors from the `Message` module
    MessageTooShort { expected: usize, found: usize },
    MessageTooLong { length: usize },
    UnknownMessageId(u8),
    WrongMessageId { expected: u8, found: u8 },
    WrongPayloadLength { expected: usize, found: usize },
    PayloadTooShort { minimum: usize, found: usize },

    // Errors from the `Piece` module
    PieceIndexMismatch { expected: u32, found: u32 },
    BlockOutOfBounds { begin: usize, length: usize, capacity: usize },
    PieceMissingBlocks,
}

// Implement `std::fmt::Display` for `ProtocolError`
impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidHandshake => write!(f, "Invalid handshake"),
            ProtocolError::MessageTooShort { expected, found } => write!(
                f,
                "Message buffer too short: expected at least {} bytes, found {}",
                expected, found
            ),
            ProtocolError::MessageTooLong { length } => write!(
                f,
                "Declared message length {} exceeds the maximum allowed",
                length
            ),
            ProtocolError::UnknownMessageId(id) => write!(f, "Unknown message id {}", id),
            ProtocolError::WrongMessageId { expected, found } => write!(
                f,
                "Wrong message id: expected {}, found {}",
                expected, found
            ),
            ProtocolError::WrongPayloadLength { expected, found } => write!(
                f,
                "Wrong payload length: expected {} bytes, found {}",
                expected, found
            ),
            ProtocolError::PayloadTooShort { minimum, found } => write!(
                f,
                "Payload too short: expected at least {} bytes, found {}",
                minimum, found
            ),
            ProtocolError::PieceIndexMismatch { expected, found } => write!(
                f,
                "Piece index mismatch: expected {}, found {}",
                expected, found
            ),
            ProtocolError::BlockOutOfBounds {
                begin,
                length,
                capacity,
            } => write!(
                f,
                "Block out of bounds: begin {} with length {} exceeds piece capacity {}",
                begin, length, capacity
            ),
            ProtocolError::PieceMissingBlocks => write!(f, "Piece has missing blocks"),
        }
    }
}

// Implement `std::error::Error` for `ProtocolError`
impl std::error::Error for ProtocolError {}
