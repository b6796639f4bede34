use crate::error::ProtocolError;

/// Upper bound accepted for a declared message length, used to reject
/// nonsense length prefixes before any allocation happens.
pub const MAX_MESSAGE_LENGTH: usize = 1 << 20;

#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub message_id: MessageId,
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageId {
    KeepAlive = -1,
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
}

impl TryFrom<u8> for MessageId {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageId::Choke),
            1 => Ok(MessageId::Unchoke),
            2 => Ok(MessageId::Interested),
            3 => Ok(MessageId::NotInterested),
            4 => Ok(MessageId::Have),
            5 => Ok(MessageId::Bitfield),
            6 => Ok(MessageId::Request),
            7 => Ok(MessageId::Piece),
            8 => Ok(MessageId::Cancel),
            9 => Ok(MessageId::Port),
            _ => Err(ProtocolError::UnknownMessageId(value)),
        }
    }
}

impl Message {
    pub fn new(message_id: MessageId, payload: Option<Vec<u8>>) -> Message {
        Message {
            message_id,
            payload,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        // A keep-alive is a bare length prefix of zero, with no id byte.
        if self.message_id == MessageId::KeepAlive {
            return 0u32.to_be_bytes().to_vec();
        }

        // Determine payload length (0 if None)
        let payload_length = self.payload.as_ref().map_or(0, |p| p.len());

        // Preallocate the buffer with the capacity needed
        let mut bytes = Vec::with_capacity(4 + 1 + payload_length);

        // a Message has the following format <length prefix><message ID><payload>.
        //
        // Write the length of the message (payload size + 1 for message ID)
        bytes.extend_from_slice(&(payload_length as u32 + 1).to_be_bytes());
        // Write the message ID as a single byte
        bytes.push(self.message_id as u8);
        // Write the payload, if it exists
        if let Some(payload) = &self.payload {
            bytes.extend_from_slice(payload);
        }

        bytes
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Message, ProtocolError> {
        if buffer.len() < 4 {
            return Err(ProtocolError::MessageTooShort {
                expected: 4,
                found: buffer.len(),
            });
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buffer[..4]);
        let length_prefix = u32::from_be_bytes(length_bytes) as usize;

        if length_prefix == 0 {
            return Ok(Message::new(MessageId::KeepAlive, None));
        }

        if length_prefix > MAX_MESSAGE_LENGTH {
            return Err(ProtocolError::MessageTooLong {
                length: length_prefix,
            });
        }

        if buffer.len() < 4 + length_prefix {
            return Err(ProtocolError::MessageTooShort {
                expected: 4 + length_prefix,
                found: buffer.len(),
            });
        }

        let message_id = MessageId::try_from(buffer[4])?;

        let payload = if length_prefix > 1 {
            Some(buffer[5..4 + length_prefix].to_vec())
        } else {
            None
        };

        Ok(Message::new(message_id, payload))
    }

    /// Extracts the piece index advertised by a `Have` message.
    pub fn parse_have(&self) -> Result<u32, ProtocolError> {
        if self.message_id != MessageId::Have {
            return Err(ProtocolError::WrongMessageId {
                expected: MessageId::Have as u8,
                found: self.message_id as u8,
            });
        }

        let payload = self.payload.as_deref().unwrap_or(&[]);
        if payload.len() != 4 {
            return Err(ProtocolError::WrongPayloadLength {
                expected: 4,
                found: payload.len(),
            });
        }

        let mut index = [0u8; 4];
        index.copy_from_slice(payload);

        Ok(u32::from_be_bytes(index))
    }
}

// struct used for Request and Cancel message payloads
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferPayload {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl TransferPayload {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 4 + 4);

        // the Request and Cancel payload has the following format <index><begin><length>
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.begin.to_be_bytes());
        bytes.extend_from_slice(&self.length.to_be_bytes());

        bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PiecePayload {
    pub index: u32,
    pub begin: u32,
    pub block: Vec<u8>,
}

impl PiecePayload {
    pub fn new(index: u32, begin: u32, block: Vec<u8>) -> Self {
        Self {
            index,
            begin,
            block,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + 4 + self.block.len());

        // the Piece payload has the following format <index><begin><block>
        bytes.extend_from_slice(&self.index.to_be_bytes());
        bytes.extend_from_slice(&self.begin.to_be_bytes());
        bytes.extend_from_slice(&self.block);

        bytes
    }

    pub fn deserialize(payload: &[u8]) -> Result<Self, ProtocolError> {
        // Check that the payload is at least 8 bytes for `index` and `begin`
        if payload.len() < 8 {
            return Err(ProtocolError::PayloadTooShort {
                minimum: 8,
                found: payload.len(),
            });
        }

        // Extract the `index` (first 4 bytes) and `begin` (next 4 bytes)
        let mut index = [0u8; 4];
        index.copy_from_slice(&payload[..4]);
        let index = u32::from_be_bytes(index);
        let mut begin = [0u8; 4];
        begin.copy_from_slice(&payload[4..8]);
        let begin = u32::from_be_bytes(begin);

        // The remaining bytes correspond to the `block`
        let block = payload[8..].to_vec();

        Ok(PiecePayload::new(index, begin, block))
    }
}
