use crate::error::ProtocolError;

/// Protocol identifier exchanged in the first message of every peer session.
pub const PSTR: &str = "BitTorrent protocol";

/// Fixed wire size of a handshake: 1 + 19 + 8 + 20 + 20.
pub const HANDSHAKE_LENGTH: usize = 49 + PSTR.len();

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(HANDSHAKE_LENGTH);
        buffer.push(PSTR.len() as u8);
        buffer.extend_from_slice(PSTR.as_bytes());
        buffer.extend_from_slice(&self.reserved);
        buffer.extend_from_slice(&self.info_hash);
        buffer.extend_from_slice(&self.peer_id);

        buffer
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Handshake, ProtocolError> {
        if buffer.len() < HANDSHAKE_LENGTH {
            return Err(ProtocolError::MessageTooShort {
                expected: HANDSHAKE_LENGTH,
                found: buffer.len(),
            });
        }

        let pstr_len = buffer[0] as usize;
        if pstr_len != PSTR.len() || &buffer[1..1 + pstr_len] != PSTR.as_bytes() {
            return Err(ProtocolError::InvalidHandshake);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buffer[20..28]);

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buffer[28..48]);

        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buffer[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handshake_serialize() {
        let info_hash = [0x12u8; 20];
        let peer_id = [0x34u8; 20];
        let handshake = Handshake::new(info_hash, peer_id);

        let bytes = handshake.serialize();

        assert_eq!(bytes.len(), HANDSHAKE_LENGTH);
        assert_eq!(bytes[0], 19);
        assert_eq!(&bytes[1..20], PSTR.as_bytes());
        assert_eq!(&bytes[20..28], &[0u8; 8]);
        assert_eq!(&bytes[28..48], &info_hash);
        assert_eq!(&bytes[48..68], &peer_id);
    }

    #[test]
    fn test_handshake_deserialize() {
        let handshake = Handshake::new([0xabu8; 20], [0xcdu8; 20]);
        let bytes = handshake.serialize();

        let deserialized = Handshake::deserialize(&bytes).unwrap();

        assert_eq!(deserialized, handshake);
    }

    #[test]
    fn test_handshake_deserialize_rejects_unknown_protocol() {
        let mut bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();
        bytes[1] = b'X';

        let result = Handshake::deserialize(&bytes);

        assert_eq!(result.unwrap_err(), ProtocolError::InvalidHandshake);
    }

    #[test]
    fn test_handshake_deserialize_rejects_short_buffer() {
        let bytes = Handshake::new([0u8; 20], [0u8; 20]).serialize();

        let result = Handshake::deserialize(&bytes[..HANDSHAKE_LENGTH - 1]);

        assert_eq!(
            result.unwrap_err(),
            ProtocolError::MessageTooShort {
                expected: HANDSHAKE_LENGTH,
                found: HANDSHAKE_LENGTH - 1,
            }
        );
    }
}
