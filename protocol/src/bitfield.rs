/// Piece availability map as carried by `Bitfield` messages: one bit per
/// piece, most significant bit first, spare bits in the last byte unused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    pub bytes: Vec<u8>,
    pub total_pieces: usize,
}

impl Bitfield {
    /// Creates an empty bitfield sized for `total_pieces` pieces.
    pub fn new(total_pieces: usize) -> Self {
        Self {
            bytes: vec![0u8; (total_pieces + 7) / 8],
            total_pieces,
        }
    }

    /// Builds a bitfield from raw message payload bytes.
    pub fn from(bytes: &[u8], total_pieces: usize) -> Self {
        Self {
            bytes: bytes.to_vec(),
            total_pieces,
        }
    }

    pub fn has_piece(&self, index: usize) -> bool {
        if index >= self.total_pieces {
            return false;
        }

        let byte_index = index / 8;
        let offset = index % 8;

        self.bytes
            .get(byte_index)
            .map_or(false, |byte| (byte >> (7 - offset)) & 1 != 0)
    }

    pub fn set_piece(&mut self, index: usize) {
        if index >= self.total_pieces {
            return;
        }

        let byte_index = index / 8;
        let offset = index % 8;

        if let Some(byte) = self.bytes.get_mut(byte_index) {
            *byte |= 1 << (7 - offset);
        }
    }

    /// Number of pieces marked present, counting valid positions only.
    pub fn count(&self) -> usize {
        (0..self.total_pieces)
            .filter(|&index| self.has_piece(index))
            .count()
    }

    /// Indices of all pieces not marked present, in ascending order.
    pub fn missing_pieces(&self) -> Vec<u32> {
        (0..self.total_pieces)
            .filter(|&index| !self.has_piece(index))
            .map(|index| index as u32)
            .collect()
    }

    /// A bitfield over zero pieces is trivially complete.
    pub fn has_all_pieces(&self) -> bool {
        self.count() == self.total_pieces
    }
}

#[cfg(test)]
mod test {
    use super::Bitfield;

    #[test]
    fn test_has_piece_reads_most_significant_bit_first() {
        let bitfield = Bitfield::from(&[0b1011_0000, 0b0110_0000], 11);

        for index in [0, 2, 3, 9, 10] {
            assert!(bitfield.has_piece(index), "piece {} should be set", index);
        }
        for index in [1, 4, 5, 6, 7, 8] {
            assert!(!bitfield.has_piece(index), "piece {} should be unset", index);
        }
    }

    #[test]
    fn test_set_piece_round_trips_through_bytes() {
        let mut bitfield = Bitfield::new(11);

        for index in [0, 2, 3, 9, 10] {
            bitfield.set_piece(index);
        }

        assert_eq!(bitfield.bytes, vec![0b1011_0000, 0b0110_0000]);
        assert_eq!(Bitfield::from(&bitfield.bytes, 11), bitfield);
    }

    #[test]
    fn test_set_piece_is_idempotent() {
        let mut bitfield = Bitfield::new(8);

        bitfield.set_piece(3);
        bitfield.set_piece(3);

        assert_eq!(bitfield.count(), 1);
        assert_eq!(bitfield.bytes, vec![0b0001_0000]);
    }

    #[test]
    fn test_set_piece_ignores_out_of_range_index() {
        let mut bitfield = Bitfield::new(8);

        bitfield.set_piece(8);

        assert_eq!(bitfield.count(), 0);
    }

    #[test]
    fn test_has_piece_out_of_range_is_absent() {
        let bitfield = Bitfield::from(&[0xff], 3);

        assert!(!bitfield.has_piece(3));
        assert!(!bitfield.has_piece(250));
    }

    #[test]
    fn test_count_ignores_spare_bits() {
        let bitfield = Bitfield::from(&[0xff], 3);

        assert_eq!(bitfield.count(), 3);
    }

    #[test]
    fn test_missing_pieces() {
        let mut bitfield = Bitfield::new(5);
        bitfield.set_piece(1);
        bitfield.set_piece(4);

        assert_eq!(bitfield.missing_pieces(), vec![0, 2, 3]);
    }

    #[test]
    fn test_has_all_pieces() {
        let mut bitfield = Bitfield::new(4);
        assert!(!bitfield.has_all_pieces());

        for index in 0..4 {
            bitfield.set_piece(index);
        }
        assert!(bitfield.has_all_pieces());
    }

    #[test]
    fn test_has_all_pieces_zero_pieces_is_complete() {
        let bitfield = Bitfield::new(0);

        assert!(bitfield.has_all_pieces());
    }
}
