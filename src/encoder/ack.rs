//! Acknowledgement ingestion and loss-range iteration.
//!
//! An acknowledgement carries the decoder's next expected column followed by
//! varint loss ranges.  The range list is kept serialized; the iterator
//! decodes it on the fly while the retransmit path walks loss columns.

use tracing::trace;

use crate::encoder::window::EncoderPacketWindow;
use crate::wire;
use crate::{add_columns, next_column, PacketNum};

/// State of the most recent acknowledgement.
pub(crate) struct AcknowledgementState {
    /// Serialized loss ranges plus zero padding for read-ahead.
    data: Vec<u8>,

    /// Bytes of real loss range data (padding excluded).
    data_bytes: usize,

    /// Next byte of the range list to decode.
    offset: usize,

    /// Next loss column to hand out.
    loss_column: PacketNum,

    /// Losses left in the current range.
    loss_count: usize,

    /// Next column the decoder expects.
    pub next_column_expected: PacketNum,

    /// Whether any acknowledgement has been processed yet.
    have_ack: bool,
}

impl AcknowledgementState {
    pub fn new() -> Self {
        Self {
            data: Vec::new(),
            data_bytes: 0,
            offset: 0,
            loss_column: 0,
            loss_count: 0,
            next_column_expected: 0,
            have_ack: false,
        }
    }

    /// True if the last acknowledgement reported any losses.
    pub fn has_negative_acknowledgements(&self) -> bool {
        self.data_bytes > 0
    }

    /// Ingest an acknowledgement buffer.  Trims the window up to the next
    /// expected column and resets the loss iterator.
    ///
    /// Returns false on malformed input.
    pub fn on_acknowledgement_data(
        &mut self,
        window: &mut EncoderPacketWindow,
        buffer: &[u8],
    ) -> bool {
        let Some((next_column_expected, header_bytes)) = wire::deserialize_packet_num(buffer)
        else {
            return false;
        };
        let ranges = &buffer[header_bytes..];

        // Byte-identical duplicate acknowledgements are a no-op.  A repeated
        // next-expected column with different ranges still refreshes the
        // loss list.
        if self.have_ack
            && self.next_column_expected == next_column_expected
            && ranges.len() == self.data_bytes
            && ranges == &self.data[..self.data_bytes]
        {
            return true;
        }

        self.have_ack = true;
        self.next_column_expected = next_column_expected;

        window.remove_before(next_column_expected);

        self.offset = 0;
        self.loss_column = next_column_expected;
        self.loss_count = 0;
        self.data_bytes = ranges.len();

        if ranges.is_empty() {
            self.data.clear();
            return true;
        }

        // Copy the range list with guard padding so the range decoder can
        // read ahead safely.
        self.data.clear();
        self.data.extend_from_slice(ranges);
        self.data.resize(ranges.len() + wire::NACK_PADDING_BYTES, 0);

        trace!(
            next_column_expected,
            range_bytes = ranges.len(),
            "acknowledgement received"
        );

        self.decode_next_range()
    }

    /// Decode the next loss range from the serialized list.
    fn decode_next_range(&mut self) -> bool {
        if self.offset >= self.data_bytes {
            return false;
        }

        let Some((relative_start, count_minus_one, consumed)) =
            wire::deserialize_nack_range(&self.data[self.offset..])
        else {
            return false;
        };

        self.offset += consumed;
        if self.offset > self.data_bytes {
            // Range ran into the padding: truncated input.
            return false;
        }

        self.loss_column = add_columns(self.loss_column, relative_start);
        self.loss_count = count_minus_one as usize + 1;
        true
    }

    /// Next lost column, advancing the iterator.
    ///
    /// Returns `None` once every range has been walked; call
    /// [`restart_loss_iterator`](Self::restart_loss_iterator) to begin again.
    pub fn next_loss_column(&mut self) -> Option<PacketNum> {
        if self.loss_count == 0 {
            // The column one past the previous range anchors the next
            // range's relative offset.
            self.loss_column = next_column(self.loss_column);
            if !self.decode_next_range() {
                return None;
            }
        }

        let column = self.loss_column;
        self.loss_column = next_column(self.loss_column);
        self.loss_count -= 1;
        Some(column)
    }

    /// Rewind the loss iterator to the first range.
    pub fn restart_loss_iterator(&mut self) {
        self.offset = 0;
        self.loss_column = self.next_column_expected;
        self.loss_count = 0;
        self.decode_next_range();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slab::Allocator;

    fn ack_bytes(next_expected: PacketNum, ranges: &[(u32, u32)]) -> Vec<u8> {
        let mut buffer = vec![0u8; 64];
        let mut used = wire::serialize_packet_num(next_expected, &mut buffer);
        for &(relative_start, count_minus_one) in ranges {
            used += wire::serialize_nack_range(relative_start, count_minus_one, &mut buffer[used..]);
        }
        buffer.truncate(used);
        buffer
    }

    fn filled_window(alloc: &mut Allocator, count: usize) -> EncoderPacketWindow {
        let mut window = EncoderPacketWindow::new();
        for _ in 0..count {
            window.add(alloc, &[0xa5; 32], 0).unwrap();
        }
        window
    }

    #[test]
    fn test_ack_trims_window_and_iterates_losses() {
        let mut alloc = Allocator::new();
        let mut window = filled_window(&mut alloc, 50);
        let mut ack = AcknowledgementState::new();

        // Next expected 10; losses at {15, 16} and {20}.  The second range
        // start is relative to one past the end of the first range plus one
        // implicitly received column.
        let buffer = ack_bytes(10, &[(5, 1), (2, 0)]);
        assert!(ack.on_acknowledgement_data(&mut window, &buffer));

        assert_eq!(window.first_unremoved, 10);
        assert_eq!(ack.next_column_expected, 10);
        assert!(ack.has_negative_acknowledgements());

        assert_eq!(ack.next_loss_column(), Some(15));
        assert_eq!(ack.next_loss_column(), Some(16));
        assert_eq!(ack.next_loss_column(), Some(20));
        assert_eq!(ack.next_loss_column(), None);

        ack.restart_loss_iterator();
        assert_eq!(ack.next_loss_column(), Some(15));
    }

    #[test]
    fn test_duplicate_ack_is_noop() {
        let mut alloc = Allocator::new();
        let mut window = filled_window(&mut alloc, 50);
        let mut ack = AcknowledgementState::new();

        let buffer = ack_bytes(10, &[(5, 1)]);
        assert!(ack.on_acknowledgement_data(&mut window, &buffer));
        assert_eq!(ack.next_loss_column(), Some(15));

        // The identical bytes again must not reset the iterator.
        assert!(ack.on_acknowledgement_data(&mut window, &buffer));
        assert_eq!(ack.next_loss_column(), Some(16));
    }

    #[test]
    fn test_same_next_expected_new_ranges_refreshes() {
        let mut alloc = Allocator::new();
        let mut window = filled_window(&mut alloc, 50);
        let mut ack = AcknowledgementState::new();

        assert!(ack.on_acknowledgement_data(&mut window, &ack_bytes(10, &[(5, 1)])));
        assert!(ack.on_acknowledgement_data(&mut window, &ack_bytes(10, &[(7, 0)])));
        assert_eq!(ack.next_loss_column(), Some(17));
        assert_eq!(ack.next_loss_column(), None);
    }

    #[test]
    fn test_ack_without_losses() {
        let mut alloc = Allocator::new();
        let mut window = filled_window(&mut alloc, 20);
        let mut ack = AcknowledgementState::new();

        assert!(ack.on_acknowledgement_data(&mut window, &ack_bytes(20, &[])));
        assert!(!ack.has_negative_acknowledgements());
        assert_eq!(ack.next_loss_column(), None);
        assert_eq!(window.count, 0); // acked past everything
    }

    #[test]
    fn test_empty_ack_is_invalid() {
        let mut alloc = Allocator::new();
        let mut window = filled_window(&mut alloc, 5);
        let mut ack = AcknowledgementState::new();
        assert!(!ack.on_acknowledgement_data(&mut window, &[]));
    }
}
