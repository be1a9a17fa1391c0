//! Decoder receive window.
//!
//! Received and recovered originals share the encoder's subwindow layout,
//! with a per-subwindow received mask in place of the running sums.  The
//! window anchors itself on the first arrival (rounded down a subwindow so
//! slightly older packets still fit), grows forward as columns and recovery
//! coverage arrive, and trims behind the encoder's window start carried in
//! recovery metadata.

use tracing::{debug, trace};

use crate::bitset::BitSet;
use crate::slab::{Allocator, BlockHandle};
use crate::wire;
use crate::{
    add_columns, is_column_delta_negative, subtract_columns, Error, PacketNum, Result,
    MAX_PACKETS, SUBWINDOW_SIZE,
};

/// One received or recovered original.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct DecoderSlot {
    pub column: PacketNum,
    pub header_bytes: usize,
    pub block: Option<BlockHandle>,
    /// Prefix plus payload bytes.
    pub bytes: usize,
    /// Arrival or recovery time, used for the ack age filter.
    pub arrival_msec: u64,
}

struct DecoderSubwindow {
    slots: Vec<DecoderSlot>,
    received: BitSet<1>,
}

impl DecoderSubwindow {
    fn new() -> Self {
        Self {
            slots: vec![DecoderSlot::default(); SUBWINDOW_SIZE],
            received: BitSet::new(),
        }
    }

    fn reset(&mut self, alloc: &mut Allocator) {
        for slot in self.slots.iter_mut() {
            if let Some(block) = slot.block.take() {
                alloc.free(block);
            }
            *slot = DecoderSlot::default();
        }
        self.received.clear_all();
    }
}

/// Sliding receive window.
pub(crate) struct DecoderPacketWindow {
    /// Column of element zero; a multiple of the subwindow size, so the
    /// lane invariant `element % 8 == column % 8` holds.
    pub column_start: PacketNum,

    /// Elements spanned so far, growing with arrivals and recovery
    /// coverage.
    pub count: usize,

    /// Elements below this are behind the encoder's window and are never
    /// reported missing again.
    pub first_unremoved: usize,

    subwindows: Vec<DecoderSubwindow>,

    /// Set once the first arrival fixes `column_start`.
    anchored: bool,

    /// Smallest element ever stored or covered by a recovery.  Elements
    /// before it were never part of the observed stream (the anchor slack,
    /// or history before a mid-stream join) and are excluded from
    /// solvability checks; acknowledgements still report from
    /// `first_unremoved`.
    solve_start: usize,

    /// `(last covered element, arrival msec)` per recovery packet; loss
    /// evidence for the ack age filter.
    pub recovery_marks: Vec<(usize, u64)>,

    pub emergency_disabled: bool,
}

impl DecoderPacketWindow {
    pub fn new() -> Self {
        Self {
            column_start: 0,
            count: 0,
            first_unremoved: 0,
            subwindows: Vec::new(),
            anchored: false,
            solve_start: usize::MAX,
            recovery_marks: Vec::new(),
            emergency_disabled: false,
        }
    }

    /// First element the solver should consider when looking for missing
    /// columns.
    pub fn solve_start_element(&self) -> usize {
        self.first_unremoved.max(self.solve_start.min(self.count))
    }

    /// Record that a recovery row covers columns from `start_element` on.
    pub fn note_coverage(&mut self, start_element: usize) {
        self.solve_start = self.solve_start.min(start_element);
    }

    #[inline]
    pub fn column_to_element(&self, column: PacketNum) -> usize {
        subtract_columns(column, self.column_start)
    }

    #[inline]
    pub fn element_to_column(&self, element: usize) -> PacketNum {
        add_columns(self.column_start, element as u32)
    }

    /// Fix the window start from the first observed column, keeping a
    /// subwindow of slack for slightly older out-of-order arrivals.
    pub fn anchor(&mut self, column: PacketNum) {
        if self.anchored {
            return;
        }
        let offset = (column as usize) % SUBWINDOW_SIZE;
        self.column_start = column - offset as u32;
        self.anchored = true;
        debug!(column_start = self.column_start, "receive window anchored");
    }

    /// Grow the window to span `new_count` elements.
    pub fn extend_count(&mut self, new_count: usize) -> Result<()> {
        if new_count <= self.count {
            return Ok(());
        }
        if new_count > MAX_PACKETS {
            return Err(Error::MaxPacketsReached);
        }
        while self.subwindows.len() * SUBWINDOW_SIZE < new_count {
            self.subwindows.push(DecoderSubwindow::new());
        }
        self.count = new_count;
        Ok(())
    }

    #[inline]
    pub fn is_received(&self, element: usize) -> bool {
        if element >= self.count {
            return false;
        }
        self.subwindows[element / SUBWINDOW_SIZE]
            .received
            .check(element % SUBWINDOW_SIZE)
    }

    #[inline]
    pub fn slot(&self, element: usize) -> &DecoderSlot {
        &self.subwindows[element / SUBWINDOW_SIZE].slots[element % SUBWINDOW_SIZE]
    }

    /// Store a prefixed original buffer and mark its column received.
    ///
    /// `data` is the raw payload; the length prefix is added here so that
    /// recovery row arithmetic sees the same bytes on both sides.
    pub fn store(
        &mut self,
        alloc: &mut Allocator,
        column: PacketNum,
        data: &[u8],
        arrival_msec: u64,
    ) -> Result<()> {
        let element = self.column_to_element(column);
        self.extend_count(element + 1)?;

        let mut prefix = [0u8; wire::MAX_LENGTH_BYTES];
        let header_bytes = wire::serialize_length(data.len() as u32, &mut prefix);
        let total_bytes = header_bytes + data.len();

        let Some(block) = alloc.allocate(total_bytes) else {
            self.emergency_disabled = true;
            debug!("receive buffer allocation failed, disabling decoder");
            return Err(Error::Disabled);
        };
        let buffer = alloc.block_mut(block);
        buffer[..header_bytes].copy_from_slice(&prefix[..header_bytes]);
        buffer[header_bytes..total_bytes].copy_from_slice(data);

        self.store_prefixed_block(alloc, column, block, header_bytes, total_bytes, arrival_msec)
    }

    /// Store an already prefixed buffer (the solver's recovered output).
    pub fn store_prefixed(
        &mut self,
        alloc: &mut Allocator,
        column: PacketNum,
        prefixed: &[u8],
        header_bytes: usize,
        arrival_msec: u64,
    ) -> Result<()> {
        let element = self.column_to_element(column);
        self.extend_count(element + 1)?;

        let Some(block) = alloc.allocate(prefixed.len()) else {
            self.emergency_disabled = true;
            return Err(Error::Disabled);
        };
        alloc.block_mut(block)[..prefixed.len()].copy_from_slice(prefixed);

        self.store_prefixed_block(alloc, column, block, header_bytes, prefixed.len(), arrival_msec)
    }

    fn store_prefixed_block(
        &mut self,
        alloc: &mut Allocator,
        column: PacketNum,
        block: BlockHandle,
        header_bytes: usize,
        total_bytes: usize,
        arrival_msec: u64,
    ) -> Result<()> {
        let element = self.column_to_element(column);
        let subwindow = &mut self.subwindows[element / SUBWINDOW_SIZE];
        let index = element % SUBWINDOW_SIZE;

        debug_assert!(!subwindow.received.check(index));
        if let Some(old) = subwindow.slots[index].block.take() {
            alloc.free(old);
        }
        subwindow.slots[index] = DecoderSlot {
            column,
            header_bytes,
            block: Some(block),
            bytes: total_bytes,
            arrival_msec,
        };
        subwindow.received.set(index);
        self.solve_start = self.solve_start.min(element);
        trace!(column, element, bytes = total_bytes, "original stored");
        Ok(())
    }

    /// First not-received element at or after `from`.
    ///
    /// Returns `count` when everything from `from` on has arrived.
    pub fn first_missing_element(&self, from: usize) -> usize {
        let mut element = from;
        while element < self.count {
            let subwindow = &self.subwindows[element / SUBWINDOW_SIZE];
            let clear = subwindow.received.find_first_clear(element % SUBWINDOW_SIZE);
            if clear < SUBWINDOW_SIZE {
                let found = (element / SUBWINDOW_SIZE) * SUBWINDOW_SIZE + clear;
                if found < self.count {
                    return found;
                }
                return self.count;
            }
            element = (element / SUBWINDOW_SIZE + 1) * SUBWINDOW_SIZE;
        }
        self.count
    }

    /// Count of elements in `[first_unremoved, count)` still missing.
    pub fn missing_count(&self) -> usize {
        let mut missing = 0;
        let mut element = self.first_unremoved;
        while element < self.count {
            element = self.first_missing_element(element);
            if element >= self.count {
                break;
            }
            missing += 1;
            element += 1;
        }
        missing
    }

    /// Trim behind the encoder's window start; columns before it can never
    /// be recovered or retransmitted.
    pub fn remove_before(&mut self, alloc: &mut Allocator, column: PacketNum) {
        let element = self.column_to_element(column);
        if is_column_delta_negative(element) {
            return;
        }
        let element = element.min(self.count);
        if element > self.first_unremoved {
            self.first_unremoved = element;
        }

        if self.first_unremoved >= 2 * SUBWINDOW_SIZE {
            self.evict(alloc);
        }
    }

    fn evict(&mut self, alloc: &mut Allocator) {
        let first_kept_subwindow = self.first_unremoved / SUBWINDOW_SIZE;
        let removed = first_kept_subwindow * SUBWINDOW_SIZE;

        for subwindow in self.subwindows.iter_mut().take(first_kept_subwindow) {
            subwindow.reset(alloc);
        }
        self.subwindows.rotate_left(first_kept_subwindow);

        self.column_start = add_columns(self.column_start, removed as u32);
        self.count -= removed;
        self.first_unremoved -= removed;
        self.solve_start = self.solve_start.saturating_sub(removed);

        self.recovery_marks.retain_mut(|(element, _)| {
            if *element < removed {
                false
            } else {
                *element -= removed;
                true
            }
        });

        debug!(
            removed,
            column_start = self.column_start,
            "receive window trimmed"
        );
    }
}
