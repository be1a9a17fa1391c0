//! Encoder sliding window.
//!
//! Originals live in fixed-size subwindows and are only ever appended;
//! acknowledged elements are first marked removed and later evicted a whole
//! subwindow at a time, so the per-lane running sums stay valid across
//! trimming.  The window answers one expensive question for the encoder:
//! "give me the running sum of lane L, weight k, over elements up to E",
//! folding in newly added originals lazily.

use tracing::{debug, trace};

use crate::slab::{Allocator, BlockHandle};
use crate::wire;
use crate::{
    add_columns, gf, is_column_delta_negative, next_column, rows, subtract_columns, Error,
    PacketNum, Result, LANE_COUNT, MAX_PACKETS, SUBWINDOW_SIZE, SUM_COUNT,
};

/// Byte buffer that grows monotonically, zero-filling exposed bytes.
///
/// Backs the lane running sums and the recovery scratch space.  `len` can be
/// reset to zero without releasing capacity; regrowth re-zeroes the region.
#[derive(Debug, Default)]
pub(crate) struct GrowingBuffer {
    pub data: Vec<u8>,
    pub len: usize,
}

impl GrowingBuffer {
    pub const fn new() -> Self {
        Self {
            data: Vec::new(),
            len: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Grow to at least `bytes`, zeroing anything newly exposed.
    pub fn grow_zero_padded(&mut self, bytes: usize) {
        if bytes <= self.len {
            return;
        }
        if self.data.len() < bytes {
            self.data.resize(bytes, 0);
        }
        // The region past `len` may hold stale content from before a reset.
        self.data[self.len..bytes].fill(0);
        self.len = bytes;
    }

    /// Size to exactly `bytes`, all zero.
    pub fn initialize_zeroed(&mut self, bytes: usize) {
        if self.data.len() < bytes {
            self.data.resize(bytes, 0);
        }
        self.data[..bytes].fill(0);
        self.len = bytes;
    }

    pub fn reset(&mut self) {
        self.len = 0;
    }
}

/// One original packet slot.
///
/// The slab block holds a length prefix followed by the payload; recovery
/// rows are computed over the prefixed buffer so the decoder recovers the
/// payload length along with the data.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct OriginalPacket {
    pub column: PacketNum,
    pub header_bytes: usize,
    pub block: Option<BlockHandle>,
    /// Prefix plus payload bytes.
    pub bytes: usize,
    pub last_send_msec: u64,
}

struct EncoderSubwindow {
    originals: Vec<OriginalPacket>,
}

impl EncoderSubwindow {
    fn new() -> Self {
        Self {
            originals: vec![OriginalPacket::default(); SUBWINDOW_SIZE],
        }
    }
}

/// Per-lane running sums.
///
/// `next_element[k]` is the next window element to fold into sum `k`; the
/// sums lag behind the window independently and catch up on demand.
struct EncoderColumnLane {
    next_element: [usize; SUM_COUNT],
    sums: [GrowingBuffer; SUM_COUNT],
    /// Longest packet seen in this lane; bounds sum growth when data sizes
    /// vary a lot between lanes.
    longest_packet: usize,
}

impl EncoderColumnLane {
    fn new(lane_index: usize) -> Self {
        Self {
            next_element: [lane_index; SUM_COUNT],
            sums: [GrowingBuffer::new(), GrowingBuffer::new(), GrowingBuffer::new()],
            longest_packet: 0,
        }
    }
}

/// Sliding window of original packets plus per-lane running sums.
pub(crate) struct EncoderPacketWindow {
    /// Next column number to assign.
    pub next_column: PacketNum,

    /// Elements in the window, including logically removed ones.
    pub count: usize,

    /// Column of element zero.  Undefined while `count == 0`.
    pub column_start: PacketNum,

    /// Longest prefixed buffer among live elements.
    pub longest_packet: usize,

    /// Elements below this index are acknowledged and await eviction.
    pub first_unremoved: usize,

    /// Running sum element range `[sum_start_element, sum_end_element)`.
    pub sum_start_element: usize,
    pub sum_end_element: usize,

    /// Column of the first element ever folded into the current sums.
    pub sum_column_start: PacketNum,

    /// Elements folded into the sums and then evicted.
    pub sum_erased_count: usize,

    subwindows: Vec<EncoderSubwindow>,
    lanes: [EncoderColumnLane; LANE_COUNT],

    /// Latched on allocation failure or invariant violation; every public
    /// operation fails with `Disabled` afterwards.
    pub emergency_disabled: bool,
}

impl EncoderPacketWindow {
    pub fn new() -> Self {
        Self {
            next_column: 0,
            count: 0,
            column_start: 0,
            longest_packet: 0,
            first_unremoved: 0,
            sum_start_element: 0,
            sum_end_element: 0,
            sum_column_start: 0,
            sum_erased_count: 0,
            subwindows: Vec::new(),
            lanes: std::array::from_fn(EncoderColumnLane::new),
            emergency_disabled: false,
        }
    }

    #[inline]
    pub fn column_to_element(&self, column: PacketNum) -> usize {
        subtract_columns(column, self.column_start)
    }

    #[inline]
    pub fn element_to_column(&self, element: usize) -> PacketNum {
        add_columns(self.column_start, element as u32)
    }

    #[inline]
    pub fn invalid_element(&self, element: usize) -> bool {
        element >= self.count
    }

    #[inline]
    pub fn element(&self, element: usize) -> &OriginalPacket {
        debug_assert!(element < self.count);
        &self.subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE]
    }

    #[inline]
    pub fn element_mut(&mut self, element: usize) -> &mut OriginalPacket {
        debug_assert!(element < self.count);
        &mut self.subwindows[element / SUBWINDOW_SIZE].originals[element % SUBWINDOW_SIZE]
    }

    /// Elements not yet acknowledged by the decoder.
    #[inline]
    pub fn unacknowledged_count(&self) -> usize {
        self.count.saturating_sub(self.first_unremoved)
    }

    /// Next element at or after `element` belonging to `lane_index`.
    fn next_lane_element(element: usize, lane_index: usize) -> usize {
        let mut next = element - (element % LANE_COUNT) + lane_index;
        if next < element {
            next += LANE_COUNT;
        }
        next
    }

    /// Append a packet.  Assigns and returns the next column number.
    pub fn add(&mut self, alloc: &mut Allocator, data: &[u8], now_msec: u64) -> Result<PacketNum> {
        if self.emergency_disabled {
            return Err(Error::Disabled);
        }
        if self.count >= MAX_PACKETS {
            return Err(Error::MaxPacketsReached);
        }

        let column = self.next_column;
        let mut element = self.count;

        // Keep a subwindow of headroom so lane-aligned restarts always fit.
        while element + LANE_COUNT >= self.subwindows.len() * SUBWINDOW_SIZE {
            self.subwindows.push(EncoderSubwindow::new());
        }

        if self.count > 0 {
            self.count += 1;
        } else {
            element = (column as usize) % LANE_COUNT;
            self.start_new_window(column);
        }

        // Serialize the length prefix and payload into a slab block.
        let mut prefix = [0u8; wire::MAX_LENGTH_BYTES];
        let header_bytes = wire::serialize_length(data.len() as u32, &mut prefix);
        let total_bytes = header_bytes + data.len();

        let Some(block) = alloc.allocate(total_bytes) else {
            self.emergency_disabled = true;
            debug!("packet buffer allocation failed, disabling encoder");
            return Err(Error::Disabled);
        };
        let buffer = alloc.block_mut(block);
        buffer[..header_bytes].copy_from_slice(&prefix[..header_bytes]);
        buffer[header_bytes..total_bytes].copy_from_slice(data);

        let slot = self.element_mut(element);
        if let Some(old) = slot.block.take() {
            // Slot recycled after subwindow rotation.
            alloc.free(old);
        }
        *slot = OriginalPacket {
            column,
            header_bytes,
            block: Some(block),
            bytes: total_bytes,
            last_send_msec: now_msec,
        };
        debug_assert!(column as usize % LANE_COUNT == element % LANE_COUNT);

        self.next_column = next_column(column);

        let lane = &mut self.lanes[(column as usize) % LANE_COUNT];
        if lane.longest_packet < total_bytes {
            lane.longest_packet = total_bytes;
        }
        if self.longest_packet < total_bytes {
            self.longest_packet = total_bytes;
        }

        Ok(column)
    }

    /// Start a window at `column`, skipping lane slots so that
    /// `element % LANE_COUNT == column % LANE_COUNT` holds.
    fn start_new_window(&mut self, column: PacketNum) {
        let element = (column as usize) % LANE_COUNT;
        self.column_start = column - element as u32;
        self.sum_start_element = element;
        self.sum_end_element = element;
        self.sum_column_start = self.column_start + element as u32;
        self.first_unremoved = element;
        self.count = element + 1;

        self.longest_packet = 0;
        for lane in self.lanes.iter_mut() {
            lane.longest_packet = 0;
        }

        debug!(column_start = self.column_start, "starting a new window");
    }

    /// Mark everything before `first_kept_column` as acknowledged.
    pub fn remove_before(&mut self, first_kept_column: PacketNum) {
        if self.emergency_disabled {
            return;
        }

        let first_kept_element = self.column_to_element(first_kept_column);

        if self.invalid_element(first_kept_element) {
            if is_column_delta_negative(first_kept_element) {
                trace!(first_kept_column, "remove before: already behind window");
            } else {
                self.count = 0;
                debug!(first_kept_column, "remove before: emptied window");
            }
        } else if self.first_unremoved < first_kept_element {
            self.first_unremoved = first_kept_element;
            trace!(first_kept_column, first_kept_element, "remove before");
        }
    }

    /// Throw away the running sums and restart them at `element_start`.
    pub fn reset_sums(&mut self, element_start: usize) {
        for (lane_index, lane) in self.lanes.iter_mut().enumerate() {
            let next = Self::next_lane_element(element_start, lane_index);
            for sum_index in 0..SUM_COUNT {
                lane.next_element[sum_index] = next;
                lane.sums[sum_index].reset();
            }
        }

        self.sum_start_element = element_start;
        self.sum_end_element = element_start;
        self.sum_column_start = self.element_to_column(element_start);
        self.sum_erased_count = 0;
    }

    /// Running sum for `(lane_index, sum_index)` folded up to `element_end`.
    ///
    /// Destructive: the returned sum only ever extends forward.  Callers
    /// must not pass a smaller `element_end` than a previous call unless
    /// [`reset_sums`](Self::reset_sums) intervened.
    pub fn get_sum(
        &mut self,
        alloc: &Allocator,
        lane_index: usize,
        sum_index: usize,
        element_end: usize,
    ) -> &[u8] {
        let mut element = self.lanes[lane_index].next_element[sum_index];
        debug_assert!(element % LANE_COUNT == lane_index);

        if element < element_end {
            let lane_longest = self.lanes[lane_index].longest_packet;
            if lane_longest > 0 {
                self.lanes[lane_index].sums[sum_index].grow_zero_padded(lane_longest);
            }

            loop {
                let (block, bytes, column) = {
                    let original = self.element(element);
                    (original.block, original.bytes, original.column)
                };

                let sum = &mut self.lanes[lane_index].sums[sum_index];
                sum.grow_zero_padded(bytes);

                if let Some(block) = block {
                    let source = &alloc.block(block)[..bytes];
                    if sum_index == 0 {
                        gf::add_mem(&mut sum.data[..bytes], source);
                    } else {
                        let mut cx = rows::column_value(column);
                        if sum_index == 2 {
                            cx = gf::sqr(cx);
                        }
                        gf::muladd_mem(&mut sum.data[..bytes], source, cx);
                    }
                }

                element += LANE_COUNT;
                if element >= element_end {
                    break;
                }
            }

            self.lanes[lane_index].next_element[sum_index] = element;
        }

        self.lanes[lane_index].sums[sum_index].as_slice()
    }

    /// Physically evict acknowledged subwindows.
    ///
    /// Precondition: `first_unremoved >= SUBWINDOW_SIZE`.  Still-needed sums
    /// are folded forward first so the coverage arithmetic stays exact.
    pub fn remove_elements(&mut self, alloc: &Allocator) {
        let first_kept_subwindow = self.first_unremoved / SUBWINDOW_SIZE;
        let removed = first_kept_subwindow * SUBWINDOW_SIZE;
        debug_assert!(first_kept_subwindow >= 1);
        debug_assert!(removed % LANE_COUNT == 0);
        debug_assert!(removed <= self.first_unremoved);

        debug!(
            removed,
            column_start = self.column_start,
            "evicting acknowledged subwindows"
        );

        // Roll the sums past the eviction point before the data disappears.
        if self.sum_end_element > self.sum_start_element {
            for lane_index in 0..LANE_COUNT {
                for sum_index in 0..SUM_COUNT {
                    self.get_sum(alloc, lane_index, sum_index, removed);
                    debug_assert!(self.lanes[lane_index].next_element[sum_index] >= removed);
                    self.lanes[lane_index].next_element[sum_index] -= removed;
                }
            }

            if removed > self.sum_start_element {
                self.sum_erased_count += removed - self.sum_start_element;
            }
            self.sum_end_element = self.sum_end_element.saturating_sub(removed);
            self.sum_start_element = self.sum_start_element.saturating_sub(removed);
        }

        // Kept subwindows shift to the front; evicted ones rotate to the end
        // and their slots are recycled as the window grows again.
        self.subwindows.rotate_left(first_kept_subwindow);

        debug_assert!(self.count >= removed);
        self.count -= removed;
        self.column_start = add_columns(self.column_start, removed as u32);
        self.first_unremoved -= removed;

        // Recompute packet length bounds over the survivors.
        let mut longest = 0;
        let mut lane_longest = [0usize; LANE_COUNT];
        for element in self.first_unremoved..self.count {
            let bytes = self.element(element).bytes;
            if longest < bytes {
                longest = bytes;
            }
            let lane = element % LANE_COUNT;
            if lane_longest[lane] < bytes {
                lane_longest[lane] = bytes;
            }
        }
        self.longest_packet = longest;
        for (lane, longest) in self.lanes.iter_mut().zip(lane_longest) {
            lane.longest_packet = longest;
        }

        if self.sum_end_element <= self.sum_start_element {
            self.reset_sums(self.first_unremoved);
        }
    }

    #[cfg(test)]
    pub fn set_next_column(&mut self, column: PacketNum) {
        debug_assert!(self.count == 0);
        self.next_column = column;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window_with(alloc: &mut Allocator, count: usize, bytes: usize) -> EncoderPacketWindow {
        let mut window = EncoderPacketWindow::new();
        for i in 0..count {
            let payload = vec![i as u8; bytes];
            window.add(alloc, &payload, 0).unwrap();
        }
        window
    }

    #[test]
    fn test_add_assigns_sequential_columns() {
        let mut alloc = Allocator::new();
        let mut window = EncoderPacketWindow::new();
        for i in 0..10u32 {
            assert_eq!(window.add(&mut alloc, &[0u8; 100], 0).unwrap(), i);
        }
        assert_eq!(window.count, 10);
        assert_eq!(window.unacknowledged_count(), 10);
    }

    #[test]
    fn test_lane_invariant_holds() {
        let mut alloc = Allocator::new();
        let window = window_with(&mut alloc, 100, 64);
        for element in 0..window.count {
            let original = window.element(element);
            assert_eq!(
                original.column as usize % LANE_COUNT,
                element % LANE_COUNT,
                "element {}",
                element
            );
        }
    }

    #[test]
    fn test_stored_buffer_has_length_prefix() {
        let mut alloc = Allocator::new();
        let window = window_with(&mut alloc, 1, 300);
        let original = window.element(0);
        let buffer = alloc.block(original.block.unwrap());
        let (length, header) = wire::deserialize_length(buffer).unwrap();
        assert_eq!(length, 300);
        assert_eq!(header, original.header_bytes);
        assert_eq!(original.bytes, header + 300);
    }

    #[test]
    fn test_remove_before_marks_elements() {
        let mut alloc = Allocator::new();
        let mut window = window_with(&mut alloc, 50, 64);

        window.remove_before(20);
        assert_eq!(window.first_unremoved, 20);
        assert_eq!(window.unacknowledged_count(), 30);

        // Acks never move the mark backwards.
        window.remove_before(10);
        assert_eq!(window.first_unremoved, 20);

        // A column beyond the window empties it.
        window.remove_before(1000);
        assert_eq!(window.count, 0);
    }

    #[test]
    fn test_reset_sums_realigns_lanes() {
        let mut alloc = Allocator::new();
        let mut window = window_with(&mut alloc, 40, 64);

        // Fold everything once so the sums are dirty.
        for lane in 0..LANE_COUNT {
            for sum in 0..SUM_COUNT {
                window.get_sum(&alloc, lane, sum, window.count);
            }
        }

        window.reset_sums(11);
        for lane_index in 0..LANE_COUNT {
            let lane = &window.lanes[lane_index];
            for sum_index in 0..SUM_COUNT {
                assert_eq!(lane.sums[sum_index].len, 0);
                let next = lane.next_element[sum_index];
                assert!(next >= 11);
                assert!(next < 11 + LANE_COUNT);
                assert_eq!(next % LANE_COUNT, lane_index);
            }
        }
        assert_eq!(window.sum_column_start, 11);
    }

    #[test]
    fn test_sum_zero_is_lane_xor() {
        let mut alloc = Allocator::new();
        let mut window = window_with(&mut alloc, 24, 32);

        let sum = window.get_sum(&alloc, 0, 0, window.count).to_vec();

        // Lane 0 holds elements 0, 8, 16; XOR their prefixed buffers.
        let mut expected = vec![0u8; sum.len()];
        for element in [0usize, 8, 16] {
            let original = window.element(element);
            let buffer = alloc.block(original.block.unwrap());
            for (byte, source) in expected.iter_mut().zip(&buffer[..original.bytes]) {
                *byte ^= source;
            }
        }
        assert_eq!(sum, expected);
    }

    #[test]
    fn test_get_sum_extends_incrementally() {
        let mut alloc = Allocator::new();
        let mut window = window_with(&mut alloc, 16, 32);

        let early = window.get_sum(&alloc, 0, 0, 8).to_vec();
        // Add the remaining lane element and extend.
        let full = window.get_sum(&alloc, 0, 0, window.count).to_vec();

        let original = window.element(8);
        let buffer = alloc.block(original.block.unwrap()).to_vec();
        let mut expected = early.clone();
        for (byte, source) in expected.iter_mut().zip(&buffer[..original.bytes]) {
            *byte ^= source;
        }
        assert_eq!(full, expected);
    }

    #[test]
    fn test_remove_elements_rolls_window_forward() {
        let mut alloc = Allocator::new();
        let mut window = window_with(&mut alloc, 200, 48);

        // Prime the sums so eviction has to roll them forward.
        window.reset_sums(0);
        for lane in 0..LANE_COUNT {
            for sum in 0..SUM_COUNT {
                window.get_sum(&alloc, lane, sum, window.count);
            }
        }
        window.sum_end_element = window.count;

        window.remove_before(140);
        let removed = (140 / SUBWINDOW_SIZE) * SUBWINDOW_SIZE;
        window.remove_elements(&alloc);

        assert_eq!(window.column_start, removed as u32);
        assert_eq!(window.count, 200 - removed);
        assert_eq!(window.first_unremoved, 140 - removed);
        assert_eq!(window.sum_erased_count, removed);

        // Surviving elements still line up with their columns.
        for element in window.first_unremoved..window.count {
            assert_eq!(
                window.element(element).column,
                window.element_to_column(element)
            );
        }
    }

    #[test]
    fn test_window_restart_preserves_lane_alignment() {
        let mut alloc = Allocator::new();
        let mut window = window_with(&mut alloc, 11, 16);

        window.remove_before(2000); // empties
        assert_eq!(window.count, 0);

        // Next add restarts at next_column = 11, which is lane 3.
        let column = window.add(&mut alloc, &[1u8; 16], 0).unwrap();
        assert_eq!(column, 11);
        let element = window.column_to_element(column);
        assert_eq!(element % LANE_COUNT, 11 % LANE_COUNT);
        assert_eq!(window.count, element + 1);
    }
}
