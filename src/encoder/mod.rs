//! Encoder: sliding-window state and recovery row generation.
//!
//! The encoder tracks originals that the decoder has not yet acknowledged
//! and, when asked for a recovery packet, picks between three row types by
//! window size: a parity-of-one row for a single packet, parity/Cauchy rows
//! while the window is small, and the structured dense-plus-light row for
//! large windows.  It also consumes acknowledgements and serves NACK-driven
//! retransmits.

mod ack;
pub(crate) mod window;

use std::time::Instant;

use tracing::debug;

use crate::slab::{Allocator, BlockHandle, ReallocBehavior};
use crate::stats::EncoderStats;
use crate::wire::{self, RecoveryMetadata};
use crate::{
    add_columns, gf, is_column_delta_negative, rows, Error, PacketNum, Result, CAUCHY_MAX_COLUMNS,
    CAUCHY_MAX_ROWS, CAUCHY_THRESHOLD, ENCODER_REMOVE_THRESHOLD, LANE_COUNT, MAX_PACKETS,
    MAX_PACKET_BYTES, PACKET_NUM_MAX, PAIR_ADD_RATE, ROW_PERIOD, SUM_COUNT, SUM_RESET_THRESHOLD,
};

use ack::AcknowledgementState;
use window::{EncoderPacketWindow, GrowingBuffer};

/// Streaming FEC encoder.
///
/// Single-threaded; the caller synchronizes access.  Buffers returned by
/// [`encode`](Self::encode), [`get`](Self::get) and
/// [`retransmit`](Self::retransmit) borrow the encoder and stay valid until
/// the next state-changing call.
pub struct Encoder {
    alloc: Allocator,
    window: EncoderPacketWindow,
    ack: AcknowledgementState,

    /// Scratch for the recovery packet being built; reused across calls.
    recovery: GrowingBuffer,

    /// Next structured row number.
    next_row: u32,

    /// First column at which the next parity row may start.
    next_parity_column: PacketNum,

    /// Rotating Cauchy row index.
    next_cauchy_row: u32,

    stats: EncoderStats,
    epoch: Instant,
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder {
    /// Create an encoder with its own packet allocator.
    pub fn new() -> Self {
        Self {
            alloc: Allocator::new(),
            window: EncoderPacketWindow::new(),
            ack: AcknowledgementState::new(),
            recovery: GrowingBuffer::new(),
            next_row: 0,
            next_parity_column: 0,
            next_cauchy_row: 0,
            stats: EncoderStats::default(),
            epoch: Instant::now(),
        }
    }

    fn now_msec(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Cap the codec's backing storage.  When the cap is hit, the failing
    /// operation and every call after it return [`Error::Disabled`].
    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.alloc.set_memory_limit(limit);
    }

    /// Append an original packet to the protected set.
    ///
    /// Returns the packet number assigned to it.
    pub fn add(&mut self, data: &[u8]) -> Result<PacketNum> {
        if data.is_empty() || data.len() > MAX_PACKET_BYTES {
            return Err(Error::InvalidInput);
        }
        let now_msec = self.now_msec();
        let column = self.window.add(&mut self.alloc, data, now_msec)?;
        self.stats.original_count += 1;
        self.stats.original_bytes += data.len() as u64;
        Ok(column)
    }

    /// Look up a packet still held in the window.
    pub fn get(&mut self, packet_num: PacketNum) -> Result<&[u8]> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if packet_num > PACKET_NUM_MAX {
            return Err(Error::InvalidInput);
        }

        let element = self.window.column_to_element(packet_num);
        if self.window.invalid_element(element) || element < self.window.first_unremoved {
            return Err(Error::NeedMoreData);
        }

        let (block, bytes, header_bytes) = {
            let original = self.window.element(element);
            (original.block, original.bytes, original.header_bytes)
        };
        let Some(block) = block else {
            return Err(Error::NeedMoreData);
        };

        if cfg!(debug_assertions) {
            // Cross-check the stored length prefix; a mismatch means the
            // window state is corrupt.
            let buffer = self.alloc.block(block);
            let valid = matches!(
                wire::deserialize_length(&buffer[..bytes]),
                Some((length, consumed))
                    if length > 0 && consumed == header_bytes
                        && consumed + length as usize == bytes
            );
            if !valid {
                self.window.emergency_disabled = true;
                return Err(Error::Disabled);
            }
        }

        Ok(&self.alloc.block(block)[header_bytes..bytes])
    }

    /// Drop all packets before `first_kept_packet_num` from the set.
    ///
    /// Prefer feeding decoder acknowledgements to [`acknowledge`](Self::acknowledge);
    /// this is the manual escape hatch.
    pub fn remove_before(&mut self, first_kept_packet_num: PacketNum) -> Result<()> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if first_kept_packet_num > PACKET_NUM_MAX {
            return Err(Error::InvalidInput);
        }
        self.window.remove_before(first_kept_packet_num);
        Ok(())
    }

    /// Process an acknowledgement produced by
    /// [`Decoder::acknowledgement`](crate::Decoder::acknowledgement).
    pub fn acknowledge(&mut self, buffer: &[u8]) -> Result<()> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if !self.ack.on_acknowledgement_data(&mut self.window, buffer) {
            return Err(Error::InvalidInput);
        }
        self.stats.ack_count += 1;
        self.stats.ack_bytes += buffer.len() as u64;
        Ok(())
    }

    /// Return the next NACKed original due for retransmission.
    ///
    /// `retransmit_msec` is the minimum time between sends of the same
    /// packet.  Returns `NeedMoreData` once every due loss has been walked;
    /// the iteration restarts on the following call.
    pub fn retransmit(&mut self, retransmit_msec: u64) -> Result<(PacketNum, &[u8])> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if !self.ack.has_negative_acknowledgements() {
            return Err(Error::NeedMoreData);
        }

        let now_msec = self.now_msec();
        let mut found: Option<(PacketNum, BlockHandle, usize, usize)> = None;

        while let Some(column) = self.ack.next_loss_column() {
            let element = self.window.column_to_element(column);
            if self.window.invalid_element(element) {
                debug_assert!(false, "loss column outside the window");
                break;
            }

            let (block, bytes, header_bytes, last_send_msec) = {
                let original = self.window.element(element);
                (
                    original.block,
                    original.bytes,
                    original.header_bytes,
                    original.last_send_msec,
                )
            };
            let Some(block) = block else {
                break;
            };

            // Resent too recently; look at the next loss.
            if now_msec - last_send_msec < retransmit_msec {
                continue;
            }

            self.window.element_mut(element).last_send_msec = now_msec;
            found = Some((column, block, header_bytes, bytes));
            break;
        }

        match found {
            Some((column, block, header_bytes, bytes)) => {
                let length = bytes - header_bytes;
                self.stats.retransmit_count += 1;
                self.stats.retransmit_bytes += length as u64;
                debug!(column, length, "retransmitting original");
                Ok((column, &self.alloc.block(block)[header_bytes..bytes]))
            }
            None => {
                self.ack.restart_loss_iterator();
                Err(Error::NeedMoreData)
            }
        }
    }

    /// Generate the next recovery packet over the unacknowledged window.
    ///
    /// This is the only encoder entry point with real CPU cost.
    pub fn encode(&mut self) -> Result<&[u8]> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if self.window.count == 0 {
            return Err(Error::NeedMoreData);
        }

        let unacknowledged = self.window.unacknowledged_count();
        if unacknowledged == 0 {
            return Err(Error::NeedMoreData);
        }
        if unacknowledged == 1 {
            return self.generate_single();
        }

        // Upper bound on the sum width if the current sums keep extending.
        debug_assert!(self.window.count + self.window.sum_erased_count >= self.window.sum_start_element);
        let new_sum_upper_bound =
            self.window.count - self.window.sum_start_element + self.window.sum_erased_count;

        if self.window.sum_end_element <= self.window.sum_start_element
            || new_sum_upper_bound >= MAX_PACKETS
        {
            // No usable sums.  Small windows go to Cauchy rows; otherwise
            // restart the sums at the unacknowledged tail.
            if unacknowledged <= CAUCHY_THRESHOLD {
                return self.generate_cauchy();
            }
            debug!(
                element = self.window.first_unremoved,
                "resetting running sums"
            );
            self.window.reset_sums(self.window.first_unremoved);
        } else if unacknowledged <= SUM_RESET_THRESHOLD
            || new_sum_upper_bound <= CAUCHY_THRESHOLD
        {
            // The window shrank enough that Cauchy rows win; drop the sums.
            self.window.sum_end_element = self.window.sum_start_element;
            return self.generate_cauchy();
        }

        if self.window.first_unremoved >= ENCODER_REMOVE_THRESHOLD {
            self.window.remove_elements(&self.alloc);
        }

        let row = self.next_row;
        self.next_row = (self.next_row + 1) % ROW_PERIOD;

        // The scratch holds the recovery accumulator and the product
        // workspace back to back, plus footer room.
        let recovery_bytes = self.window.longest_packet;
        let aligned = (recovery_bytes + 15) & !15;
        self.recovery
            .initialize_zeroed(2 * aligned + wire::MAX_RECOVERY_METADATA_BYTES);

        {
            let (recovery_half, product_half) = self.recovery.data.split_at_mut(aligned);

            Self::add_dense_columns(
                &mut self.window,
                &self.alloc,
                recovery_half,
                product_half,
                row,
                recovery_bytes,
            );
            Self::add_light_columns(&self.window, &self.alloc, recovery_half, product_half, row);

            // recovery += RX * product
            gf::muladd_mem(
                &mut recovery_half[..recovery_bytes],
                &product_half[..recovery_bytes],
                rows::row_value(row),
            );
        }

        debug_assert!(
            self.window.sum_end_element + self.window.sum_erased_count
                >= self.window.sum_start_element
        );
        let metadata = RecoveryMetadata {
            column_start: self.window.sum_column_start,
            sum_count: (self.window.sum_end_element - self.window.sum_start_element
                + self.window.sum_erased_count) as u32,
            ldpc_count: unacknowledged as u32,
            row,
        };

        let footer_bytes = wire::serialize_recovery_footer(
            &metadata,
            &mut self.recovery.data[recovery_bytes..recovery_bytes + wire::MAX_RECOVERY_METADATA_BYTES],
        );

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += (recovery_bytes + footer_bytes) as u64;

        debug!(
            column_start = metadata.column_start,
            sum_count = metadata.sum_count,
            ldpc_count = metadata.ldpc_count,
            row,
            "generated structured recovery packet"
        );

        Ok(&self.recovery.data[..recovery_bytes + footer_bytes])
    }

    /// Dense step: fold the selected lane sums into both accumulators.
    fn add_dense_columns(
        window: &mut EncoderPacketWindow,
        alloc: &Allocator,
        recovery: &mut [u8],
        product: &mut [u8],
        row: u32,
        recovery_bytes: usize,
    ) {
        for lane_index in 0..LANE_COUNT {
            let opcode = rows::row_opcode(lane_index, row);

            for sum_index in 0..SUM_COUNT {
                if opcode & (1 << sum_index) != 0 {
                    let sum = window.get_sum(alloc, lane_index, sum_index, window.count);
                    let add_bytes = sum.len().min(recovery_bytes);
                    gf::add_mem(&mut recovery[..add_bytes], &sum[..add_bytes]);
                }
            }
            for sum_index in 0..SUM_COUNT {
                if opcode & (1 << (SUM_COUNT + sum_index)) != 0 {
                    let sum = window.get_sum(alloc, lane_index, sum_index, window.count);
                    let add_bytes = sum.len().min(recovery_bytes);
                    gf::add_mem(&mut product[..add_bytes], &sum[..add_bytes]);
                }
            }
        }

        window.sum_end_element = window.count;
    }

    /// Light step: pseudo-random element pairs, one side per accumulator.
    fn add_light_columns(
        window: &EncoderPacketWindow,
        alloc: &Allocator,
        recovery: &mut [u8],
        product: &mut [u8],
        row: u32,
    ) {
        let start = window.first_unremoved;
        debug_assert!(window.sum_end_element >= start);
        let count = window.sum_end_element - start;
        debug_assert!(count >= 2);

        let mut prng = rows::PcgRandom::seed(row as u64, count as u64);
        let pair_count = (count + PAIR_ADD_RATE - 1) / PAIR_ADD_RATE;

        for _ in 0..pair_count {
            let into_recovery = start + prng.next() as usize % count;
            let original = window.element(into_recovery);
            if let Some(block) = original.block {
                gf::add_mem(recovery, &alloc.block(block)[..original.bytes]);
            }

            let into_product = start + prng.next() as usize % count;
            let original = window.element(into_product);
            if let Some(block) = original.block {
                gf::add_mem(product, &alloc.block(block)[..original.bytes]);
            }
        }
    }

    /// Single unacknowledged packet: emit it as a parity-of-one row,
    /// growing its own buffer for the footer to avoid a copy.
    fn generate_single(&mut self) -> Result<&[u8]> {
        let element = self.window.first_unremoved;
        let (block, bytes, column) = {
            let original = self.window.element(element);
            (original.block, original.bytes, original.column)
        };
        let Some(block) = block else {
            self.window.emergency_disabled = true;
            return Err(Error::Disabled);
        };

        // Usually in place thanks to the allocator's slack.
        let Some(grown) = self.alloc.reallocate(
            block,
            bytes + wire::MAX_RECOVERY_METADATA_BYTES,
            ReallocBehavior::CopyExisting,
        ) else {
            self.window.emergency_disabled = true;
            return Err(Error::Disabled);
        };
        self.window.element_mut(element).block = Some(grown);

        let metadata = RecoveryMetadata {
            column_start: column,
            sum_count: 1,
            ldpc_count: 1,
            row: 0,
        };
        let mut footer = [0u8; wire::MAX_RECOVERY_METADATA_BYTES];
        let footer_bytes = wire::serialize_recovery_footer(&metadata, &mut footer);

        let buffer = self.alloc.block_mut(grown);
        buffer[bytes..bytes + footer_bytes].copy_from_slice(&footer[..footer_bytes]);

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += (bytes + footer_bytes) as u64;

        debug!(column, "generated single-packet recovery");

        Ok(&self.alloc.block(grown)[..bytes + footer_bytes])
    }

    /// Small window: emit a parity row on schedule, Cauchy rows otherwise.
    fn generate_cauchy(&mut self) -> Result<&[u8]> {
        let first_element = self.window.first_unremoved;
        let recovery_bytes = self.window.longest_packet;
        self.recovery
            .initialize_zeroed(recovery_bytes + wire::MAX_RECOVERY_METADATA_BYTES);

        let unacknowledged = self.window.unacknowledged_count();
        let column_start = self.window.element_to_column(first_element);

        // Parity and Cauchy rows skip the acknowledged head of the window,
        // so the row may be shorter than the window's longest packet.
        let mut used_bytes = 0usize;
        let row;

        let next_parity_element = self.window.column_to_element(self.next_parity_column);
        if next_parity_element <= first_element || is_column_delta_negative(next_parity_element) {
            // Parity row; schedule the next one past the current window.
            self.next_parity_column = add_columns(column_start, unacknowledged as u32);
            row = 0;

            for element in first_element..self.window.count {
                let (block, bytes) = {
                    let original = self.window.element(element);
                    (original.block, original.bytes)
                };
                if let Some(block) = block {
                    gf::add_mem(&mut self.recovery.data[..bytes], &self.alloc.block(block)[..bytes]);
                }
                used_bytes = used_bytes.max(bytes);
            }
        } else {
            let cauchy_row = self.next_cauchy_row;
            row = cauchy_row + 1;
            self.next_cauchy_row = (self.next_cauchy_row + 1) % CAUCHY_MAX_ROWS;

            let mut cauchy_column = column_start % CAUCHY_MAX_COLUMNS;
            for element in first_element..self.window.count {
                let (block, bytes) = {
                    let original = self.window.element(element);
                    (original.block, original.bytes)
                };
                let y = rows::cauchy_element(cauchy_row, cauchy_column);
                if let Some(block) = block {
                    gf::muladd_mem(
                        &mut self.recovery.data[..bytes],
                        &self.alloc.block(block)[..bytes],
                        y,
                    );
                }
                used_bytes = used_bytes.max(bytes);
                cauchy_column = (cauchy_column + 1) % CAUCHY_MAX_COLUMNS;
            }
        }

        let metadata = RecoveryMetadata {
            column_start,
            sum_count: unacknowledged as u32,
            ldpc_count: unacknowledged as u32,
            row,
        };
        let footer_bytes = wire::serialize_recovery_footer(
            &metadata,
            &mut self.recovery.data[used_bytes..used_bytes + wire::MAX_RECOVERY_METADATA_BYTES],
        );

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += (used_bytes + footer_bytes) as u64;

        debug!(
            column_start,
            count = unacknowledged,
            row,
            "generated parity/Cauchy recovery packet"
        );

        Ok(&self.recovery.data[..used_bytes + footer_bytes])
    }

    /// Allocate from the encoder's packet pool.  Always 16-byte aligned.
    pub fn mem_alloc(&mut self, bytes: usize) -> Option<BlockHandle> {
        self.alloc.allocate(bytes)
    }

    /// Free a block from [`mem_alloc`](Self::mem_alloc).
    pub fn mem_free(&mut self, handle: BlockHandle) {
        self.alloc.free(handle);
    }

    /// Borrow a block from [`mem_alloc`](Self::mem_alloc).
    pub fn mem(&self, handle: BlockHandle) -> &[u8] {
        self.alloc.block(handle)
    }

    /// Borrow a block mutably.
    pub fn mem_mut(&mut self, handle: BlockHandle) -> &mut [u8] {
        self.alloc.block_mut(handle)
    }

    /// Lifetime statistics.
    pub fn stats(&self) -> EncoderStats {
        let mut stats = self.stats.clone();
        stats.memory_allocated_bytes = self.alloc.memory_allocated_bytes() as u64;
        stats
    }

    #[cfg(test)]
    pub(crate) fn set_next_column(&mut self, column: PacketNum) {
        self.window.set_next_column(column);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::deserialize_recovery_footer;

    #[test]
    fn test_encode_without_data_needs_more() {
        let mut encoder = Encoder::new();
        assert_eq!(encoder.encode().unwrap_err(), Error::NeedMoreData);
    }

    #[test]
    fn test_single_packet_recovery_is_parity_of_one() {
        let mut encoder = Encoder::new();
        let payload = vec![0x5au8; 200];
        encoder.add(&payload).unwrap();

        let recovery = encoder.encode().unwrap().to_vec();
        let (metadata, footer_bytes) = deserialize_recovery_footer(&recovery).unwrap();
        assert_eq!(metadata.sum_count, 1);
        assert_eq!(metadata.ldpc_count, 1);
        assert_eq!(metadata.column_start, 0);
        assert_eq!(metadata.row, 0);

        // The recovery payload is the prefixed original; XORing it against
        // the stored buffer must leave zero.
        let body = &recovery[..recovery.len() - footer_bytes];
        let stored = {
            let mut buffer = vec![0u8; 4];
            let header = wire::serialize_length(200, &mut buffer);
            buffer.truncate(header);
            buffer.extend_from_slice(&payload);
            buffer
        };
        assert_eq!(body, &stored[..]);
    }

    #[test]
    fn test_small_window_produces_parity_then_cauchy() {
        let mut encoder = Encoder::new();
        for i in 0..8 {
            encoder.add(&vec![i as u8; 100]).unwrap();
        }

        let first = encoder.encode().unwrap().to_vec();
        let (metadata, _) = deserialize_recovery_footer(&first).unwrap();
        assert_eq!(metadata.row, 0); // parity comes first
        assert_eq!(metadata.sum_count, 8);
        assert_eq!(metadata.ldpc_count, 8);

        let second = encoder.encode().unwrap().to_vec();
        let (metadata, _) = deserialize_recovery_footer(&second).unwrap();
        assert_eq!(metadata.row, 1); // then the first Cauchy row
        assert_eq!(metadata.sum_count, 8);
    }

    #[test]
    fn test_parity_row_xors_all_originals() {
        let mut encoder = Encoder::new();
        let payloads: Vec<Vec<u8>> = (0..4).map(|i| vec![(i * 17 + 1) as u8; 64]).collect();
        for payload in &payloads {
            encoder.add(payload).unwrap();
        }

        let recovery = encoder.encode().unwrap().to_vec();
        let (metadata, footer_bytes) = deserialize_recovery_footer(&recovery).unwrap();
        assert_eq!(metadata.row, 0);

        // Rebuild the expected XOR over prefixed buffers.
        let mut expected = vec![0u8; recovery.len() - footer_bytes];
        for payload in &payloads {
            let mut prefix = [0u8; 4];
            let header = wire::serialize_length(payload.len() as u32, &mut prefix);
            let mut buffer = prefix[..header].to_vec();
            buffer.extend_from_slice(payload);
            for (byte, source) in expected.iter_mut().zip(&buffer) {
                *byte ^= source;
            }
        }
        assert_eq!(&recovery[..recovery.len() - footer_bytes], &expected[..]);
    }

    #[test]
    fn test_large_window_generates_structured_rows() {
        let mut encoder = Encoder::new();
        for i in 0..100 {
            encoder.add(&vec![(i % 251) as u8; 128]).unwrap();
        }

        let first = encoder.encode().unwrap().to_vec();
        let (metadata, _) = deserialize_recovery_footer(&first).unwrap();
        assert_eq!(metadata.sum_count, 100);
        assert_eq!(metadata.ldpc_count, 100);
        assert_eq!(metadata.column_start, 0);
        assert_eq!(metadata.row, 0);
        assert!(metadata.sum_count as usize > CAUCHY_THRESHOLD);

        let second = encoder.encode().unwrap().to_vec();
        let (metadata, _) = deserialize_recovery_footer(&second).unwrap();
        assert_eq!(metadata.row, 1);
    }

    #[test]
    fn test_recovery_overhead_is_bounded() {
        let mut encoder = Encoder::new();
        for _ in 0..100 {
            encoder.add(&[0x77u8; 500]).unwrap();
        }
        let recovery = encoder.encode().unwrap();
        // Longest prefixed buffer is 2 + 500; overhead stays within bounds.
        assert!(recovery.len() <= 502 + crate::MAX_ENCODE_OVERHEAD);
    }

    #[test]
    fn test_get_respects_removal() {
        let mut encoder = Encoder::new();
        for i in 0..20 {
            encoder.add(&vec![i as u8; 50]).unwrap();
        }
        assert_eq!(encoder.get(5).unwrap(), &[5u8; 50][..]);

        encoder.remove_before(10).unwrap();
        assert_eq!(encoder.get(5).unwrap_err(), Error::NeedMoreData);
        assert_eq!(encoder.get(10).unwrap(), &[10u8; 50][..]);
    }

    #[test]
    fn test_invalid_add_rejected() {
        let mut encoder = Encoder::new();
        assert_eq!(encoder.add(&[]).unwrap_err(), Error::InvalidInput);
    }

    #[test]
    fn test_stats_track_operations() {
        let mut encoder = Encoder::new();
        encoder.add(&[1u8; 100]).unwrap();
        encoder.add(&[2u8; 100]).unwrap();
        encoder.encode().unwrap();

        let stats = encoder.stats();
        assert_eq!(stats.original_count, 2);
        assert_eq!(stats.original_bytes, 200);
        assert_eq!(stats.recovery_count, 1);
        assert!(stats.recovery_bytes > 0);
        assert!(stats.memory_allocated_bytes > 0);
    }

    #[test]
    fn test_memory_limit_latches_disabled() {
        let mut encoder = Encoder::new();
        encoder.set_memory_limit(Some(encoder.stats().memory_allocated_bytes as usize));

        let mut failed = false;
        for i in 0..10_000 {
            match encoder.add(&[0xcdu8; 1000]) {
                Ok(_) => continue,
                Err(Error::Disabled) => {
                    failed = true;
                    // Everything after the failure stays disabled.
                    assert_eq!(encoder.add(&[1u8; 10]).unwrap_err(), Error::Disabled);
                    assert_eq!(encoder.encode().unwrap_err(), Error::Disabled);
                    assert_eq!(encoder.get(0).unwrap_err(), Error::Disabled);
                    assert_eq!(encoder.remove_before(1).unwrap_err(), Error::Disabled);
                    break;
                }
                Err(other) => panic!("unexpected error {:?} at add {}", other, i),
            }
        }
        assert!(failed, "memory limit never latched");
    }
}
