//! Decoder: receive window, recovery accumulation, and acknowledgements.
//!
//! The decoder mirrors the encoder's window layout, substitutes received
//! originals out of incoming recovery rows, and solves for missing columns
//! as soon as the pending rows cover them.  It also emits selective
//! acknowledgements with NACK ranges for the encoder's retransmit path.

mod solver;
pub(crate) mod window;

use std::time::Instant;

use tracing::debug;

use crate::slab::Allocator;
use crate::stats::DecoderStats;
use crate::wire;
use crate::{
    is_column_delta_negative, Error, PacketNum, Result, ACK_MIN_BYTES, CAUCHY_MAX_ROWS,
    CAUCHY_THRESHOLD, MAX_PACKET_BYTES, PACKET_NUM_MAX,
};

use solver::{InsertOutcome, RecoverySolver};
use window::DecoderPacketWindow;

/// An original reconstructed by [`Decoder::decode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredPacket {
    /// Column assigned by the encoder.
    pub packet_num: PacketNum,
    /// Reconstructed payload.
    pub data: Vec<u8>,
}

/// Streaming FEC decoder.
///
/// Single-threaded; the caller synchronizes access and copies out any data
/// that must outlive the next state-changing call.
pub struct Decoder {
    alloc: Allocator,
    window: DecoderPacketWindow,
    solver: RecoverySolver,
    stats: DecoderStats,
    epoch: Instant,

    /// Monotonicity guard for generated acknowledgements.
    last_next_expected: Option<PacketNum>,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    /// Create a decoder with its own packet allocator.
    pub fn new() -> Self {
        Self {
            alloc: Allocator::new(),
            window: DecoderPacketWindow::new(),
            solver: RecoverySolver::new(),
            stats: DecoderStats::default(),
            epoch: Instant::now(),
            last_next_expected: None,
        }
    }

    fn now_msec(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Cap the codec's backing storage; see
    /// [`Encoder::set_memory_limit`](crate::Encoder::set_memory_limit).
    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.alloc.set_memory_limit(limit);
    }

    /// Feed an original packet that arrived from the network.
    ///
    /// Returns [`Error::DuplicateData`] when the packet was already received
    /// or already reconstructed through recovery.
    pub fn add_original(&mut self, packet_num: PacketNum, data: &[u8]) -> Result<()> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if packet_num > PACKET_NUM_MAX || data.is_empty() || data.len() > MAX_PACKET_BYTES {
            return Err(Error::InvalidInput);
        }

        self.window.anchor(packet_num);

        let element = self.window.column_to_element(packet_num);
        if is_column_delta_negative(element) || element < self.window.first_unremoved {
            // Behind the window: the data was already consumed or given up.
            self.stats.duped_original_count += 1;
            return Err(Error::DuplicateData);
        }
        if self.window.is_received(element) {
            self.stats.duped_original_count += 1;
            return Err(Error::DuplicateData);
        }

        let now_msec = self.now_msec();
        self.window.store(&mut self.alloc, packet_num, data, now_msec)?;
        self.solver
            .substitute_received(&self.window, &self.alloc, packet_num);

        self.stats.original_count += 1;
        self.stats.original_bytes += data.len() as u64;
        Ok(())
    }

    /// Feed a recovery packet that arrived from the network.
    ///
    /// The window trims behind the coverage start carried in the packet, so
    /// recovery input is also what bounds decoder memory.
    pub fn add_recovery(&mut self, packet: &[u8]) -> Result<()> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }

        let Some((metadata, footer_bytes)) = wire::deserialize_recovery_footer(packet) else {
            return Err(Error::InvalidInput);
        };
        if packet.len() <= footer_bytes {
            return Err(Error::InvalidInput);
        }
        let payload = &packet[..packet.len() - footer_bytes];

        // Validate the metadata against the wire contract.
        let valid = metadata.sum_count >= 1
            && metadata.ldpc_count >= 1
            && metadata.ldpc_count <= metadata.sum_count
            && metadata.sum_count as usize <= crate::MAX_PACKETS
            && if metadata.sum_count as usize <= CAUCHY_THRESHOLD {
                metadata.row <= CAUCHY_MAX_ROWS
            } else {
                metadata.ldpc_count >= 2
            };
        if !valid {
            return Err(Error::InvalidInput);
        }

        self.stats.recovery_count += 1;
        self.stats.recovery_bytes += packet.len() as u64;

        self.window.anchor(metadata.column_start);

        let start_element = self.window.column_to_element(metadata.column_start);
        if is_column_delta_negative(start_element) {
            // Coverage starts before anything we can still index.
            self.stats.duped_recovery_count += 1;
            return Ok(());
        }

        self.window
            .extend_count(start_element + metadata.sum_count as usize)?;
        self.window
            .remove_before(&mut self.alloc, metadata.column_start);

        // Re-derive elements after the trim above may have shifted them.
        let start_element = self.window.column_to_element(metadata.column_start);
        let end_element = start_element + metadata.sum_count as usize;
        self.window.note_coverage(start_element);

        // The coverage end is loss evidence for the ack age filter.
        let now_msec = self.now_msec();
        let first_unremoved = self.window.first_unremoved;
        self.window
            .recovery_marks
            .retain(|&(element, _)| element >= first_unremoved);
        let already_marked = matches!(
            self.window.recovery_marks.last(),
            Some(&(element, _)) if element == end_element - 1
        );
        if !already_marked {
            self.window.recovery_marks.push((end_element - 1, now_msec));
        }

        if (start_element..end_element).all(|element| self.window.is_received(element)) {
            // Everything covered already arrived.
            self.stats.duped_recovery_count += 1;
            return Ok(());
        }

        match self
            .solver
            .insert(&self.window, &self.alloc, payload, &metadata)
        {
            InsertOutcome::Installed => {}
            InsertOutcome::Redundant => self.stats.duped_recovery_count += 1,
        }
        Ok(())
    }

    /// True when enough evidence accumulated that [`decode`](Self::decode)
    /// can reconstruct every missing packet in the window.
    pub fn is_ready(&self) -> bool {
        !self.window.emergency_disabled && self.solver.is_ready(&self.window)
    }

    /// Reconstruct the missing originals.
    ///
    /// Recovered packets are also stored in the window, so
    /// [`get`](Self::get) returns them afterwards.
    pub fn decode(&mut self) -> Result<Vec<RecoveredPacket>> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if !self.solver.is_ready(&self.window) {
            return Err(Error::NeedMoreData);
        }

        let now_msec = self.now_msec();
        debug!(
            missing = self.window.missing_count(),
            pending = self.solver.pending_rows(),
            "starting decode pass"
        );
        let (recovered, failed) = self
            .solver
            .decode(&mut self.window, &mut self.alloc, now_msec)?;

        self.stats.solve_success_count += recovered.len() as u64;
        self.stats.solve_fail_count += failed as u64;
        debug!(
            recovered = recovered.len(),
            failed, "decode pass finished"
        );

        Ok(recovered
            .into_iter()
            .map(|(packet_num, data)| RecoveredPacket { packet_num, data })
            .collect())
    }

    /// Look up a received or recovered packet by number.
    pub fn get(&self, packet_num: PacketNum) -> Result<&[u8]> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if packet_num > PACKET_NUM_MAX {
            return Err(Error::InvalidInput);
        }

        let element = self.window.column_to_element(packet_num);
        if is_column_delta_negative(element) || !self.window.is_received(element) {
            return Err(Error::NeedMoreData);
        }

        let slot = self.window.slot(element);
        debug_assert!(slot.column == packet_num);
        let Some(block) = slot.block else {
            return Err(Error::NeedMoreData);
        };
        Ok(&self.alloc.block(block)[slot.header_bytes..slot.bytes])
    }

    /// Write an acknowledgement into `buffer` (at least [`ACK_MIN_BYTES`]).
    ///
    /// `age_msec` suppresses NACK ranges until newer data has been held
    /// that long, allowing for reordering.  Returns the bytes used; if the
    /// buffer cannot hold every range the list is truncated.
    pub fn acknowledgement(&mut self, buffer: &mut [u8], age_msec: u64) -> Result<usize> {
        if self.window.emergency_disabled {
            return Err(Error::Disabled);
        }
        if buffer.len() < ACK_MIN_BYTES {
            return Err(Error::InvalidInput);
        }

        let now_msec = self.now_msec();
        let window = &self.window;
        let count = window.count;

        let next_expected_element = window.first_missing_element(window.first_unremoved);
        let next_expected = window.element_to_column(next_expected_element);

        // Acks only ever move forward.
        debug_assert!(self.last_next_expected.map_or(true, |last| {
            !is_column_delta_negative(crate::subtract_columns(next_expected, last))
        }));
        self.last_next_expected = Some(next_expected);

        let mut used = wire::serialize_packet_num(next_expected, buffer);

        // Oldest evidence (arrival or recovery coverage) at or after each
        // element; a missing range is only reported once evidence past it
        // is at least `age_msec` old.
        let mut evidence = vec![u64::MAX; count + 1];
        for element in next_expected_element..count {
            if window.is_received(element) {
                let arrival = window.slot(element).arrival_msec;
                evidence[element] = evidence[element].min(arrival);
            }
        }
        for &(element, msec) in window.recovery_marks.iter() {
            let at = (element + 1).min(count);
            evidence[at] = evidence[at].min(msec);
        }
        for element in (next_expected_element..count).rev() {
            evidence[element] = evidence[element].min(evidence[element + 1]);
        }

        let mut element = next_expected_element;
        let mut previous_end: Option<usize> = None;
        while element < count {
            let start = window.first_missing_element(element);
            if start >= count {
                break;
            }
            let mut end = start + 1;
            while end < count && !window.is_received(end) {
                end += 1;
            }

            let aged = evidence[end.min(count)] != u64::MAX
                && now_msec.saturating_sub(evidence[end.min(count)]) >= age_msec;
            if aged {
                if used + wire::MAX_NACK_RANGE_BYTES > buffer.len() {
                    break; // truncated list
                }
                let relative_start = match previous_end {
                    None => start - next_expected_element,
                    Some(previous) => start - previous - 1,
                };
                used += wire::serialize_nack_range(
                    relative_start as u32,
                    (end - start - 1) as u32,
                    &mut buffer[used..],
                );
                previous_end = Some(end);
            }

            element = end;
        }

        self.stats.ack_count += 1;
        self.stats.ack_bytes += used as u64;
        Ok(used)
    }

    /// Lifetime statistics.
    pub fn stats(&self) -> DecoderStats {
        let mut stats = self.stats.clone();
        stats.memory_allocated_bytes = self.alloc.memory_allocated_bytes() as u64;
        stats
    }

    /// Pending recovery rows held by the solver.
    pub fn pending_recovery_count(&self) -> usize {
        self.solver.pending_rows()
    }
}
