//! Packet-tuned slab allocator.
//!
//! General-purpose allocators are a measurable fraction of codec runtime:
//! both window sides hold thousands of roughly packet-sized buffers that are
//! freed in nearly the same order they were allocated.  This allocator is
//! tuned for exactly that workload:
//!
//! - allocations are carved from 2048-unit windows (one unit = 16 bytes, the
//!   SIMD alignment quantum), tracked by a per-window used bitset,
//! - windows live on a *preferred* list while they are likely to satisfy a
//!   request and migrate to a *full* list once utilization passes 75%,
//! - each window remembers a resume-scan offset so repeated allocations do
//!   not rescan the whole bitset, and frees move the offset back to the hole
//!   they opened,
//! - requests of a quarter window or more bypass the slab entirely.
//!
//! Every allocation is preceded by a one-unit header recording its length
//! and a freed flag, which gives cheap reallocation and double-free
//! detection.  Blocks are addressed by copyable [`BlockHandle`]s; the slices
//! behind a handle stay valid until the handle is freed.

use crate::bitset::BitSet;

/// Minimum allocation unit, matching SIMD alignment.
const UNIT_SIZE: usize = 16;

/// Units per window, tuned for packet-sized data of around 1000 bytes.
const WINDOW_MAX_UNITS: usize = 2048;

const WINDOW_WORDS: usize = WINDOW_MAX_UNITS / 64;
const WINDOW_BYTES: usize = WINDOW_MAX_UNITS * UNIT_SIZE;

/// Slack appended to every request so short in-place growth (length
/// prefixes, recovery footers) does not force a reallocation.
const OVERALLOCATION_BYTES: usize = 8;

/// Windows created eagerly at construction.
const PREALLOCATED_WINDOWS: usize = 2;

/// A window stays preferred while at least this many units are free
/// (utilization at most 75%).
const PREFERRED_THRESHOLD_UNITS: usize = WINDOW_MAX_UNITS / 4;

/// Requests needing more than this many units skip the slab.
const FALLBACK_THRESHOLD_UNITS: usize = WINDOW_MAX_UNITS / 4;

/// Keep this many fully-empty windows around for reuse.
const EMPTY_WINDOW_MINIMUM: usize = 32;

/// Bulk-release empty windows once this many have accumulated.
const EMPTY_WINDOW_CLEANUP_THRESHOLD: usize = 64;

/// Marker window index for fallback (system) allocations.
const FALLBACK_WINDOW: u32 = u32::MAX;

/// Whether reallocation preserves the existing payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReallocBehavior {
    Uninitialized,
    CopyExisting,
}

/// Opaque reference to an allocated block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHandle {
    window: u32,
    unit: u32,
}

struct SlabWindow {
    used: BitSet<WINDOW_WORDS>,
    free_units: usize,
    resume_scan: usize,
    in_full_list: bool,
    preallocated: bool,
    data: Box<[u8]>,
}

impl SlabWindow {
    fn new(preallocated: bool) -> Self {
        Self {
            used: BitSet::new(),
            free_units: WINDOW_MAX_UNITS,
            resume_scan: 0,
            in_full_list: false,
            preallocated,
            data: vec![0u8; WINDOW_BYTES].into_boxed_slice(),
        }
    }

    fn header_offset(unit: usize) -> usize {
        unit * UNIT_SIZE
    }

    fn read_header(&self, unit: usize) -> (usize, bool) {
        let at = Self::header_offset(unit);
        let units = u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap()) as usize;
        let freed = self.data[at + 4] != 0;
        (units, freed)
    }

    fn write_header(&mut self, unit: usize, used_units: usize, freed: bool) {
        let at = Self::header_offset(unit);
        self.data[at..at + 4].copy_from_slice(&(used_units as u32).to_le_bytes());
        self.data[at + 4] = freed as u8;
    }
}

/// Slab allocator for packet buffers.
///
/// Single-threaded by construction: each codec instance privately owns one.
pub struct Allocator {
    windows: Vec<SlabWindow>,

    /// Window ids likely to satisfy a request, scanned front to back.
    /// Fresh windows enter at the front, recycled ones at the back.
    preferred: std::collections::VecDeque<u32>,

    /// Window ids with utilization above the preferred threshold.
    full: Vec<u32>,

    /// Retired window ids whose storage was released; reused before
    /// growing the `windows` vector.
    retired: Vec<u32>,

    /// Oversized blocks served straight from the system allocator.
    fallbacks: Vec<Option<Box<[u8]>>>,
    free_fallback_slots: Vec<u32>,

    /// Fully-empty windows eligible for bulk cleanup.
    empty_window_count: usize,

    /// Total bytes of backing storage currently held.
    allocated_bytes: usize,

    /// Optional ceiling on backing storage; exceeding it fails the
    /// allocation instead of growing.
    memory_limit: Option<usize>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Create an allocator with its preallocated windows.
    pub fn new() -> Self {
        let mut windows = Vec::with_capacity(PREALLOCATED_WINDOWS);
        let mut preferred = std::collections::VecDeque::new();
        for id in 0..PREALLOCATED_WINDOWS {
            windows.push(SlabWindow::new(true));
            preferred.push_front(id as u32);
        }

        Self {
            windows,
            preferred,
            full: Vec::new(),
            retired: Vec::new(),
            fallbacks: Vec::new(),
            free_fallback_slots: Vec::new(),
            empty_window_count: 0,
            allocated_bytes: PREALLOCATED_WINDOWS * WINDOW_BYTES,
            memory_limit: None,
        }
    }

    /// Cap the total backing storage.  Allocations that would grow past the
    /// limit fail, which the codec latches as a terminal `Disabled` state.
    pub fn set_memory_limit(&mut self, limit: Option<usize>) {
        self.memory_limit = limit;
    }

    /// Units needed for `bytes` of payload plus the allocation header.
    fn units_for(bytes: usize) -> usize {
        (bytes + OVERALLOCATION_BYTES + UNIT_SIZE - 1) / UNIT_SIZE + 1
    }

    /// Allocate a block with room for at least `bytes` bytes.
    ///
    /// Returns `None` for zero-size requests and on memory exhaustion.
    pub fn allocate(&mut self, bytes: usize) -> Option<BlockHandle> {
        if bytes == 0 {
            return None;
        }

        let units = Self::units_for(bytes);
        if units > FALLBACK_THRESHOLD_UNITS {
            return self.fallback_allocate(units);
        }

        let mut found: Option<(usize, u32, usize)> = None;

        'windows: for (pos, &id) in self.preferred.iter().enumerate() {
            let window = &self.windows[id as usize];
            if window.free_units < units {
                continue;
            }

            // Walk the holes in the used mask from the resume offset.
            let mut region_start = window.resume_scan;
            while region_start < WINDOW_MAX_UNITS {
                region_start = window.used.find_first_clear(region_start);
                let region_end = region_start + units;
                if region_end > WINDOW_MAX_UNITS {
                    break;
                }

                let first_set = window.used.find_first_set(region_start + 1, region_end);
                if first_set - region_start < units {
                    region_start = first_set + 1;
                    continue;
                }

                found = Some((pos, id, region_start));
                break 'windows;
            }
        }

        if let Some((pos, id, region_start)) = found {
            self.carve(id, region_start, units);

            // Windows scanned before this one failed to serve the request;
            // demote the ones that crossed the utilization threshold.  The
            // serving window itself is demoted too once it cannot fit
            // another allocation of the same size.
            let exhausted =
                self.windows[id as usize].resume_scan + units > WINDOW_MAX_UNITS;
            self.demote_first_windows(if exhausted { pos + 1 } else { pos });

            return Some(BlockHandle {
                window: id,
                unit: region_start as u32,
            });
        }

        // Nothing on the preferred list worked out.
        let count = self.preferred.len();
        self.demote_first_windows(count);
        self.allocate_from_new_window(units)
    }

    /// Mark `[region_start, region_start + units)` used and stamp a header.
    fn carve(&mut self, id: u32, region_start: usize, units: usize) {
        let window = &mut self.windows[id as usize];
        if window.free_units == WINDOW_MAX_UNITS && !window.preallocated {
            self.empty_window_count -= 1;
        }
        window.used.set_range(region_start, region_start + units);
        window.free_units -= units;
        window.resume_scan = region_start + units;
        window.write_header(region_start, units, false);
    }

    /// Re-examine the first `count` preferred windows, keeping the ones that
    /// still have capacity (rescanned from the top) and demoting the rest.
    fn demote_first_windows(&mut self, count: usize) {
        for _ in 0..count {
            let Some(id) = self.preferred.pop_front() else {
                break;
            };
            let window = &mut self.windows[id as usize];
            if window.free_units >= PREFERRED_THRESHOLD_UNITS {
                // The scan missed holes before its resume offset; restart
                // from the top next time and fall to the back of the line.
                window.resume_scan = 0;
                self.preferred.push_back(id);
            } else {
                window.in_full_list = true;
                self.full.push(id);
            }
        }
    }

    fn allocate_from_new_window(&mut self, units: usize) -> Option<BlockHandle> {
        if let Some(limit) = self.memory_limit {
            if self.allocated_bytes + WINDOW_BYTES > limit {
                return None;
            }
        }

        let id = match self.retired.pop() {
            Some(id) => {
                self.windows[id as usize] = SlabWindow::new(false);
                id
            }
            None => {
                self.windows.push(SlabWindow::new(false));
                (self.windows.len() - 1) as u32
            }
        };
        self.allocated_bytes += WINDOW_BYTES;

        let window = &mut self.windows[id as usize];
        window.used.set_range(0, units);
        window.free_units = WINDOW_MAX_UNITS - units;
        window.resume_scan = units;
        window.write_header(0, units, false);

        self.preferred.push_front(id);

        Some(BlockHandle { window: id, unit: 0 })
    }

    fn fallback_allocate(&mut self, units: usize) -> Option<BlockHandle> {
        let bytes = units * UNIT_SIZE;
        if let Some(limit) = self.memory_limit {
            if self.allocated_bytes + bytes > limit {
                return None;
            }
        }

        let mut data = vec![0u8; bytes].into_boxed_slice();
        data[0..4].copy_from_slice(&(units as u32).to_le_bytes());
        data[4] = 0;
        self.allocated_bytes += bytes;

        let slot = match self.free_fallback_slots.pop() {
            Some(slot) => {
                self.fallbacks[slot as usize] = Some(data);
                slot
            }
            None => {
                self.fallbacks.push(Some(data));
                (self.fallbacks.len() - 1) as u32
            }
        };

        Some(BlockHandle {
            window: FALLBACK_WINDOW,
            unit: slot,
        })
    }

    /// Free a block.
    ///
    /// Double frees are detected through the header flag and ignored.
    pub fn free(&mut self, handle: BlockHandle) {
        if handle.window == FALLBACK_WINDOW {
            self.fallback_free(handle);
            return;
        }

        let id = handle.window as usize;
        let region_start = handle.unit as usize;
        let (units, freed) = self.windows[id].read_header(region_start);
        if freed {
            debug_assert!(false, "double free");
            return;
        }

        let window = &mut self.windows[id];
        window.write_header(region_start, units, true);
        window.used.clear_range(region_start, region_start + units);
        window.free_units += units;

        // Resume scanning from this hole next time.
        if window.resume_scan > region_start {
            window.resume_scan = region_start;
        }

        if window.in_full_list && window.free_units >= PREFERRED_THRESHOLD_UNITS {
            window.in_full_list = false;
            window.resume_scan = 0;
            let pos = self
                .full
                .iter()
                .position(|&w| w == handle.window)
                .expect("window missing from full list");
            self.full.swap_remove(pos);
            self.preferred.push_back(handle.window);
        }

        if self.windows[id].free_units == WINDOW_MAX_UNITS && !self.windows[id].preallocated {
            self.empty_window_count += 1;
            if self.empty_window_count >= EMPTY_WINDOW_CLEANUP_THRESHOLD {
                self.release_empty_windows();
            }
        }
    }

    fn fallback_free(&mut self, handle: BlockHandle) {
        let slot = handle.unit as usize;
        let Some(data) = self.fallbacks[slot].take() else {
            debug_assert!(false, "double free");
            return;
        };
        self.allocated_bytes -= data.len();
        self.free_fallback_slots.push(handle.unit);
    }

    /// Release surplus fully-empty windows, keeping a working set.
    fn release_empty_windows(&mut self) {
        let mut kept = std::collections::VecDeque::with_capacity(self.preferred.len());
        while let Some(id) = self.preferred.pop_front() {
            let window = &self.windows[id as usize];
            let releasable = !window.preallocated
                && window.free_units == WINDOW_MAX_UNITS
                && self.empty_window_count > EMPTY_WINDOW_MINIMUM;
            if releasable {
                self.windows[id as usize].data = Vec::new().into_boxed_slice();
                self.allocated_bytes -= WINDOW_BYTES;
                self.empty_window_count -= 1;
                self.retired.push(id);
            } else {
                kept.push_back(id);
            }
        }
        self.preferred = kept;
    }

    /// Grow or shrink a block.  Growth first tries to extend in place into
    /// the trailing free units; otherwise a new block is carved and the
    /// payload copied when requested.
    pub fn reallocate(
        &mut self,
        handle: BlockHandle,
        bytes: usize,
        behavior: ReallocBehavior,
    ) -> Option<BlockHandle> {
        if bytes == 0 {
            self.free(handle);
            return None;
        }

        let (existing_units, freed) = self.block_header(handle);
        if freed {
            debug_assert!(false, "reallocate after free");
            return self.allocate(bytes);
        }

        let requested_units = (bytes + UNIT_SIZE - 1) / UNIT_SIZE + 1;
        if requested_units <= existing_units {
            return Some(handle);
        }

        // In-place growth into trailing free units.
        if handle.window != FALLBACK_WINDOW {
            let id = handle.window as usize;
            let region_start = handle.unit as usize;
            let tail = region_start + existing_units;
            let grown_end = region_start + requested_units;
            let window = &mut self.windows[id];
            if grown_end <= WINDOW_MAX_UNITS
                && window.used.find_first_set(tail, grown_end) == grown_end
            {
                window.used.set_range(tail, grown_end);
                window.free_units -= requested_units - existing_units;
                window.write_header(region_start, requested_units, false);
                return Some(handle);
            }
        }

        let new_handle = self.allocate(bytes)?;
        if behavior == ReallocBehavior::CopyExisting {
            let old_payload = (existing_units - 1) * UNIT_SIZE;
            let copy_len = old_payload.min(self.payload_capacity(new_handle));
            let tmp = self.block(handle)[..copy_len].to_vec();
            self.block_mut(new_handle)[..copy_len].copy_from_slice(&tmp);
        }
        self.free(handle);
        Some(new_handle)
    }

    fn block_header(&self, handle: BlockHandle) -> (usize, bool) {
        if handle.window == FALLBACK_WINDOW {
            match &self.fallbacks[handle.unit as usize] {
                Some(data) => {
                    let units = u32::from_le_bytes(data[0..4].try_into().unwrap()) as usize;
                    (units, data[4] != 0)
                }
                None => (0, true),
            }
        } else {
            self.windows[handle.window as usize].read_header(handle.unit as usize)
        }
    }

    /// Payload capacity of a block in bytes.
    pub fn payload_capacity(&self, handle: BlockHandle) -> usize {
        let (units, freed) = self.block_header(handle);
        debug_assert!(!freed);
        (units - 1) * UNIT_SIZE
    }

    /// Borrow a block's payload.
    pub fn block(&self, handle: BlockHandle) -> &[u8] {
        if handle.window == FALLBACK_WINDOW {
            let data = self.fallbacks[handle.unit as usize]
                .as_ref()
                .expect("block freed");
            &data[UNIT_SIZE..]
        } else {
            let window = &self.windows[handle.window as usize];
            let (units, freed) = window.read_header(handle.unit as usize);
            debug_assert!(!freed);
            let start = (handle.unit as usize + 1) * UNIT_SIZE;
            &window.data[start..start + (units - 1) * UNIT_SIZE]
        }
    }

    /// Borrow a block's payload mutably.
    pub fn block_mut(&mut self, handle: BlockHandle) -> &mut [u8] {
        if handle.window == FALLBACK_WINDOW {
            let data = self.fallbacks[handle.unit as usize]
                .as_mut()
                .expect("block freed");
            &mut data[UNIT_SIZE..]
        } else {
            let window = &mut self.windows[handle.window as usize];
            let (units, freed) = window.read_header(handle.unit as usize);
            debug_assert!(!freed);
            let start = (handle.unit as usize + 1) * UNIT_SIZE;
            &mut window.data[start..start + (units - 1) * UNIT_SIZE]
        }
    }

    /// Bytes currently handed out to live blocks.
    pub fn memory_used_bytes(&self) -> usize {
        let window_used: usize = self
            .windows
            .iter()
            .filter(|w| !w.data.is_empty())
            .map(|w| (WINDOW_MAX_UNITS - w.free_units) * UNIT_SIZE)
            .sum();
        let fallback_used: usize = self
            .fallbacks
            .iter()
            .flatten()
            .map(|data| data.len())
            .sum();
        window_used + fallback_used
    }

    /// Total bytes of backing storage held.
    pub fn memory_allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    /// Verify the allocator's internal bookkeeping.
    pub fn integrity_check(&self) -> bool {
        for (pos, window) in self.windows.iter().enumerate() {
            if window.data.is_empty() {
                // Retired window; must be on the retired list.
                if !self.retired.contains(&(pos as u32)) {
                    return false;
                }
                continue;
            }
            let set = window.used.range_popcount(0, WINDOW_MAX_UNITS);
            if set != WINDOW_MAX_UNITS - window.free_units {
                return false;
            }
            if window.resume_scan > WINDOW_MAX_UNITS {
                return false;
            }
            let on_preferred = self.preferred.contains(&(pos as u32));
            let on_full = self.full.contains(&(pos as u32));
            if on_preferred == on_full {
                return false;
            }
            if window.in_full_list != on_full {
                return false;
            }
        }
        true
    }
}
