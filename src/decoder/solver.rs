//! Progressive recovery solver.
//!
//! Pending recovery rows form a sparse lower-triangular system keyed by
//! pivot column, the smallest column each row still touches.  Rows arrive,
//! get their known columns substituted out, are eliminated against existing
//! pivots, and are installed normalized (leading coefficient one).  Once the
//! pivot set covers every missing column the system back-substitutes in
//! descending column order and emits the recovered originals.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::decoder::window::DecoderPacketWindow;
use crate::slab::Allocator;
use crate::wire::{self, RecoveryMetadata};
use crate::{add_columns, gf, rows, Gf256, PacketNum, Result};

/// A recovery row not yet consumed, reduced against everything known.
pub(crate) struct PendingRow {
    /// `(column, coefficient)` pairs sorted by window order; the first
    /// entry is the pivot.  Disjoint from the received set.
    pattern: Vec<(PacketNum, Gf256)>,

    /// Residual row data over the prefixed original buffers.
    data: Vec<u8>,
}

impl PendingRow {
    fn contains(&self, column: PacketNum) -> bool {
        self.pattern.iter().any(|&(c, _)| c == column)
    }
}

/// Outcome of feeding one recovery row to the solver.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InsertOutcome {
    /// The row survived reduction and now pivots a missing column.
    Installed,
    /// The row was linearly dependent on data already held.
    Redundant,
}

/// Sparse progressive Gaussian elimination over pending rows.
pub(crate) struct RecoverySolver {
    rows: HashMap<PacketNum, PendingRow>,
}

impl RecoverySolver {
    pub fn new() -> Self {
        Self {
            rows: HashMap::new(),
        }
    }

    pub fn pending_rows(&self) -> usize {
        self.rows.len()
    }

    /// Feed one recovery packet: regenerate its coefficients, substitute
    /// received originals out, eliminate against held pivots and install.
    pub fn insert(
        &mut self,
        window: &DecoderPacketWindow,
        alloc: &Allocator,
        payload: &[u8],
        metadata: &RecoveryMetadata,
    ) -> InsertOutcome {
        let coefficients = rows::recovery_coefficients(metadata);

        let mut row = PendingRow {
            pattern: Vec::new(),
            data: payload.to_vec(),
        };

        for (i, &coefficient) in coefficients.iter().enumerate() {
            if coefficient.0 == 0 {
                continue;
            }
            let column = add_columns(metadata.column_start, i as u32);
            let element = window.column_to_element(column);

            if window.is_received(element) {
                let slot = window.slot(element);
                if let Some(block) = slot.block {
                    gf::muladd_mem(
                        &mut row.data,
                        &alloc.block(block)[..slot.bytes],
                        coefficient,
                    );
                }
            } else {
                // Coverage ascends in window order, so the pattern stays
                // sorted by construction.
                row.pattern.push((column, coefficient));
            }
        }

        self.reduce_and_install(window, row)
    }

    /// Eliminate `row` against held pivots until its leading column is
    /// unclaimed, then normalize and install it.
    fn reduce_and_install(
        &mut self,
        window: &DecoderPacketWindow,
        mut row: PendingRow,
    ) -> InsertOutcome {
        loop {
            let Some(&(pivot_column, coefficient)) = row.pattern.first() else {
                // Vanished: linearly dependent on rows already held.
                trace!("recovery row reduced to nothing");
                return InsertOutcome::Redundant;
            };

            let Some(pivot_row) = self.rows.get(&pivot_column) else {
                break;
            };
            // Pivot rows are normalized, so the multiple is the leading
            // coefficient itself.
            Self::row_muladd(window, &mut row, pivot_row, coefficient);
        }

        // Normalize the leading coefficient to one.
        let (pivot_column, leading) = row.pattern[0];
        let inverse = gf::inv(leading);
        if inverse.0 != 1 {
            gf::mul_mem_inplace(&mut row.data, inverse);
            for (_, coefficient) in row.pattern.iter_mut() {
                *coefficient = *coefficient * inverse;
            }
        }

        trace!(
            pivot_column,
            pattern_len = row.pattern.len(),
            "pivot row installed"
        );
        self.rows.insert(pivot_column, row);
        InsertOutcome::Installed
    }

    /// `dst += scale * src` over data and coefficient patterns.
    fn row_muladd(
        window: &DecoderPacketWindow,
        dst: &mut PendingRow,
        src: &PendingRow,
        scale: Gf256,
    ) {
        if src.data.len() > dst.data.len() {
            dst.data.resize(src.data.len(), 0);
        }
        gf::muladd_mem(&mut dst.data, &src.data, scale);

        // Merge the sorted patterns, cancelling zero coefficients.
        let mut merged = Vec::with_capacity(dst.pattern.len() + src.pattern.len());
        let mut a = dst.pattern.iter().peekable();
        let mut b = src.pattern.iter().peekable();
        loop {
            match (a.peek(), b.peek()) {
                (Some(&&(col_a, coeff_a)), Some(&&(col_b, coeff_b))) => {
                    let elem_a = window.column_to_element(col_a);
                    let elem_b = window.column_to_element(col_b);
                    if elem_a < elem_b {
                        merged.push((col_a, coeff_a));
                        a.next();
                    } else if elem_b < elem_a {
                        merged.push((col_b, coeff_b * scale));
                        b.next();
                    } else {
                        let combined = coeff_a + coeff_b * scale;
                        if combined.0 != 0 {
                            merged.push((col_a, combined));
                        }
                        a.next();
                        b.next();
                    }
                }
                (Some(&&(col_a, coeff_a)), None) => {
                    merged.push((col_a, coeff_a));
                    a.next();
                }
                (None, Some(&&(col_b, coeff_b))) => {
                    merged.push((col_b, coeff_b * scale));
                    b.next();
                }
                (None, None) => break,
            }
        }
        dst.pattern = merged;
    }

    /// An original for `column` arrived; substitute it out of every row
    /// that still references it.
    pub fn substitute_received(
        &mut self,
        window: &DecoderPacketWindow,
        alloc: &Allocator,
        column: PacketNum,
    ) {
        let affected: Vec<PacketNum> = self
            .rows
            .iter()
            .filter(|(_, row)| row.contains(column))
            .map(|(&pivot, _)| pivot)
            .collect();

        for pivot in affected {
            let mut row = self.rows.remove(&pivot).expect("pivot disappeared");

            let position = row
                .pattern
                .iter()
                .position(|&(c, _)| c == column)
                .expect("column vanished from pattern");
            let (_, coefficient) = row.pattern.remove(position);

            let slot = window.slot(window.column_to_element(column));
            if let Some(block) = slot.block {
                gf::muladd_mem(&mut row.data, &alloc.block(block)[..slot.bytes], coefficient);
            }

            self.reduce_and_install(window, row);
        }
    }

    /// True when every missing column in the receive window has a pivot row
    /// and there is something to decode.
    pub fn is_ready(&self, window: &DecoderPacketWindow) -> bool {
        let mut any_missing = false;
        let mut element = window.solve_start_element();
        loop {
            element = window.first_missing_element(element);
            if element >= window.count {
                break;
            }
            any_missing = true;
            if !self.rows.contains_key(&window.element_to_column(element)) {
                return false;
            }
            element += 1;
        }
        any_missing
    }

    /// Back-substitute in descending column order and emit the recovered
    /// prefixed originals.  Returns `(recovered, failed_count)`.
    pub fn decode(
        &mut self,
        window: &mut DecoderPacketWindow,
        alloc: &mut Allocator,
        now_msec: u64,
    ) -> Result<(Vec<(PacketNum, Vec<u8>)>, usize)> {
        let mut pivots: Vec<PacketNum> = self.rows.keys().copied().collect();
        pivots.sort_by_key(|&column| window.column_to_element(column));

        let mut recovered: Vec<(PacketNum, Vec<u8>)> = Vec::new();
        let mut failed = 0usize;

        for &column in pivots.iter().rev() {
            let Some(row) = self.rows.remove(&column) else {
                // Dropped while substituting a larger recovered column.
                continue;
            };

            // Every larger column was solved first, so the row must now
            // determine its pivot alone with unit coefficient.
            let solved = matches!(row.pattern.as_slice(), [(_, coefficient)] if coefficient.0 == 1);
            if !solved {
                debug!(column, "pivot row still entangled, need more data");
                failed += 1;
                continue;
            }

            let Some((length, header_bytes)) = wire::deserialize_length(&row.data) else {
                failed += 1;
                continue;
            };
            let total_bytes = header_bytes + length as usize;
            if length == 0 || total_bytes > row.data.len() {
                debug!(column, length, "recovered buffer failed validation");
                failed += 1;
                continue;
            }

            window.store_prefixed(alloc, column, &row.data[..total_bytes], header_bytes, now_msec)?;
            self.substitute_received(window, alloc, column);

            recovered.push((column, row.data[header_bytes..total_bytes].to_vec()));
        }

        recovered.sort_by_key(|&(column, _)| window.column_to_element(column));
        Ok((recovered, failed))
    }
}
