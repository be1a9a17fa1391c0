//! Deterministic generator matrix coefficients.
//!
//! Both codec sides must derive byte-identical row coefficients from a
//! recovery packet's metadata alone, so everything here is part of the wire
//! contract: the integer hash, the PCG constants and seeding procedure, the
//! per-column and per-row scale factors, the per-lane opcodes, and the
//! Cauchy matrix elements.

use crate::wire::RecoveryMetadata;
use crate::{
    add_columns, gf, Gf256, PacketNum, CAUCHY_MAX_COLUMNS, CAUCHY_MAX_ROWS, CAUCHY_THRESHOLD,
    LANE_COUNT, PAIR_ADD_RATE, SUM_COUNT,
};

/// Thomas Wang's 32-bit integer hash.
#[inline]
pub(crate) fn int32_hash(mut key: u32) -> u32 {
    key = key.wrapping_add(!(key << 15));
    key ^= key >> 10;
    key = key.wrapping_add(key << 3);
    key ^= key >> 6;
    key = key.wrapping_add(!(key << 11));
    key ^= key >> 16;
    key
}

/// PCG pseudo-random generator used to pick light column pairs.
///
/// The multiplier, the `(y << 1) | 1` increment derivation and the double
/// step after seeding are normative; a different stream would break
/// interoperability.
pub(crate) struct PcgRandom {
    state: u64,
    inc: u64,
}

impl PcgRandom {
    pub fn seed(y: u64, x: u64) -> Self {
        let mut prng = Self {
            state: 0,
            inc: (y << 1) | 1,
        };
        prng.next();
        prng.state = prng.state.wrapping_add(x);
        prng.next();
        prng
    }

    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> u32 {
        let oldstate = self.state;
        self.state = oldstate
            .wrapping_mul(6364136223846793005)
            .wrapping_add(self.inc);
        let xorshifted = (((oldstate >> 18) ^ oldstate) >> 27) as u32;
        let rot = (oldstate >> 59) as u32;
        (xorshifted >> rot) | (xorshifted << (rot.wrapping_neg() & 31))
    }
}

/// Per-column scale factor `CX(column)` applied in the second and third
/// running sums.  Never 0 or 1, so the three sums stay independent.
#[inline]
pub(crate) fn column_value(column: PacketNum) -> Gf256 {
    Gf256(2 + (int32_hash(column) % 253) as u8)
}

/// Per-row scale factor `RX(row)` combining the product workspace into the
/// recovery buffer.  Always nonzero.
#[inline]
pub(crate) fn row_value(row: u32) -> Gf256 {
    Gf256(1 + (int32_hash(row + 1) % 255) as u8)
}

/// Dense-step opcode for one (lane, row) pair.
///
/// A 6-bit nonzero mask: the low three bits select which of the lane's sums
/// add into the recovery buffer, the high three which add into the product
/// workspace.
#[inline]
pub(crate) fn row_opcode(lane: usize, row: u32) -> u32 {
    debug_assert!(lane < LANE_COUNT);
    debug_assert!(row < crate::ROW_PERIOD);
    (int32_hash(lane as u32 + row * LANE_COUNT as u32) % 63) + 1
}

/// Cauchy matrix element for `row < CAUCHY_MAX_ROWS` and
/// `column < CAUCHY_MAX_COLUMNS`.
///
/// The matrix is normalized so an implicit leading row is all ones:
/// `a_ij = (y_j + x_0) / (x_i + y_j)`, with column indices `y_j` below
/// [`CAUCHY_MAX_COLUMNS`] and row indices `x_i` above.  The wire parity row
/// is that leading all-ones row, so parity and Cauchy rows together form one
/// Cauchy matrix and any square submatrix of it is invertible.
#[inline]
pub(crate) fn cauchy_element(row: u32, column: u32) -> Gf256 {
    debug_assert!(row < CAUCHY_MAX_ROWS);
    debug_assert!(column < CAUCHY_MAX_COLUMNS);
    let x_0 = CAUCHY_MAX_COLUMNS as u8;
    let x_i = (CAUCHY_MAX_COLUMNS + 1 + row) as u8;
    let y_j = column as u8;
    Gf256(y_j ^ x_0) / Gf256(x_i ^ y_j)
}

/// The three sum weights for a column: `1`, `CX`, `CX^2`.
#[inline]
pub(crate) fn sum_weights(column: PacketNum) -> [Gf256; SUM_COUNT] {
    let cx = column_value(column);
    [Gf256(1), cx, gf::sqr(cx)]
}

/// Expand a recovery row into one coefficient per covered column.
///
/// `coefficients[i]` scales the original at column
/// `column_start + i` in the row's data.  This mirrors the encoder's
/// construction exactly: dense per-lane sum selection, light pseudo-random
/// pairs over the trailing `ldpc_count` columns, and the final
/// `RX * product` combine.
pub(crate) fn recovery_coefficients(metadata: &RecoveryMetadata) -> Vec<Gf256> {
    let count = metadata.sum_count as usize;
    let mut coefficients = vec![Gf256(0); count];

    // Parity and Cauchy rows cover small windows with direct coefficients.
    if metadata.sum_count as usize <= CAUCHY_THRESHOLD {
        if metadata.row == 0 {
            coefficients.fill(Gf256(1));
        } else {
            let mut cauchy_column = metadata.column_start % CAUCHY_MAX_COLUMNS;
            for coefficient in coefficients.iter_mut() {
                *coefficient = cauchy_element(metadata.row - 1, cauchy_column);
                cauchy_column = (cauchy_column + 1) % CAUCHY_MAX_COLUMNS;
            }
        }
        return coefficients;
    }

    // Dense step: each lane's opcode selects running sums for the recovery
    // accumulator (low bits) and the product workspace (high bits).
    let mut product = vec![Gf256(0); count];
    for (i, coefficient) in coefficients.iter_mut().enumerate() {
        let column = add_columns(metadata.column_start, i as u32);
        let lane = (column as usize) % LANE_COUNT;
        let opcode = row_opcode(lane, metadata.row);
        let weights = sum_weights(column);

        for (sum_index, &weight) in weights.iter().enumerate() {
            if opcode & (1 << sum_index) != 0 {
                *coefficient = *coefficient + weight;
            }
            if opcode & (1 << (SUM_COUNT + sum_index)) != 0 {
                product[i] = product[i] + weight;
            }
        }
    }

    // Light step: pseudo-random pairs over the unacknowledged tail, one
    // element into each accumulator.
    let light_count = metadata.ldpc_count as usize;
    let light_start = count - light_count;
    let mut prng = PcgRandom::seed(metadata.row as u64, light_count as u64);
    let pair_count = (light_count + PAIR_ADD_RATE - 1) / PAIR_ADD_RATE;
    for _ in 0..pair_count {
        let into_recovery = light_start + (prng.next() as usize % light_count);
        coefficients[into_recovery] = coefficients[into_recovery] + Gf256(1);
        let into_product = light_start + (prng.next() as usize % light_count);
        product[into_product] = product[into_product] + Gf256(1);
    }

    // Combine: recovery += RX * product.
    let rx = row_value(metadata.row);
    for (coefficient, product_coefficient) in coefficients.iter_mut().zip(product) {
        *coefficient = *coefficient + rx * product_coefficient;
    }

    coefficients
}
