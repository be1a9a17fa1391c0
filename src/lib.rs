//! # streamfec - Streaming Erasure Coding
//!
//! A streaming forward-error-correction codec for low and medium rate packet
//! streams: up to roughly 2000 packets in flight at loss rates of 20% or less.
//!
//! Unlike block erasure codes, the encoder keeps accepting new original
//! packets while previously generated recovery packets are still in flight,
//! and the decoder starts reconstructing lost originals as soon as enough
//! evidence has accumulated.  The codec also produces selective
//! acknowledgements and serves NACK-driven retransmits, so it can act as the
//! core engine of a hybrid ARQ transport.
//!
//! The codec never touches the network itself.  The caller moves buffers
//! between the [`Encoder`] and [`Decoder`]:
//!
//! ```rust
//! use streamfec::{Encoder, Decoder};
//!
//! let mut encoder = Encoder::new();
//! let mut decoder = Decoder::new();
//!
//! // Sender side: protect some packets.
//! let first = encoder.add(&[0x11u8; 600]).unwrap();
//! encoder.add(&[0x22u8; 600]).unwrap();
//!
//! // Receiver side: packet `first` arrived, the second one was lost.
//! decoder.add_original(first, &[0x11u8; 600]).unwrap();
//!
//! // One recovery packet is enough to repair a single loss.
//! let recovery = encoder.encode().unwrap().to_vec();
//! decoder.add_recovery(&recovery).unwrap();
//!
//! assert!(decoder.is_ready());
//! let recovered = decoder.decode().unwrap();
//! assert_eq!(recovered[0].data, vec![0x22u8; 600]);
//! ```
//!
//! ## Row construction
//!
//! Recovery packets are rows of a structured generator matrix.  Small windows
//! (at most [`CAUCHY_THRESHOLD`] unacknowledged packets) use parity and
//! Cauchy matrix rows, which guarantee recovery whenever enough packets
//! arrive.  Larger windows switch to a dense-plus-sparse row built from
//! per-lane running sums; that construction is much cheaper to maintain
//! incrementally, at the cost of a roughly 1% chance per batch that one
//! extra recovery packet is needed.
//!
//! All row coefficients are deterministic functions of the metadata carried
//! in the recovery packet footer, so the decoder rebuilds each row without
//! any side channel.

// Custom GF(256) type for scalar field math.  The bulk (slice) operations in
// the `gf` module use matching const-evaluated lookup tables.
use gf256::gf::gf;

#[gf(polynomial = 0x11d, generator = 0x2)]
pub type Gf256;

pub mod bitset;
pub mod gf;
pub mod slab;
pub mod wire;

mod decoder;
mod encoder;
mod rows;
mod stats;

#[cfg(test)]
mod tests;

pub use decoder::{Decoder, RecoveredPacket};
pub use encoder::Encoder;
pub use stats::{DecoderStats, EncoderStats};
pub use wire::RecoveryMetadata;

/// Error type shared by all codec operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A function parameter or serialized input was invalid.
    InvalidInput,
    /// More data is needed before this operation can succeed.
    NeedMoreData,
    /// The window already holds [`MAX_PACKETS`] packets.
    MaxPacketsReached,
    /// The packet was already received or recovered.
    DuplicateData,
    /// The codec instance entered an invalid state (allocation failure or a
    /// detected internal inconsistency) and latched itself off.  Every
    /// further call on the instance returns this error.
    Disabled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidInput => write!(f, "invalid input"),
            Error::NeedMoreData => write!(f, "more data needed"),
            Error::MaxPacketsReached => write!(f, "window packet limit reached"),
            Error::DuplicateData => write!(f, "duplicate data"),
            Error::Disabled => write!(f, "codec instance disabled"),
        }
    }
}

impl std::error::Error for Error {}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Packet number (column) assigned to each original packet, wrapping at
/// [`PACKET_NUM_COUNT`].
pub type PacketNum = u32;

/// Number of distinct packet numbers before wrap-around.
pub const PACKET_NUM_COUNT: u32 = 1 << 22;

/// Largest valid packet number.
pub const PACKET_NUM_MAX: u32 = PACKET_NUM_COUNT - 1;

/// Maximum number of packets resident in a window at a time.
///
/// Practically only about 2000 packets in flight make sense; this is the
/// hard cap past which [`Encoder::add`] reports `MaxPacketsReached`.
pub const MAX_PACKETS: usize = 16_000;

/// Packet payloads must be 1..=`MAX_PACKET_BYTES` bytes.
pub const MAX_PACKET_BYTES: usize = 0x1fff_ffff;

/// A recovery packet is at most this many bytes longer than the longest
/// original packet in the window.
pub const MAX_ENCODE_OVERHEAD: usize = 8;

/// Minimum size of the buffer passed to [`Decoder::acknowledgement`].
pub const ACK_MIN_BYTES: usize = 16;

/// Number of column lanes.  Packets are partitioned by `column % LANE_COUNT`
/// and each lane maintains its own running sums.
pub const LANE_COUNT: usize = 8;

/// Number of running sums kept per lane, weighted by `1`, `CX(column)` and
/// `CX(column)^2`.
pub const SUM_COUNT: usize = 3;

/// Number of packet slots in one subwindow, the unit of physical eviction.
pub const SUBWINDOW_SIZE: usize = 64;

/// Recovery row numbers cycle with this period.
pub const ROW_PERIOD: u32 = 256;

/// Largest unacknowledged count served by parity/Cauchy rows.  Recovery
/// packets whose `sum_count` is at or below this threshold are parity or
/// Cauchy rows on the wire.
pub const CAUCHY_THRESHOLD: usize = 64;

/// When the unacknowledged count shrinks to this threshold the encoder
/// abandons its running sums and falls back to Cauchy rows.  Must not
/// exceed [`CAUCHY_THRESHOLD`].
pub const SUM_RESET_THRESHOLD: usize = 32;

pub(crate) const CAUCHY_MAX_ROWS: u32 = 127;
pub(crate) const CAUCHY_MAX_COLUMNS: u32 = 128;

/// One light (LDPC-style) pair is added per this many window elements.
pub(crate) const PAIR_ADD_RATE: usize = 16;

/// Elements are physically evicted once this many have been acknowledged.
pub(crate) const ENCODER_REMOVE_THRESHOLD: usize = 2 * SUBWINDOW_SIZE;

// ---------------------------------------------------------------------------
// Packet number arithmetic
// ---------------------------------------------------------------------------

/// Add an element offset to a column, wrapping at [`PACKET_NUM_COUNT`].
#[inline]
pub(crate) fn add_columns(column: PacketNum, delta: u32) -> PacketNum {
    column.wrapping_add(delta) & PACKET_NUM_MAX
}

/// Wrapping distance from `start` to `column`.
///
/// The result is meaningful as an element index only while the window spans
/// less than half the packet number space; larger values indicate a column
/// before `start` (see [`is_column_delta_negative`]).
#[inline]
pub(crate) fn subtract_columns(column: PacketNum, start: PacketNum) -> usize {
    (column.wrapping_sub(start) & PACKET_NUM_MAX) as usize
}

/// The next column after `column`.
#[inline]
pub(crate) fn next_column(column: PacketNum) -> PacketNum {
    column.wrapping_add(1) & PACKET_NUM_MAX
}

/// True if a wrapping delta actually refers to a column in the past.
#[inline]
pub(crate) fn is_column_delta_negative(delta: usize) -> bool {
    delta >= (PACKET_NUM_COUNT / 2) as usize
}
