//! Lifetime counters collected by each codec side.

/// Counters accumulated by an [`Encoder`](crate::Encoder).
#[derive(Debug, Clone, Default)]
pub struct EncoderStats {
    /// Original packets added.
    pub original_count: u64,
    /// Total original payload bytes added.
    pub original_bytes: u64,
    /// Recovery packets generated.
    pub recovery_count: u64,
    /// Total recovery bytes generated.
    pub recovery_bytes: u64,
    /// Packets returned for retransmission.
    pub retransmit_count: u64,
    /// Total retransmitted payload bytes.
    pub retransmit_bytes: u64,
    /// Acknowledgements processed.
    pub ack_count: u64,
    /// Total acknowledgement bytes processed.
    pub ack_bytes: u64,
    /// Bytes of backing storage currently held by the codec.
    pub memory_allocated_bytes: u64,
}

/// Counters accumulated by a [`Decoder`](crate::Decoder).
#[derive(Debug, Clone, Default)]
pub struct DecoderStats {
    /// Original packets received.
    pub original_count: u64,
    /// Total original payload bytes received.
    pub original_bytes: u64,
    /// Recovery packets received.
    pub recovery_count: u64,
    /// Total recovery bytes received.
    pub recovery_bytes: u64,
    /// Acknowledgements generated.
    pub ack_count: u64,
    /// Total acknowledgement bytes generated.
    pub ack_bytes: u64,
    /// Originals ignored because recovery already reproduced them.
    pub duped_original_count: u64,
    /// Recovery packets ignored because every covered original had arrived.
    pub duped_recovery_count: u64,
    /// Originals successfully recovered by the solver.
    pub solve_success_count: u64,
    /// Solver attempts that needed more data.
    pub solve_fail_count: u64,
    /// Bytes of backing storage currently held by the codec.
    pub memory_allocated_bytes: u64,
}
