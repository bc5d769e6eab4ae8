//! Crate-wide error types.
//!
//! Per spec.md §7, nothing at the wire level is fatal: stale datagrams,
//! out-of-range acks, malformed fragments and stale reliable segments are all
//! silently dropped, logged at [`tracing::warn!`] where useful, and never
//! surfaced as an [`Err`] from [`crate::sequencer::DatagramSequencer::received_datagram`].
//!
//! The one genuine failure domain is the caller-supplied [`crate::bitstream::Bitstream`]
//! collaborator erroring on encode or decode - that's an application bug, not a
//! transient wire condition, so it propagates as [`Result::Err`].

use thiserror::Error;

/// Failure from the [`Bitstream`](crate::bitstream::Bitstream) collaborator.
#[derive(Debug, Error)]
pub enum BitstreamError {
    /// The bitstream failed to encode a value the caller tried to write.
    #[error("failed to encode value")]
    Encode(#[source] Box<dyn std::error::Error + Send + Sync>),
    /// The bitstream failed to decode a value from the wire.
    #[error("failed to decode value")]
    Decode(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A datagram-level condition that causes the datagram to be discarded.
///
/// These are never returned to the caller of
/// [`received_datagram`](crate::sequencer::DatagramSequencer::received_datagram) -
/// they exist so the sequencer's internals can log a specific reason via
/// `tracing` before dropping the offending bytes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DatagramError {
    /// The datagram was shorter than the caller's configured header.
    #[error("datagram shorter than the configured header")]
    ShorterThanHeader,
    /// The datagram was too short to contain its fragment header
    /// (`sequence`, `total_size`, `offset`).
    #[error("datagram too short to contain a fragment header")]
    TruncatedFragmentHeader,
    /// `sequence` is behind the packet currently being reassembled.
    #[error("stale packet sequence")]
    StaleSequence,
    /// This `offset` was already received for the packet being reassembled.
    #[error("duplicate fragment offset")]
    DuplicateOffset,
    /// The fragment's payload would write past the end of the declared
    /// `total_size`.
    #[error("fragment payload overruns declared packet size")]
    PayloadOverrun,
}
