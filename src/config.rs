//! See [`SequencerConfig`].

use bytes::Bytes;

/// Minimum remaining space in a packet, in bytes, below which
/// [`DatagramSequencer::end_packet`] gives up on appending reliable data and
/// just writes a `reliable_channels = 0` footer (spec.md §4.4,
/// "`MIN_RELIABLE_HEADER`", five `uint32`s worth).
///
/// [`DatagramSequencer::end_packet`]: crate::sequencer::DatagramSequencer::end_packet
pub const MIN_RELIABLE_HEADER: usize = 4 * 5;

/// Default value of [`SequencerConfig::max_packet_size`].
pub const DEFAULT_MAX_PACKET_SIZE: usize = 3000;

/// Default value of [`SequencerConfig::max_datagram_size`].
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1500;

/// Default [`priority`](crate::channel::ReliableSendChannel::priority) of a
/// freshly created channel.
pub const DEFAULT_CHANNEL_PRIORITY: f32 = 1.0;

/// Configuration for a [`DatagramSequencer`](crate::sequencer::DatagramSequencer).
///
/// See spec.md §6, "Configuration".
#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Opaque prefix prepended to every outbound datagram, and expected at the
    /// start of every inbound datagram.
    ///
    /// The sequencer never interprets these bytes - they belong to whatever
    /// framing the caller's transport layer uses above this one.
    pub datagram_header: Bytes,
    /// Upper bound on a logical packet's size, before fragmentation into
    /// datagrams. Default [`DEFAULT_MAX_PACKET_SIZE`].
    pub max_packet_size: usize,
    /// Upper bound on a single wire datagram, header included. Default
    /// [`DEFAULT_MAX_DATAGRAM_SIZE`].
    pub max_datagram_size: usize,
}

impl SequencerConfig {
    /// Creates a new config with the given header and the documented defaults
    /// for packet/datagram size caps.
    #[must_use]
    pub fn new(datagram_header: impl Into<Bytes>) -> Self {
        Self {
            datagram_header: datagram_header.into(),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }

    pub(crate) fn assert_valid(&self) {
        assert!(
            self.max_packet_size > MIN_RELIABLE_HEADER,
            "max_packet_size must be large enough to fit the ack/HP prologue"
        );
        let fragment_header_len = crate::wire::FRAGMENT_HEADER_LEN;
        assert!(
            self.max_datagram_size > self.datagram_header.len() + fragment_header_len,
            "max_datagram_size must fit the caller header and the fragment header"
        );
    }

    /// Maximum payload bytes a single datagram can carry, after the caller
    /// header and the `{packet_number, total_size, offset}` fragment header.
    #[must_use]
    pub fn datagram_payload_capacity(&self) -> usize {
        self.max_datagram_size - self.datagram_header.len() - crate::wire::FRAGMENT_HEADER_LEN
    }
}
