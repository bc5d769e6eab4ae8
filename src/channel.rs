//! One logical reliable byte-stream channel, split into its send half
//! ([`ReliableSendChannel`]) and receive half ([`ReliableRecvChannel`]),
//! per spec.md §4.3/§4.3b.
//!
//! Channels are created lazily by integer index and owned by the
//! [`DatagramSequencer`](crate::sequencer::DatagramSequencer) for their whole
//! lifetime; the two halves never share state directly, only via the
//! `ChannelSpan`s a `SendRecord` carries between them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::bitstream::Bitstream;
use crate::circular_buffer::CircularBuffer;
use crate::error::DatagramError;
use crate::span_list::SpanList;
use crate::wire;

/// A contiguous byte range of one channel's stream, carried in one packet.
///
/// Recorded in a `SendRecord` so that, once the carrying packet is
/// acknowledged, [`ReliableSendChannel::span_acknowledged`] can be called for
/// each one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpan {
    pub channel_id: u32,
    pub offset: u32,
    pub length: u32,
}

/// The send half of a reliable channel: buffers the unacknowledged tail of an
/// outbound byte stream and doles it out a budget at a time.
#[derive(Debug)]
pub struct ReliableSendChannel {
    index: u32,
    buffer: CircularBuffer,
    acknowledged: SpanList,
    /// Absolute stream position of `buffer`'s logical byte 0.
    offset: u32,
    /// Rotating cursor biasing which unacked gap `write_data` starts from.
    write_position: u32,
    priority: f32,
}

impl ReliableSendChannel {
    #[must_use]
    pub fn new(index: u32) -> Self {
        Self {
            index,
            buffer: CircularBuffer::new(),
            acknowledged: SpanList::new(),
            offset: 0,
            write_position: 0,
            priority: crate::config::DEFAULT_CHANNEL_PRIORITY,
        }
    }

    #[must_use]
    pub fn priority(&self) -> f32 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: f32) {
        self.priority = priority;
    }

    /// Bytes of the unacked stream still owed to the peer.
    #[must_use]
    pub fn bytes_available(&self) -> usize {
        self.buffer.size() - self.acknowledged.total_set() as usize
    }

    /// Serializes `value` through `bitstream` and appends it to the outbound
    /// stream. Per `SPEC_FULL.md` §7, a codec failure is the caller's bug and
    /// propagates rather than silently corrupting the channel.
    ///
    /// # Errors
    ///
    /// Returns an error if `bitstream` fails to encode `value`.
    pub fn send_message<B: Bitstream>(
        &mut self,
        bitstream: &mut B,
        value: &B::Value,
    ) -> Result<(), crate::error::BitstreamError> {
        let mut scratch = BytesMut::new();
        bitstream.write_value(&mut scratch, value)?;
        self.buffer.append(&scratch);
        Ok(())
    }

    /// Appends raw, already-encoded bytes to the outbound stream. Used for
    /// control messages that don't need the caller's bitstream.
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.buffer.append(bytes);
    }

    /// The still-unset regions of the stream: each acknowledged-list gap,
    /// plus the trailing region beyond its tracked coverage.
    ///
    /// The persisted `acknowledged` list can never begin with a zero-length
    /// `unset` run followed by dangling `set` bytes (any front-set region is
    /// folded into an advancement and dropped the instant it occurs - see
    /// `span_list::SpanList::set`), so the first gap this yields always
    /// starts at position `0`.
    fn gaps(&self) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        let mut position = 0usize;
        for span in self.acknowledged.spans() {
            if span.unset > 0 {
                out.push((position, span.unset as usize));
            }
            position += (span.unset + span.set) as usize;
        }
        let tail = self.buffer.size().saturating_sub(position);
        if tail > 0 {
            out.push((position, tail));
        }
        out
    }

    /// Emits one or more `{offset, length, payload}` segments totalling
    /// `budget` bytes (spec.md §4.3's two-pass span selection), appending a
    /// [`ChannelSpan`] per segment to `spans` for the current `SendRecord`.
    ///
    /// `budget` must not exceed [`ReliableSendChannel::bytes_available`].
    pub fn write_data(&mut self, out: &mut BytesMut, budget: usize, spans: &mut Vec<ChannelSpan>) {
        let span_count = self.count_spans(budget);
        out.put_u32_le(span_count);

        let mut remaining = budget;
        let mut first = true;
        loop {
            let gaps = self.gaps();
            let mut progressed = false;
            for &(gap_pos, gap_len) in &gaps {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(gap_len);
                if take == 0 {
                    continue;
                }
                remaining -= self.write_span(out, &mut first, gap_pos, take, spans);
                progressed = true;
            }
            if remaining == 0 || !progressed {
                break;
            }
        }
    }

    /// Dry run of [`ReliableSendChannel::write_data`]'s traversal, counting
    /// how many segments it will emit without writing anything.
    fn count_spans(&self, budget: usize) -> u32 {
        let mut remaining = budget;
        let mut first = true;
        let mut count = 0u32;
        loop {
            let gaps = self.gaps();
            let mut progressed = false;
            for &(_gap_pos, gap_len) in &gaps {
                if remaining == 0 {
                    break;
                }
                let take = remaining.min(gap_len);
                if take == 0 {
                    continue;
                }
                count += 1;
                remaining -= Self::bytes_consumed(&mut first, self.write_position, take);
                progressed = true;
            }
            if remaining == 0 || !progressed {
                break;
            }
        }
        count
    }

    /// How many bytes a gap of capped length `length` actually contributes:
    /// for the very first contributing gap of the whole call, the interior
    /// `write_position mod length` prefix is skipped entirely (spec.md §4.3,
    /// "entered at its own interior position"); every later gap contributes
    /// in full.
    fn bytes_consumed(first: &mut bool, write_position: u32, length: usize) -> usize {
        if *first {
            *first = false;
            if length == 0 {
                return 0;
            }
            length - (write_position as usize % length)
        } else {
            length
        }
    }

    /// Writes one segment, applying the same first-gap skip as
    /// [`ReliableSendChannel::bytes_consumed`] and, only for that first
    /// segment, advancing `write_position` by the amount actually written.
    fn write_span(
        &mut self,
        out: &mut BytesMut,
        first: &mut bool,
        gap_pos: usize,
        length: usize,
        spans: &mut Vec<ChannelSpan>,
    ) -> usize {
        let (position, length) = if *first {
            *first = false;
            let skip = if length == 0 { 0 } else { self.write_position as usize % length };
            let written = length - skip;
            self.write_position += written as u32;
            (gap_pos + skip, written)
        } else {
            (gap_pos, length)
        };

        let span = ChannelSpan {
            channel_id: self.index,
            offset: self.offset.wrapping_add(position as u32),
            length: length as u32,
        };
        out.put_u32_le(span.offset);
        out.put_u32_le(span.length);
        self.buffer.write_to_stream(position, length, out);
        spans.push(span);
        length
    }

    /// Records that `span` was delivered. If the acknowledged prefix
    /// advances, drops that many bytes from the head of the buffer and
    /// shifts `offset`/`write_position` to match (spec.md §4.3).
    pub fn span_acknowledged(&mut self, span: &ChannelSpan) {
        let relative_offset = i64::from(span.offset) - i64::from(self.offset);
        let advancement = self.acknowledged.set(relative_offset, i64::from(span.length));
        if advancement > 0 {
            let advancement = advancement as u32;
            self.buffer.remove(advancement as usize);
            self.offset = self.offset.wrapping_add(advancement);
            self.write_position = self.write_position.saturating_sub(advancement);
        }
    }
}

/// The receive half of a reliable channel: reassembles out-of-order segments
/// into an in-order delivered prefix.
#[derive(Debug)]
pub struct ReliableRecvChannel {
    buffer: CircularBuffer,
    acknowledged: SpanList,
    assembly_buffer: CircularBuffer,
    /// Absolute stream position of `buffer`'s logical byte 0.
    offset: u32,
}

impl ReliableRecvChannel {
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: CircularBuffer::new(),
            acknowledged: SpanList::new(),
            assembly_buffer: CircularBuffer::new(),
            offset: 0,
        }
    }

    /// Bytes of the in-order delivered prefix not yet read by the
    /// application.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffer.size() - self.buffer.cursor()
    }

    /// Reads up to `len` bytes of delivered, in-order data.
    pub fn read(&mut self, len: usize) -> Vec<u8> {
        self.buffer.read(len)
    }

    /// Consumes a `{segments, {offset, size, payload}*}` block (spec.md
    /// §4.3b), landing each segment in `assembly_buffer` and promoting any
    /// newly-contiguous prefix into `buffer`. Returns whether any bytes
    /// advanced (the `ready_to_read` signal).
    ///
    /// # Errors
    ///
    /// Returns [`DatagramError::TruncatedFragmentHeader`] or
    /// [`DatagramError::PayloadOverrun`] if `buf` runs out before the
    /// declared segment count/sizes are satisfied.
    pub fn read_data(&mut self, buf: &mut Bytes) -> Result<bool, DatagramError> {
        let segments = wire::read_u32(buf).ok_or(DatagramError::TruncatedFragmentHeader)?;
        let mut advanced = false;
        for _ in 0..segments {
            let offset = wire::read_u32(buf).ok_or(DatagramError::TruncatedFragmentHeader)?;
            let size = wire::read_u32(buf).ok_or(DatagramError::TruncatedFragmentHeader)?;
            if buf.remaining() < size as usize {
                return Err(DatagramError::PayloadOverrun);
            }

            let position = i64::from(offset) - i64::from(self.offset);
            let end = position + i64::from(size);
            if end <= 0 {
                // Entirely stale: still must consume `size` bytes of the
                // stream reader before continuing (spec.md §9).
                buf.advance(size as usize);
            } else if position < 0 {
                buf.advance((-position) as usize);
                self.assembly_buffer.read_from_stream(0, end as usize, buf);
            } else {
                self.assembly_buffer.read_from_stream(position as usize, size as usize, buf);
            }

            let advancement = self.acknowledged.set(position, i64::from(size));
            if advancement > 0 {
                let advancement = advancement as usize;
                self.assembly_buffer.append_to_buffer(0, advancement, &mut self.buffer);
                self.assembly_buffer.remove(advancement);
                self.offset = self.offset.wrapping_add(advancement as u32);
                advanced = true;
            }
        }

        // Prune whatever the application has already read, so `buffer`
        // retains only the undelivered prefix.
        let read_so_far = self.buffer.cursor();
        if read_so_far > 0 {
            self.buffer.remove(read_so_far);
            self.buffer
                .seek(0)
                .expect("seeking to 0 never exceeds buffer size");
        }

        Ok(advanced)
    }
}

impl Default for ReliableRecvChannel {
    fn default() -> Self {
        Self::new()
    }
}
