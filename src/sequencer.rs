//! See [`DatagramSequencer`], the per-peer engine tying every other module
//! together (spec.md §4.4).

use ahash::{AHashMap, AHashSet};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::VecDeque;
use tracing::{trace, warn};

use crate::bitstream::{Bitstream, SharedObjectId};
use crate::channel::{ChannelSpan, ReliableRecvChannel, ReliableSendChannel};
use crate::config::{SequencerConfig, MIN_RELIABLE_HEADER};
use crate::error::{BitstreamError, DatagramError};
use crate::highprio::HighPriorityQueue;
use crate::seq::PacketNumber;
use crate::wire::{self, FragmentHeader};

/// One in-flight outgoing packet's bookkeeping (spec.md §3).
#[derive(Debug, Clone)]
pub struct SendRecord<W> {
    pub packet_number: PacketNumber,
    pub last_received_packet_number: PacketNumber,
    pub write_mappings: W,
    pub spans: Vec<ChannelSpan>,
}

/// One fully-received incoming packet's bookkeeping (spec.md §3).
#[derive(Debug, Clone)]
pub struct ReceiveRecord<R> {
    pub packet_number: PacketNumber,
    pub read_mappings: R,
    /// Signed, matching the original's `int` arithmetic (`DatagramSequencer.cpp`):
    /// the peer's HP list can shrink between packets, so this delta can be
    /// negative - see [`DatagramSequencer::parse_completed_packet`].
    pub new_high_priority_messages: i64,
    /// Signed for the same reason as `new_high_priority_messages` above.
    pub new_cleared_shared_objects: i64,
}

/// Everything a completed call to [`DatagramSequencer::received_datagram`]
/// produced, bundled instead of emitted through callbacks (`SPEC_FULL.md`
/// §5 REDESIGN).
#[derive(Debug, Clone, Default)]
pub struct ReceivedPacketEvents<V> {
    /// High-priority values newly delivered this call (each exactly once,
    /// Testable Property 6).
    pub received_high_priority_messages: Vec<V>,
    /// Shared-object ids the peer reported cleared, newly delivered this
    /// call (`SPEC_FULL.md` §3 supplement).
    pub cleared_shared_objects: Vec<SharedObjectId>,
    /// Packet numbers of our own sends the peer just acknowledged.
    pub send_acknowledged: Vec<PacketNumber>,
    /// Packet numbers of our own receives the peer has now stopped
    /// echoing (Open Question 2: carries the real pruned packet number
    /// rather than the original's meaningless constant `0`).
    pub receive_acknowledged: Vec<PacketNumber>,
}

/// Reliable, ordered message transport over an unreliable datagram substrate
/// (spec.md §1). One instance models one peer relation.
///
/// Generic over the caller-supplied [`Bitstream`] codec. Every public method
/// is synchronous and does no I/O of its own: the caller feeds it inbound
/// datagrams via [`DatagramSequencer::received_datagram`] and is responsible
/// for actually sending whatever [`DatagramSequencer::end_packet`] returns.
#[derive(derivative::Derivative)]
#[derivative(Debug)]
pub struct DatagramSequencer<B: Bitstream> {
    config: SequencerConfig,
    #[derivative(Debug = "ignore")]
    bitstream: B,

    outgoing_packet_number: PacketNumber,
    #[derivative(Debug = "ignore")]
    send_records: VecDeque<SendRecord<B::WriteMappings>>,
    send_channels: AHashMap<u32, ReliableSendChannel>,

    incoming_packet_number: PacketNumber,
    incoming_buffer: Vec<u8>,
    offsets_received: AHashSet<u32>,
    remaining_bytes: usize,
    #[derivative(Debug = "ignore")]
    receive_records: VecDeque<ReceiveRecord<B::ReadMappings>>,
    recv_channels: AHashMap<u32, ReliableRecvChannel>,

    #[derivative(Debug = "ignore")]
    high_priority: HighPriorityQueue<B::Value>,
    cleared_shared_objects: HighPriorityQueue<SharedObjectId>,
    /// Signed to match the original's `int _receivedHighPriorityMessages`:
    /// pruning a `ReceiveRecord` subtracts its `new_high_priority_messages`
    /// delta in signed arithmetic, which can otherwise run negative if the
    /// peer's HP list shrinks between packets (`DatagramSequencer.cpp:180,221`).
    received_high_priority_messages: i64,
    /// Signed for the same reason as `received_high_priority_messages` above.
    received_cleared_shared_objects: i64,

    outgoing_packet_buffer: BytesMut,
}

impl<B: Bitstream> DatagramSequencer<B> {
    /// Creates a fresh sequencer with no in-flight state.
    pub fn new(config: SequencerConfig, bitstream: B) -> Self {
        config.assert_valid();
        Self {
            config,
            bitstream,
            outgoing_packet_number: PacketNumber::ZERO,
            send_records: VecDeque::new(),
            send_channels: AHashMap::default(),
            incoming_packet_number: PacketNumber::ZERO,
            incoming_buffer: Vec::new(),
            offsets_received: AHashSet::default(),
            remaining_bytes: 0,
            receive_records: VecDeque::new(),
            recv_channels: AHashMap::default(),
            high_priority: HighPriorityQueue::new(),
            cleared_shared_objects: HighPriorityQueue::new(),
            received_high_priority_messages: 0,
            received_cleared_shared_objects: 0,
            outgoing_packet_buffer: BytesMut::new(),
        }
    }

    /// Enqueues `value` to be sent with every outbound packet, starting with
    /// the next one, until its first-carrying packet is acknowledged
    /// (spec.md §3/§4.4).
    pub fn send_high_priority_message(&mut self, value: B::Value) {
        let next = self.outgoing_packet_number + 1;
        self.high_priority.push(value, next);
    }

    /// Gets or lazily creates the reliable output channel at `index`.
    pub fn reliable_output_channel(&mut self, index: u32) -> &mut ReliableSendChannel {
        self.send_channels
            .entry(index)
            .or_insert_with(|| ReliableSendChannel::new(index))
    }

    /// Gets or lazily creates the reliable input channel at `index`.
    pub fn reliable_input_channel(&mut self, index: u32) -> &mut ReliableRecvChannel {
        self.recv_channels.entry(index).or_insert_with(ReliableRecvChannel::new)
    }

    /// Sets an output channel's relative share of the reliable budget
    /// (spec.md §6, default `1.0`).
    pub fn set_channel_priority(&mut self, index: u32, priority: f32) {
        self.reliable_output_channel(index).set_priority(priority);
    }

    /// Mutable access to the underlying [`Bitstream`] collaborator, for
    /// callers that need to drive codec-level state directly (e.g. queuing a
    /// shared-object clear ahead of the next `start_packet`).
    pub fn bitstream_mut(&mut self) -> &mut B {
        &mut self.bitstream
    }

    /// Writes the packet prologue - acknowledgements, cleared-shared-object
    /// ids, then high-priority messages - into the outgoing packet buffer
    /// (spec.md §4.4). Must be followed by zero or more
    /// [`DatagramSequencer::write_middle_value`]/[`DatagramSequencer::write_middle_raw`]
    /// calls and then [`DatagramSequencer::end_packet`].
    ///
    /// # Errors
    ///
    /// Returns an error if the bitstream fails to encode a pending
    /// high-priority value.
    pub fn start_packet(&mut self) -> Result<(), BitstreamError> {
        self.outgoing_packet_buffer.clear();

        self.outgoing_packet_buffer.put_u32_le(self.receive_records.len() as u32);
        for record in &self.receive_records {
            record.packet_number.write(&mut self.outgoing_packet_buffer);
        }

        for id in self.bitstream.take_cleared_shared_objects() {
            let next = self.outgoing_packet_number + 1;
            self.cleared_shared_objects.push(id, next);
        }
        self.outgoing_packet_buffer
            .put_u32_le(self.cleared_shared_objects.len() as u32);
        for message in self.cleared_shared_objects.iter() {
            wire::write_u32(&mut self.outgoing_packet_buffer, message.data);
        }

        self.outgoing_packet_buffer.put_u32_le(self.high_priority.len() as u32);
        for message in self.high_priority.iter() {
            self.bitstream.write_value(&mut self.outgoing_packet_buffer, &message.data)?;
        }

        Ok(())
    }

    /// Writes one caller value into the current packet's free-form middle
    /// section, between the prologue and the reliable-data suffix.
    ///
    /// # Errors
    ///
    /// Returns an error if the bitstream fails to encode `value`.
    pub fn write_middle_value(&mut self, value: &B::Value) -> Result<(), BitstreamError> {
        self.bitstream.write_value(&mut self.outgoing_packet_buffer, value)
    }

    /// Appends raw bytes to the current packet's middle section.
    pub fn write_middle_raw(&mut self, bytes: &[u8]) {
        self.outgoing_packet_buffer.put_slice(bytes);
    }

    /// Appends a reliable-data suffix if there's room, then fragments and
    /// emits the finished packet as one or more datagrams ready to send
    /// (spec.md §4.4's `ready_to_write` notification, returned here instead
    /// of emitted - `SPEC_FULL.md` §5 REDESIGN).
    pub fn end_packet(&mut self) -> Vec<Bytes> {
        let remaining = self
            .config
            .max_packet_size
            .saturating_sub(self.outgoing_packet_buffer.len());
        let mut spans = Vec::new();
        if remaining > MIN_RELIABLE_HEADER {
            self.append_reliable_data(remaining, &mut spans);
        } else {
            self.outgoing_packet_buffer.put_u32_le(0);
        }
        self.send_packet(spans)
    }

    /// Splits `budget` bytes across every backlogged output channel in
    /// proportion to its `priority`, renormalizing after each channel so
    /// integer rounding loss is absorbed by later channels (spec.md §4.4).
    fn append_reliable_data(&mut self, budget: usize, spans: &mut Vec<ChannelSpan>) {
        let mut indices: Vec<u32> = self.send_channels.keys().copied().collect();
        indices.sort_unstable();

        let mut total_bytes = 0usize;
        let mut total_priority = 0f32;
        let mut active_count = 0u32;
        for &idx in &indices {
            let available = self.send_channels[&idx].bytes_available();
            if available > 0 {
                total_bytes += available;
                total_priority += self.send_channels[&idx].priority();
                active_count += 1;
            }
        }

        self.outgoing_packet_buffer.put_u32_le(active_count);
        if active_count == 0 {
            return;
        }

        let mut effective_budget = budget.min(total_bytes);
        let mut remaining_priority = total_priority;
        for &idx in &indices {
            let channel = self.send_channels.get_mut(&idx).expect("index collected above");
            let available = channel.bytes_available();
            if available == 0 {
                continue;
            }
            self.outgoing_packet_buffer.put_u32_le(idx);

            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let proportional = ((effective_budget as f32) * channel.priority() / remaining_priority) as usize;
            let share = available.min(proportional);

            channel.write_data(&mut self.outgoing_packet_buffer, share, spans);
            effective_budget -= share;
            remaining_priority -= channel.priority();
        }
    }

    /// Records the send, fragments the accumulated packet buffer into
    /// MTU-sized datagrams, and rewinds the buffer for reuse.
    fn send_packet(&mut self, spans: Vec<ChannelSpan>) -> Vec<Bytes> {
        self.outgoing_packet_number += 1;
        let last_received_packet_number = self
            .receive_records
            .back()
            .map_or(PacketNumber::ZERO, |record| record.packet_number);
        let write_mappings = self.bitstream.snapshot_write_mappings();
        self.bitstream.reset();

        self.send_records.push_back(SendRecord {
            packet_number: self.outgoing_packet_number,
            last_received_packet_number,
            write_mappings,
            spans,
        });

        let packet = self.outgoing_packet_buffer.split().freeze();
        let payload_capacity = self.config.datagram_payload_capacity();

        let mut datagrams = Vec::new();
        let mut offset = 0usize;
        loop {
            let take = payload_capacity.min(packet.len() - offset);
            let mut datagram = BytesMut::with_capacity(
                self.config.datagram_header.len() + wire::FRAGMENT_HEADER_LEN + take,
            );
            datagram.put_slice(&self.config.datagram_header);
            FragmentHeader {
                packet_number: self.outgoing_packet_number,
                total_size: packet.len() as u32,
                offset: offset as u32,
            }
            .write(&mut datagram);
            datagram.put_slice(&packet[offset..offset + take]);
            datagrams.push(datagram.freeze());

            offset += take;
            if offset >= packet.len() {
                break;
            }
        }
        datagrams
    }

    /// Feeds one inbound datagram through reassembly. `read_middle` is
    /// invoked synchronously, once, with the packet's free-form middle
    /// section positioned right after the prologue and before the
    /// reliable-data suffix - only the caller knows how many bytes of
    /// application data to consume from it, so unlike every other event this
    /// one cannot be collected into [`ReceivedPacketEvents`] without first
    /// running caller code (`SPEC_FULL.md` §5 REDESIGN note).
    ///
    /// Returns `Ok(None)` if the datagram was stale, a duplicate, malformed,
    /// or merely advanced an in-progress reassembly (spec.md §7: nothing at
    /// this level is fatal). Returns `Ok(Some(_))` exactly when a packet was
    /// newly completed and parsed.
    ///
    /// # Errors
    ///
    /// Returns an error if the bitstream fails to decode a high-priority
    /// value - a caller-codec bug, not a wire condition.
    pub fn received_datagram<F>(
        &mut self,
        datagram: &[u8],
        read_middle: F,
    ) -> Result<Option<ReceivedPacketEvents<B::Value>>, BitstreamError>
    where
        F: FnOnce(&mut Bytes),
    {
        if datagram.len() < self.config.datagram_header.len() {
            warn!(error = %DatagramError::ShorterThanHeader, "dropping datagram");
            return Ok(None);
        }
        let mut body = Bytes::copy_from_slice(&datagram[self.config.datagram_header.len()..]);

        let Some(header) = FragmentHeader::read(&mut body) else {
            warn!(error = %DatagramError::TruncatedFragmentHeader, "dropping datagram");
            return Ok(None);
        };

        if header.packet_number < self.incoming_packet_number {
            trace!(error = %DatagramError::StaleSequence, "dropping datagram");
            return Ok(None);
        }
        if header.packet_number > self.incoming_packet_number {
            self.incoming_packet_number = header.packet_number;
            self.incoming_buffer = vec![0u8; header.total_size as usize];
            self.offsets_received.clear();
            self.remaining_bytes = header.total_size as usize;
        }

        if !self.offsets_received.insert(header.offset) {
            trace!(error = %DatagramError::DuplicateOffset, "dropping datagram");
            return Ok(None);
        }

        let offset = header.offset as usize;
        let payload_len = body.remaining();
        let overruns = match offset.checked_add(payload_len) {
            Some(end) => end > self.incoming_buffer.len(),
            None => true,
        };
        if overruns {
            warn!(error = %DatagramError::PayloadOverrun, "dropping datagram");
            return Ok(None);
        }
        self.incoming_buffer[offset..offset + payload_len].copy_from_slice(&body);
        self.remaining_bytes = self.remaining_bytes.saturating_sub(payload_len);
        if self.remaining_bytes > 0 {
            return Ok(None);
        }

        self.parse_completed_packet(read_middle).map(Some)
    }

    fn parse_completed_packet<F>(&mut self, read_middle: F) -> Result<ReceivedPacketEvents<B::Value>, BitstreamError>
    where
        F: FnOnce(&mut Bytes),
    {
        let mut buf = Bytes::copy_from_slice(&self.incoming_buffer);

        let mut send_acknowledged = Vec::new();
        let mut receive_acknowledged = Vec::new();
        let ack_count = wire::read_u32(&mut buf).unwrap_or(0);
        for _ in 0..ack_count {
            let Some(acked) = wire::read_u32(&mut buf) else { break };
            let acked = PacketNumber(acked);
            let Some(front) = self.send_records.front() else { continue };
            let index = acked - front.packet_number;
            if index < 0 || index as usize >= self.send_records.len() {
                continue;
            }
            for _ in 0..=(index as usize) {
                let record = self.send_records.pop_front().expect("index bounds checked above");
                let packet_number = record.packet_number;
                receive_acknowledged.extend(self.send_record_acknowledged(record));
                send_acknowledged.push(packet_number);
            }
        }

        let cleared_total = i64::from(wire::read_u32(&mut buf).unwrap_or(0));
        let mut cleared_shared_objects = Vec::new();
        for i in 0..cleared_total {
            let Some(id) = wire::read_u32(&mut buf) else { break };
            if i >= self.received_cleared_shared_objects {
                self.bitstream.clear_shared_object(id);
                cleared_shared_objects.push(id);
            }
        }
        // Signed, matching the original's `int` delta (`DatagramSequencer.cpp:180`):
        // the peer's list can shrink between packets, so this can go negative.
        let new_cleared_shared_objects = cleared_total - self.received_cleared_shared_objects;
        self.received_cleared_shared_objects = cleared_total;

        let hp_total = i64::from(wire::read_u32(&mut buf).unwrap_or(0));
        let mut received_high_priority_messages = Vec::new();
        for i in 0..hp_total {
            let value = self.bitstream.read_value(&mut buf)?;
            if i >= self.received_high_priority_messages {
                received_high_priority_messages.push(value);
            }
        }
        let new_high_priority_messages = hp_total - self.received_high_priority_messages;
        self.received_high_priority_messages = hp_total;

        read_middle(&mut buf);

        let reliable_channels = wire::read_u32(&mut buf).unwrap_or(0);
        for _ in 0..reliable_channels {
            let Some(channel_index) = wire::read_u32(&mut buf) else { break };
            let channel = self
                .recv_channels
                .entry(channel_index)
                .or_insert_with(ReliableRecvChannel::new);
            if let Err(err) = channel.read_data(&mut buf) {
                warn!(%err, channel_index, "dropping malformed reliable segment");
                break;
            }
        }

        let read_mappings = self.bitstream.snapshot_read_mappings();
        self.bitstream.reset();
        self.receive_records.push_back(ReceiveRecord {
            packet_number: self.incoming_packet_number,
            read_mappings,
            new_high_priority_messages,
            new_cleared_shared_objects,
        });

        Ok(ReceivedPacketEvents {
            received_high_priority_messages,
            cleared_shared_objects,
            send_acknowledged,
            receive_acknowledged,
        })
    }

    /// Runs the four acknowledgement effects from spec.md §4.4, in order:
    /// prune now-redundant receive records and persist their read mappings,
    /// persist this send's write mappings, drop now-acked high-priority
    /// messages, and forward each carried span to its channel.
    fn send_record_acknowledged(&mut self, record: SendRecord<B::WriteMappings>) -> Vec<PacketNumber> {
        let mut pruned = Vec::new();
        while let Some(front) = self.receive_records.front() {
            if front.packet_number > record.last_received_packet_number {
                break;
            }
            let received = self.receive_records.pop_front().expect("checked Some above");
            self.bitstream.persist_read_mappings(received.read_mappings);
            self.received_high_priority_messages -= received.new_high_priority_messages;
            self.received_cleared_shared_objects -= received.new_cleared_shared_objects;
            pruned.push(received.packet_number);
        }

        self.bitstream.persist_write_mappings(record.write_mappings);

        self.high_priority.drop_acknowledged_through(record.packet_number);
        self.cleared_shared_objects.drop_acknowledged_through(record.packet_number);

        for span in &record.spans {
            if let Some(channel) = self.send_channels.get_mut(&span.channel_id) {
                channel.span_acknowledged(span);
            }
        }

        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitstream::MemoryBitstream;

    fn config() -> SequencerConfig {
        let mut config = SequencerConfig::new(Bytes::from_static(b"hdr"));
        config.max_packet_size = 200;
        config.max_datagram_size = 64;
        config
    }

    #[test]
    fn small_packet_emits_one_datagram() {
        let mut seq = DatagramSequencer::new(config(), MemoryBitstream::new());
        seq.start_packet().unwrap();
        seq.write_middle_value(&Bytes::from_static(b"hi")).unwrap();
        let datagrams = seq.end_packet();

        assert_eq!(1, datagrams.len());
        let mut body = datagrams[0].clone();
        body.advance(3); // caller header
        let header = FragmentHeader::read(&mut body).unwrap();
        assert_eq!(PacketNumber(1), header.packet_number);
        assert_eq!(0, header.offset);
    }

    #[test]
    fn loopback_round_trips_ack_and_middle() {
        let mut sender = DatagramSequencer::new(config(), MemoryBitstream::new());
        let mut receiver = DatagramSequencer::new(config(), MemoryBitstream::new());

        sender.start_packet().unwrap();
        sender.write_middle_value(&Bytes::from_static(b"ping")).unwrap();
        let datagrams = sender.end_packet();

        // The middle section carries no length prefix of its own (spec.md §6):
        // the caller must know how to delimit its own content, the same way it
        // encoded it. Here that's `write_middle_value`'s bitstream framing, so
        // the read side decodes with a matching `read_value` rather than
        // greedily consuming the rest of the buffer - which would also swallow
        // the trailing `reliable_channels` footer.
        let mut decoder = MemoryBitstream::new();
        let mut received_middle = Bytes::new();
        for datagram in &datagrams {
            let events = receiver
                .received_datagram(datagram, |middle| {
                    received_middle = decoder.read_value(middle).unwrap();
                })
                .unwrap();
            if let Some(events) = events {
                assert!(events.received_high_priority_messages.is_empty());
            }
        }
        assert_eq!(&b"ping"[..], &received_middle[..]);
    }

    #[test]
    fn high_priority_message_retransmits_until_acked() {
        let mut sender = DatagramSequencer::new(config(), MemoryBitstream::new());
        let mut receiver = DatagramSequencer::new(config(), MemoryBitstream::new());

        sender.send_high_priority_message(Bytes::from_static(b"X"));

        sender.start_packet().unwrap();
        let lost_packet = sender.end_packet();
        drop(lost_packet); // simulate loss of packet 1

        sender.start_packet().unwrap();
        let packet_2 = sender.end_packet();
        let mut delivered = Vec::new();
        for datagram in &packet_2 {
            if let Some(events) = receiver.received_datagram(datagram, |_| {}).unwrap() {
                delivered.extend(events.received_high_priority_messages);
            }
        }
        assert_eq!(vec![Bytes::from_static(b"X")], delivered);

        // packet 3 still carries X, unacked - receiver must not redeliver.
        sender.start_packet().unwrap();
        let packet_3 = sender.end_packet();
        let mut redelivered = Vec::new();
        for datagram in &packet_3 {
            if let Some(events) = receiver.received_datagram(datagram, |_| {}).unwrap() {
                redelivered.extend(events.received_high_priority_messages);
            }
        }
        assert!(redelivered.is_empty());
    }

    #[test]
    fn reliable_channel_survives_packet_loss() {
        let mut config = config();
        config.max_packet_size = 64;
        let mut sender = DatagramSequencer::new(config.clone(), MemoryBitstream::new());
        let mut receiver = DatagramSequencer::new(config, MemoryBitstream::new());

        sender.reliable_output_channel(0).send_raw(&[7u8; 300]);

        let mut delivered: Vec<u8> = Vec::new();
        for packet_index in 0..40 {
            sender.start_packet().unwrap();
            let datagrams = sender.end_packet();
            if packet_index == 0 {
                continue; // simulate losing the very first packet
            }
            for datagram in &datagrams {
                if let Some(_events) = receiver.received_datagram(datagram, |_| {}).unwrap() {
                    let chunk = receiver.reliable_input_channel(0).read(usize::MAX);
                    delivered.extend(chunk);
                }
            }
            if delivered.len() >= 300 {
                break;
            }
        }
        assert_eq!(vec![7u8; 300], delivered);
    }
}
