//! Multi-component scenarios from spec.md §8 that don't fit naturally inside
//! a single module's unit tests - S2/S3/S6/S7/S8 of `SPEC_FULL.md` §8.
//! S1/S4/S5 are covered as unit tests in `src/sequencer.rs`.

use bytes::{Buf, Bytes, BytesMut};
use datagram_sequencer::bitstream::{Bitstream, SharedObjectId};
use datagram_sequencer::error::BitstreamError;
use datagram_sequencer::{DatagramSequencer, MemoryBitstream, SequencerConfig};

fn config(max_packet_size: usize, max_datagram_size: usize) -> SequencerConfig {
    let mut config = SequencerConfig::new(Bytes::from_static(b"hdr"));
    config.max_packet_size = max_packet_size;
    config.max_datagram_size = max_datagram_size;
    config
}

/// S2: a packet big enough to need two fragments reassembles correctly when
/// the fragments arrive in reverse order.
#[test]
fn fragments_reassemble_out_of_order() {
    let mut sender = DatagramSequencer::new(config(3000, 1500), MemoryBitstream::new());
    let mut receiver = DatagramSequencer::new(config(3000, 1500), MemoryBitstream::new());

    let payload = vec![0xABu8; 2600];
    sender.start_packet().unwrap();
    sender.write_middle_raw(&payload);
    let datagrams = sender.end_packet();
    assert_eq!(2, datagrams.len(), "2600 bytes at 1500 datagram cap needs 2 fragments");

    // The middle section carries no length prefix of its own (spec.md §6) -
    // whatever wrote it knows how much it wrote. Here that's the raw 2600-byte
    // payload, so the read side takes exactly that many bytes rather than
    // greedily draining the rest of the buffer, which would also swallow the
    // trailing `reliable_channels` footer `end_packet` always appends.
    let mut received_middle = Bytes::new();
    let mut completed = 0;
    for datagram in datagrams.iter().rev() {
        let events = receiver
            .received_datagram(datagram, |middle| {
                received_middle = middle.split_to(payload.len());
            })
            .unwrap();
        if events.is_some() {
            completed += 1;
        }
    }
    assert_eq!(1, completed, "packet completes only once both fragments arrive");
    assert_eq!(payload, received_middle.to_vec());
}

/// S3: delivering the same fragment twice is a no-op the second time - no
/// notification, and (once the packet is otherwise complete) no duplicate
/// completion either.
#[test]
fn duplicate_fragment_is_ignored() {
    let mut sender = DatagramSequencer::new(config(3000, 1500), MemoryBitstream::new());
    let mut receiver = DatagramSequencer::new(config(3000, 1500), MemoryBitstream::new());

    sender.start_packet().unwrap();
    sender.write_middle_raw(b"hello");
    let datagrams = sender.end_packet();
    assert_eq!(1, datagrams.len());

    let first = receiver.received_datagram(&datagrams[0], |_| {}).unwrap();
    assert!(first.is_some());

    // redelivering the exact same datagram must not re-complete the packet,
    // since `incoming_packet_number` has already moved past it and it's now
    // stale (spec.md §7, "stale datagram").
    let second = receiver.received_datagram(&datagrams[0], |_| {}).unwrap();
    assert!(second.is_none());
}

/// S3 variant: a duplicate fragment *of the packet currently being
/// reassembled* (not yet complete) is also a no-op.
#[test]
fn duplicate_fragment_mid_reassembly_is_ignored() {
    let mut sender = DatagramSequencer::new(config(3000, 1500), MemoryBitstream::new());
    let mut receiver = DatagramSequencer::new(config(3000, 1500), MemoryBitstream::new());

    sender.start_packet().unwrap();
    sender.write_middle_raw(&vec![0u8; 2600]);
    let datagrams = sender.end_packet();
    assert_eq!(2, datagrams.len());

    // deliver fragment 0 twice before fragment 1 ever arrives.
    assert!(receiver.received_datagram(&datagrams[0], |_| {}).unwrap().is_none());
    assert!(receiver.received_datagram(&datagrams[0], |_| {}).unwrap().is_none());
    // now complete it - if the duplicate had corrupted `remaining_bytes` this
    // would either never complete or panic on an overrun.
    assert!(receiver.received_datagram(&datagrams[1], |_| {}).unwrap().is_some());
}

/// S6: two channels backlogged at priority 1:3 split a 100-byte reliable
/// budget roughly 25:75, and the two shares never exceed the budget.
#[test]
fn priority_split_matches_ratio() {
    let mut config = config(3000, 1500);
    config.max_packet_size = 200; // remaining budget after a near-empty prologue
    let mut sender = DatagramSequencer::new(config, MemoryBitstream::new());

    sender.reliable_output_channel(0).send_raw(&[1u8; 10_000]);
    sender.reliable_output_channel(1).send_raw(&[2u8; 10_000]);
    sender.set_channel_priority(0, 1.0);
    sender.set_channel_priority(1, 3.0);

    sender.start_packet().unwrap();
    sender.end_packet();

    let available_0 = sender.reliable_output_channel(0).bytes_available();
    let available_1 = sender.reliable_output_channel(1).bytes_available();
    let sent_0 = 10_000 - available_0;
    let sent_1 = 10_000 - available_1;

    assert!(sent_0 > 0 && sent_1 > 0, "both channels must get some share");
    // ratio should be close to 1:3; allow rounding slack.
    let ratio = f64::from(u32::try_from(sent_1).unwrap()) / f64::from(u32::try_from(sent_0).unwrap());
    assert!((2.0..=4.0).contains(&ratio), "ratio {ratio} should be roughly 3:1, got sent_0={sent_0} sent_1={sent_1}");
}

/// S7: a cleared shared object surfaces as a high-priority control message
/// ahead of application high-priority values, and obeys the same
/// at-least-once/dedup/ack-pruning rules as any other high-priority message.
#[test]
fn cleared_shared_object_is_delivered_and_deduped() {
    let mut sender = DatagramSequencer::new(config(3000, 1500), ClearingBitstream::default());
    let mut receiver = DatagramSequencer::new(config(3000, 1500), ClearingBitstream::default());

    sender.bitstream_mut().clear(42);

    sender.start_packet().unwrap();
    let lost_packet = sender.end_packet();
    drop(lost_packet); // simulate losing the packet that first carried the clear

    sender.start_packet().unwrap();
    let datagrams = sender.end_packet();
    let mut cleared = Vec::new();
    for datagram in &datagrams {
        if let Some(events) = receiver.received_datagram(datagram, |_| {}).unwrap() {
            cleared.extend(events.cleared_shared_objects);
        }
    }
    assert_eq!(vec![42], cleared);

    // still unacked, so the next packet carries it again - receiver must not
    // redeliver a second time.
    sender.start_packet().unwrap();
    let datagrams = sender.end_packet();
    let mut redelivered = Vec::new();
    for datagram in &datagrams {
        if let Some(events) = receiver.received_datagram(datagram, |_| {}).unwrap() {
            redelivered.extend(events.cleared_shared_objects);
        }
    }
    assert!(redelivered.is_empty());
}

/// S8: a `Bitstream` that fails to encode causes `start_packet` to surface
/// `Err(BitstreamError)` rather than silently writing a corrupt packet.
#[test]
fn bitstream_encode_error_propagates() {
    let mut sender = DatagramSequencer::new(config(3000, 1500), FailingBitstream);
    sender.send_high_priority_message(());
    assert!(matches!(sender.start_packet(), Err(BitstreamError::Encode(_))));
}

/// Minimal `Bitstream` used only by [`bitstream_encode_error_propagates`]:
/// every value fails to encode.
struct FailingBitstream;

impl Bitstream for FailingBitstream {
    type Value = ();
    type WriteMappings = ();
    type ReadMappings = ();

    fn write_value(&mut self, _out: &mut BytesMut, _value: &()) -> Result<(), BitstreamError> {
        Err(BitstreamError::Encode(Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "always fails",
        ))))
    }

    fn read_value(&mut self, _buf: &mut Bytes) -> Result<(), BitstreamError> {
        Ok(())
    }

    fn snapshot_write_mappings(&mut self) {}
    fn snapshot_read_mappings(&mut self) {}
    fn persist_write_mappings(&mut self, (): ()) {}
    fn persist_read_mappings(&mut self, (): ()) {}
    fn reset(&mut self) {}
}

/// Wraps [`MemoryBitstream`] with a pending-clear queue, exercising the
/// `take_cleared_shared_objects`/`clear_shared_object` hooks that
/// `MemoryBitstream` itself leaves as no-ops.
#[derive(Default)]
struct ClearingBitstream {
    inner: MemoryBitstream,
    pending_clears: Vec<SharedObjectId>,
}

impl ClearingBitstream {
    fn clear(&mut self, id: SharedObjectId) {
        self.pending_clears.push(id);
    }
}

impl Bitstream for ClearingBitstream {
    type Value = Bytes;
    type WriteMappings = u64;
    type ReadMappings = u64;

    fn write_value(&mut self, out: &mut BytesMut, value: &Bytes) -> Result<(), BitstreamError> {
        self.inner.write_value(out, value)
    }

    fn read_value(&mut self, buf: &mut Bytes) -> Result<Bytes, BitstreamError> {
        self.inner.read_value(buf)
    }

    fn snapshot_write_mappings(&mut self) -> u64 {
        self.inner.snapshot_write_mappings()
    }

    fn snapshot_read_mappings(&mut self) -> u64 {
        self.inner.snapshot_read_mappings()
    }

    fn persist_write_mappings(&mut self, mappings: u64) {
        self.inner.persist_write_mappings(mappings);
    }

    fn persist_read_mappings(&mut self, mappings: u64) {
        self.inner.persist_read_mappings(mappings);
    }

    fn reset(&mut self) {
        self.inner.reset();
    }

    fn take_cleared_shared_objects(&mut self) -> Vec<SharedObjectId> {
        std::mem::take(&mut self.pending_clears)
    }
}

