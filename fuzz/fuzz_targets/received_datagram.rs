#![no_main]

use bytes::Bytes;
use datagram_sequencer::{DatagramSequencer, MemoryBitstream, SequencerConfig};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut seq = DatagramSequencer::new(SequencerConfig::new(Bytes::new()), MemoryBitstream::new());
    let _ = seq.received_datagram(data, |_middle| {});
});
