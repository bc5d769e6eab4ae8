#![cfg_attr(any(nightly, docsrs), feature(doc_cfg, doc_auto_cfg))]
#![doc = include_str!("../README.md")]

pub mod bitstream;
pub mod channel;
pub mod circular_buffer;
pub mod config;
pub mod error;
pub mod highprio;
pub mod seq;
pub mod sequencer;
pub mod span_list;
pub mod wire;

pub use bitstream::{Bitstream, MemoryBitstream, SharedObjectId};
pub use config::SequencerConfig;
pub use seq::PacketNumber;
pub use sequencer::{DatagramSequencer, ReceivedPacketEvents};
