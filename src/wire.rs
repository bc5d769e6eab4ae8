//! Raw little-endian wire primitives shared by the datagram and packet framing
//! (spec.md §6).
//!
//! Unlike the teacher crate's `octs`-based codecs, every field in this
//! protocol's wire format is a fixed-width `uint32` - there is no varint
//! length-prefixing to deal with, since segment/value payloads are already
//! length-prefixed by the format itself. A tiny set of helpers on top of
//! [`bytes::Buf`]/[`bytes::BufMut`] is all that's needed.

use bytes::{Buf, BufMut};

use crate::seq::PacketNumber;

/// Length in bytes of the `{packet_number, total_size, offset}` header that
/// prefixes every datagram's payload, after the caller's opaque header.
pub const FRAGMENT_HEADER_LEN: usize = 4 * 3;

/// Per-datagram fragment header (spec.md §6, "Datagram wire format").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub packet_number: PacketNumber,
    pub total_size: u32,
    pub offset: u32,
}

impl FragmentHeader {
    pub fn write(self, buf: &mut impl BufMut) {
        self.packet_number.write(buf);
        buf.put_u32_le(self.total_size);
        buf.put_u32_le(self.offset);
    }

    /// Reads a fragment header from `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`None`] if fewer than [`FRAGMENT_HEADER_LEN`] bytes remain.
    pub fn read(buf: &mut impl Buf) -> Option<Self> {
        if buf.remaining() < FRAGMENT_HEADER_LEN {
            return None;
        }
        Some(Self {
            packet_number: PacketNumber::read(buf),
            total_size: buf.get_u32_le(),
            offset: buf.get_u32_le(),
        })
    }
}

/// Reads a `uint32` length prefix, returning [`None`] if not enough bytes
/// remain.
pub fn read_u32(buf: &mut impl Buf) -> Option<u32> {
    if buf.remaining() < 4 {
        return None;
    }
    Some(buf.get_u32_le())
}

pub fn write_u32(buf: &mut impl BufMut, value: u32) {
    buf.put_u32_le(value);
}
