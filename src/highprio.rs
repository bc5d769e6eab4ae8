//! See [`HighPriorityQueue`].

use std::collections::VecDeque;

use crate::seq::PacketNumber;

/// A pending high-priority message: retransmitted in every outbound packet
/// until the packet it was first attempted in gets acknowledged (spec.md §3).
#[derive(Debug, Clone)]
pub struct HighPriorityMessage<V> {
    pub data: V,
    pub first_packet_number: PacketNumber,
}

/// Send-side bookkeeping for high-priority messages.
///
/// Messages are always appended with a non-decreasing `first_packet_number`
/// (the current outgoing packet number at the time [`HighPriorityQueue::push`]
/// is called), which lets [`HighPriorityQueue::drop_acknowledged_through`]
/// find the prefix to drop by scanning from the back, as the original does.
#[derive(Debug)]
pub struct HighPriorityQueue<V> {
    messages: VecDeque<HighPriorityMessage<V>>,
}

impl<V> Default for HighPriorityQueue<V> {
    fn default() -> Self {
        Self {
            messages: VecDeque::new(),
        }
    }
}

impl<V> HighPriorityQueue<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues a value to be sent with every outbound packet, starting with
    /// `first_packet_number`, until acknowledged.
    pub fn push(&mut self, data: V, first_packet_number: PacketNumber) {
        self.messages.push_back(HighPriorityMessage {
            data,
            first_packet_number,
        });
    }

    /// Number of pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// All currently pending messages, to be re-sent in the next outbound
    /// packet's prologue (spec.md §4.4, `start_packet`).
    pub fn iter(&self) -> impl Iterator<Item = &HighPriorityMessage<V>> {
        self.messages.iter()
    }

    /// Drops every message whose `first_packet_number` is `<= packet_number`:
    /// the peer has now acknowledged a packet that carried it, so it no
    /// longer needs retransmitting (spec.md §4.4, ack effect 3).
    pub fn drop_acknowledged_through(&mut self, packet_number: PacketNumber) {
        let mut cut = None;
        for (i, message) in self.messages.iter().enumerate().rev() {
            if message.first_packet_number <= packet_number {
                cut = Some(i);
                break;
            }
        }
        if let Some(i) = cut {
            self.messages.drain(0..=i);
        }
    }
}
