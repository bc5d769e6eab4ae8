//! See [`SpanList`].

/// One run of the list: `unset` bytes followed by `set` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub unset: i64,
    pub set: i64,
}

/// A sorted run-length encoding of which byte offsets in an implicit,
/// infinite stream have been acknowledged or received (spec.md §4.2).
///
/// The list always begins with an `unset` run (possibly zero-length) and
/// never ends with a zero-length `set` run. `offset` values passed to
/// [`SpanList::set`] are relative to the position just past the last fully
/// set prefix, and may be negative (e.g. a stale re-ack of already-consumed
/// bytes) - see [`ReliableSendChannel::span_acknowledged`][chan].
///
/// [chan]: crate::channel::ReliableSendChannel
#[derive(Debug, Clone, Default)]
pub struct SpanList {
    spans: Vec<Span>,
    total_set: i64,
}

impl SpanList {
    /// Creates an empty span list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of bytes marked as set across the whole list.
    #[must_use]
    pub fn total_set(&self) -> i64 {
        self.total_set
    }

    /// Iterates the list's runs in order.
    pub fn spans(&self) -> impl Iterator<Item = Span> + '_ {
        self.spans.iter().copied()
    }

    /// Marks `[offset, offset + length)` as set.
    ///
    /// Returns the *advancement* of the fully-set prefix: if `offset <= 0`
    /// and the new range reaches or crosses the front of the list, this is
    /// how many contiguous bytes at the head are now set (and have been
    /// dropped from the list, since they're now implicitly "before" the new
    /// relative zero). Otherwise returns `0` (spec.md §4.2).
    pub fn set(&mut self, offset: i64, length: i64) -> i64 {
        if length <= 0 {
            return 0;
        }

        if offset <= 0 {
            let intersection = offset + length;
            return if intersection > 0 {
                self.set_spans_from(0, intersection)
            } else {
                0
            };
        }

        let mut position: i64 = 0;
        let mut idx = 0;
        while idx < self.spans.len() {
            position += self.spans[idx].unset;
            if offset <= position {
                let remove = position - offset;
                self.spans[idx].unset -= remove;

                let extra = offset + length - position;
                if extra >= 0 {
                    let amount = self.set_spans_from(idx + 1, extra);
                    self.spans[idx].set += amount;
                    self.total_set += amount;
                } else {
                    let new_span = Span {
                        unset: self.spans[idx].unset,
                        set: length + extra,
                    };
                    self.total_set += new_span.set;
                    self.spans[idx].unset = -extra;
                    self.spans.insert(idx, new_span);
                }
                return 0;
            }

            position += self.spans[idx].set;
            if offset <= position {
                let extra = offset + length - position;
                let amount = self.set_spans_from(idx + 1, extra);
                self.spans[idx].set += amount;
                self.total_set += amount;
                return 0;
            }
            idx += 1;
        }

        self.spans.push(Span {
            unset: offset - position,
            set: length,
        });
        self.total_set += length;
        0
    }

    /// Consumes spans starting at index `from` until `length` bytes worth of
    /// runs have been absorbed, erasing fully-consumed spans and shrinking
    /// the `unset` portion of the one it stops at. Returns
    /// `max(length, total_removed)`: bytes past the last tracked span are
    /// implicitly unset forever, so running off the end of the list still
    /// reports the full requested `length` as consumed.
    fn set_spans_from(&mut self, from: usize, length: i64) -> i64 {
        let mut remaining = length;
        let mut total_removed: i64 = 0;
        let mut idx = from;
        while idx < self.spans.len() {
            let span = self.spans[idx];
            if remaining < span.unset {
                self.spans[idx].unset -= remaining;
                total_removed += remaining;
                break;
            }
            let combined = span.unset + span.set;
            remaining = (remaining - combined).max(0);
            total_removed += combined;
            self.total_set -= span.set;
            self.spans.remove(idx);
        }
        length.max(total_removed)
    }
}
