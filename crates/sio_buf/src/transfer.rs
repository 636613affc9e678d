// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// The outcome of a read or write that moved zero or more bytes.
///
/// A transfer records how many bytes were requested, how many actually moved and whether a read
/// stopped because the source had no more data. End-of-stream is never reported for writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Transfer {
    len: usize,
    requested: usize,
    end_of_stream: bool,
}

impl Transfer {
    /// A transfer of `len` bytes out of `requested`.
    #[must_use]
    pub const fn new(len: usize, requested: usize) -> Self {
        Self {
            len,
            requested,
            end_of_stream: false,
        }
    }

    /// A read of `len` bytes out of `requested` that stopped at the end of the source.
    #[must_use]
    pub const fn end_of_stream(len: usize, requested: usize) -> Self {
        Self {
            len,
            requested,
            end_of_stream: true,
        }
    }

    /// Number of bytes moved.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Number of bytes the caller asked for.
    #[must_use]
    pub const fn requested(&self) -> usize {
        self.requested
    }

    /// Whether no bytes moved.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the read reached the end of its source.
    #[must_use]
    pub const fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Whether every requested byte moved.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.len == self.requested
    }

    /// Whether fewer bytes than requested moved.
    #[must_use]
    pub const fn is_short(&self) -> bool {
        self.len < self.requested
    }

    /// Adds the bytes of a follow-up transfer to this one, keeping the original request size.
    pub const fn absorb(&mut self, other: Self) {
        self.len += other.len;
        self.end_of_stream |= other.end_of_stream;
    }

    /// Combines two consecutive transfers into one covering both requests.
    #[must_use]
    pub const fn chain(self, next: Self) -> Self {
        Self {
            len: self.len + next.len,
            requested: self.requested + next.requested,
            end_of_stream: self.end_of_stream || next.end_of_stream,
        }
    }
}

impl From<Transfer> for usize {
    fn from(value: Transfer) -> Self {
        value.len
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn complete_transfer() {
        let transfer = Transfer::new(10, 10);

        assert!(transfer.is_complete());
        assert!(!transfer.is_short());
        assert!(!transfer.is_end_of_stream());
        assert_eq!(usize::from(transfer), 10);
    }

    #[test]
    fn short_read_at_end() {
        let transfer = Transfer::end_of_stream(3, 64);

        assert!(transfer.is_short());
        assert!(transfer.is_end_of_stream());
        assert_eq!(transfer.requested(), 64);
    }

    #[test]
    fn chain_sums_both_sides() {
        let combined = Transfer::new(4, 4).chain(Transfer::end_of_stream(1, 4));

        assert_eq!(combined.len(), 5);
        assert_eq!(combined.requested(), 8);
        assert!(combined.is_end_of_stream());
    }

    #[test]
    fn absorb_keeps_request() {
        let mut total = Transfer::new(2, 10);
        total.absorb(Transfer::new(3, 8));

        assert_eq!(total.len(), 5);
        assert_eq!(total.requested(), 10);
    }

    #[test]
    fn empty_default() {
        assert!(Transfer::default().is_empty());
        assert!(Transfer::default().is_complete());
    }
}
