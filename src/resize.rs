//! Encoding of the resize-control word.
//!
//! The map packs three distinct pieces of state into one signed atomic,
//! `size_ctl`, so that "resize in progress" can be observed and joined
//! without any extra lock:
//!
//! - non-negative: no resize is running. Before the first table exists the
//!   value is the requested initial capacity (0 for the default); afterwards
//!   it is the element count at which the next resize triggers.
//! - `-1`: the initial table is being allocated by some thread.
//! - any other negative value: a transfer is running. The high half holds a
//!   stamp derived from the pre-resize table length, the low half holds
//!   `1 + active_helpers`. The stamp has its top bit set so the packed word
//!   is guaranteed negative.
//!
//! The raw comparisons on the hot paths live in `map`; this module keeps the
//! layout in one place and decodable, so the packing itself can be tested in
//! isolation.

const ISIZE_BITS: usize = std::mem::size_of::<isize>() * 8;

/// Number of bits used for the generation stamp.
pub(crate) const RESIZE_STAMP_BITS: usize = ISIZE_BITS / 2;

/// Shift that moves a stamp into the high half of the control word.
pub(crate) const RESIZE_STAMP_SHIFT: usize = ISIZE_BITS - RESIZE_STAMP_BITS;

/// Maximum number of threads that may help a single transfer. Must fit in
/// the helper-count half of the control word.
pub(crate) const MAX_RESIZERS: isize = (1 << (ISIZE_BITS - RESIZE_STAMP_BITS)) - 1;

/// Returns the stamp identifying a resize episode for a table of length `n`.
///
/// The stamp is unique per length (lengths are powers of two, so their
/// leading-zero counts differ) and has bit `RESIZE_STAMP_BITS - 1` set, so
/// `stamp << RESIZE_STAMP_SHIFT` lands in the sign bit.
pub(crate) fn resize_stamp(n: usize) -> isize {
    n.leading_zeros() as isize | (1 << (RESIZE_STAMP_BITS - 1))
}

/// Decoded view of a `size_ctl` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SizeCtl {
    /// The initial table is being allocated.
    Initializing,
    /// A transfer is running for the episode identified by `stamp`, with
    /// `helpers` threads currently claiming bin ranges.
    Resizing { stamp: isize, helpers: isize },
    /// No resize is running. Holds the requested initial capacity while the
    /// table is unallocated, the next resize threshold afterwards.
    Threshold(isize),
}

impl SizeCtl {
    pub(crate) fn decode(sc: isize) -> Self {
        if sc == -1 {
            SizeCtl::Initializing
        } else if sc < 0 {
            let stamp = (sc >> RESIZE_STAMP_SHIFT) & ((1 << RESIZE_STAMP_BITS) - 1);
            let helpers = (sc & ((1 << RESIZE_STAMP_SHIFT) - 1)) - 1;
            SizeCtl::Resizing { stamp, helpers }
        } else {
            SizeCtl::Threshold(sc)
        }
    }

    #[cfg(test)]
    pub(crate) fn encode(self) -> isize {
        match self {
            SizeCtl::Initializing => -1,
            SizeCtl::Resizing { stamp, helpers } => (stamp << RESIZE_STAMP_SHIFT) + 1 + helpers,
            SizeCtl::Threshold(t) => t,
        }
    }
}
