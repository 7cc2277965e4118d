//! Bit-packed (count, color) encoding for the strong reference counter.
//!
//! A control block's strong counter is a single machine word: the reference
//! count lives in the high bits, a two-bit color tag in the low bits. The
//! collector manipulates pointer colors while mutators manipulate counts,
//! both through CAS on the same word, which is what makes red promotion
//! (RED -> GREY on a concurrent acquire) atomic with the increment.
//!
//! Color transition rules:
//! - Red promotion happens whenever a RED block's count goes 0 -> 1.
//! - Red demotion (-> RED) is performed only by the collector's mark phase.
//! - Only the collector turns blocks BLACK, and only BLACK blocks have
//!   their payload destroyed.
//! - A count transition 1 -> 0 must be followed by a collection request on
//!   the block's generation, unless the block is provably still reachable.

/// Color of a control block, as seen by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub(crate) enum Color {
    /// Not strongly reachable; may or may not be reachable.
    Red = 0,
    /// Unreachable; payload destroyed or about to be.
    Black = 1,
    /// Reachable; outgoing edges not yet processed by the collector.
    Grey = 2,
    /// Reachable; outgoing edges processed (or no collection running).
    White = 3,
}

/// Number of low bits used by the color tag.
pub(crate) const COLOR_SHIFT: u32 = 2;

/// Mask extracting the color tag from a counter word.
pub(crate) const COLOR_MASK: usize = (1 << COLOR_SHIFT) - 1;

/// One strong reference, as an addend for the packed word.
pub(crate) const ONE_REF: usize = 1 << COLOR_SHIFT;

/// Extract the reference count from a packed word.
#[inline]
pub(crate) const fn refs(word: usize) -> usize {
    word >> COLOR_SHIFT
}

/// Extract the color from a packed word.
#[inline]
pub(crate) const fn color(word: usize) -> Color {
    match word & COLOR_MASK {
        0 => Color::Red,
        1 => Color::Black,
        2 => Color::Grey,
        _ => Color::White,
    }
}

/// Pack a reference count and a color into one word.
#[inline]
pub(crate) const fn pack(nrefs: usize, c: Color) -> usize {
    (nrefs << COLOR_SHIFT) | c as usize
}

/// The color invariant: a positive count implies WHITE or GREY, and BLACK
/// implies a zero count.
#[inline]
pub(crate) const fn color_invariant(word: usize) -> bool {
    (refs(word) == 0 || matches!(color(word), Color::White | Color::Grey))
        && (!matches!(color(word), Color::Black) || refs(word) == 0)
}
