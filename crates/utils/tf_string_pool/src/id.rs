use std::fmt;

/// Number of bits encoding the byte offset of an entry inside its block.
const NUM_BLOCK_OFFSET_BITS: u32 = 25;
/// Number of bits encoding the block index.
const NUM_BLOCK_INDEX_BITS: u32 = 6;

const LARGE_STRING_FLAG: u32 = 1 << 31;
const BLOCK_OFFSET_MASK: u32 = (1 << NUM_BLOCK_OFFSET_BITS) - 1;

/// Size of one block arena: the full offset range, 32 MiB.
pub(crate) const BLOCK_SIZE: usize = (BLOCK_OFFSET_MASK + 1) as usize;
/// Maximum number of blocks, bounded by the index bits.
pub(crate) const MAX_BLOCK_COUNT: usize = 1 << NUM_BLOCK_INDEX_BITS;

/// Compact 32-bit key for a string interned in a
/// [`StringPool`](crate::StringPool).
///
/// Layout:
///
/// ```text
/// [31] [30:25] [24:0]
///  |      |       |
///  |      |       +---- offset in block (or LSB of large string index)
///  |      +------------ block index (or MSB of large string index)
///  +------------------- 1: large string, 0: string in a block
/// ```
///
/// The raw value 0 is reserved for [`StringId::NULL`]; the pool never issues
/// it for real content.
#[repr(transparent)]
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
pub struct StringId(u32);

static_assertions::assert_eq_size!(StringId, u32);

impl StringId {
    /// The null string. Not the same thing as an interned `""`.
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Reconstructs an id from its raw value. Only meaningful for values
    /// previously obtained from [`Self::raw`] on the same pool.
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn is_large_string(self) -> bool {
        self.0 & LARGE_STRING_FLAG != 0
    }

    #[inline]
    pub(crate) const fn block_index(self) -> u32 {
        debug_assert!(!self.is_large_string());
        (self.0 & !LARGE_STRING_FLAG) >> NUM_BLOCK_OFFSET_BITS
    }

    #[inline]
    pub(crate) const fn block_offset(self) -> u32 {
        debug_assert!(!self.is_large_string());
        self.0 & BLOCK_OFFSET_MASK
    }

    #[inline]
    pub(crate) const fn large_string_index(self) -> u32 {
        debug_assert!(self.is_large_string());
        self.0 & !LARGE_STRING_FLAG
    }

    #[inline]
    pub(crate) const fn block_string(block_index: u32, offset: u32) -> Self {
        debug_assert!(block_index < MAX_BLOCK_COUNT as u32);
        debug_assert!(offset <= BLOCK_OFFSET_MASK);
        Self((block_index << NUM_BLOCK_OFFSET_BITS) | (offset & BLOCK_OFFSET_MASK))
    }

    #[inline]
    pub(crate) const fn large_string(index: u32) -> Self {
        debug_assert!(index & LARGE_STRING_FLAG == 0);
        Self(LARGE_STRING_FLAG | index)
    }
}

impl nohash_hasher::IsEnabled for StringId {}

impl fmt::Debug for StringId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "StringId(NULL)")
        } else if self.is_large_string() {
            write!(f, "StringId(large {})", self.large_string_index())
        } else {
            write!(
                f,
                "StringId(block {} offset {})",
                self.block_index(),
                self.block_offset()
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_string_round_trip() {
        let id = StringId::block_string(5, 1234);
        assert!(!id.is_null());
        assert!(!id.is_large_string());
        assert_eq!(id.block_index(), 5);
        assert_eq!(id.block_offset(), 1234);
    }

    #[test]
    fn large_string_round_trip() {
        let id = StringId::large_string(42);
        assert!(id.is_large_string());
        assert_eq!(id.large_string_index(), 42);
    }

    #[test]
    fn null_is_block_zero_offset_zero() {
        assert_eq!(StringId::NULL, StringId::block_string(0, 0));
        assert!(StringId::NULL.is_null());
    }

    #[test]
    fn ids_order_by_block_then_offset() {
        assert!(StringId::block_string(0, 10) < StringId::block_string(0, 20));
        assert!(StringId::block_string(0, 20) < StringId::block_string(1, 0));
    }
}
