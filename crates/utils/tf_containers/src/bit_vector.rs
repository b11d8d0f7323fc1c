use std::fmt;

use crate::{FlexVector, Slab};

/// A packed bitmap storing 64 bits per word.
///
/// The engine uses bit vectors as null-presence overlays: bit `i` says
/// whether row `i` holds a value. The operations that matter are therefore
/// not generic bit twiddling but the three things the query path needs:
///
/// * appending while a column is being built ([`Self::push`]);
/// * bulk-filtering a buffer of row indices by their bit
///   ([`Self::pack_left`] and friends);
/// * translating row indices to storage indices via popcounts
///   ([`Self::prefix_popcount`] + [`Self::count_set_bits_before_in_word`]).
///
/// Invariant: bits at positions `>= len` are always zero, so whole-word
/// popcounts never see garbage.
#[derive(Default, Clone)]
pub struct BitVector {
    words: FlexVector<u64>,
    len: usize,
}

impl BitVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// A bit vector of `len` bits, all set.
    ///
    /// Used when the first null value of a column arrives after `len`
    /// non-null rows: every existing row is present, the null itself is
    /// pushed by the caller.
    pub fn with_len_all_set(len: usize) -> Self {
        let word_count = len.div_ceil(64);
        let mut words = FlexVector::with_len(word_count);
        words.as_mut_slice().fill(u64::MAX);
        if len % 64 != 0 {
            words[word_count - 1] = (1u64 << (len % 64)) - 1;
        }
        Self { words, len }
    }

    #[inline]
    pub fn push(&mut self, bit: bool) {
        if self.len % 64 == 0 {
            self.words.push(0);
        }
        self.words[self.len / 64] |= u64::from(bit) << (self.len % 64);
        self.len += 1;
    }

    /// Appends `count` copies of `bit`.
    pub fn push_n(&mut self, bit: bool, count: usize) {
        // Fill word by word rather than bit by bit; repeated pushes are the
        // common shape for run-length encoded column data.
        let mut remaining = count;
        while remaining > 0 {
            if self.len % 64 == 0 {
                self.words.push(0);
            }
            let offset = self.len % 64;
            let in_word = (64 - offset).min(remaining);
            if bit {
                let mask = if in_word == 64 {
                    u64::MAX
                } else {
                    ((1u64 << in_word) - 1) << offset
                };
                self.words[self.len / 64] |= mask;
            }
            self.len += in_word;
            remaining -= in_word;
        }
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / 64] |= 1u64 << (i % 64);
    }

    #[inline]
    pub fn clear(&mut self, i: usize) {
        debug_assert!(i < self.len);
        self.words[i / 64] &= !(1u64 << (i % 64));
    }

    #[inline]
    pub fn is_set(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        (self.words[i / 64] >> (i % 64)) & 1 != 0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total number of set bits.
    pub fn count_set_bits(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.count_ones() as usize)
            .sum()
    }

    /// Popcount of the bits strictly below `i` within the word containing
    /// `i`.
    ///
    /// Combined with the per-word prefix sums from [`Self::prefix_popcount`]
    /// this gives the rank of bit `i` in O(1), which is how sparse-null row
    /// indices are translated to storage indices.
    #[inline]
    pub fn count_set_bits_before_in_word(&self, i: usize) -> usize {
        debug_assert!(i < self.len);
        let mask = (1u64 << (i % 64)) - 1;
        (self.words[i / 64] & mask).count_ones() as usize
    }

    /// Per-word prefix sums of set bits: entry `w` is the number of set bits
    /// in all words before `w`.
    pub fn prefix_popcount(&self) -> Slab<u32> {
        let word_count = self.len.div_ceil(64);
        let mut res = Slab::<u32>::alloc(word_count);
        let mut accum = 0u32;
        for w in 0..word_count {
            res[w] = accum;
            accum += self.words[w].count_ones();
        }
        res
    }

    /// Copies every index from `source` whose bit is set (unset when
    /// `invert`) to the front of `dest`. Returns the number of indices kept.
    pub fn pack_left(&self, source: &[u32], dest: &mut [u32], invert: bool) -> usize {
        let mut written = 0;
        for &idx in source {
            dest[written] = idx;
            let keep = self.is_set(idx as usize) ^ invert;
            written += keep as usize;
        }
        written
    }

    /// In-place [`Self::pack_left`]: filters `buf` down to the indices whose
    /// bit matches, preserving order. Returns the new length.
    pub fn pack_left_in_place(&self, buf: &mut [u32], invert: bool) -> usize {
        let mut written = 0;
        for read in 0..buf.len() {
            let idx = buf[read];
            buf[written] = idx;
            let keep = self.is_set(idx as usize) ^ invert;
            written += keep as usize;
        }
        written
    }
}

impl fmt::Debug for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitVector[{} bits, {} set]", self.len, self.count_set_bits())
    }
}
