//! A string interning pool issuing compact 32-bit ids.
//!
//! Columns never store strings directly: they store [`StringId`]s pointing
//! into a [`StringPool`] owned by the engine. Interning the same content
//! twice returns the same id, ids are stable for the lifetime of the pool,
//! and both directions of the mapping are O(1).
//!
//! The pool is monotonic by design — it never shrinks and never rewrites an
//! entry — which is what makes it safe to hand out `&str` views that outlive
//! the internal lock: block arenas and large-string buffers are never moved
//! or freed while the pool is alive.

mod id;

pub use self::id::StringId;

use std::collections::HashMap;
use std::hash::BuildHasher as _;
use std::ptr;

use nohash_hasher::BuildNoHashHasher;
use parking_lot::RwLock;

use self::id::{BLOCK_SIZE, MAX_BLOCK_COUNT};

/// Strings at least this long bypass the block arenas and get their own
/// heap buffer. Keeps huge one-off strings from wasting block space.
const MIN_LARGE_STRING_SIZE: usize = BLOCK_SIZE / 8;

/// One 32-MiB append-only arena.
///
/// Entries are laid out back to back as `[varint(len)][bytes][NUL]`. The
/// base pointer is captured once at allocation; all reads and writes go
/// through it so published bytes are never re-borrowed.
struct Block {
    /// Owns the allocation. Never accessed directly after construction.
    #[allow(dead_code)]
    storage: Box<[u8]>,
    base: *mut u8,
    pos: u32,
}

// SAFETY: a `Block` exclusively owns its allocation; `base` is merely a
// cached pointer into `storage`, which is never moved or freed while the
// block is alive.
#[expect(unsafe_code)]
unsafe impl Send for Block {}
// SAFETY: see above; shared access only ever reads bytes below `pos`, which
// are immutable once written.
#[expect(unsafe_code)]
unsafe impl Sync for Block {}

impl Block {
    fn new() -> Self {
        let mut storage = bytemuck::allocation::zeroed_slice_box::<u8>(BLOCK_SIZE);
        let base = storage.as_mut_ptr();
        Self {
            storage,
            base,
            pos: 0,
        }
    }

    /// Room left for an entry of `len` bytes plus metadata?
    fn fits(&self, len: usize) -> bool {
        self.pos as usize + varint_len(len as u32) + len + 1 <= BLOCK_SIZE
    }

    /// Appends `[varint(len)][bytes][NUL]` and returns the entry's offset.
    #[expect(unsafe_code)]
    fn append(&mut self, s: &str) -> u32 {
        debug_assert!(self.fits(s.len()));
        let offset = self.pos;
        let mut meta = [0u8; 5];
        let meta_len = encode_varint(s.len() as u32, &mut meta);
        // SAFETY: `fits` guarantees the whole entry lies inside the block's
        // allocation, and nothing below `pos` is ever rewritten, so this only
        // touches bytes no reader has been handed a view of.
        unsafe {
            let dst = self.base.add(offset as usize);
            ptr::copy_nonoverlapping(meta.as_ptr(), dst, meta_len);
            ptr::copy_nonoverlapping(s.as_ptr(), dst.add(meta_len), s.len());
            *dst.add(meta_len + s.len()) = 0;
        }
        self.pos += (meta_len + s.len() + 1) as u32;
        offset
    }

    /// Decodes the entry at `offset`, returning its payload pointer/length.
    #[expect(unsafe_code)]
    fn entry(&self, offset: u32) -> (*const u8, usize) {
        debug_assert!(offset < self.pos);
        // SAFETY: `offset` points at a previously appended entry, so a valid
        // varint and payload follow it within the allocation.
        unsafe {
            let mut p = self.base.add(offset as usize).cast_const();
            let mut len = 0u32;
            let mut shift = 0u32;
            loop {
                let byte = *p;
                p = p.add(1);
                len |= u32::from(byte & 0x7f) << shift;
                if byte & 0x80 == 0 {
                    break;
                }
                shift += 7;
            }
            (p, len as usize)
        }
    }

    /// Byte length of the entry starting at `offset` (metadata included).
    fn entry_size(&self, offset: u32) -> u32 {
        let (_, len) = self.entry(offset);
        (varint_len(len as u32) + len + 1) as u32
    }
}

fn varint_len(value: u32) -> usize {
    match value {
        0..=0x7f => 1,
        0x80..=0x3fff => 2,
        0x4000..=0x1f_ffff => 3,
        0x20_0000..=0xfff_ffff => 4,
        _ => 5,
    }
}

fn encode_varint(mut value: u32, out: &mut [u8; 5]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out[i] = byte;
            return i + 1;
        }
        out[i] = byte | 0x80;
        i += 1;
    }
}

#[derive(Default)]
struct Inner {
    blocks: Vec<Block>,
    /// Strings too large for a block, each in its own stable heap buffer.
    large_strings: Vec<Box<str>>,
    /// Content hash -> id. Append-only: an entry, once written, is never
    /// overwritten, so an id handed out stays correct forever. The key is
    /// the full 64-bit content hash; the bytes themselves are re-verified
    /// against the stored content on every insert hit.
    index: HashMap<u64, StringId, BuildNoHashHasher<u64>>,
}

impl Inner {
    fn view(&self, id: StringId) -> (*const u8, usize) {
        if id.is_large_string() {
            let s = &self.large_strings[id.large_string_index() as usize];
            (s.as_ptr(), s.len())
        } else {
            self.blocks[id.block_index() as usize].entry(id.block_offset())
        }
    }

    fn insert(&mut self, s: &str) -> StringId {
        if s.len() >= MIN_LARGE_STRING_SIZE {
            let index = self.large_strings.len() as u32;
            self.large_strings.push(Box::from(s));
            return StringId::large_string(index);
        }
        if !self.blocks.last().is_some_and(|b| b.fits(s.len())) {
            if self.blocks.len() >= MAX_BLOCK_COUNT {
                panic!(
                    "string pool exhausted: the bytes consumed by unique interned strings \
                     exceeded the maximum of {} blocks ({} MiB). The trace contains an \
                     unreasonable number of distinct strings.",
                    MAX_BLOCK_COUNT,
                    (MAX_BLOCK_COUNT * BLOCK_SIZE) / (1024 * 1024),
                );
            }
            self.blocks.push(Block::new());
        }
        let block_index = (self.blocks.len() - 1) as u32;
        let offset = self.blocks.last_mut().expect("just ensured").append(s);
        StringId::block_string(block_index, offset)
    }
}

/// Interns immutable strings and hands out compact [`StringId`]s which can
/// be used to retrieve the string in O(1).
///
/// May be shared across threads: the insert path takes an internal write
/// lock, lookups take a read lock, and [`Self::get`] returns views that
/// remain valid for the pool's entire lifetime regardless of later inserts.
pub struct StringPool {
    hasher: ahash::RandomState,
    inner: RwLock<Inner>,
}

static_assertions::assert_impl_all!(StringPool: Send, Sync);

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StringPool {
    pub fn new() -> Self {
        let mut inner = Inner::default();
        // Reserve block 0, offset 0 for the null string so that no real
        // string is ever issued the raw id 0.
        let mut block = Block::new();
        block.append("");
        inner.blocks.push(block);
        Self {
            hasher: ahash::RandomState::new(),
            inner: RwLock::new(inner),
        }
    }

    /// Interns `s`, returning an id such that [`Self::get`] yields the same
    /// bytes. Interning the same content twice returns the same id.
    pub fn intern(&self, s: &str) -> StringId {
        let hash = self.hasher.hash_one(s);
        let mut inner = self.inner.write();
        if let Some(&id) = inner.index.get(&hash) {
            debug_assert_eq!(self.view_str(&inner, id), s);
            return id;
        }
        let id = inner.insert(s);
        inner.index.insert(hash, id);
        id
    }

    /// Returns the id of `s` if it has already been interned. Pure read.
    pub fn lookup(&self, s: &str) -> Option<StringId> {
        let hash = self.hasher.hash_one(s);
        let inner = self.inner.read();
        let id = inner.index.get(&hash).copied();
        if let Some(id) = id {
            debug_assert_eq!(self.view_str(&inner, id), s);
        }
        id
    }

    /// Retrieves the string for `id`.
    ///
    /// `get(StringId::NULL)` returns an empty view; use
    /// [`StringId::is_null`] to distinguish it from an interned `""`.
    ///
    /// The returned view stays valid for the pool's lifetime: blocks and
    /// large-string buffers are never relocated.
    #[expect(unsafe_code)]
    pub fn get(&self, id: StringId) -> &str {
        if id.is_null() {
            return "";
        }
        let inner = self.inner.read();
        let (ptr, len) = inner.view(id);
        // SAFETY: the bytes live in a block arena or large-string buffer
        // that is never moved, freed, or rewritten while `self` is alive, so
        // extending the view past the lock guard is sound. The bytes were
        // copied verbatim from a `&str`, so they are valid UTF-8.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr, len)) }
    }

    /// Number of interned strings (the null string doesn't count).
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` once for every interned string, in insertion order within
    /// each storage class (block strings first, then large strings).
    pub fn for_each(&self, mut f: impl FnMut(StringId, &str)) {
        // Snapshot the iteration bounds, then walk without holding the lock:
        // entries below these bounds are immutable.
        let (block_positions, large_count) = {
            let inner = self.inner.read();
            let positions: Vec<u32> = inner.blocks.iter().map(|b| b.pos).collect();
            (positions, inner.large_strings.len() as u32)
        };
        for (block_index, &end) in block_positions.iter().enumerate() {
            // Skip the reserved null entry at the very start of block 0.
            let mut offset = if block_index == 0 { 2 } else { 0 };
            while offset < end {
                let id = StringId::block_string(block_index as u32, offset);
                f(id, self.get(id));
                let inner = self.inner.read();
                let size = inner.blocks[block_index].entry_size(offset);
                drop(inner);
                offset += size;
            }
        }
        for index in 0..large_count {
            let id = StringId::large_string(index);
            f(id, self.get(id));
        }
    }

    /// The largest block-string id issued so far. Every block string in the
    /// pool compares `<=` to this.
    pub fn max_small_string_id(&self) -> StringId {
        let inner = self.inner.read();
        let last = inner.blocks.len() - 1;
        StringId::block_string(last as u32, inner.blocks[last].pos)
    }

    /// Whether at least one string went to the large-string side vector.
    pub fn has_large_strings(&self) -> bool {
        !self.inner.read().large_strings.is_empty()
    }

    #[expect(unsafe_code)]
    fn view_str<'a>(&'a self, inner: &Inner, id: StringId) -> &'a str {
        let (ptr, len) = inner.view(id);
        // SAFETY: same invariants as `get`.
        unsafe { std::str::from_utf8_unchecked(std::slice::from_raw_parts(ptr, len)) }
    }
}

impl std::fmt::Debug for StringPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("StringPool")
            .field("strings", &inner.index.len())
            .field("blocks", &inner.blocks.len())
            .field("large_strings", &inner.large_strings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intern_is_idempotent() {
        let pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("hello");
        assert_eq!(a, b);
        assert_eq!(pool.get(a), "hello");
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn distinct_strings_get_distinct_ids() {
        let pool = StringPool::new();
        let a = pool.intern("hello");
        let b = pool.intern("world");
        assert_ne!(a, b);
        assert_eq!(pool.get(a), "hello");
        assert_eq!(pool.get(b), "world");
    }

    #[test]
    fn empty_string_is_not_null() {
        let pool = StringPool::new();
        let empty = pool.intern("");
        assert!(!empty.is_null());
        assert_eq!(pool.get(empty), "");
        assert_eq!(pool.get(StringId::NULL), "");
    }

    #[test]
    fn lookup_does_not_intern() {
        let pool = StringPool::new();
        assert_eq!(pool.lookup("missing"), None);
        let id = pool.intern("present");
        assert_eq!(pool.lookup("present"), Some(id));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn large_strings_round_trip() {
        let pool = StringPool::new();
        let big = "x".repeat(MIN_LARGE_STRING_SIZE + 1);
        let id = pool.intern(&big);
        assert!(id.is_large_string());
        assert_eq!(pool.get(id), big);
        assert!(pool.has_large_strings());

        // Still deduplicated.
        assert_eq!(pool.intern(&big), id);
    }

    #[test]
    fn views_survive_later_inserts() {
        let pool = StringPool::new();
        let id = pool.intern("stable");
        let view = pool.get(id);
        for i in 0..10_000 {
            pool.intern(&format!("filler-{i}"));
        }
        assert_eq!(view, "stable");
    }

    #[test]
    fn for_each_yields_every_string_once() {
        let pool = StringPool::new();
        let mut expected = std::collections::BTreeSet::new();
        for i in 0..100 {
            let s = format!("string-{i}");
            pool.intern(&s);
            expected.insert(s);
        }
        // Interning twice must not duplicate.
        pool.intern("string-0");

        let mut seen = std::collections::BTreeSet::new();
        pool.for_each(|id, s| {
            assert!(!id.is_null());
            assert!(seen.insert(s.to_owned()), "duplicate: {s}");
        });
        assert_eq!(seen, expected);
    }

    #[test]
    fn max_small_string_id_bounds_block_strings() {
        let pool = StringPool::new();
        let a = pool.intern("a");
        let b = pool.intern("b");
        let max = pool.max_small_string_id();
        assert!(a < max);
        assert!(b < max);
    }

    #[test]
    fn concurrent_interning_converges() {
        use std::sync::Arc;
        let pool = Arc::new(StringPool::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    (0..1000)
                        .map(|i| pool.intern(&format!("shared-{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<Vec<StringId>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(pool.len(), 1000);
    }
}
