use std::fmt;

use bytemuck::Pod;

/// A fixed-size, zero-initialized buffer of trivially-copyable elements.
///
/// A `Slab` is allocated once and never grows. The query interpreter keeps
/// slabs alive inside registers across executions of the same cursor, so
/// repeated queries reuse the allocation instead of touching the allocator
/// every time.
pub struct Slab<T> {
    data: Box<[T]>,
}

impl<T: Pod> Slab<T> {
    /// Allocates a slab with room for exactly `len` elements, all zeroed.
    pub fn alloc(len: usize) -> Self {
        Self {
            data: bytemuck::allocation::zeroed_slice_box(len),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<T> Default for Slab<T> {
    fn default() -> Self {
        Self {
            data: Vec::new().into_boxed_slice(),
        }
    }
}

impl<T: Clone> Clone for Slab<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
        }
    }
}

impl<T> std::ops::Deref for Slab<T> {
    type Target = [T];

    #[inline]
    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> std::ops::DerefMut for Slab<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: fmt::Debug> fmt::Debug for Slab<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.data.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_is_zeroed() {
        let slab = Slab::<u32>::alloc(100);
        assert_eq!(slab.len(), 100);
        assert!(slab.iter().all(|&v| v == 0));
    }

    #[test]
    fn deref_mut_roundtrip() {
        let mut slab = Slab::<u32>::alloc(4);
        slab[0] = 7;
        slab[3] = 42;
        assert_eq!(&*slab, &[7, 0, 0, 42]);
    }

    #[test]
    fn empty() {
        let slab = Slab::<u64>::default();
        assert!(slab.is_empty());
        assert_eq!(slab.len(), 0);
    }
}
