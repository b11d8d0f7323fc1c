//! Process-wide deduplication of identical dataframes.

use std::collections::HashMap;
use std::hash::BuildHasher as _;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::dataframe::Dataframe;

/// Identifies a dataframe *before* it is created.
///
/// Tags hash the identity inputs of a table (e.g. module plus table name)
/// so that engines on different threads can discover each other's work.
/// Frames that should never be shared get a [`Tag::unique`] one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Tag {
    hash: u64,
}

impl Tag {
    /// Tag for a table defined by a named module.
    pub fn for_module_table(module_name: &str, table_name: &str) -> Self {
        Self {
            hash: tag_hasher().hash_one((module_name, table_name)),
        }
    }

    /// Tag for a process-global static table.
    pub fn for_static_table(table_name: &str) -> Self {
        Self {
            hash: tag_hasher().hash_one(table_name),
        }
    }

    /// A tag no other caller can collide with, for frames that are stored
    /// only for uniformity and never shared.
    pub fn unique() -> Self {
        Self {
            hash: rand::random::<u64>(),
        }
    }
}

/// The tag space must be stable across threads for the lifetime of the
/// process, so the hasher seed is process-global.
fn tag_hasher() -> &'static ahash::RandomState {
    static STATE: OnceLock<ahash::RandomState> = OnceLock::new();
    STATE.get_or_init(ahash::RandomState::new)
}

/// A weak map from [`Tag`] to shared [`Dataframe`], so identical large
/// tables are not duplicated across engine instances.
///
/// The map holds only [`Weak`] handles: dropping the last `Arc` outside
/// frees the frame, and its entry is revived or replaced on the next
/// insert. Thread-safe; the single mutex covers only lookup and weak
/// promotion.
///
/// ```
/// # use std::sync::Arc;
/// # use tf_dataframe::{Dataframe, DataframeSharedStorage, StringPool, Tag};
/// let storage = DataframeSharedStorage::global();
/// let tag = Tag::for_static_table("threads");
/// let df = match storage.find(tag) {
///     Some(df) => df,
///     None => storage.insert(tag, Dataframe::with_specs(vec![], Arc::new(StringPool::new()))),
/// };
/// # drop(df);
/// ```
#[derive(Default)]
pub struct DataframeSharedStorage {
    frames: Mutex<HashMap<u64, Weak<Dataframe>, ahash::RandomState>>,
}

impl DataframeSharedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide instance, initialized on first use.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<DataframeSharedStorage> = OnceLock::new();
        GLOBAL.get_or_init(Self::new)
    }

    /// Returns the live dataframe for `tag`, if any.
    pub fn find(&self, tag: Tag) -> Option<Arc<Dataframe>> {
        let frames = self.frames.lock();
        frames.get(&tag.hash).and_then(Weak::upgrade)
    }

    /// Publishes `df` under `tag`, or returns the frame another thread won
    /// the race with. The returned handle is what callers must use.
    pub fn insert(&self, tag: Tag, df: Dataframe) -> Arc<Dataframe> {
        let shared = Arc::new(df);
        let mut frames = self.frames.lock();
        match frames.get(&tag.hash).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                frames.insert(tag.hash, Arc::downgrade(&shared));
                shared
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StringPool;

    fn frame() -> Dataframe {
        Dataframe::with_specs(vec![], Arc::new(StringPool::new()))
    }

    #[test]
    fn insert_then_find() {
        let storage = DataframeSharedStorage::new();
        let tag = Tag::for_module_table("sched", "slices");
        assert!(storage.find(tag).is_none());

        let df = storage.insert(tag, frame());
        let found = storage.find(tag).expect("inserted");
        assert!(Arc::ptr_eq(&df, &found));
    }

    #[test]
    fn insert_race_returns_existing() {
        let storage = DataframeSharedStorage::new();
        let tag = Tag::for_static_table("threads");
        let first = storage.insert(tag, frame());
        let second = storage.insert(tag, frame());
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn entries_are_weak() {
        let storage = DataframeSharedStorage::new();
        let tag = Tag::for_static_table("threads");
        let df = storage.insert(tag, frame());
        drop(df);
        assert!(storage.find(tag).is_none());

        // A dead entry is replaced by a later insert.
        let revived = storage.insert(tag, frame());
        assert!(storage.find(tag).is_some());
        drop(revived);
    }

    #[test]
    fn tags_are_deterministic_within_a_process() {
        assert_eq!(
            Tag::for_module_table("sched", "slices"),
            Tag::for_module_table("sched", "slices")
        );
        assert_ne!(
            Tag::for_module_table("sched", "slices"),
            Tag::for_module_table("sched", "threads")
        );
        assert_ne!(Tag::unique(), Tag::unique());
    }
}
