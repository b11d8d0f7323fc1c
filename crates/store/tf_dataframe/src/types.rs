//! Internal column representation shared by the builders, the planner, and
//! the interpreter.

use tf_containers::{BitVector, FlexVector, Slab};
use tf_string_pool::StringId;

use crate::specs::{DuplicateState, Nullability, SortState, StorageType};

/// Physical storage for one column's values. Read-only after construction.
///
/// Typed access goes through the `uint32()`-style accessors; calling one
/// whose variant doesn't match is a programming error and panics. The
/// planner only emits opcodes whose type parameter matches the column, so a
/// mismatch can only come from a corrupted or mismatched plan.
pub(crate) enum Storage {
    /// The value of row `i` is `i`; no backing array.
    Id { row_count: u32 },
    Uint32(FlexVector<u32>),
    Int32(FlexVector<i32>),
    Int64(FlexVector<i64>),
    Double(FlexVector<f64>),
    String(FlexVector<StringId>),
}

impl Storage {
    pub fn storage_type(&self) -> StorageType {
        match self {
            Self::Id { .. } => StorageType::Id,
            Self::Uint32(_) => StorageType::Uint32,
            Self::Int32(_) => StorageType::Int32,
            Self::Int64(_) => StorageType::Int64,
            Self::Double(_) => StorageType::Double,
            Self::String(_) => StorageType::String,
        }
    }

    /// Number of physical slots (row count for `Id`).
    pub fn len(&self) -> usize {
        match self {
            Self::Id { row_count } => *row_count as usize,
            Self::Uint32(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::String(v) => v.len(),
        }
    }

    pub fn uint32(&self) -> &[u32] {
        match self {
            Self::Uint32(v) => v.as_slice(),
            _ => unreachable!("expected Uint32 storage, found {:?}", self.storage_type()),
        }
    }

    pub fn int32(&self) -> &[i32] {
        match self {
            Self::Int32(v) => v.as_slice(),
            _ => unreachable!("expected Int32 storage, found {:?}", self.storage_type()),
        }
    }

    pub fn int64(&self) -> &[i64] {
        match self {
            Self::Int64(v) => v.as_slice(),
            _ => unreachable!("expected Int64 storage, found {:?}", self.storage_type()),
        }
    }

    pub fn double(&self) -> &[f64] {
        match self {
            Self::Double(v) => v.as_slice(),
            _ => unreachable!("expected Double storage, found {:?}", self.storage_type()),
        }
    }

    pub fn string(&self) -> &[StringId] {
        match self {
            Self::String(v) => v.as_slice(),
            _ => unreachable!("expected String storage, found {:?}", self.storage_type()),
        }
    }
}

/// Optional null-presence overlay for one column. Read-only after
/// construction.
pub(crate) enum NullStorage {
    NonNull,
    /// Storage holds only non-null values; `bit_vector` has one presence
    /// bit per row. Row→storage index translation uses popcounts, optionally
    /// accelerated by a table precomputed at build time.
    SparseNull {
        bit_vector: BitVector,
        prefix_popcount: Option<Slab<u32>>,
    },
    /// Storage holds a slot for every row; null slots have unspecified
    /// contents.
    DenseNull { bit_vector: BitVector },
}

impl NullStorage {
    pub fn nullability(&self) -> Nullability {
        match self {
            Self::NonNull => Nullability::NonNull,
            Self::SparseNull { .. } => Nullability::SparseNull,
            Self::DenseNull { .. } => Nullability::DenseNull,
        }
    }

    pub fn bit_vector(&self) -> Option<&BitVector> {
        match self {
            Self::NonNull => None,
            Self::SparseNull { bit_vector, .. } | Self::DenseNull { bit_vector } => {
                Some(bit_vector)
            }
        }
    }
}

/// A complete column: storage, overlay, sort state, duplicate knowledge.
pub(crate) struct Column {
    pub storage: Storage,
    pub nulls: NullStorage,
    pub sort_state: SortState,
    pub duplicates: DuplicateState,
}

impl Column {
    /// Debug-mode consistency check of the storage/overlay invariants.
    pub fn check_invariants(&self, row_count: u32) {
        match &self.nulls {
            NullStorage::NonNull => {
                debug_assert_eq!(self.storage.len(), row_count as usize);
            }
            NullStorage::SparseNull { bit_vector, .. } => {
                debug_assert_eq!(bit_vector.len(), row_count as usize);
                debug_assert_eq!(self.storage.len(), bit_vector.count_set_bits());
                debug_assert_eq!(self.sort_state, SortState::Unsorted);
            }
            NullStorage::DenseNull { bit_vector } => {
                debug_assert_eq!(bit_vector.len(), row_count as usize);
                debug_assert_eq!(self.storage.len(), row_count as usize);
                debug_assert_eq!(self.sort_state, SortState::Unsorted);
            }
        }
        if matches!(self.storage, Storage::Id { .. }) {
            debug_assert_eq!(self.nulls.nullability(), Nullability::NonNull);
        }
    }
}

/// A half-open interval `[b, e)` of row indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Range {
    pub b: u32,
    pub e: u32,
}

impl Range {
    #[inline]
    pub fn len(&self) -> u32 {
        self.e - self.b
    }
}

/// A window into the index slab held by another register.
///
/// `b`/`e` are element offsets within that slab, which keeps spans plain
/// data: they serialize with the plan and stay valid however often the
/// backing slab register is re-populated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Span {
    /// Register index of the backing `Slab<u32>`.
    pub slab: u32,
    pub b: u32,
    pub e: u32,
}

impl Span {
    #[inline]
    pub fn len(&self) -> u32 {
        self.e - self.b
    }
}

/// Outcome of coercing a caller-supplied filter value to a column type.
///
/// `NoneMatch`/`AllMatch` are not errors: they collapse the predicate to
/// "keep nothing" / "keep everything" and execution continues.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CastFilterValueResult {
    Valid(CastValue),
    NoneMatch,
    AllMatch,
}

/// A filter value successfully coerced to a column's comparison domain.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum CastValue {
    Id(u32),
    Uint32(u32),
    Int32(i32),
    Int64(i64),
    Double(f64),
    /// An interned needle for string equality.
    StringId(StringId),
    /// A raw needle for string ordering, glob, and regex operators.
    Str(String),
}

impl CastValue {
    pub fn as_id(&self) -> u32 {
        match self {
            Self::Id(v) => *v,
            _ => unreachable!("expected Id cast value"),
        }
    }

    pub fn as_uint32(&self) -> u32 {
        match self {
            Self::Uint32(v) => *v,
            _ => unreachable!("expected Uint32 cast value"),
        }
    }

    pub fn as_int32(&self) -> i32 {
        match self {
            Self::Int32(v) => *v,
            _ => unreachable!("expected Int32 cast value"),
        }
    }

    pub fn as_int64(&self) -> i64 {
        match self {
            Self::Int64(v) => *v,
            _ => unreachable!("expected Int64 cast value"),
        }
    }

    pub fn as_double(&self) -> f64 {
        match self {
            Self::Double(v) => *v,
            _ => unreachable!("expected Double cast value"),
        }
    }
}
