//! Public specifications describing columns and filter predicates.

/// Physical representation of a column's values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StorageType {
    /// Pseudo-storage: the value of row `i` **is** `i`. Zero memory
    /// overhead; operations on such columns short-circuit to range
    /// arithmetic.
    Id,
    Uint32,
    Int32,
    Int64,
    Double,
    /// Dense vector of [`tf_string_pool::StringId`]s into the frame's pool.
    String,
}

impl StorageType {
    /// Dense index used for arithmetic opcode computation.
    #[inline]
    pub(crate) fn index(self) -> u32 {
        match self {
            Self::Id => 0,
            Self::Uint32 => 1,
            Self::Int32 => 2,
            Self::Int64 => 3,
            Self::Double => 4,
            Self::String => 5,
        }
    }

    #[inline]
    pub(crate) fn from_index(index: u32) -> Self {
        match index {
            0 => Self::Id,
            1 => Self::Uint32,
            2 => Self::Int32,
            3 => Self::Int64,
            4 => Self::Double,
            5 => Self::String,
            _ => unreachable!("invalid storage type index {index}"),
        }
    }

    #[inline]
    pub fn is_string(self) -> bool {
        self == Self::String
    }
}

/// What the column's physical ordering guarantees.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SortState {
    /// `data[i] == i` for every row. Only meaningful for [`StorageType::Id`]
    /// columns.
    IdSorted,
    /// The first occurrence of value `v` sits at row `v`; equal values form
    /// contiguous runs. Only meaningful for non-null `Uint32` columns.
    SetIdSorted,
    /// Values are non-decreasing.
    Sorted,
    Unsorted,
}

/// Whether and how a column stores NULLs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Nullability {
    /// No overlay; every row has a value.
    NonNull,
    /// Presence bitvector; storage holds only the non-null values. Reads go
    /// through a popcount-based index translation.
    SparseNull,
    /// Presence bitvector; storage holds a slot for every row, null slots
    /// have unspecified contents.
    DenseNull,
}

/// Whether a column is known to be duplicate-free.
///
/// Computed by the ad-hoc builder's size-gated duplicate filter; the check
/// is conservative, so `HasDuplicates` really means "not proven
/// duplicate-free".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DuplicateState {
    HasDuplicates,
    NoDuplicates,
}

/// Filter operator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    IsNull,
    IsNotNull,
    /// Shell wildcard match (`*`, `?`, character classes). Strings only.
    Glob,
    /// Regular expression search. Strings only; availability is a
    /// compile-time feature.
    Regex,
}

impl Op {
    /// Dense index of the six comparison operators, used for arithmetic
    /// opcode computation. Preconditioned on `self` being a comparison.
    #[inline]
    pub(crate) fn comparison_index(self) -> u32 {
        match self {
            Self::Eq => 0,
            Self::Ne => 1,
            Self::Lt => 2,
            Self::Le => 3,
            Self::Gt => 4,
            Self::Ge => 5,
            _ => unreachable!("{self:?} is not a comparison operator"),
        }
    }

    /// Dense index of the string operators (comparisons plus `Glob` and
    /// `Regex`).
    #[inline]
    pub(crate) fn string_index(self) -> u32 {
        match self {
            Self::Glob => 6,
            Self::Regex => 7,
            _ => self.comparison_index(),
        }
    }

    #[inline]
    pub fn is_null_op(self) -> bool {
        matches!(self, Self::IsNull | Self::IsNotNull)
    }

    #[inline]
    pub fn is_inequality(self) -> bool {
        matches!(self, Self::Lt | Self::Le | Self::Gt | Self::Ge)
    }

    /// Operators a binary search over sorted storage can serve.
    #[inline]
    pub(crate) fn is_range_op(self) -> bool {
        self == Self::Eq || self.is_inequality()
    }

    /// Operators applicable to non-string storage.
    #[inline]
    pub(crate) fn is_comparison(self) -> bool {
        self == Self::Eq || self == Self::Ne || self.is_inequality()
    }
}

/// A filter predicate to be applied to column data.
///
/// Callers construct these from their own predicate representation (e.g.
/// SQLite `xBestIndex` constraints) and hand them to
/// [`Dataframe::plan_query`](crate::Dataframe::plan_query). Planning
/// reorders the list and fills in [`Self::value_index`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilterSpec {
    /// Index of the column in the dataframe to filter.
    pub column_index: u32,

    /// Original index from the client query, untouched by planning. Lets
    /// the caller map the reordered specs back to its own structures.
    pub source_index: u32,

    /// Operator to apply.
    pub op: Op,

    /// Output of planning: the slot in the filter-value array the caller
    /// must populate for this predicate, or `None` if the planner did not
    /// consume it (the caller must evaluate it itself).
    pub value_index: Option<u32>,
}

impl FilterSpec {
    pub fn new(column_index: u32, source_index: u32, op: Op) -> Self {
        Self {
            column_index,
            source_index,
            op,
            value_index: None,
        }
    }
}

/// Everything a caller can know about one column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub storage_type: StorageType,
    pub nullability: Nullability,
    pub sort_state: SortState,
}
