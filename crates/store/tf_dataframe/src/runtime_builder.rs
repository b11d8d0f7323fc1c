//! Builds a [`Dataframe`] row by row at runtime.

use std::sync::Arc;

use tf_containers::{BitVector, FlexVector};
use tf_string_pool::{StringId, StringPool};

use crate::dataframe::Dataframe;
use crate::errors::BuildError;
use crate::specs::{DuplicateState, SortState};
use crate::types::{Column, NullStorage, Storage};
use crate::value_fetcher::{FetchedValueType, ValueFetcher};

/// Largest integer magnitude a double represents exactly (2^53).
pub(crate) const MAX_DOUBLE_REPRESENTABLE: i64 = 1 << 53;

pub(crate) fn representable_as_double(v: i64) -> bool {
    (-MAX_DOUBLE_REPRESENTABLE..=MAX_DOUBLE_REPRESENTABLE).contains(&v)
}

/// Per-column accumulation state. The inferred type is fixed by the first
/// non-null value; integers are collected as `i64` and downcast at build
/// time.
pub(crate) enum ColumnData {
    Untyped,
    Int64(FlexVector<i64>),
    Double(FlexVector<f64>),
    String(FlexVector<StringId>),
}

impl ColumnData {
    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Self::Untyped => "NULL",
            Self::Int64(_) => "LONG",
            Self::Double(_) => "DOUBLE",
            Self::String(_) => "STRING",
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Untyped => 0,
            Self::Int64(v) => v.len(),
            Self::Double(v) => v.len(),
            Self::String(v) => v.len(),
        }
    }
}

struct ColumnState {
    data: ColumnData,
    null_overlay: Option<BitVector>,
}

/// Builds a [`Dataframe`] incrementally from row-shaped input.
///
/// Column types are inferred from the first non-null value in each column;
/// later values of a different type fail the row (with one exception: ints
/// and doubles coerce into a double column when no precision would be
/// lost). Nulls are tracked in a lazily-created bitvector, and storage only
/// holds the non-null values, so fully-dense columns pay nothing.
///
/// `build()` then analyzes each column to pick its final physical shape:
/// `Id` storage when values equal their row index, `Uint32`/`Int32`
/// downcasts when the value range fits, and a sort state derived from a
/// single scan.
///
/// Errors are sticky: after a failed [`Self::add_row`] the builder refuses
/// further rows and [`Self::build`] surfaces the stored error.
pub struct RuntimeDataframeBuilder {
    pool: Arc<StringPool>,
    column_names: Vec<String>,
    states: Vec<ColumnState>,
    row_count: u32,
    status: Result<(), BuildError>,
}

impl RuntimeDataframeBuilder {
    /// `names` fixes the column set and order; `pool` interns every string
    /// value encountered and backs the resulting frame's string columns.
    pub fn new(names: Vec<String>, pool: Arc<StringPool>) -> Self {
        let states = names
            .iter()
            .map(|_| ColumnState {
                data: ColumnData::Untyped,
                null_overlay: None,
            })
            .collect();
        Self {
            pool,
            column_names: names,
            states,
            row_count: 0,
            status: Ok(()),
        }
    }

    /// Adds one row, reading the value for column `i` from slot `i` of
    /// `fetcher`.
    ///
    /// Returns false if the row was rejected; [`Self::status`] has the
    /// reason, and the builder must not be fed further rows.
    pub fn add_row<F: ValueFetcher>(&mut self, fetcher: &F) -> bool {
        if self.status.is_err() {
            return false;
        }
        for i in 0..self.column_names.len() {
            let fetched = fetcher.value_type(i as u32);
            let ok = match fetched {
                FetchedValueType::Int64 => self.push_int64(i, fetcher.int64_value(i as u32)),
                FetchedValueType::Double => self.push_double(i, fetcher.double_value(i as u32)),
                FetchedValueType::String => {
                    let id = self.pool.intern(fetcher.string_value(i as u32));
                    self.push_string(i, id)
                }
                FetchedValueType::Null => {
                    let state = &mut self.states[i];
                    if state.null_overlay.is_none() {
                        state.null_overlay =
                            Some(BitVector::with_len_all_set(self.row_count as usize));
                    }
                    true
                }
            };
            if !ok {
                return false;
            }
            if let Some(overlay) = &mut self.states[i].null_overlay {
                overlay.push(fetched != FetchedValueType::Null);
            }
        }
        self.row_count += 1;
        true
    }

    /// The sticky builder status; `Err` after any rejected row.
    pub fn status(&self) -> &Result<(), BuildError> {
        &self.status
    }

    /// Finalizes the builder into an immutable [`Dataframe`], choosing the
    /// optimal storage, overlay, and sort state for every column.
    #[profiling::function]
    pub fn build(mut self) -> Result<Dataframe, BuildError> {
        self.status?;
        let mut columns = Vec::with_capacity(self.states.len());
        for state in self.states {
            let is_nullable = state.null_overlay.is_some();
            let column = match state.data {
                ColumnData::Untyped => Column {
                    storage: Storage::Uint32(FlexVector::new()),
                    nulls: sparse_overlay_from(state.null_overlay),
                    sort_state: SortState::Unsorted,
                    duplicates: DuplicateState::HasDuplicates,
                },
                ColumnData::Int64(data) => {
                    let summary = scan_integers(&data);
                    finalize_integer_column(
                        data,
                        &summary,
                        is_nullable,
                        sparse_overlay_from(state.null_overlay),
                    )
                }
                ColumnData::Double(data) => {
                    let sort_state = double_sort_state(is_nullable, &data);
                    Column {
                        storage: Storage::Double(data),
                        nulls: sparse_overlay_from(state.null_overlay),
                        sort_state,
                        duplicates: DuplicateState::HasDuplicates,
                    }
                }
                ColumnData::String(data) => {
                    let sort_state = string_sort_state(is_nullable, &data, &self.pool);
                    Column {
                        storage: Storage::String(data),
                        nulls: sparse_overlay_from(state.null_overlay),
                        sort_state,
                        duplicates: DuplicateState::HasDuplicates,
                    }
                }
            };
            columns.push(column);
        }
        log::trace!(
            "built dataframe: {} columns, {} rows",
            columns.len(),
            self.row_count
        );
        Ok(Dataframe::from_parts(
            self.column_names,
            columns,
            self.row_count,
            self.pool,
        ))
    }

    fn push_int64(&mut self, i: usize, value: i64) -> bool {
        let state = &mut self.states[i];
        match &mut state.data {
            ColumnData::Untyped => {
                let mut vec = FlexVector::new();
                vec.push(value);
                state.data = ColumnData::Int64(vec);
                true
            }
            ColumnData::Int64(vec) => {
                vec.push(value);
                true
            }
            // An integer arriving in a double column stays a double if no
            // precision is lost.
            ColumnData::Double(vec) => {
                if !representable_as_double(value) {
                    self.status = Err(BuildError::UnrepresentableInteger {
                        column: self.column_names[i].clone(),
                        row: self.row_count,
                        value,
                    });
                    return false;
                }
                vec.push(value as f64);
                true
            }
            ColumnData::String(_) => self.type_mismatch(i, "LONG"),
        }
    }

    fn push_double(&mut self, i: usize, value: f64) -> bool {
        let state = &mut self.states[i];
        match &mut state.data {
            ColumnData::Untyped => {
                let mut vec = FlexVector::new();
                vec.push(value);
                state.data = ColumnData::Double(vec);
                true
            }
            ColumnData::Double(vec) => {
                vec.push(value);
                true
            }
            // A double arriving in an integer column rewrites the column as
            // doubles, provided every value seen so far survives exactly.
            ColumnData::Int64(vec) => {
                for j in 0..vec.len() {
                    if !representable_as_double(vec[j]) {
                        self.status = Err(BuildError::UnrepresentableInteger {
                            column: self.column_names[i].clone(),
                            row: j as u32,
                            value: vec[j],
                        });
                        return false;
                    }
                }
                let mut rewritten = FlexVector::<f64>::with_len(vec.len());
                for j in 0..vec.len() {
                    rewritten[j] = vec[j] as f64;
                }
                rewritten.push(value);
                state.data = ColumnData::Double(rewritten);
                true
            }
            ColumnData::String(_) => self.type_mismatch(i, "DOUBLE"),
        }
    }

    fn push_string(&mut self, i: usize, id: StringId) -> bool {
        let state = &mut self.states[i];
        match &mut state.data {
            ColumnData::Untyped => {
                let mut vec = FlexVector::new();
                vec.push(id);
                state.data = ColumnData::String(vec);
                true
            }
            ColumnData::String(vec) => {
                vec.push(id);
                true
            }
            ColumnData::Int64(_) | ColumnData::Double(_) => self.type_mismatch(i, "STRING"),
        }
    }

    #[cold]
    fn type_mismatch(&mut self, i: usize, actual: &'static str) -> bool {
        self.status = Err(BuildError::InferredTypeMismatch {
            column: self.column_names[i].clone(),
            row: self.row_count,
            expected: self.states[i].data.type_name(),
            actual,
        });
        false
    }
}

fn sparse_overlay_from(bit_vector: Option<BitVector>) -> NullStorage {
    match bit_vector {
        Some(bit_vector) => NullStorage::SparseNull {
            bit_vector,
            prefix_popcount: None,
        },
        None => NullStorage::NonNull,
    }
}

/// Single-scan summary of an integer column's shape.
pub(crate) struct IntegerColumnSummary {
    pub is_id_sorted: bool,
    pub is_setid_sorted: bool,
    pub is_sorted: bool,
    pub min: i64,
    pub max: i64,
}

pub(crate) fn scan_integers(data: &FlexVector<i64>) -> IntegerColumnSummary {
    let mut summary = IntegerColumnSummary {
        is_id_sorted: data.is_empty() || data[0] == 0,
        is_setid_sorted: data.is_empty() || data[0] == 0,
        is_sorted: true,
        min: if data.is_empty() { 0 } else { data[0] },
        max: if data.is_empty() { 0 } else { data[0] },
    };
    for j in 1..data.len() {
        let v = data[j];
        summary.is_id_sorted = summary.is_id_sorted && v == j as i64;
        summary.is_setid_sorted =
            summary.is_setid_sorted && (v == data[j - 1] || v == j as i64);
        summary.is_sorted = summary.is_sorted && data[j - 1] <= v;
        summary.min = summary.min.min(v);
        summary.max = summary.max.max(v);
    }
    summary
}

pub(crate) fn finalize_integer_column(
    data: FlexVector<i64>,
    summary: &IntegerColumnSummary,
    is_nullable: bool,
    nulls: NullStorage,
) -> Column {
    let storage = integer_storage(data, summary, is_nullable);
    let duplicates = if matches!(storage, Storage::Id { .. }) {
        DuplicateState::NoDuplicates
    } else {
        DuplicateState::HasDuplicates
    };
    Column {
        storage,
        nulls,
        sort_state: integer_sort_state(summary, is_nullable),
        duplicates,
    }
}

/// Picks the narrowest physical representation the scanned range allows.
fn integer_storage(
    data: FlexVector<i64>,
    summary: &IntegerColumnSummary,
    is_nullable: bool,
) -> Storage {
    if summary.is_id_sorted && !is_nullable {
        return Storage::Id {
            row_count: data.len() as u32,
        };
    }
    if range_fits(summary, i64::from(u32::MIN), i64::from(u32::MAX)) {
        return Storage::Uint32(downcast(&data, |v| v as u32));
    }
    if range_fits(summary, i64::from(i32::MIN), i64::from(i32::MAX)) {
        return Storage::Int32(downcast(&data, |v| v as i32));
    }
    Storage::Int64(data)
}

fn range_fits(summary: &IntegerColumnSummary, min: i64, max: i64) -> bool {
    summary.min >= min && summary.max <= max
}

fn downcast<T: bytemuck::Pod>(data: &FlexVector<i64>, cast: impl Fn(i64) -> T) -> FlexVector<T> {
    let mut res = FlexVector::with_len(data.len());
    for j in 0..data.len() {
        res[j] = cast(data[j]);
    }
    res
}

pub(crate) fn integer_sort_state(summary: &IntegerColumnSummary, is_nullable: bool) -> SortState {
    if is_nullable {
        return SortState::Unsorted;
    }
    if summary.is_id_sorted {
        debug_assert!(summary.is_setid_sorted);
        debug_assert!(summary.is_sorted);
        return SortState::IdSorted;
    }
    if summary.is_setid_sorted {
        debug_assert!(summary.is_sorted);
        return SortState::SetIdSorted;
    }
    if summary.is_sorted {
        return SortState::Sorted;
    }
    SortState::Unsorted
}

pub(crate) fn double_sort_state(is_nullable: bool, data: &FlexVector<f64>) -> SortState {
    if is_nullable {
        return SortState::Unsorted;
    }
    for j in 1..data.len() {
        // `!(a <= b)` rather than `a > b`: a NaN anywhere makes the
        // ordering unprovable, and binary searches must never see it.
        if !(data[j - 1] <= data[j]) {
            return SortState::Unsorted;
        }
    }
    SortState::Sorted
}

pub(crate) fn string_sort_state(
    is_nullable: bool,
    data: &FlexVector<StringId>,
    pool: &StringPool,
) -> SortState {
    if is_nullable {
        return SortState::Unsorted;
    }
    for j in 1..data.len() {
        if pool.get(data[j - 1]) > pool.get(data[j]) {
            return SortState::Unsorted;
        }
    }
    SortState::Sorted
}
