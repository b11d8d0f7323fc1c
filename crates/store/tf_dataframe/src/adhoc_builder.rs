//! Builds a [`Dataframe`] by appending values column by column.

use std::sync::Arc;

use tf_containers::{BitVector, FlexVector};
use tf_string_pool::{StringId, StringPool};

use crate::dataframe::Dataframe;
use crate::errors::BuildError;
use crate::runtime_builder::{
    ColumnData, double_sort_state, finalize_integer_column, representable_as_double,
    scan_integers, string_sort_state,
};
use crate::specs::{DuplicateState, SortState};
use crate::types::{Column, NullStorage, Storage};

/// How nullable columns are physically represented after `build()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NullabilityType {
    /// Storage holds only non-null values; index translation happens at
    /// query time.
    SparseNull,
    /// As [`Self::SparseNull`], but the prefix-popcount table is computed
    /// at build time so query-time translation starts warm.
    SparseNullWithPopcount,
    /// Storage holds a placeholder slot for every row.
    DenseNull,
}

/// Column types that can be declared up front.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdhocColumnType {
    Int64,
    Double,
    String,
}

/// Options for [`AdhocDataframeBuilder`].
#[derive(Default)]
pub struct AdhocDataframeBuilderOptions {
    /// Declared column types. Empty means every column's type is inferred
    /// from its first non-null value; otherwise the length must match the
    /// column names.
    pub types: Vec<AdhocColumnType>,

    /// Representation used for columns that receive at least one null.
    pub nullability: NullabilityType,
}

impl Default for NullabilityType {
    fn default() -> Self {
        Self::SparseNull
    }
}

struct ColumnState {
    data: ColumnData,
    null_overlay: Option<BitVector>,
    /// Placeholder slots requested before the column's type was known.
    pending_placeholders: u32,
}

/// Builds a [`Dataframe`] from data that is already partially columnar but
/// still needs type checking and sort/duplicate analysis.
///
/// Append values with the `push_non_null_*` methods (or their unchecked
/// fast paths once a column's type is established) and nulls with
/// [`Self::push_null`]; conceptually every "row" must receive a value or a
/// null in every column before the next row starts, though the calls may
/// arrive column by column. Repeated values fold into a single call via the
/// `count` argument.
///
/// For purely row-oriented input prefer
/// [`RuntimeDataframeBuilder`](crate::RuntimeDataframeBuilder).
///
/// Errors are sticky: after a failed push the builder refuses further data
/// and [`Self::build`] surfaces the stored error.
pub struct AdhocDataframeBuilder {
    pool: Arc<StringPool>,
    column_names: Vec<String>,
    states: Vec<ColumnState>,
    did_declare_types: bool,
    nullability: NullabilityType,
    duplicate_bits: BitVector,
    status: Result<(), BuildError>,
}

impl AdhocDataframeBuilder {
    pub fn new(names: Vec<String>, pool: Arc<StringPool>) -> Self {
        Self::with_options(names, pool, AdhocDataframeBuilderOptions::default())
    }

    pub fn with_options(
        names: Vec<String>,
        pool: Arc<StringPool>,
        options: AdhocDataframeBuilderOptions,
    ) -> Self {
        let did_declare_types = !options.types.is_empty();
        debug_assert!(!did_declare_types || options.types.len() == names.len());
        let states = names
            .iter()
            .enumerate()
            .map(|(i, _)| ColumnState {
                data: match options.types.get(i) {
                    None => ColumnData::Untyped,
                    Some(AdhocColumnType::Int64) => ColumnData::Int64(FlexVector::new()),
                    Some(AdhocColumnType::Double) => ColumnData::Double(FlexVector::new()),
                    Some(AdhocColumnType::String) => ColumnData::String(FlexVector::new()),
                },
                null_overlay: None,
                pending_placeholders: 0,
            })
            .collect();
        Self {
            pool,
            column_names: names,
            states,
            did_declare_types,
            nullability: options.nullability,
            duplicate_bits: BitVector::new(),
            status: Ok(()),
        }
    }

    /// Appends `count` copies of an integer value to column `col`.
    ///
    /// Returns false on failure (type mismatch, lossy coercion); the reason
    /// is stored in [`Self::status`].
    pub fn push_non_null_i64(&mut self, col: u32, value: i64, count: u32) -> bool {
        if self.status.is_err() {
            return false;
        }
        let ok = self.push_i64_inner(col, value, count);
        if ok {
            self.push_presence(col, count);
        }
        ok
    }

    /// Appends `count` copies of a double value to column `col`.
    pub fn push_non_null_f64(&mut self, col: u32, value: f64, count: u32) -> bool {
        if self.status.is_err() {
            return false;
        }
        let ok = self.push_f64_inner(col, value, count);
        if ok {
            self.push_presence(col, count);
        }
        ok
    }

    /// Appends `count` copies of an already-interned string to column
    /// `col`. The id must come from this builder's pool.
    pub fn push_non_null_id(&mut self, col: u32, value: StringId, count: u32) -> bool {
        if self.status.is_err() {
            return false;
        }
        let ok = self.push_id_inner(col, value, count);
        if ok {
            self.push_presence(col, count);
        }
        ok
    }

    /// Interns `value` and appends it `count` times to column `col`.
    pub fn push_non_null_str(&mut self, col: u32, value: &str, count: u32) -> bool {
        let id = self.pool.intern(value);
        self.push_non_null_id(col, id, count)
    }

    /// Fast path for a column whose type is already established as
    /// integer. No type checks, no coercion.
    pub fn push_non_null_unchecked_i64(&mut self, col: u32, value: i64, count: u32) {
        match &mut self.states[col as usize].data {
            ColumnData::Int64(vec) => vec.push_n(value, count as usize),
            _ => unreachable!("column type not established as LONG"),
        }
        self.push_presence(col, count);
    }

    /// Fast path for an established double column.
    pub fn push_non_null_unchecked_f64(&mut self, col: u32, value: f64, count: u32) {
        match &mut self.states[col as usize].data {
            ColumnData::Double(vec) => vec.push_n(value, count as usize),
            _ => unreachable!("column type not established as DOUBLE"),
        }
        self.push_presence(col, count);
    }

    /// Fast path for an established string column.
    pub fn push_non_null_unchecked_id(&mut self, col: u32, value: StringId, count: u32) {
        match &mut self.states[col as usize].data {
            ColumnData::String(vec) => vec.push_n(value, count as usize),
            _ => unreachable!("column type not established as STRING"),
        }
        self.push_presence(col, count);
    }

    /// Appends `count` nulls to column `col`.
    pub fn push_null(&mut self, col: u32, count: u32) {
        let state = &mut self.states[col as usize];
        if state.null_overlay.is_none() {
            state.null_overlay = Some(BitVector::with_len_all_set(row_count_of(state)));
        }
        state
            .null_overlay
            .as_mut()
            .expect("just created")
            .push_n(false, count as usize);
        // Dense-null storage keeps a slot for every row, so nulls need
        // placeholder values.
        if self.nullability == NullabilityType::DenseNull {
            self.push_placeholder(col, count);
        }
    }

    /// Appends `count` placeholder slots to column `col` without touching
    /// the null overlay. Only meaningful for dense-null columns.
    pub fn push_placeholder(&mut self, col: u32, count: u32) {
        let state = &mut self.states[col as usize];
        match &mut state.data {
            // Type not known yet: backfilled when it is established.
            ColumnData::Untyped => state.pending_placeholders += count,
            ColumnData::Int64(vec) => vec.push_n(0, count as usize),
            ColumnData::Double(vec) => vec.push_n(0.0, count as usize),
            ColumnData::String(vec) => vec.push_n(StringId::NULL, count as usize),
        }
    }

    /// The sticky builder status; `Err` after any rejected push.
    pub fn status(&self) -> &Result<(), BuildError> {
        &self.status
    }

    /// Finalizes the builder into an immutable [`Dataframe`].
    ///
    /// Analyzes every column to pick integer downcasts, sort states, the
    /// declared nullability representation, and duplicate knowledge.
    #[profiling::function]
    pub fn build(mut self) -> Result<Dataframe, BuildError> {
        if let Err(e) = &self.status {
            return Err(e.clone());
        }
        let row_count = self.validate_row_counts()?;
        let nullability = self.nullability;
        let pool = Arc::clone(&self.pool);
        let mut duplicate_bits = std::mem::take(&mut self.duplicate_bits);

        let mut columns = Vec::with_capacity(self.states.len());
        for mut state in self.states {
            // All-null dense columns never established a type; their
            // placeholders become zeroed integer slots now.
            if state.pending_placeholders > 0 {
                let mut vec = FlexVector::new();
                vec.push_n(0i64, state.pending_placeholders as usize);
                state.data = ColumnData::Int64(vec);
                state.pending_placeholders = 0;
            }
            let is_nullable = state.null_overlay.is_some();
            let nulls = make_overlay(state.null_overlay, nullability);
            let column = match state.data {
                ColumnData::Untyped => Column {
                    storage: Storage::Uint32(FlexVector::new()),
                    nulls,
                    sort_state: SortState::Unsorted,
                    duplicates: DuplicateState::HasDuplicates,
                },
                ColumnData::Int64(data) => {
                    let summary = scan_integers(&data);
                    let duplicates = detect_duplicates(&data, &mut duplicate_bits);
                    let mut column = finalize_integer_column(data, &summary, is_nullable, nulls);
                    if column.duplicates == DuplicateState::HasDuplicates {
                        column.duplicates = duplicates;
                    }
                    column
                }
                ColumnData::Double(data) => {
                    let sort_state = double_sort_state(is_nullable, &data);
                    Column {
                        storage: Storage::Double(data),
                        nulls,
                        sort_state,
                        duplicates: DuplicateState::HasDuplicates,
                    }
                }
                ColumnData::String(data) => {
                    let sort_state = string_sort_state(is_nullable, &data, &pool);
                    Column {
                        storage: Storage::String(data),
                        nulls,
                        sort_state,
                        duplicates: DuplicateState::HasDuplicates,
                    }
                }
            };
            columns.push(column);
        }
        Ok(Dataframe::from_parts(
            self.column_names,
            columns,
            row_count,
            pool,
        ))
    }

    /// Every column must account for the same number of rows.
    fn validate_row_counts(&self) -> Result<u32, BuildError> {
        let mut row_count = None;
        for (i, state) in self.states.iter().enumerate() {
            let rows = row_count_of(state) as u32;
            match row_count {
                None => row_count = Some(rows),
                Some(expected) if expected != rows => {
                    return Err(BuildError::RaggedColumns {
                        column: self.column_names[i].clone(),
                        expected,
                        actual: rows,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(row_count.unwrap_or(0))
    }

    fn push_i64_inner(&mut self, col: u32, value: i64, count: u32) -> bool {
        match &mut self.states[col as usize].data {
            // First typed push: it decides the column type, and any
            // placeholders deferred while the column was untyped land
            // first so row order is preserved.
            ColumnData::Untyped => {
                let pending =
                    std::mem::take(&mut self.states[col as usize].pending_placeholders);
                let mut vec = FlexVector::new();
                vec.push_n(0i64, pending as usize);
                vec.push_n(value, count as usize);
                self.states[col as usize].data = ColumnData::Int64(vec);
                true
            }
            ColumnData::Int64(vec) => {
                vec.push_n(value, count as usize);
                true
            }
            ColumnData::Double(vec) => {
                if representable_as_double(value) {
                    vec.push_n(value as f64, count as usize);
                    true
                } else {
                    let row = vec.len() as u32;
                    self.fail_unrepresentable(col, row, value);
                    false
                }
            }
            ColumnData::String(_) => self.fail_type_mismatch(col, "LONG"),
        }
    }

    fn push_f64_inner(&mut self, col: u32, value: f64, count: u32) -> bool {
        match &mut self.states[col as usize].data {
            ColumnData::Untyped => {
                let pending =
                    std::mem::take(&mut self.states[col as usize].pending_placeholders);
                let mut vec = FlexVector::new();
                vec.push_n(0.0f64, pending as usize);
                vec.push_n(value, count as usize);
                self.states[col as usize].data = ColumnData::Double(vec);
                true
            }
            ColumnData::Double(vec) => {
                vec.push_n(value, count as usize);
                true
            }
            ColumnData::Int64(vec) => {
                for j in 0..vec.len() {
                    if !representable_as_double(vec[j]) {
                        let (row, value) = (j as u32, vec[j]);
                        self.fail_unrepresentable(col, row, value);
                        return false;
                    }
                }
                let mut rewritten = FlexVector::<f64>::with_len(vec.len());
                for j in 0..vec.len() {
                    rewritten[j] = vec[j] as f64;
                }
                rewritten.push_n(value, count as usize);
                self.states[col as usize].data = ColumnData::Double(rewritten);
                true
            }
            ColumnData::String(_) => self.fail_type_mismatch(col, "DOUBLE"),
        }
    }

    fn push_id_inner(&mut self, col: u32, value: StringId, count: u32) -> bool {
        match &mut self.states[col as usize].data {
            ColumnData::Untyped => {
                let pending =
                    std::mem::take(&mut self.states[col as usize].pending_placeholders);
                let mut vec = FlexVector::new();
                vec.push_n(StringId::NULL, pending as usize);
                vec.push_n(value, count as usize);
                self.states[col as usize].data = ColumnData::String(vec);
                true
            }
            ColumnData::String(vec) => {
                vec.push_n(value, count as usize);
                true
            }
            ColumnData::Int64(_) | ColumnData::Double(_) => self.fail_type_mismatch(col, "STRING"),
        }
    }

    fn push_presence(&mut self, col: u32, count: u32) {
        if let Some(overlay) = &mut self.states[col as usize].null_overlay {
            overlay.push_n(true, count as usize);
        }
    }

    #[cold]
    fn fail_type_mismatch(&mut self, col: u32, actual: &'static str) -> bool {
        let column = self.column_names[col as usize].clone();
        let expected = self.states[col as usize].data.type_name();
        self.status = Err(if self.did_declare_types {
            BuildError::DeclaredTypeMismatch {
                column,
                expected,
                actual,
            }
        } else {
            BuildError::InferredTypeMismatch {
                column,
                row: self.states[col as usize].data.len() as u32,
                expected,
                actual,
            }
        });
        false
    }

    #[cold]
    fn fail_unrepresentable(&mut self, col: u32, row: u32, value: i64) {
        self.status = Err(BuildError::UnrepresentableInteger {
            column: self.column_names[col as usize].clone(),
            row,
            value,
        });
    }
}

fn row_count_of(state: &ColumnState) -> usize {
    match &state.null_overlay {
        // The overlay has one bit per row, nulls included.
        Some(overlay) => overlay.len(),
        None => state.data.len() + state.pending_placeholders as usize,
    }
}

fn make_overlay(bit_vector: Option<BitVector>, nullability: NullabilityType) -> NullStorage {
    let Some(bit_vector) = bit_vector else {
        return NullStorage::NonNull;
    };
    match nullability {
        NullabilityType::SparseNull => NullStorage::SparseNull {
            bit_vector,
            prefix_popcount: None,
        },
        NullabilityType::SparseNullWithPopcount => {
            let table = bit_vector.prefix_popcount();
            NullStorage::SparseNull {
                bit_vector,
                prefix_popcount: Some(table),
            }
        }
        NullabilityType::DenseNull => NullStorage::DenseNull { bit_vector },
    }
}

/// Size-gated duplicate filter: a bitvector marks values already seen, but
/// only while values stay below 16× the column length. Values outside the
/// gate (or negative) are conservatively treated as duplicates, which
/// cheaply rules out "no duplicates" for most columns without unbounded
/// memory.
fn detect_duplicates(data: &FlexVector<i64>, bits: &mut BitVector) -> DuplicateState {
    let gate = 16 * data.len() as i64;
    // One scratch bitvector shared across columns; reset between uses.
    if !bits.is_empty() {
        *bits = BitVector::new();
    }
    for &value in data {
        if value < 0 || value >= gate {
            return DuplicateState::HasDuplicates;
        }
        let idx = value as usize;
        if idx >= bits.len() {
            bits.push_n(false, idx - bits.len() + 1);
        }
        if bits.is_set(idx) {
            return DuplicateState::HasDuplicates;
        }
        bits.set(idx);
    }
    DuplicateState::NoDuplicates
}
