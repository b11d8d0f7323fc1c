//! The immutable columnar table and its query entry points.

use std::sync::Arc;

use tf_containers::{BitVector, FlexVector};
use tf_string_pool::StringPool;

use crate::cursor::Cursor;
use crate::errors::PlanError;
use crate::query_plan::{QueryPlan, QueryPlanBuilder};
use crate::specs::{ColumnSpec, DuplicateState, FilterSpec, Nullability, SortState, StorageType};
use crate::types::{Column, NullStorage, Storage};

/// An immutable, columnar table of rows.
///
/// Built once — by [`RuntimeDataframeBuilder`](crate::RuntimeDataframeBuilder)
/// or [`AdhocDataframeBuilder`](crate::AdhocDataframeBuilder) — and then
/// only queried. Frames are cheap to share across threads behind an
/// [`Arc`]; see [`DataframeSharedStorage`](crate::DataframeSharedStorage)
/// for process-wide deduplication of identical tables.
pub struct Dataframe {
    column_names: Vec<String>,
    columns: Vec<Column>,
    row_count: u32,
    pool: Arc<StringPool>,
}

impl Dataframe {
    /// Creates an empty dataframe from declared column specs.
    ///
    /// This is how a table schema exists before any data does (e.g. when a
    /// virtual table is declared): all columns are empty, the row count is
    /// zero, and plans built against it are fully functional.
    pub fn with_specs(specs: Vec<ColumnSpec>, pool: Arc<StringPool>) -> Self {
        let mut column_names = Vec::with_capacity(specs.len());
        let mut columns = Vec::with_capacity(specs.len());
        for spec in specs {
            column_names.push(spec.name);
            columns.push(Column {
                storage: empty_storage(spec.storage_type),
                nulls: empty_overlay(spec.nullability),
                sort_state: spec.sort_state,
                duplicates: DuplicateState::HasDuplicates,
            });
        }
        Self {
            column_names,
            columns,
            row_count: 0,
            pool,
        }
    }

    pub(crate) fn from_parts(
        column_names: Vec<String>,
        columns: Vec<Column>,
        row_count: u32,
        pool: Arc<StringPool>,
    ) -> Self {
        #[cfg(debug_assertions)]
        for column in &columns {
            column.check_invariants(row_count);
        }
        Self {
            column_names,
            columns,
            row_count,
            pool,
        }
    }

    /// Compiles an execution plan for the given filter predicates and
    /// output-column bitmap.
    ///
    /// `specs` is reordered by estimated cost, and every predicate the
    /// planner consumed gets its `value_index` populated — the caller must
    /// place the corresponding filter value in that slot of its
    /// [`ValueFetcher`](crate::ValueFetcher) at execution time. Bit `i` of
    /// `cols_used` must be set for every column the caller intends to read
    /// from the cursor.
    pub fn plan_query(
        &self,
        specs: &mut [FilterSpec],
        cols_used: u64,
    ) -> Result<QueryPlan, PlanError> {
        QueryPlanBuilder::build(self.row_count, &self.columns, specs, cols_used)
    }

    /// Prepares a cursor that executes `plan` against this frame.
    ///
    /// The cursor borrows the frame and owns the plan; re-executing the
    /// same cursor reuses its internal buffers.
    pub fn cursor(&self, plan: QueryPlan) -> Cursor<'_> {
        Cursor::new(plan, &self.columns, &self.pool)
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_names
    }

    /// The string pool backing this frame's string columns.
    pub fn string_pool(&self) -> &Arc<StringPool> {
        &self.pool
    }

    /// Per-column specifications, in column order.
    pub fn column_specs(&self) -> Vec<ColumnSpec> {
        self.column_names
            .iter()
            .zip(&self.columns)
            .map(|(name, column)| ColumnSpec {
                name: name.clone(),
                storage_type: column.storage.storage_type(),
                nullability: column.nulls.nullability(),
                sort_state: column.sort_state,
            })
            .collect()
    }

    /// Whether the given column is proven duplicate-free.
    pub fn column_duplicate_state(&self, col: usize) -> DuplicateState {
        self.columns[col].duplicates
    }
}

impl std::fmt::Debug for Dataframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dataframe")
            .field("columns", &self.column_names)
            .field("row_count", &self.row_count)
            .finish()
    }
}

fn empty_storage(ty: StorageType) -> Storage {
    match ty {
        StorageType::Id => Storage::Id { row_count: 0 },
        StorageType::Uint32 => Storage::Uint32(FlexVector::new()),
        StorageType::Int32 => Storage::Int32(FlexVector::new()),
        StorageType::Int64 => Storage::Int64(FlexVector::new()),
        StorageType::Double => Storage::Double(FlexVector::new()),
        StorageType::String => Storage::String(FlexVector::new()),
    }
}

fn empty_overlay(nullability: Nullability) -> NullStorage {
    match nullability {
        Nullability::NonNull => NullStorage::NonNull,
        Nullability::SparseNull => NullStorage::SparseNull {
            bit_vector: BitVector::new(),
            prefix_popcount: None,
        },
        Nullability::DenseNull => NullStorage::DenseNull {
            bit_vector: BitVector::new(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::specs::Op;

    fn specs() -> Vec<ColumnSpec> {
        vec![
            ColumnSpec {
                name: "id".to_owned(),
                storage_type: StorageType::Id,
                nullability: Nullability::NonNull,
                sort_state: SortState::IdSorted,
            },
            ColumnSpec {
                name: "ts".to_owned(),
                storage_type: StorageType::Int64,
                nullability: Nullability::NonNull,
                sort_state: SortState::Sorted,
            },
        ]
    }

    #[test]
    fn too_many_filters_is_a_planning_error() {
        let df = Dataframe::with_specs(specs(), Arc::new(StringPool::new()));
        let mut filters: Vec<FilterSpec> =
            (0..17).map(|i| FilterSpec::new(0, i, Op::Eq)).collect();
        assert_eq!(
            df.plan_query(&mut filters, u64::MAX),
            Err(PlanError::TooManyFilters(17))
        );
    }

    #[test]
    fn invalid_column_is_a_planning_error() {
        let df = Dataframe::with_specs(specs(), Arc::new(StringPool::new()));
        let mut filters = vec![FilterSpec::new(7, 0, Op::Eq)];
        assert_eq!(
            df.plan_query(&mut filters, u64::MAX),
            Err(PlanError::InvalidColumn {
                column: 7,
                column_count: 2
            })
        );
    }

    #[test]
    fn introspection() {
        let df = Dataframe::with_specs(specs(), Arc::new(StringPool::new()));
        assert_eq!(df.row_count(), 0);
        assert_eq!(df.column_count(), 2);
        assert_eq!(df.column_names(), &["id".to_owned(), "ts".to_owned()]);
        let got = df.column_specs();
        assert_eq!(got[1].storage_type, StorageType::Int64);
        assert_eq!(got[1].sort_state, SortState::Sorted);
    }
}
