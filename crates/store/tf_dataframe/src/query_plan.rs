//! Compiles filter predicates plus an output-column bitmap into bytecode.
//!
//! The planner reorders predicates by how cheaply they can be answered
//! (sorted columns get binary searches on a shrinking range, everything
//! else gets linear filters over a materialized index slab), wires up
//! null-overlay translation where needed, and lays out the output buffer.

use base64::Engine as _;
use itertools::Itertools as _;
use smallvec::SmallVec;

use tf_containers::Slab;

use crate::bytecode::registers::{Handle, MAX_REGISTERS};
use crate::bytecode::{
    AllocateIndices, BoundModifier, Bytecode, CastFilterValue, InitRange, Iota, LinearFilter,
    NullFilter, Opcode, PrefixPopcount, SortedFilter, SortedFilterMode, StrideCopy,
    StrideCopyDenseNullIndices, StrideTranslateAndCopySparseNullIndices,
    TranslateSparseNullIndices, Uint32SetIdSortedEq,
};
use crate::errors::PlanError;
use crate::specs::{FilterSpec, Nullability, Op, SortState, StorageType};
use crate::types::{CastFilterValueResult, Column, Range, Span};

/// Hard cap on the number of filters a single query may carry.
pub(crate) const MAX_FILTERS: usize = 16;

/// Widest supported output bitmap: one bit per column.
pub(crate) const MAX_COLUMNS: usize = 64;

/// Everything the interpreter needs besides the bytecode itself.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
pub(crate) struct ExecutionParams {
    /// Number of filter-value slots the plan consumes.
    pub filter_value_count: u32,
    /// Register holding the final output index span.
    pub output_register: u32,
    /// Stride of each output row: 1, plus one slot per requested nullable
    /// column.
    pub output_per_row: u32,
    /// Maps column index to its offset within an output row.
    pub col_to_output_offset: [u32; MAX_COLUMNS],
}

/// An executable, serializable compilation of one query.
///
/// A plan is bound to the dataframe (column order, types, sort states) it
/// was built from; executing it against a different frame is a programming
/// error. The serialized form is unstable across engine versions — callers
/// caching blobs must key their caches on the engine build.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryPlan {
    pub(crate) bytecode: Vec<Bytecode>,
    pub(crate) params: ExecutionParams,
}

impl QueryPlan {
    /// Encodes the plan as an opaque base64 blob.
    pub fn serialize(&self) -> String {
        let mut buf = Vec::with_capacity(
            size_of::<u64>()
                + self.bytecode.len() * size_of::<Bytecode>()
                + size_of::<ExecutionParams>(),
        );
        buf.extend_from_slice(&(self.bytecode.len() as u64).to_le_bytes());
        buf.extend_from_slice(bytemuck::cast_slice(&self.bytecode));
        buf.extend_from_slice(bytemuck::bytes_of(&self.params));
        base64::engine::general_purpose::STANDARD.encode(buf)
    }

    /// Exact inverse of [`Self::serialize`].
    pub fn deserialize(blob: &str) -> Result<Self, PlanError> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .map_err(|_| PlanError::MalformedPlan)?;

        let (len_bytes, rest) = raw
            .split_at_checked(size_of::<u64>())
            .ok_or(PlanError::MalformedPlan)?;
        let count = u64::from_le_bytes(len_bytes.try_into().expect("split_at length"));
        let bytecode_bytes = usize::try_from(count)
            .ok()
            .and_then(|c| c.checked_mul(size_of::<Bytecode>()))
            .ok_or(PlanError::MalformedPlan)?;
        let (code_bytes, params_bytes) = rest
            .split_at_checked(bytecode_bytes)
            .ok_or(PlanError::MalformedPlan)?;
        if params_bytes.len() != size_of::<ExecutionParams>() {
            return Err(PlanError::MalformedPlan);
        }

        let bytecode: Vec<Bytecode> = code_bytes
            .chunks_exact(size_of::<Bytecode>())
            .map(bytemuck::pod_read_unaligned)
            .collect();
        for bc in &bytecode {
            if Opcode::try_from_u32(bc.opcode).is_none() {
                return Err(PlanError::MalformedPlan);
            }
        }
        let params: ExecutionParams = bytemuck::pod_read_unaligned(params_bytes);
        if params.output_per_row == 0 || params.output_register as usize >= MAX_REGISTERS {
            return Err(PlanError::MalformedPlan);
        }
        Ok(Self { bytecode, params })
    }

    /// Human-readable instruction listing, one per line. For debugging and
    /// plan-shape tests.
    pub fn explain(&self) -> String {
        self.bytecode
            .iter()
            .map(crate::bytecode::format_bytecode)
            .join("\n")
    }
}

/// Scoring used to order filters; lower applies earlier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum FilterPreference {
    IdEq,
    SetIdSortedEq,
    IdInequality,
    NumericSortedEq,
    NumericSortedInequality,
    StringSortedEq,
    StringSortedInequality,
    LeastPreferred,
}

fn filter_preference(spec: &FilterSpec, col: &Column) -> FilterPreference {
    use FilterPreference as P;
    let op = spec.op;
    let ct = col.storage.storage_type();
    let non_null = col.nulls.nullability() == Nullability::NonNull;
    let sorted = col.sort_state == SortState::Sorted
        || col.sort_state == SortState::IdSorted
        || col.sort_state == SortState::SetIdSorted;
    if non_null && ct == StorageType::Id && op == Op::Eq {
        return P::IdEq;
    }
    if non_null && ct == StorageType::Uint32 && col.sort_state == SortState::SetIdSorted && op == Op::Eq {
        return P::SetIdSortedEq;
    }
    if non_null && ct == StorageType::Id && op.is_inequality() {
        return P::IdInequality;
    }
    if non_null && sorted && !ct.is_string() && ct != StorageType::Id && op == Op::Eq {
        return P::NumericSortedEq;
    }
    if non_null && sorted && !ct.is_string() && ct != StorageType::Id && op.is_inequality() {
        return P::NumericSortedInequality;
    }
    if non_null && sorted && ct.is_string() && op == Op::Eq {
        return P::StringSortedEq;
    }
    if non_null && sorted && ct.is_string() && op.is_inequality() {
        return P::StringSortedInequality;
    }
    P::LeastPreferred
}

/// Maps a range operator to (which end to write, how to search).
fn sorted_filter_args(op: Op) -> (BoundModifier, SortedFilterMode) {
    match op {
        Op::Eq => (BoundModifier::BothBounds, SortedFilterMode::EqualRange),
        Op::Lt => (BoundModifier::EndBound, SortedFilterMode::LowerBound),
        Op::Le => (BoundModifier::EndBound, SortedFilterMode::UpperBound),
        Op::Gt => (BoundModifier::BeginBound, SortedFilterMode::UpperBound),
        Op::Ge => (BoundModifier::BeginBound, SortedFilterMode::LowerBound),
        _ => unreachable!("{op:?} is not a range operator"),
    }
}

/// Which register currently holds the set of matching indices.
#[derive(Clone, Copy)]
enum IndicesReg {
    Range(Handle<Range>),
    Span(Handle<Span>),
}

/// Per-column state tracked while planning.
#[derive(Default)]
struct ColumnPlanState {
    prefix_popcount: Option<Handle<Slab<u32>>>,
}

pub(crate) struct QueryPlanBuilder<'df> {
    max_row_count: u32,
    columns: &'df [Column],
    plan: QueryPlan,
    column_states: Vec<ColumnPlanState>,
    register_count: u32,
    indices_reg: IndicesReg,
}

impl<'df> QueryPlanBuilder<'df> {
    /// Compiles `specs` against `columns` into an executable plan.
    ///
    /// `specs` is reordered by preference, and each consumed spec gets its
    /// `value_index` populated with the filter-value slot the caller must
    /// fill at execution time.
    #[profiling::function]
    pub fn build(
        row_count: u32,
        columns: &'df [Column],
        specs: &mut [FilterSpec],
        cols_used: u64,
    ) -> Result<QueryPlan, PlanError> {
        if specs.len() > MAX_FILTERS {
            return Err(PlanError::TooManyFilters(specs.len()));
        }
        for spec in specs.iter() {
            if spec.column_index as usize >= columns.len() {
                return Err(PlanError::InvalidColumn {
                    column: spec.column_index,
                    column_count: columns.len(),
                });
            }
        }
        let mut builder = Self::new(row_count, columns);
        builder.filter(specs)?;
        builder.output(cols_used);
        log::debug!(
            "query plan built: {} filters, {} instructions, stride {}",
            specs.len(),
            builder.plan.bytecode.len(),
            builder.plan.params.output_per_row,
        );
        Ok(builder.plan)
    }

    fn new(row_count: u32, columns: &'df [Column]) -> Self {
        let mut builder = Self {
            max_row_count: row_count,
            columns,
            plan: QueryPlan {
                bytecode: Vec::new(),
                params: ExecutionParams {
                    filter_value_count: 0,
                    output_register: 0,
                    output_per_row: 1,
                    col_to_output_offset: [0; MAX_COLUMNS],
                },
            },
            column_states: columns.iter().map(|_| ColumnPlanState::default()).collect(),
            register_count: 0,
            indices_reg: IndicesReg::Range(Handle::new(0)),
        };
        // A dedicated register starts out holding the full row range.
        let range = builder.alloc_register::<Range>();
        builder.emit(
            InitRange {
                size: row_count,
                dest: range,
            }
            .encode(),
        );
        builder.indices_reg = IndicesReg::Range(range);
        builder
    }

    fn filter(&mut self, specs: &mut [FilterSpec]) -> Result<(), PlanError> {
        // Most selective / cheapest first; stable so caller order breaks
        // ties.
        specs.sort_by_key(|spec| filter_preference(spec, &self.columns[spec.column_index as usize]));

        for spec in specs.iter_mut() {
            let col = &self.columns[spec.column_index as usize];
            let ct = col.storage.storage_type();

            if spec.op.is_null_op() {
                self.null_constraint(spec);
                continue;
            }

            // Coerce the caller's value into the column's comparison domain.
            let value_reg = self.alloc_register::<CastFilterValueResult>();
            self.emit(
                CastFilterValue {
                    fval_handle: self.plan.params.filter_value_count,
                    dest: value_reg,
                    op: spec.op,
                }
                .encode(ct),
            );
            spec.value_index = Some(self.plan.params.filter_value_count);
            self.plan.params.filter_value_count += 1;

            if self.try_sorted_constraint(spec, ct, value_reg) {
                continue;
            }

            if ct.is_string() {
                self.string_constraint(spec, value_reg)?;
            } else if spec.op.is_comparison() {
                self.non_string_constraint(spec, ct, value_reg);
            } else {
                // Glob/Regex against a non-string column can never match.
                self.set_guaranteed_to_be_empty();
            }
        }
        Ok(())
    }

    fn null_constraint(&mut self, spec: &mut FilterSpec) {
        // Consume a value slot even though no value is read: it tells the
        // caller the predicate was fully handled here.
        spec.value_index = Some(self.plan.params.filter_value_count);
        self.plan.params.filter_value_count += 1;

        let col = &self.columns[spec.column_index as usize];
        match col.nulls.nullability() {
            Nullability::SparseNull | Nullability::DenseNull => {
                let indices = self.ensure_indices_are_in_slab();
                self.emit(
                    NullFilter {
                        col: spec.column_index,
                        update: indices,
                    }
                    .encode(spec.op == Op::IsNull),
                );
            }
            Nullability::NonNull => {
                if spec.op == Op::IsNull {
                    self.set_guaranteed_to_be_empty();
                }
                // IsNotNull on a non-null column is a tautology.
            }
        }
    }

    /// Tries to serve the predicate with a binary search over the still
    /// intact row range. Returns false if the range was already
    /// materialized or the column/operator doesn't qualify.
    fn try_sorted_constraint(
        &mut self,
        spec: &FilterSpec,
        ct: StorageType,
        value_reg: Handle<CastFilterValueResult>,
    ) -> bool {
        let col = &self.columns[spec.column_index as usize];
        if col.nulls.nullability() != Nullability::NonNull
            || col.sort_state == SortState::Unsorted
            || !spec.op.is_range_op()
        {
            return false;
        }
        // Filter ordering guarantees sorted constraints run before anything
        // that materializes the range into a slab.
        let IndicesReg::Range(range_reg) = self.indices_reg else {
            return false;
        };

        if ct == StorageType::Uint32 && col.sort_state == SortState::SetIdSorted && spec.op == Op::Eq
        {
            self.emit(
                Uint32SetIdSortedEq {
                    col: spec.column_index,
                    val: value_reg,
                    update: range_reg,
                }
                .encode(),
            );
            return true;
        }
        let (bound, mode) = sorted_filter_args(spec.op);
        self.emit(
            SortedFilter {
                col: spec.column_index,
                val: value_reg,
                update: range_reg,
                write_result_to: bound,
            }
            .encode(ct, mode),
        );
        true
    }

    fn non_string_constraint(
        &mut self,
        spec: &FilterSpec,
        ct: StorageType,
        value_reg: Handle<CastFilterValueResult>,
    ) {
        let source = self.maybe_add_overlay_translation(spec);
        let update = self.ensure_indices_are_in_slab();
        self.emit(
            LinearFilter {
                col: spec.column_index,
                val: value_reg,
                source,
                update,
            }
            .encode(Opcode::non_string_filter(ct, spec.op)),
        );
    }

    fn string_constraint(
        &mut self,
        spec: &FilterSpec,
        value_reg: Handle<CastFilterValueResult>,
    ) -> Result<(), PlanError> {
        if spec.op == Op::Regex && !cfg!(feature = "regex") {
            return Err(PlanError::RegexUnsupported);
        }
        let source = self.maybe_add_overlay_translation(spec);
        let update = self.ensure_indices_are_in_slab();
        self.emit(
            LinearFilter {
                col: spec.column_index,
                val: value_reg,
                source,
                update,
            }
            .encode(Opcode::string_filter(spec.op)),
        );
        Ok(())
    }

    /// For nullable columns, drops null rows and (for sparse overlays)
    /// translates row indices into storage indices in a scratch span, so
    /// the data-bearing filter that follows reads the right slots.
    fn maybe_add_overlay_translation(&mut self, spec: &FilterSpec) -> Handle<Span> {
        let main = self.ensure_indices_are_in_slab();
        let col_index = spec.column_index;
        match self.columns[col_index as usize].nulls.nullability() {
            Nullability::NonNull => main,
            Nullability::DenseNull => {
                self.emit(
                    NullFilter {
                        col: col_index,
                        update: main,
                    }
                    .encode(false),
                );
                main
            }
            Nullability::SparseNull => {
                self.emit(
                    NullFilter {
                        col: col_index,
                        update: main,
                    }
                    .encode(false),
                );
                let scratch_slab = self.alloc_register::<Slab<u32>>();
                let scratch_span = self.alloc_register::<Span>();
                self.emit(
                    AllocateIndices {
                        size: self.max_row_count,
                        dest_slab: scratch_slab,
                        dest_span: scratch_span,
                    }
                    .encode(),
                );
                let popcount = self.prefix_popcount_register_for(col_index);
                self.emit(
                    TranslateSparseNullIndices {
                        col: col_index,
                        popcount,
                        source: main,
                        update: scratch_span,
                    }
                    .encode(),
                );
                scratch_span
            }
        }
    }

    fn output(&mut self, cols_used: u64) {
        struct ColAndOffset {
            col: u32,
            offset: u32,
        }

        let mut null_cols: SmallVec<[ColAndOffset; 8]> = SmallVec::new();
        self.plan.params.output_per_row = 1;

        let mut bitmap = cols_used;
        for col in 0..self.columns.len().min(MAX_COLUMNS) as u32 {
            if bitmap == 0 {
                break;
            }
            let requested = bitmap & 1 != 0;
            bitmap >>= 1;
            if !requested {
                continue;
            }
            match self.columns[col as usize].nulls.nullability() {
                Nullability::SparseNull | Nullability::DenseNull => {
                    let offset = self.plan.params.output_per_row;
                    null_cols.push(ColAndOffset { col, offset });
                    self.plan.params.col_to_output_offset[col as usize] = offset;
                    self.plan.params.output_per_row += 1;
                }
                // Non-null columns read straight through the row index at
                // offset 0.
                Nullability::NonNull => {
                    self.plan.params.col_to_output_offset[col as usize] = 0;
                }
            }
        }

        let in_memory_indices = self.ensure_indices_are_in_slab();
        let output_register = if self.plan.params.output_per_row > 1 {
            let stride = self.plan.params.output_per_row;
            let slab = self.alloc_register::<Slab<u32>>();
            let span = self.alloc_register::<Span>();
            self.emit(
                AllocateIndices {
                    size: self.max_row_count * stride,
                    dest_slab: slab,
                    dest_span: span,
                }
                .encode(),
            );
            self.emit(
                StrideCopy {
                    source: in_memory_indices,
                    update: span,
                    stride,
                }
                .encode(),
            );
            for ColAndOffset { col, offset } in null_cols {
                match self.columns[col as usize].nulls.nullability() {
                    Nullability::SparseNull => {
                        let popcount = self.prefix_popcount_register_for(col);
                        self.emit(
                            StrideTranslateAndCopySparseNullIndices {
                                col,
                                popcount,
                                update: span,
                                offset,
                                stride,
                            }
                            .encode(),
                        );
                    }
                    Nullability::DenseNull => {
                        self.emit(
                            StrideCopyDenseNullIndices {
                                col,
                                update: span,
                                offset,
                                stride,
                            }
                            .encode(),
                        );
                    }
                    Nullability::NonNull => unreachable!("only nullable columns are collected"),
                }
            }
            span
        } else {
            in_memory_indices
        };
        self.plan.params.output_register = output_register.index;
    }

    /// Materializes the row range into an index slab if it hasn't been
    /// already; linear filters and output layout need actual indices.
    fn ensure_indices_are_in_slab(&mut self) -> Handle<Span> {
        match self.indices_reg {
            IndicesReg::Span(span) => span,
            IndicesReg::Range(range_reg) => {
                let slab = self.alloc_register::<Slab<u32>>();
                let span = self.alloc_register::<Span>();
                self.emit(
                    AllocateIndices {
                        size: self.max_row_count,
                        dest_slab: slab,
                        dest_span: span,
                    }
                    .encode(),
                );
                self.emit(
                    Iota {
                        source: range_reg,
                        update: span,
                    }
                    .encode(),
                );
                self.indices_reg = IndicesReg::Span(span);
                span
            }
        }
    }

    /// Collapses the plan to a zero-length index span. Used when a filter
    /// guarantees no matches (e.g. `IS NULL` on a non-null column).
    fn set_guaranteed_to_be_empty(&mut self) {
        self.max_row_count = 0;
        let slab = self.alloc_register::<Slab<u32>>();
        let span = self.alloc_register::<Span>();
        self.emit(
            AllocateIndices {
                size: 0,
                dest_slab: slab,
                dest_span: span,
            }
            .encode(),
        );
        self.indices_reg = IndicesReg::Span(span);
    }

    /// Returns the register holding the column's prefix popcount, emitting
    /// the (memoized) computation on first use.
    fn prefix_popcount_register_for(&mut self, col: u32) -> Handle<Slab<u32>> {
        if let Some(reg) = self.column_states[col as usize].prefix_popcount {
            return reg;
        }
        let reg = self.alloc_register::<Slab<u32>>();
        self.column_states[col as usize].prefix_popcount = Some(reg);
        self.emit(PrefixPopcount { col, dest: reg }.encode());
        reg
    }

    fn alloc_register<T>(&mut self) -> Handle<T> {
        let index = self.register_count;
        debug_assert!((index as usize) < MAX_REGISTERS);
        self.register_count += 1;
        Handle::new(index)
    }

    fn emit(&mut self, bc: Bytecode) {
        self.plan.bytecode.push(bc);
    }
}
