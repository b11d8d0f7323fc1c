//! Iteration over executed plan output.

use tf_string_pool::StringPool;

use crate::bytecode::interpreter::{Interpreter, NULL_INDEX_SENTINEL};
use crate::bytecode::registers::Handle;
use crate::query_plan::QueryPlan;
use crate::types::Column;
use crate::value_fetcher::ValueFetcher;

/// Receives the typed value of one cell.
///
/// Exactly one method is invoked per [`Cursor::cell`] call, chosen by the
/// column's storage type (`Id` and `Uint32` storage both report through
/// [`Self::on_u32`]) — or [`Self::on_null`] when the cell is NULL.
pub trait CellCallback {
    fn on_null(&mut self);
    fn on_u32(&mut self, value: u32);
    fn on_i32(&mut self, value: i32);
    fn on_i64(&mut self, value: i64);
    fn on_f64(&mut self, value: f64);
    fn on_str(&mut self, value: &str);
}

/// Iterator over the rows matched by one executed [`QueryPlan`].
///
/// Owned by one thread at a time. A cursor may be re-executed any number of
/// times (e.g. with different filter values); its internal buffers are
/// reused across executions.
pub struct Cursor<'df> {
    interpreter: Interpreter<'df>,
    plan: QueryPlan,
    columns: &'df [Column],
    pool: &'df StringPool,
    /// Element offset of the current row within the output span.
    pos: usize,
    /// Total element count of the output span after the last execution.
    len: usize,
}

impl<'df> Cursor<'df> {
    pub(crate) fn new(plan: QueryPlan, columns: &'df [Column], pool: &'df StringPool) -> Self {
        Self {
            interpreter: Interpreter::new(columns, pool),
            plan,
            columns,
            pool,
            pos: 0,
            len: 0,
        }
    }

    /// Runs the plan and positions the cursor on the first result row.
    ///
    /// `fetcher` supplies the filter values at the slots recorded in the
    /// specs' `value_index` during planning; it is consulted once per
    /// consumed predicate.
    #[profiling::function]
    pub fn execute<F: ValueFetcher>(&mut self, fetcher: &F) {
        self.interpreter.execute(&self.plan.bytecode, fetcher);
        self.pos = 0;
        self.len = self.output_slice().len();
    }

    /// Advances to the next result row.
    #[inline]
    pub fn next(&mut self) {
        debug_assert!(!self.eof());
        self.pos += self.plan.params.output_per_row as usize;
    }

    /// True once the cursor has moved past the last result row.
    #[inline]
    pub fn eof(&self) -> bool {
        self.pos >= self.len
    }

    /// The number of rows matched by the last execution.
    pub fn result_row_count(&self) -> usize {
        self.len / self.plan.params.output_per_row as usize
    }

    /// The current row's index in the dataframe.
    #[inline]
    pub fn row_index(&self) -> u32 {
        self.output_slice()[self.pos]
    }

    /// Reads the current row's cell in column `col`, dispatching the typed
    /// value to `callback`.
    ///
    /// `col` must have had its bit set in the `cols_used` bitmap the plan
    /// was built with.
    pub fn cell(&self, col: u32, callback: &mut impl CellCallback) {
        let column = &self.columns[col as usize];
        let offset = self.plan.params.col_to_output_offset[col as usize] as usize;
        let idx = self.output_slice()[self.pos + offset];
        if idx == NULL_INDEX_SENTINEL {
            callback.on_null();
            return;
        }
        let idx = idx as usize;
        match &column.storage {
            crate::types::Storage::Id { .. } => callback.on_u32(idx as u32),
            crate::types::Storage::Uint32(v) => callback.on_u32(v[idx]),
            crate::types::Storage::Int32(v) => callback.on_i32(v[idx]),
            crate::types::Storage::Int64(v) => callback.on_i64(v[idx]),
            crate::types::Storage::Double(v) => callback.on_f64(v[idx]),
            crate::types::Storage::String(v) => callback.on_str(self.pool.get(v[idx])),
        }
    }

    fn output_slice(&self) -> &[u32] {
        self.interpreter
            .span_slice(Handle::new(self.plan.params.output_register))
    }
}
