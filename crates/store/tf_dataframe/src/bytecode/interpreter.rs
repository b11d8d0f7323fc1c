//! A virtual machine executing query bytecode against a column set.
//!
//! The interpreter owns a fixed-size register file and runs a flat bytecode
//! vector to completion — no suspension points, no allocation beyond the
//! slabs declared by `AllocateIndices`. Registers persist across executions
//! of the same cursor: slabs get reused and memoized popcounts stay warm.

use tf_containers::Slab;
use tf_string_pool::StringPool;

use crate::specs::{Op, StorageType};
use crate::types::{CastFilterValueResult, CastValue, Column, NullStorage, Range, Span};
use crate::value_fetcher::{FetchedValueType, ValueFetcher};

use super::registers::{Handle, MAX_REGISTERS, RegValue};
use super::{
    AllocateIndices, BoundModifier, Bytecode, CastFilterValue, Iota, LinearFilter, NullFilter,
    Opcode, PrefixPopcount, SortedFilter, SortedFilterMode, StrideCopy,
    StrideCopyDenseNullIndices, StrideTranslateAndCopySparseNullIndices,
    TranslateSparseNullIndices, Uint32SetIdSortedEq,
};

/// Sentinel written into output slots whose cell is NULL.
pub(crate) const NULL_INDEX_SENTINEL: u32 = u32::MAX;

pub(crate) struct Interpreter<'df> {
    columns: &'df [Column],
    pool: &'df StringPool,
    registers: Vec<RegValue>,
}

impl<'df> Interpreter<'df> {
    pub fn new(columns: &'df [Column], pool: &'df StringPool) -> Self {
        let mut registers = Vec::with_capacity(MAX_REGISTERS);
        registers.resize_with(MAX_REGISTERS, || RegValue::Empty);
        Self {
            columns,
            pool,
            registers,
        }
    }

    /// Runs `bytecode` to completion, reading filter values through
    /// `fetcher`.
    #[profiling::function]
    pub fn execute<F: ValueFetcher>(&mut self, bytecode: &[Bytecode], fetcher: &F) {
        for bc in bytecode {
            self.step(bc, fetcher);
        }
    }

    fn step<F: ValueFetcher>(&mut self, bc: &Bytecode, fetcher: &F) {
        use Opcode as O;
        let opcode = Opcode::from_u32(bc.opcode);
        match opcode {
            O::InitRange => {
                let a = super::InitRange::decode(bc);
                self.registers[a.dest.index as usize] =
                    RegValue::Range(Range { b: 0, e: a.size });
            }
            O::AllocateIndices => self.allocate_indices(bc),
            O::Iota => self.iota(bc),

            O::CastFilterValueId => self.cast_filter_value(bc, fetcher, StorageType::Id),
            O::CastFilterValueUint32 => self.cast_filter_value(bc, fetcher, StorageType::Uint32),
            O::CastFilterValueInt32 => self.cast_filter_value(bc, fetcher, StorageType::Int32),
            O::CastFilterValueInt64 => self.cast_filter_value(bc, fetcher, StorageType::Int64),
            O::CastFilterValueDouble => self.cast_filter_value(bc, fetcher, StorageType::Double),
            O::CastFilterValueString => self.cast_filter_value(bc, fetcher, StorageType::String),

            O::Uint32SetIdSortedEq => self.set_id_sorted_eq(bc),
            O::NullFilterIsNotNull => self.null_filter(bc, false),
            O::NullFilterIsNull => self.null_filter(bc, true),
            O::StrideCopy => self.stride_copy(bc),
            O::StrideTranslateAndCopySparseNullIndices => self.stride_translate_sparse(bc),
            O::StrideCopyDenseNullIndices => self.stride_copy_dense(bc),
            O::PrefixPopcount => self.prefix_popcount(bc),
            O::TranslateSparseNullIndices => self.translate_sparse(bc),

            _ => {
                let raw = bc.opcode;
                if raw >= O::SortedFilterIdEqualRange as u32
                    && raw <= O::SortedFilterStringUpperBound as u32
                {
                    let rel = raw - O::SortedFilterIdEqualRange as u32;
                    let ty = StorageType::from_index(rel / 3);
                    let mode = match rel % 3 {
                        0 => SortedFilterMode::EqualRange,
                        1 => SortedFilterMode::LowerBound,
                        _ => SortedFilterMode::UpperBound,
                    };
                    self.sorted_filter(bc, ty, mode);
                } else if raw >= O::NonStringFilterIdEq as u32
                    && raw <= O::NonStringFilterDoubleGe as u32
                {
                    let rel = raw - O::NonStringFilterIdEq as u32;
                    let ty = StorageType::from_index(rel / 6);
                    let op = comparison_from_index(rel % 6);
                    self.non_string_filter(bc, ty, op);
                } else if raw >= O::StringFilterEq as u32 && raw <= O::StringFilterRegex as u32 {
                    let rel = raw - O::StringFilterEq as u32;
                    let op = match rel {
                        6 => Op::Glob,
                        7 => Op::Regex,
                        i => comparison_from_index(i),
                    };
                    self.string_filter(bc, op);
                } else {
                    unreachable!("unhandled opcode {}", opcode.name());
                }
            }
        }
    }

    // --- Structural opcodes ---

    fn allocate_indices(&mut self, bc: &Bytecode) {
        let a = AllocateIndices::decode(bc);
        let reusable = matches!(
            &self.registers[a.dest_slab.index as usize],
            RegValue::Slab(slab) if slab.len() == a.size as usize
        );
        if !reusable {
            self.registers[a.dest_slab.index as usize] =
                RegValue::Slab(Slab::alloc(a.size as usize));
        }
        self.registers[a.dest_span.index as usize] = RegValue::Span(Span {
            slab: a.dest_slab.index,
            b: 0,
            e: a.size,
        });
    }

    fn iota(&mut self, bc: &Bytecode) {
        let a = Iota::decode(bc);
        let range = self.range(a.source);
        let mut span = self.span(a.update);
        debug_assert!(range.len() <= span.len());
        let mut slab = self.take_slab(span.slab);
        for i in 0..range.len() {
            slab[(span.b + i) as usize] = range.b + i;
        }
        self.put_slab(span.slab, slab);
        span.e = span.b + range.len();
        self.set_span(a.update, span);
    }

    // --- Filter value coercion ---

    fn cast_filter_value<F: ValueFetcher>(
        &mut self,
        bc: &Bytecode,
        fetcher: &F,
        ty: StorageType,
    ) {
        let a = CastFilterValue::decode(bc);
        let result = match ty {
            StorageType::Id => {
                cast_to_integer::<u32, F>(fetcher, a.fval_handle, a.op, CastValue::Id)
            }
            StorageType::Uint32 => {
                cast_to_integer::<u32, F>(fetcher, a.fval_handle, a.op, CastValue::Uint32)
            }
            StorageType::Int32 => {
                cast_to_integer::<i32, F>(fetcher, a.fval_handle, a.op, CastValue::Int32)
            }
            StorageType::Int64 => {
                cast_to_integer::<i64, F>(fetcher, a.fval_handle, a.op, CastValue::Int64)
            }
            StorageType::Double => cast_to_double(fetcher, a.fval_handle, a.op),
            StorageType::String => cast_to_string(self.pool, fetcher, a.fval_handle, a.op),
        };
        self.registers[a.dest.index as usize] = RegValue::CastResult(result);
    }

    // --- Sorted filters ---

    fn sorted_filter(&mut self, bc: &Bytecode, ty: StorageType, mode: SortedFilterMode) {
        let a = SortedFilter::decode(bc);
        let Some(value) = self.unwrap_cast_range(a.val, a.update) else {
            return;
        };
        let columns = self.columns;
        let pool = self.pool;
        let range = self.range_mut(a.update);
        let bound = a.write_result_to;
        match ty {
            StorageType::Id => sorted_id_filter(value.as_id(), mode, bound, range),
            StorageType::Uint32 => {
                let data = columns[a.col as usize].storage.uint32();
                let v = value.as_uint32();
                sorted_slice_filter(mode, bound, range, |lo| data[lo] < v, |lo| data[lo] <= v);
            }
            StorageType::Int32 => {
                let data = columns[a.col as usize].storage.int32();
                let v = value.as_int32();
                sorted_slice_filter(mode, bound, range, |lo| data[lo] < v, |lo| data[lo] <= v);
            }
            StorageType::Int64 => {
                let data = columns[a.col as usize].storage.int64();
                let v = value.as_int64();
                sorted_slice_filter(mode, bound, range, |lo| data[lo] < v, |lo| data[lo] <= v);
            }
            StorageType::Double => {
                let data = columns[a.col as usize].storage.double();
                let v = value.as_double();
                sorted_slice_filter(mode, bound, range, |lo| data[lo] < v, |lo| data[lo] <= v);
            }
            StorageType::String => {
                let data = columns[a.col as usize].storage.string();
                let needle: &str = match &value {
                    CastValue::StringId(id) => pool.get(*id),
                    CastValue::Str(s) => s,
                    _ => unreachable!("expected string cast value"),
                };
                sorted_slice_filter(
                    mode,
                    bound,
                    range,
                    |lo| pool.get(data[lo]) < needle,
                    |lo| pool.get(data[lo]) <= needle,
                );
            }
        }
    }

    fn set_id_sorted_eq(&mut self, bc: &Bytecode) {
        let a = Uint32SetIdSortedEq::decode(bc);
        let Some(value) = self.unwrap_cast_range(a.val, a.update) else {
            return;
        };
        let columns = self.columns;
        let range = self.range_mut(a.update);
        let val = value.as_uint32();
        let data = columns[a.col as usize].storage.uint32();

        // Set-id law: if `val` occurs at all, its first occurrence is at row
        // `val` and the run of equal values is contiguous from there.
        if val as usize >= data.len() || data[val as usize] != val {
            range.e = range.b;
            return;
        }
        let mut run_end = val as usize + 1;
        while run_end < data.len() && data[run_end] == val {
            run_end += 1;
        }
        range.b = range.b.max(val);
        range.e = range.e.min(run_end as u32);
        if range.b > range.e {
            range.e = range.b;
        }
    }

    // --- Linear filters ---

    fn non_string_filter(&mut self, bc: &Bytecode, ty: StorageType, op: Op) {
        let a = LinearFilter::decode(bc);
        let Some(value) = self.unwrap_cast_span(a.val, a.update) else {
            return;
        };
        let columns = self.columns;
        match ty {
            StorageType::Id => {
                let v = value.as_id();
                self.dispatch_comparison(&a, op, move |row| row, v);
            }
            StorageType::Uint32 => {
                let data = columns[a.col as usize].storage.uint32();
                let v = value.as_uint32();
                self.dispatch_comparison(&a, op, move |i| data[i as usize], v);
            }
            StorageType::Int32 => {
                let data = columns[a.col as usize].storage.int32();
                let v = value.as_int32();
                self.dispatch_comparison(&a, op, move |i| data[i as usize], v);
            }
            StorageType::Int64 => {
                let data = columns[a.col as usize].storage.int64();
                let v = value.as_int64();
                self.dispatch_comparison(&a, op, move |i| data[i as usize], v);
            }
            StorageType::Double => {
                let data = columns[a.col as usize].storage.double();
                let v = value.as_double();
                self.dispatch_comparison(&a, op, move |i| data[i as usize], v);
            }
            StorageType::String => unreachable!("string columns use StringFilter"),
        }
    }

    /// Monomorphises the comparison out of the inner loop: each arm hands
    /// `filter_indices` a closure with the operator baked in.
    fn dispatch_comparison<T: PartialOrd + Copy>(
        &mut self,
        a: &LinearFilter,
        op: Op,
        get: impl Fn(u32) -> T,
        v: T,
    ) {
        match op {
            Op::Eq => self.filter_indices(a.source, a.update, |i| get(i) == v),
            Op::Ne => self.filter_indices(a.source, a.update, |i| get(i) != v),
            Op::Lt => self.filter_indices(a.source, a.update, |i| get(i) < v),
            Op::Le => self.filter_indices(a.source, a.update, |i| get(i) <= v),
            Op::Gt => self.filter_indices(a.source, a.update, |i| get(i) > v),
            Op::Ge => self.filter_indices(a.source, a.update, |i| get(i) >= v),
            _ => unreachable!("{op:?} is not a comparison"),
        }
    }

    fn string_filter(&mut self, bc: &Bytecode, op: Op) {
        let a = LinearFilter::decode(bc);
        let Some(value) = self.unwrap_cast_span(a.val, a.update) else {
            return;
        };
        let columns = self.columns;
        let pool = self.pool;
        let data = columns[a.col as usize].storage.string();
        match op {
            // Equality resolved through the pool: compare interned ids.
            Op::Eq => {
                let CastValue::StringId(id) = value else {
                    unreachable!("expected interned needle")
                };
                self.filter_indices(a.source, a.update, |i| data[i as usize] == id);
            }
            Op::Ne => {
                let CastValue::StringId(id) = value else {
                    unreachable!("expected interned needle")
                };
                self.filter_indices(a.source, a.update, |i| data[i as usize] != id);
            }
            Op::Lt | Op::Le | Op::Gt | Op::Ge => {
                let CastValue::Str(needle) = value else {
                    unreachable!("expected raw needle")
                };
                let needle = needle.as_str();
                match op {
                    Op::Lt => self.filter_indices(a.source, a.update, |i| {
                        pool.get(data[i as usize]) < needle
                    }),
                    Op::Le => self.filter_indices(a.source, a.update, |i| {
                        pool.get(data[i as usize]) <= needle
                    }),
                    Op::Gt => self.filter_indices(a.source, a.update, |i| {
                        pool.get(data[i as usize]) > needle
                    }),
                    _ => self.filter_indices(a.source, a.update, |i| {
                        pool.get(data[i as usize]) >= needle
                    }),
                }
            }
            Op::Glob => {
                let CastValue::Str(pattern) = value else {
                    unreachable!("expected raw needle")
                };
                match glob::Pattern::new(&pattern) {
                    Ok(matcher) => self.filter_indices(a.source, a.update, |i| {
                        matcher.matches(pool.get(data[i as usize]))
                    }),
                    // An invalid pattern matches nothing.
                    Err(_) => self.collapse_span(a.update),
                }
            }
            Op::Regex => self.regex_filter(&a, value),
            _ => unreachable!("{op:?} is not a string operator"),
        }
    }

    #[cfg(feature = "regex")]
    fn regex_filter(&mut self, a: &LinearFilter, value: CastValue) {
        let CastValue::Str(pattern) = value else {
            unreachable!("expected raw needle")
        };
        let pool = self.pool;
        let data = self.columns[a.col as usize].storage.string();
        match regex_lite::Regex::new(&pattern) {
            Ok(re) => self.filter_indices(a.source, a.update, |i| {
                re.is_match(pool.get(data[i as usize]))
            }),
            Err(_) => self.collapse_span(a.update),
        }
    }

    #[cfg(not(feature = "regex"))]
    fn regex_filter(&mut self, a: &LinearFilter, _value: CastValue) {
        // Planning rejects regex predicates in this configuration; the
        // opcode can only come from a foreign serialized plan. Match
        // nothing rather than guessing.
        self.collapse_span(a.update);
    }

    /// Compacts the update span positionally: position `i` is kept iff
    /// `keep(source[i])`. Source and update spans always have equal length;
    /// they are either the same span (in-place filtering) or live in
    /// different slabs (the sparse-null translation scratch).
    fn filter_indices(
        &mut self,
        source_h: Handle<Span>,
        update_h: Handle<Span>,
        keep: impl Fn(u32) -> bool,
    ) {
        let source = self.span(source_h);
        let mut update = self.span(update_h);
        debug_assert_eq!(source.len(), update.len());

        if source.slab == update.slab {
            debug_assert_eq!(source.b, update.b);
            let mut slab = self.take_slab(update.slab);
            let mut written = update.b as usize;
            for i in 0..source.len() as usize {
                let src_val = slab[source.b as usize + i];
                slab[written] = slab[update.b as usize + i];
                written += keep(src_val) as usize;
            }
            self.put_slab(update.slab, slab);
            update.e = written as u32;
        } else {
            let mut update_slab = self.take_slab(update.slab);
            {
                let source_slab = self.slab_ref(source.slab);
                let mut written = update.b as usize;
                for i in 0..source.len() as usize {
                    let src_val = source_slab[source.b as usize + i];
                    update_slab[written] = update_slab[update.b as usize + i];
                    written += keep(src_val) as usize;
                }
                update.e = written as u32;
            }
            self.put_slab(update.slab, update_slab);
        }
        self.set_span(update_h, update);
    }

    // --- Null handling ---

    fn null_filter(&mut self, bc: &Bytecode, is_null: bool) {
        let a = NullFilter::decode(bc);
        let mut span = self.span(a.update);
        let bit_vector = self.columns[a.col as usize]
            .nulls
            .bit_vector()
            .unwrap_or_else(|| unreachable!("NullFilter on a non-null column"));
        let mut slab = self.take_slab(span.slab);
        let kept = bit_vector.pack_left_in_place(
            &mut slab[span.b as usize..span.e as usize],
            /* invert= */ is_null,
        );
        self.put_slab(span.slab, slab);
        span.e = span.b + kept as u32;
        self.set_span(a.update, span);
    }

    fn prefix_popcount(&mut self, bc: &Bytecode) {
        let a = PrefixPopcount::decode(bc);
        // Memoized: a register that already holds a slab is trusted. The
        // same cursor re-executed amortizes the popcount this way.
        if matches!(&self.registers[a.dest.index as usize], RegValue::Slab(_)) {
            return;
        }
        let counts = match &self.columns[a.col as usize].nulls {
            NullStorage::SparseNull {
                prefix_popcount: Some(table),
                ..
            } => table.clone(),
            NullStorage::SparseNull { bit_vector, .. } => bit_vector.prefix_popcount(),
            _ => unreachable!("PrefixPopcount on a column without a sparse overlay"),
        };
        self.registers[a.dest.index as usize] = RegValue::Slab(counts);
    }

    fn translate_sparse(&mut self, bc: &Bytecode) {
        let a = TranslateSparseNullIndices::decode(bc);
        let source = self.span(a.source);
        let mut update = self.span(a.update);
        let bit_vector = sparse_bit_vector(&self.columns[a.col as usize]);

        let mut update_slab = self.take_slab(update.slab);
        {
            let source_slab = self.slab_ref(source.slab);
            let counts = self.slab_ref(a.popcount.index);
            for i in 0..source.len() as usize {
                let row = source_slab[source.b as usize + i];
                update_slab[update.b as usize + i] = counts[row as usize / 64]
                    + bit_vector.count_set_bits_before_in_word(row as usize) as u32;
            }
        }
        self.put_slab(update.slab, update_slab);
        update.e = update.b + source.len();
        self.set_span(a.update, update);
    }

    // --- Output layout ---

    fn stride_copy(&mut self, bc: &Bytecode) {
        let a = StrideCopy::decode(bc);
        let source = self.span(a.source);
        let mut update = self.span(a.update);
        debug_assert!(source.len() * a.stride <= update.len());

        let mut update_slab = self.take_slab(update.slab);
        {
            let source_slab = self.slab_ref(source.slab);
            for i in 0..source.len() as usize {
                update_slab[update.b as usize + i * a.stride as usize] =
                    source_slab[source.b as usize + i];
            }
        }
        self.put_slab(update.slab, update_slab);
        update.e = update.b + source.len() * a.stride;
        self.set_span(a.update, update);
    }

    fn stride_translate_sparse(&mut self, bc: &Bytecode) {
        let a = StrideTranslateAndCopySparseNullIndices::decode(bc);
        let span = self.span(a.update);
        let bit_vector = sparse_bit_vector(&self.columns[a.col as usize]);

        let mut slab = self.take_slab(span.slab);
        {
            let counts = self.slab_ref(a.popcount.index);
            let mut pos = span.b as usize;
            while pos < span.e as usize {
                let row = slab[pos];
                slab[pos + a.offset as usize] = if bit_vector.is_set(row as usize) {
                    counts[row as usize / 64]
                        + bit_vector.count_set_bits_before_in_word(row as usize) as u32
                } else {
                    NULL_INDEX_SENTINEL
                };
                pos += a.stride as usize;
            }
        }
        self.put_slab(span.slab, slab);
    }

    fn stride_copy_dense(&mut self, bc: &Bytecode) {
        let a = StrideCopyDenseNullIndices::decode(bc);
        let span = self.span(a.update);
        let bit_vector = self.columns[a.col as usize]
            .nulls
            .bit_vector()
            .unwrap_or_else(|| unreachable!("dense-null copy on a non-null column"));

        let mut slab = self.take_slab(span.slab);
        let mut pos = span.b as usize;
        while pos < span.e as usize {
            let row = slab[pos];
            slab[pos + a.offset as usize] = if bit_vector.is_set(row as usize) {
                row
            } else {
                NULL_INDEX_SENTINEL
            };
            pos += a.stride as usize;
        }
        self.put_slab(span.slab, slab);
    }

    // --- Cast result plumbing ---

    /// Reads a cast result; on `NoneMatch` collapses the range to empty and
    /// returns `None`, on `AllMatch` returns `None` leaving the range
    /// untouched (the predicate is dropped).
    fn unwrap_cast_range(
        &mut self,
        val: Handle<CastFilterValueResult>,
        range_h: Handle<Range>,
    ) -> Option<CastValue> {
        match self.cast_result(val).clone() {
            CastFilterValueResult::Valid(v) => Some(v),
            CastFilterValueResult::AllMatch => None,
            CastFilterValueResult::NoneMatch => {
                let range = self.range_mut(range_h);
                range.e = range.b;
                None
            }
        }
    }

    /// As [`Self::unwrap_cast_range`] but collapsing a span.
    fn unwrap_cast_span(
        &mut self,
        val: Handle<CastFilterValueResult>,
        span_h: Handle<Span>,
    ) -> Option<CastValue> {
        match self.cast_result(val).clone() {
            CastFilterValueResult::Valid(v) => Some(v),
            CastFilterValueResult::AllMatch => None,
            CastFilterValueResult::NoneMatch => {
                self.collapse_span(span_h);
                None
            }
        }
    }

    fn collapse_span(&mut self, span_h: Handle<Span>) {
        let mut span = self.span(span_h);
        span.e = span.b;
        self.set_span(span_h, span);
    }

    // --- Register file access ---
    //
    // A handle whose register holds a different variant is a programming
    // error (or a corrupted plan); these panic rather than recover.

    fn range(&self, h: Handle<Range>) -> Range {
        match &self.registers[h.index as usize] {
            RegValue::Range(r) => *r,
            other => unreachable!("register {} holds {}, expected Range", h.index, other.variant_name()),
        }
    }

    fn range_mut(&mut self, h: Handle<Range>) -> &mut Range {
        match &mut self.registers[h.index as usize] {
            RegValue::Range(r) => r,
            other => unreachable!("register {} holds {}, expected Range", h.index, other.variant_name()),
        }
    }

    fn span(&self, h: Handle<Span>) -> Span {
        match &self.registers[h.index as usize] {
            RegValue::Span(s) => *s,
            other => unreachable!("register {} holds {}, expected Span", h.index, other.variant_name()),
        }
    }

    fn set_span(&mut self, h: Handle<Span>, span: Span) {
        self.registers[h.index as usize] = RegValue::Span(span);
    }

    fn cast_result(&self, h: Handle<CastFilterValueResult>) -> &CastFilterValueResult {
        match &self.registers[h.index as usize] {
            RegValue::CastResult(r) => r,
            other => unreachable!(
                "register {} holds {}, expected CastResult",
                h.index,
                other.variant_name()
            ),
        }
    }

    fn take_slab(&mut self, reg: u32) -> Slab<u32> {
        match std::mem::take(&mut self.registers[reg as usize]) {
            RegValue::Slab(slab) => slab,
            other => unreachable!("register {reg} holds {}, expected Slab", other.variant_name()),
        }
    }

    fn put_slab(&mut self, reg: u32, slab: Slab<u32>) {
        self.registers[reg as usize] = RegValue::Slab(slab);
    }

    fn slab_ref(&self, reg: u32) -> &Slab<u32> {
        match &self.registers[reg as usize] {
            RegValue::Slab(slab) => slab,
            other => unreachable!("register {reg} holds {}, expected Slab", other.variant_name()),
        }
    }

    /// Resolves a span register to its index slice. Used by cursors to walk
    /// the output of an execution.
    pub fn span_slice(&self, h: Handle<Span>) -> &[u32] {
        let span = self.span(h);
        &self.slab_ref(span.slab)[span.b as usize..span.e as usize]
    }
}

fn sparse_bit_vector(column: &Column) -> &tf_containers::BitVector {
    match &column.nulls {
        NullStorage::SparseNull { bit_vector, .. } => bit_vector,
        _ => unreachable!("expected a sparse-null overlay"),
    }
}

fn comparison_from_index(index: u32) -> Op {
    match index {
        0 => Op::Eq,
        1 => Op::Ne,
        2 => Op::Lt,
        3 => Op::Le,
        4 => Op::Gt,
        _ => Op::Ge,
    }
}

// --- Sorted filter helpers ---

/// Narrows `range` on an `Id` column, where the value of row `i` is `i`.
///
/// A value falling outside the current range degenerates to an empty range,
/// including for the bound modes.
fn sorted_id_filter(val: u32, mode: SortedFilterMode, bound: BoundModifier, range: &mut Range) {
    match mode {
        SortedFilterMode::EqualRange => {
            let in_bounds = val >= range.b && val < range.e;
            range.b = val;
            range.e = val + u32::from(in_bounds);
        }
        SortedFilterMode::LowerBound | SortedFilterMode::UpperBound => {
            if val >= range.b && val < range.e {
                let pos = val + u32::from(mode == SortedFilterMode::UpperBound);
                match bound {
                    BoundModifier::BeginBound => range.b = pos,
                    BoundModifier::EndBound => range.e = pos,
                    BoundModifier::BothBounds => unreachable!("bound modes write one end"),
                }
            } else {
                range.e = range.b;
            }
        }
    }
}

/// Narrows `range` by binary search over sorted storage. `lt`/`le` report
/// whether the element at an absolute storage index compares below (or
/// below-or-equal) the filter value.
fn sorted_slice_filter(
    mode: SortedFilterMode,
    bound: BoundModifier,
    range: &mut Range,
    lt: impl Fn(usize) -> bool,
    le: impl Fn(usize) -> bool,
) {
    let lower = |range: &Range| partition_point(range.b, range.e, &lt);
    let upper = |range: &Range| partition_point(range.b, range.e, &le);
    match mode {
        SortedFilterMode::EqualRange => {
            debug_assert_eq!(bound, BoundModifier::BothBounds);
            let lo = lower(range);
            let hi = upper(range);
            if lo < hi {
                range.b = lo;
                range.e = hi;
            } else {
                range.e = range.b;
            }
        }
        SortedFilterMode::LowerBound => {
            let pos = lower(range);
            write_bound(bound, range, pos);
        }
        SortedFilterMode::UpperBound => {
            let pos = upper(range);
            write_bound(bound, range, pos);
        }
    }
}

fn write_bound(bound: BoundModifier, range: &mut Range, pos: u32) {
    match bound {
        BoundModifier::BeginBound => range.b = pos,
        BoundModifier::EndBound => range.e = pos,
        BoundModifier::BothBounds => unreachable!("bound modes write one end"),
    }
}

/// First index in `[b, e)` for which `pred` is false; `e` if none.
fn partition_point(b: u32, e: u32, pred: impl Fn(usize) -> bool) -> u32 {
    let mut lo = b;
    let mut hi = e;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if pred(mid as usize) {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    lo
}

// --- Filter value casts ---
//
// These implement SQL-style coercion of a caller-supplied value into a
// column's comparison domain. The tri-state result means contradictions are
// not errors: `NoneMatch` collapses the result to empty, `AllMatch` drops
// the predicate.

/// An integer comparison domain a filter value can be coerced into.
trait IntTarget: Copy {
    const MIN_I64: i64;
    const MAX_I64: i64;
    /// Inclusive lower bound in the double domain (exactly representable).
    const MIN_F64: f64;
    /// Exclusive upper bound in the double domain (exactly representable).
    const MAX_EXCLUSIVE_F64: f64;

    fn from_i64(v: i64) -> Self;
    fn from_f64(v: f64) -> Self;
}

impl IntTarget for u32 {
    const MIN_I64: i64 = 0;
    const MAX_I64: i64 = u32::MAX as i64;
    const MIN_F64: f64 = 0.0;
    const MAX_EXCLUSIVE_F64: f64 = 4_294_967_296.0;

    fn from_i64(v: i64) -> Self {
        v as u32
    }
    fn from_f64(v: f64) -> Self {
        v as u32
    }
}

impl IntTarget for i32 {
    const MIN_I64: i64 = i32::MIN as i64;
    const MAX_I64: i64 = i32::MAX as i64;
    const MIN_F64: f64 = -2_147_483_648.0;
    const MAX_EXCLUSIVE_F64: f64 = 2_147_483_648.0;

    fn from_i64(v: i64) -> Self {
        v as i32
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
}

impl IntTarget for i64 {
    const MIN_I64: i64 = i64::MIN;
    const MAX_I64: i64 = i64::MAX;
    // 2^63 exactly; the asymmetry of two's complement means the upper bound
    // is exclusive while the lower is inclusive.
    const MIN_F64: f64 = -9_223_372_036_854_775_808.0;
    const MAX_EXCLUSIVE_F64: f64 = 9_223_372_036_854_775_808.0;

    fn from_i64(v: i64) -> Self {
        v
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
}

fn cast_to_integer<T: IntTarget, F: ValueFetcher>(
    fetcher: &F,
    handle: u32,
    op: Op,
    wrap: fn(T) -> CastValue,
) -> CastFilterValueResult {
    use CastFilterValueResult as R;
    match fetcher.value_type(handle) {
        FetchedValueType::Int64 => {
            let v = fetcher.int64_value(handle);
            let is_small = v < T::MIN_I64;
            let is_big = v > T::MAX_I64;
            if is_small || is_big {
                return match op {
                    Op::Lt | Op::Le if is_small => R::NoneMatch,
                    Op::Gt | Op::Ge if is_big => R::NoneMatch,
                    Op::Eq => R::NoneMatch,
                    Op::Ne | Op::Lt | Op::Le | Op::Gt | Op::Ge => R::AllMatch,
                    _ => R::NoneMatch,
                };
            }
            R::Valid(wrap(T::from_i64(v)))
        }
        FetchedValueType::Double => {
            let d = fetcher.double_value(handle);
            // NaN compares false to everything, regardless of the operator.
            if d.is_nan() {
                return R::NoneMatch;
            }
            let is_small = d < T::MIN_F64;
            let is_big = d >= T::MAX_EXCLUSIVE_F64;
            if d == d.trunc() && !is_small && !is_big {
                return R::Valid(wrap(T::from_f64(d)));
            }
            // A fractional (or out-of-range) double: pick the rounding
            // direction that keeps the integer comparison exact.
            match op {
                Op::Lt => round_double_to_int(is_small, is_big, d.ceil(), wrap),
                Op::Le => round_double_to_int(is_small, is_big, d.floor(), wrap),
                Op::Gt => round_double_to_int(is_big, is_small, d.floor(), wrap),
                Op::Ge => round_double_to_int(is_big, is_small, d.ceil(), wrap),
                Op::Eq => R::NoneMatch,
                Op::Ne => R::AllMatch,
                _ => R::NoneMatch,
            }
        }
        // Strings sort above all numbers.
        FetchedValueType::String => match op {
            Op::Ne | Op::Lt | Op::Le => R::AllMatch,
            _ => R::NoneMatch,
        },
        // SQL null semantics: null compares false to everything.
        FetchedValueType::Null => R::NoneMatch,
    }
}

fn round_double_to_int<T: IntTarget>(
    none_match: bool,
    all_match: bool,
    rounded: f64,
    wrap: fn(T) -> CastValue,
) -> CastFilterValueResult {
    if none_match {
        CastFilterValueResult::NoneMatch
    } else if all_match {
        CastFilterValueResult::AllMatch
    } else {
        CastFilterValueResult::Valid(wrap(T::from_f64(rounded)))
    }
}

fn cast_to_double<F: ValueFetcher>(fetcher: &F, handle: u32, op: Op) -> CastFilterValueResult {
    use CastFilterValueResult as R;
    match fetcher.value_type(handle) {
        // NaN flows through: IEEE comparisons make it match nothing except
        // under Ne, which matches everything.
        FetchedValueType::Double => R::Valid(CastValue::Double(fetcher.double_value(handle))),
        FetchedValueType::Int64 => {
            let i = fetcher.int64_value(handle);
            let approx = i as f64;
            // Exactly representable integers convert directly. The upper
            // boundary needs care: 2^63 round-trips through `as` saturation
            // even though i64::MAX is not exactly representable.
            let exact = approx < 9_223_372_036_854_775_808.0 && approx as i64 == i;
            if exact {
                return R::Valid(CastValue::Double(approx));
            }
            let approx_greater =
                approx >= 9_223_372_036_854_775_808.0 || approx as i64 > i;
            match op {
                // Nudge toward the operator-correct side so the double
                // comparison stays equivalent to the integer one.
                Op::Lt => R::Valid(CastValue::Double(if approx_greater {
                    approx
                } else {
                    approx.next_up()
                })),
                Op::Le => R::Valid(CastValue::Double(if approx_greater {
                    approx.next_down()
                } else {
                    approx
                })),
                Op::Gt => R::Valid(CastValue::Double(if approx_greater {
                    approx.next_down()
                } else {
                    approx
                })),
                Op::Ge => R::Valid(CastValue::Double(if approx_greater {
                    approx
                } else {
                    approx.next_up()
                })),
                Op::Eq => R::NoneMatch,
                Op::Ne => R::AllMatch,
                _ => R::NoneMatch,
            }
        }
        FetchedValueType::String => match op {
            Op::Ne | Op::Lt | Op::Le => R::AllMatch,
            _ => R::NoneMatch,
        },
        FetchedValueType::Null => R::NoneMatch,
    }
}

fn cast_to_string<F: ValueFetcher>(
    pool: &StringPool,
    fetcher: &F,
    handle: u32,
    op: Op,
) -> CastFilterValueResult {
    use CastFilterValueResult as R;
    match fetcher.value_type(handle) {
        FetchedValueType::String => {
            let s = fetcher.string_value(handle);
            match op {
                // Equality goes through the pool: a needle that was never
                // interned cannot equal any stored value.
                Op::Eq => match pool.lookup(s) {
                    Some(id) => R::Valid(CastValue::StringId(id)),
                    None => R::NoneMatch,
                },
                Op::Ne => match pool.lookup(s) {
                    Some(id) => R::Valid(CastValue::StringId(id)),
                    None => R::AllMatch,
                },
                Op::Lt | Op::Le | Op::Gt | Op::Ge | Op::Glob | Op::Regex => {
                    R::Valid(CastValue::Str(s.to_owned()))
                }
                _ => R::NoneMatch,
            }
        }
        // Numbers sort below all strings.
        FetchedValueType::Int64 | FetchedValueType::Double => match op {
            Op::Ne | Op::Gt | Op::Ge => R::AllMatch,
            _ => R::NoneMatch,
        },
        FetchedValueType::Null => R::NoneMatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A fetcher holding one value, always returned regardless of index.
    enum OneValue {
        Int(i64),
        Double(f64),
        Str(&'static str),
        Null,
    }

    impl ValueFetcher for OneValue {
        fn value_type(&self, _: u32) -> FetchedValueType {
            match self {
                Self::Int(_) => FetchedValueType::Int64,
                Self::Double(_) => FetchedValueType::Double,
                Self::Str(_) => FetchedValueType::String,
                Self::Null => FetchedValueType::Null,
            }
        }
        fn int64_value(&self, _: u32) -> i64 {
            match self {
                Self::Int(v) => *v,
                _ => unreachable!(),
            }
        }
        fn double_value(&self, _: u32) -> f64 {
            match self {
                Self::Double(v) => *v,
                _ => unreachable!(),
            }
        }
        fn string_value(&self, _: u32) -> &str {
            match self {
                Self::Str(s) => s,
                _ => unreachable!(),
            }
        }
    }

    fn int_cast<T: IntTarget>(value: OneValue, op: Op, wrap: fn(T) -> CastValue) -> CastFilterValueResult {
        cast_to_integer::<T, _>(&value, 0, op, wrap)
    }

    #[test]
    fn integer_cast_in_range() {
        assert_eq!(
            int_cast::<u32>(OneValue::Int(42), Op::Eq, CastValue::Uint32),
            CastFilterValueResult::Valid(CastValue::Uint32(42))
        );
    }

    #[test]
    fn integer_cast_out_of_range() {
        use CastFilterValueResult as R;
        let big = OneValue::Int(i64::from(u32::MAX) + 1);
        assert_eq!(int_cast::<u32>(big, Op::Eq, CastValue::Uint32), R::NoneMatch);
        assert_eq!(
            int_cast::<u32>(OneValue::Int(i64::from(u32::MAX) + 1), Op::Lt, CastValue::Uint32),
            R::AllMatch
        );
        assert_eq!(
            int_cast::<u32>(OneValue::Int(-1), Op::Lt, CastValue::Uint32),
            R::NoneMatch
        );
        assert_eq!(
            int_cast::<u32>(OneValue::Int(-1), Op::Gt, CastValue::Uint32),
            R::AllMatch
        );
        assert_eq!(
            int_cast::<u32>(OneValue::Int(-1), Op::Ne, CastValue::Uint32),
            R::AllMatch
        );
    }

    #[test]
    fn double_to_integer_rounding_keeps_comparisons_exact() {
        use CastFilterValueResult as R;
        // x < 10.5 on integers is x < 11.
        assert_eq!(
            int_cast::<i64>(OneValue::Double(10.5), Op::Lt, CastValue::Int64),
            R::Valid(CastValue::Int64(11))
        );
        // x <= 10.5 is x <= 10.
        assert_eq!(
            int_cast::<i64>(OneValue::Double(10.5), Op::Le, CastValue::Int64),
            R::Valid(CastValue::Int64(10))
        );
        // x > 10.5 is x > 10.
        assert_eq!(
            int_cast::<i64>(OneValue::Double(10.5), Op::Gt, CastValue::Int64),
            R::Valid(CastValue::Int64(10))
        );
        // x >= 10.5 is x >= 11.
        assert_eq!(
            int_cast::<i64>(OneValue::Double(10.5), Op::Ge, CastValue::Int64),
            R::Valid(CastValue::Int64(11))
        );
        // Fractional equality can never hold.
        assert_eq!(
            int_cast::<i64>(OneValue::Double(10.5), Op::Eq, CastValue::Int64),
            R::NoneMatch
        );
        assert_eq!(
            int_cast::<i64>(OneValue::Double(10.5), Op::Ne, CastValue::Int64),
            R::AllMatch
        );
    }

    #[test]
    fn double_cast_edge_values() {
        use CastFilterValueResult as R;
        assert_eq!(
            int_cast::<i64>(OneValue::Double(f64::NAN), Op::Eq, CastValue::Int64),
            R::NoneMatch
        );
        assert_eq!(
            int_cast::<i64>(OneValue::Double(f64::NAN), Op::Ne, CastValue::Int64),
            R::NoneMatch
        );
        // The exact exclusive boundary 2^63.
        assert_eq!(
            int_cast::<i64>(
                OneValue::Double(9_223_372_036_854_775_808.0),
                Op::Eq,
                CastValue::Int64
            ),
            R::NoneMatch
        );
        assert_eq!(
            int_cast::<i64>(
                OneValue::Double(9_223_372_036_854_775_808.0),
                Op::Lt,
                CastValue::Int64
            ),
            R::AllMatch
        );
        // u32::MAX itself is exactly representable and in range.
        assert_eq!(
            int_cast::<u32>(OneValue::Double(4_294_967_295.0), Op::Eq, CastValue::Uint32),
            R::Valid(CastValue::Uint32(u32::MAX))
        );
    }

    #[test]
    fn string_against_numeric_column() {
        use CastFilterValueResult as R;
        assert_eq!(
            int_cast::<i64>(OneValue::Str("abc"), Op::Eq, CastValue::Int64),
            R::NoneMatch
        );
        assert_eq!(
            int_cast::<i64>(OneValue::Str("abc"), Op::Lt, CastValue::Int64),
            R::AllMatch
        );
        assert_eq!(
            int_cast::<i64>(OneValue::Str("abc"), Op::Gt, CastValue::Int64),
            R::NoneMatch
        );
    }

    #[test]
    fn null_matches_nothing() {
        use CastFilterValueResult as R;
        for op in [Op::Eq, Op::Ne, Op::Lt, Op::Le, Op::Gt, Op::Ge] {
            assert_eq!(int_cast::<i64>(OneValue::Null, op, CastValue::Int64), R::NoneMatch);
            assert_eq!(cast_to_double(&OneValue::Null, 0, op), R::NoneMatch);
        }
    }

    #[test]
    fn int_to_double_nudges_toward_operator_correct_side() {
        use CastFilterValueResult as R;
        // 2^53 + 1 is the first integer a double cannot represent.
        let v = (1i64 << 53) + 1;
        let approx = v as f64; // rounds down to 2^53
        let R::Valid(CastValue::Double(lt)) = cast_to_double(&OneValue::Int(v), 0, Op::Lt) else {
            panic!("expected valid cast");
        };
        // x < v must keep x == 2^53, so the cast value is nudged up.
        assert!(lt > approx);
        let R::Valid(CastValue::Double(le)) = cast_to_double(&OneValue::Int(v), 0, Op::Le) else {
            panic!("expected valid cast");
        };
        assert_eq!(le, approx);
        assert_eq!(cast_to_double(&OneValue::Int(v), 0, Op::Eq), R::NoneMatch);
        assert_eq!(cast_to_double(&OneValue::Int(v), 0, Op::Ne), R::AllMatch);
    }

    #[test]
    fn exact_int_to_double_is_direct() {
        let got = cast_to_double(&OneValue::Int(1), 0, Op::Eq);
        assert_eq!(got, CastFilterValueResult::Valid(CastValue::Double(1.0)));
    }

    #[test]
    fn sorted_id_filter_modes() {
        let mut r = Range { b: 0, e: 10 };
        sorted_id_filter(4, SortedFilterMode::EqualRange, BoundModifier::BothBounds, &mut r);
        assert_eq!(r, Range { b: 4, e: 5 });

        // Out of bounds degenerates to empty.
        let mut r = Range { b: 0, e: 10 };
        sorted_id_filter(10, SortedFilterMode::EqualRange, BoundModifier::BothBounds, &mut r);
        assert_eq!(r.len(), 0);

        // ts < 7: upper end written with the lower bound of 7.
        let mut r = Range { b: 0, e: 10 };
        sorted_id_filter(7, SortedFilterMode::LowerBound, BoundModifier::EndBound, &mut r);
        assert_eq!(r, Range { b: 0, e: 7 });

        // ts > 7: begin written one past 7.
        let mut r = Range { b: 0, e: 10 };
        sorted_id_filter(7, SortedFilterMode::UpperBound, BoundModifier::BeginBound, &mut r);
        assert_eq!(r, Range { b: 8, e: 10 });
    }

    #[test]
    fn sorted_slice_filter_equal_range() {
        let data = [10i64, 20, 30, 30, 30, 40];
        let mut r = Range { b: 0, e: 6 };
        sorted_slice_filter(
            SortedFilterMode::EqualRange,
            BoundModifier::BothBounds,
            &mut r,
            |i| data[i] < 30,
            |i| data[i] <= 30,
        );
        assert_eq!(r, Range { b: 2, e: 5 });

        // A run extending to the very end of the range.
        let data = [1i64, 2, 3, 3];
        let mut r = Range { b: 0, e: 4 };
        sorted_slice_filter(
            SortedFilterMode::EqualRange,
            BoundModifier::BothBounds,
            &mut r,
            |i| data[i] < 3,
            |i| data[i] <= 3,
        );
        assert_eq!(r, Range { b: 2, e: 4 });

        // Absent value.
        let data = [1i64, 2, 4];
        let mut r = Range { b: 0, e: 3 };
        sorted_slice_filter(
            SortedFilterMode::EqualRange,
            BoundModifier::BothBounds,
            &mut r,
            |i| data[i] < 3,
            |i| data[i] <= 3,
        );
        assert_eq!(r.len(), 0);
    }
}
