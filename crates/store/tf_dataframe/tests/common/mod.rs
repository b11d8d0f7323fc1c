//! Shared helpers for the end-to-end query tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::Arc;

use tf_dataframe::{
    CellCallback, Dataframe, FetchedValueType, FilterSpec, Op, RuntimeDataframeBuilder,
    StringPool, ValueFetcher,
};

/// A dynamically-typed value for feeding builders and filters.
#[derive(Clone, Debug, PartialEq)]
pub enum Val {
    I(i64),
    F(f64),
    S(&'static str),
    Null,
}

/// Fetcher backed by a plain vector; slot `i` is `values[i]`.
pub struct SlotFetcher(pub Vec<Val>);

impl ValueFetcher for SlotFetcher {
    fn value_type(&self, index: u32) -> FetchedValueType {
        match &self.0[index as usize] {
            Val::I(_) => FetchedValueType::Int64,
            Val::F(_) => FetchedValueType::Double,
            Val::S(_) => FetchedValueType::String,
            Val::Null => FetchedValueType::Null,
        }
    }
    fn int64_value(&self, index: u32) -> i64 {
        match &self.0[index as usize] {
            Val::I(v) => *v,
            other => panic!("slot {index} is {other:?}, not an integer"),
        }
    }
    fn double_value(&self, index: u32) -> f64 {
        match &self.0[index as usize] {
            Val::F(v) => *v,
            other => panic!("slot {index} is {other:?}, not a double"),
        }
    }
    fn string_value(&self, index: u32) -> &str {
        match &self.0[index as usize] {
            Val::S(s) => s,
            other => panic!("slot {index} is {other:?}, not a string"),
        }
    }
}

/// Builds a frame row by row through the runtime builder.
pub fn frame_from_rows(names: &[&str], rows: &[Vec<Val>]) -> Dataframe {
    let mut builder = RuntimeDataframeBuilder::new(
        names.iter().map(|n| (*n).to_owned()).collect(),
        Arc::new(StringPool::new()),
    );
    for row in rows {
        assert_eq!(row.len(), names.len());
        assert!(builder.add_row(&SlotFetcher(row.clone())), "row rejected: {:?}", builder.status());
    }
    builder.build().expect("build")
}

/// Plans and executes `filters` (given as `(column, op, value)`), returning
/// the matched row indices.
pub fn run_query(df: &Dataframe, filters: &[(u32, Op, Val)], cols_used: u64) -> Vec<u32> {
    let mut specs: Vec<FilterSpec> = filters
        .iter()
        .enumerate()
        .map(|(i, (col, op, _))| FilterSpec::new(*col, i as u32, *op))
        .collect();
    let plan = df.plan_query(&mut specs, cols_used).expect("plan");
    let mut cursor = df.cursor(plan);
    cursor.execute(&slots_for(&specs, filters));
    collect_indices(&mut cursor)
}

/// Arranges caller-order filter values into the slots planning assigned.
pub fn slots_for(specs: &[FilterSpec], filters: &[(u32, Op, Val)]) -> SlotFetcher {
    let mut slots = vec![Val::Null; specs.len()];
    for spec in specs {
        if let Some(value_index) = spec.value_index {
            slots[value_index as usize] = filters[spec.source_index as usize].2.clone();
        }
    }
    SlotFetcher(slots)
}

pub fn collect_indices(cursor: &mut tf_dataframe::Cursor<'_>) -> Vec<u32> {
    let mut out = Vec::new();
    while !cursor.eof() {
        out.push(cursor.row_index());
        cursor.next();
    }
    out
}

/// A cell value captured through the typed callback.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Null,
    U32(u32),
    I32(i32),
    I64(i64),
    F64(f64),
    Str(String),
}

#[derive(Default)]
pub struct CellCollector(pub Option<Cell>);

impl CellCallback for CellCollector {
    fn on_null(&mut self) {
        self.0 = Some(Cell::Null);
    }
    fn on_u32(&mut self, value: u32) {
        self.0 = Some(Cell::U32(value));
    }
    fn on_i32(&mut self, value: i32) {
        self.0 = Some(Cell::I32(value));
    }
    fn on_i64(&mut self, value: i64) {
        self.0 = Some(Cell::I64(value));
    }
    fn on_f64(&mut self, value: f64) {
        self.0 = Some(Cell::F64(value));
    }
    fn on_str(&mut self, value: &str) {
        self.0 = Some(Cell::Str(value.to_owned()));
    }
}

pub fn cell(cursor: &tf_dataframe::Cursor<'_>, col: u32) -> Cell {
    let mut collector = CellCollector::default();
    cursor.cell(col, &mut collector);
    collector.0.expect("callback fired")
}
