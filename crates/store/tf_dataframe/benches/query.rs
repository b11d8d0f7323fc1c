use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};

use tf_dataframe::{
    Dataframe, FetchedValueType, FilterSpec, Op, RuntimeDataframeBuilder, StringPool,
    ValueFetcher,
};

const ROWS: i64 = 1 << 20;

struct Int64Slots(Vec<i64>);

impl ValueFetcher for Int64Slots {
    fn value_type(&self, _: u32) -> FetchedValueType {
        FetchedValueType::Int64
    }
    fn int64_value(&self, index: u32) -> i64 {
        self.0[index as usize]
    }
    fn double_value(&self, _: u32) -> f64 {
        unreachable!()
    }
    fn string_value(&self, _: u32) -> &str {
        unreachable!()
    }
}

/// One row of (id, sorted timestamp, pseudo-random payload).
struct Row(i64);

impl ValueFetcher for Row {
    fn value_type(&self, _: u32) -> FetchedValueType {
        FetchedValueType::Int64
    }
    fn int64_value(&self, index: u32) -> i64 {
        match index {
            0 => self.0,
            1 => self.0 * 8,
            // Cheap deterministic scramble.
            _ => (self.0.wrapping_mul(2654435761) >> 7) & 0xffff,
        }
    }
    fn double_value(&self, _: u32) -> f64 {
        unreachable!()
    }
    fn string_value(&self, _: u32) -> &str {
        unreachable!()
    }
}

fn build_frame() -> Dataframe {
    let names = vec!["id".to_owned(), "ts".to_owned(), "value".to_owned()];
    let mut builder = RuntimeDataframeBuilder::new(names, Arc::new(StringPool::new()));
    for i in 0..ROWS {
        assert!(builder.add_row(&Row(i)));
    }
    builder.build().expect("build")
}

fn bench_sorted_eq(c: &mut Criterion) {
    let df = build_frame();
    let mut specs = vec![FilterSpec::new(1, 0, Op::Eq)];
    let plan = df.plan_query(&mut specs, 0b111).expect("plan");
    let fetcher = Int64Slots(vec![(ROWS / 2) * 8]);

    c.bench_function("sorted_eq_1m", |b| {
        let mut cursor = df.cursor(plan.clone());
        b.iter(|| {
            cursor.execute(&fetcher);
            std::hint::black_box(cursor.result_row_count())
        });
    });
}

fn bench_linear_filter(c: &mut Criterion) {
    let df = build_frame();
    let mut specs = vec![FilterSpec::new(2, 0, Op::Gt)];
    let plan = df.plan_query(&mut specs, 0b111).expect("plan");
    let fetcher = Int64Slots(vec![0x8000]);

    c.bench_function("linear_gt_1m", |b| {
        let mut cursor = df.cursor(plan.clone());
        b.iter(|| {
            cursor.execute(&fetcher);
            std::hint::black_box(cursor.result_row_count())
        });
    });
}

fn bench_plan(c: &mut Criterion) {
    let df = build_frame();
    c.bench_function("plan_two_filters", |b| {
        b.iter(|| {
            let mut specs = vec![FilterSpec::new(1, 0, Op::Ge), FilterSpec::new(2, 1, Op::Eq)];
            std::hint::black_box(df.plan_query(&mut specs, 0b111).expect("plan"))
        });
    });
}

criterion_group!(benches, bench_sorted_eq, bench_linear_filter, bench_plan);
criterion_main!(benches);
