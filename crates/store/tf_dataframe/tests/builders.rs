//! Builder behavior: type inference, coercion, finalization choices.

mod common;

use std::sync::Arc;

use common::{SlotFetcher, Val, frame_from_rows};
use tf_dataframe::{
    AdhocColumnType, AdhocDataframeBuilder, AdhocDataframeBuilderOptions, BuildError,
    DuplicateState, Nullability, NullabilityType, Op, RuntimeDataframeBuilder, SortState,
    StorageType, StringPool,
};

fn int_rows(values: &[i64]) -> Vec<Vec<Val>> {
    values.iter().map(|&v| vec![Val::I(v)]).collect()
}

// --- Runtime builder: storage and sort-state selection ---

#[test]
fn integers_downcast_to_the_narrowest_width() {
    let df = frame_from_rows(&["v"], &int_rows(&[5, 100, 42, 7]));
    let spec = &df.column_specs()[0];
    assert_eq!(spec.storage_type, StorageType::Uint32);
    assert_eq!(spec.nullability, Nullability::NonNull);
    assert_eq!(spec.sort_state, SortState::Unsorted);
}

#[test]
fn negative_integers_pick_int32() {
    let df = frame_from_rows(&["v"], &int_rows(&[-5, 100, 42]));
    assert_eq!(df.column_specs()[0].storage_type, StorageType::Int32);
}

#[test]
fn wide_integers_stay_int64() {
    let df = frame_from_rows(&["v"], &int_rows(&[-5_000_000_000, 5_000_000_000]));
    assert_eq!(df.column_specs()[0].storage_type, StorageType::Int64);
}

#[test]
fn row_index_valued_columns_become_id_storage() {
    let df = frame_from_rows(&["v"], &int_rows(&[0, 1, 2, 3]));
    let spec = &df.column_specs()[0];
    assert_eq!(spec.storage_type, StorageType::Id);
    assert_eq!(spec.sort_state, SortState::IdSorted);
    assert_eq!(df.column_duplicate_state(0), DuplicateState::NoDuplicates);
}

#[test]
fn set_id_layout_is_detected() {
    let df = frame_from_rows(&["v"], &int_rows(&[0, 0, 2, 2, 4]));
    let spec = &df.column_specs()[0];
    assert_eq!(spec.storage_type, StorageType::Uint32);
    assert_eq!(spec.sort_state, SortState::SetIdSorted);
}

#[test]
fn monotone_integers_are_sorted() {
    let df = frame_from_rows(&["v"], &int_rows(&[3, 7, 7, 100]));
    assert_eq!(df.column_specs()[0].sort_state, SortState::Sorted);
}

#[test]
fn nullable_columns_are_never_sorted() {
    let df = frame_from_rows(&["v"], &[vec![Val::I(1)], vec![Val::Null], vec![Val::I(3)]]);
    let spec = &df.column_specs()[0];
    assert_eq!(spec.nullability, Nullability::SparseNull);
    assert_eq!(spec.sort_state, SortState::Unsorted);
    // Sparse: storage only holds the two non-null values.
    assert_eq!(df.row_count(), 3);
}

#[test]
fn all_null_columns_build() {
    let df = frame_from_rows(&["v"], &[vec![Val::Null], vec![Val::Null]]);
    let spec = &df.column_specs()[0];
    assert_eq!(spec.nullability, Nullability::SparseNull);
    assert_eq!(df.row_count(), 2);
}

#[test]
fn string_columns_and_sortedness() {
    let df = frame_from_rows(
        &["sorted", "unsorted"],
        &[
            vec![Val::S("apple"), Val::S("b")],
            vec![Val::S("banana"), Val::S("a")],
        ],
    );
    let specs = df.column_specs();
    assert_eq!(specs[0].storage_type, StorageType::String);
    assert_eq!(specs[0].sort_state, SortState::Sorted);
    assert_eq!(specs[1].sort_state, SortState::Unsorted);
}

#[test]
fn doubles_track_monotonicity() {
    let sorted = frame_from_rows(&["v"], &[vec![Val::F(1.0)], vec![Val::F(2.5)]]);
    assert_eq!(sorted.column_specs()[0].sort_state, SortState::Sorted);
    let unsorted = frame_from_rows(&["v"], &[vec![Val::F(2.5)], vec![Val::F(1.0)]]);
    assert_eq!(unsorted.column_specs()[0].sort_state, SortState::Unsorted);
}

// --- Runtime builder: numeric coercion ---

#[test]
fn int_then_double_rewrites_the_column() {
    let df = frame_from_rows(&["v"], &[vec![Val::I(1)], vec![Val::F(1.5)]]);
    let spec = &df.column_specs()[0];
    assert_eq!(spec.storage_type, StorageType::Double);
    assert_eq!(spec.nullability, Nullability::NonNull);
}

#[test]
fn double_then_int_stores_the_int_as_double() {
    let df = frame_from_rows(&["v"], &[vec![Val::F(1.5)], vec![Val::I(2)]]);
    assert_eq!(df.column_specs()[0].storage_type, StorageType::Double);
}

#[test]
fn unrepresentable_int_fails_the_rewrite() {
    let mut builder =
        RuntimeDataframeBuilder::new(vec!["v".to_owned()], Arc::new(StringPool::new()));
    // 2^53 + 1 cannot survive a trip through a double.
    let big = (1i64 << 53) + 1;
    assert!(builder.add_row(&SlotFetcher(vec![Val::I(big)])));
    assert!(!builder.add_row(&SlotFetcher(vec![Val::F(0.5)])));
    assert!(matches!(
        builder.status(),
        Err(BuildError::UnrepresentableInteger { value, .. }) if *value == big
    ));
}

#[test]
fn unrepresentable_int_into_double_column_fails() {
    let mut builder =
        RuntimeDataframeBuilder::new(vec!["v".to_owned()], Arc::new(StringPool::new()));
    assert!(builder.add_row(&SlotFetcher(vec![Val::F(0.5)])));
    assert!(!builder.add_row(&SlotFetcher(vec![Val::I((1i64 << 53) + 1)])));
    assert!(matches!(
        builder.status(),
        Err(BuildError::UnrepresentableInteger { .. })
    ));
}

// --- Runtime builder: error stickiness ---

#[test]
fn type_mismatch_is_sticky() {
    let mut builder =
        RuntimeDataframeBuilder::new(vec!["v".to_owned()], Arc::new(StringPool::new()));
    assert!(builder.add_row(&SlotFetcher(vec![Val::I(1)])));
    assert!(!builder.add_row(&SlotFetcher(vec![Val::S("oops")])));
    assert!(matches!(
        builder.status(),
        Err(BuildError::InferredTypeMismatch { row: 1, .. })
    ));

    // Fail fast from here on, and build surfaces the stored error.
    assert!(!builder.add_row(&SlotFetcher(vec![Val::I(2)])));
    assert!(builder.build().is_err());
}

// --- Ad-hoc builder ---

#[test]
fn adhoc_infers_types_and_counts_fold() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::new(vec!["a".to_owned(), "b".to_owned()], pool);
    assert!(builder.push_non_null_i64(0, 7, 3));
    assert!(builder.push_non_null_str(1, "x", 2));
    assert!(builder.push_non_null_str(1, "y", 1));
    let df = builder.build().expect("build");
    assert_eq!(df.row_count(), 3);
    let specs = df.column_specs();
    assert_eq!(specs[0].storage_type, StorageType::Uint32);
    assert_eq!(specs[1].storage_type, StorageType::String);
}

#[test]
fn adhoc_declared_type_mismatch_names_the_schema() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::with_options(
        vec!["v".to_owned()],
        pool,
        AdhocDataframeBuilderOptions {
            types: vec![AdhocColumnType::Int64],
            nullability: NullabilityType::SparseNull,
        },
    );
    assert!(!builder.push_non_null_str(0, "oops", 1));
    assert!(matches!(
        builder.status(),
        Err(BuildError::DeclaredTypeMismatch { expected: "LONG", actual: "STRING", .. })
    ));
}

#[test]
fn adhoc_unchecked_pushes_after_type_established() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::with_options(
        vec!["v".to_owned()],
        pool,
        AdhocDataframeBuilderOptions {
            types: vec![AdhocColumnType::Int64],
            nullability: NullabilityType::SparseNull,
        },
    );
    builder.push_non_null_unchecked_i64(0, 1, 2);
    builder.push_non_null_unchecked_i64(0, 2, 1);
    let df = builder.build().expect("build");
    assert_eq!(df.row_count(), 3);
    assert_eq!(df.column_specs()[0].sort_state, SortState::Sorted);
}

#[test]
fn adhoc_dense_null_keeps_placeholder_slots() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::with_options(
        vec!["v".to_owned()],
        pool,
        AdhocDataframeBuilderOptions {
            types: vec![],
            nullability: NullabilityType::DenseNull,
        },
    );
    // Nulls before the type is known: placeholders are backfilled when the
    // first real value arrives.
    builder.push_null(0, 2);
    assert!(builder.push_non_null_i64(0, 42, 1));
    builder.push_null(0, 1);
    let df = builder.build().expect("build");
    assert_eq!(df.row_count(), 4);
    assert_eq!(df.column_specs()[0].nullability, Nullability::DenseNull);

    assert_eq!(
        common::run_query(&df, &[(0, Op::IsNotNull, Val::Null)], 1),
        vec![2]
    );
    assert_eq!(
        common::run_query(&df, &[(0, Op::Eq, Val::I(42))], 1),
        vec![2]
    );
}

#[test]
fn adhoc_all_null_dense_column_builds() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::with_options(
        vec!["v".to_owned()],
        pool,
        AdhocDataframeBuilderOptions {
            types: vec![],
            nullability: NullabilityType::DenseNull,
        },
    );
    builder.push_null(0, 3);
    let df = builder.build().expect("build");
    assert_eq!(df.row_count(), 3);
    assert_eq!(
        common::run_query(&df, &[(0, Op::IsNull, Val::Null)], 1),
        vec![0, 1, 2]
    );
}

#[test]
fn adhoc_ragged_columns_fail_the_build() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::new(vec!["a".to_owned(), "b".to_owned()], pool);
    assert!(builder.push_non_null_i64(0, 1, 2));
    assert!(builder.push_non_null_i64(1, 1, 1));
    assert!(matches!(
        builder.build(),
        Err(BuildError::RaggedColumns { expected: 2, actual: 1, .. })
    ));
}

#[test]
fn adhoc_duplicate_detection() {
    let build = |values: &[i64]| {
        let pool = Arc::new(StringPool::new());
        let mut builder = AdhocDataframeBuilder::new(vec!["v".to_owned()], pool);
        for &v in values {
            assert!(builder.push_non_null_i64(0, v, 1));
        }
        builder.build().expect("build")
    };

    assert_eq!(build(&[1, 2, 3]).column_duplicate_state(0), DuplicateState::NoDuplicates);
    assert_eq!(build(&[1, 1]).column_duplicate_state(0), DuplicateState::HasDuplicates);
    // Negative values can't be tracked by the gate: conservatively dupes.
    assert_eq!(build(&[-1, 2]).column_duplicate_state(0), DuplicateState::HasDuplicates);
    // Values far beyond 16x the column length trip the size gate.
    assert_eq!(
        build(&[1, 1_000_000]).column_duplicate_state(0),
        DuplicateState::HasDuplicates
    );
}

#[test]
fn adhoc_sparse_with_popcount_precomputes_the_table() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::with_options(
        vec!["v".to_owned()],
        pool,
        AdhocDataframeBuilderOptions {
            types: vec![],
            nullability: NullabilityType::SparseNullWithPopcount,
        },
    );
    assert!(builder.push_non_null_i64(0, 10, 1));
    builder.push_null(0, 1);
    assert!(builder.push_non_null_i64(0, 30, 1));
    let df = builder.build().expect("build");
    assert_eq!(df.column_specs()[0].nullability, Nullability::SparseNull);
    assert_eq!(
        common::run_query(&df, &[(0, Op::Gt, Val::I(15))], 1),
        vec![2]
    );
}

#[test]
fn adhoc_int_double_coercion() {
    let pool = Arc::new(StringPool::new());
    let mut builder = AdhocDataframeBuilder::new(vec!["v".to_owned()], pool);
    assert!(builder.push_non_null_i64(0, 1, 1));
    assert!(builder.push_non_null_f64(0, 2.5, 1));
    assert!(builder.push_non_null_i64(0, 4, 1));
    let df = builder.build().expect("build");
    assert_eq!(df.column_specs()[0].storage_type, StorageType::Double);
    assert_eq!(
        common::run_query(&df, &[(0, Op::Ge, Val::F(2.0))], 1),
        vec![1, 2]
    );
}
