use crate::query_plan::MAX_FILTERS;

/// Errors surfaced while planning a query. No partial plan is ever
/// produced.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    #[error(
        "too many filters provided on a single dataframe: {0} (at most {MAX_FILTERS} are \
         supported for performance reasons)"
    )]
    TooManyFilters(usize),

    #[error("filter references column {column} but the dataframe only has {column_count} columns")]
    InvalidColumn { column: u32, column_count: usize },

    #[error("regex matching is not supported by this build (enable the `regex` feature)")]
    RegexUnsupported,

    #[error("malformed serialized query plan")]
    MalformedPlan,
}

/// Errors surfaced by the dataframe builders.
///
/// Builder errors are sticky: once one occurs, subsequent pushes fail fast
/// and `build()` returns the stored error.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("column '{column}' was declared as {expected} in the schema, but {actual} found")]
    DeclaredTypeMismatch {
        column: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error(
        "column '{column}' was inferred to be {expected}, but row {row} holds a value of \
         type {actual}"
    )]
    InferredTypeMismatch {
        column: String,
        row: u32,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("unable to represent {value} in column '{column}' at row {row} as a double")]
    UnrepresentableInteger {
        column: String,
        row: u32,
        value: i64,
    },

    #[error(
        "column '{column}' has {actual} rows but the dataframe has {expected}; every column \
         must receive a value or a null for every row"
    )]
    RaggedColumns {
        column: String,
        expected: u32,
        actual: u32,
    },
}
