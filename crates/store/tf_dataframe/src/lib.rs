//! Columnar dataframe query engine for trace analysis.
//!
//! A [`Dataframe`] is an immutable, columnar table: typed storage per
//! column, optional null-presence overlays, and a sort state that the query
//! planner exploits. Frames are built once — row by row through
//! [`RuntimeDataframeBuilder`] or column by column through
//! [`AdhocDataframeBuilder`] — and then only ever queried.
//!
//! Querying is split into two phases, mirroring how a SQL virtual table
//! drives the engine:
//!
//! 1. **Planning** ([`Dataframe::plan_query`]): a list of [`FilterSpec`]s
//!    plus a bitmap of requested output columns is compiled into a
//!    [`QueryPlan`] — a register-based bytecode program. Plans serialize to
//!    opaque base64 blobs so they can be cached across queries.
//! 2. **Execution** ([`Dataframe::cursor`] + [`Cursor::execute`]): the
//!    interpreter runs the bytecode against the columns, reading filter
//!    values through a caller-supplied [`ValueFetcher`], and the cursor
//!    walks the resulting row indices, dispatching typed cell reads through
//!    a [`CellCallback`].
//!
//! ## Feature flags
//!
//! * `regex` — support the `Regex` filter operator (via `regex-lite`).
//!   Without it, planning a query containing a regex predicate fails with a
//!   diagnostic.

mod adhoc_builder;
mod bytecode;
mod cursor;
mod dataframe;
mod errors;
mod query_plan;
mod runtime_builder;
mod shared_storage;
mod specs;
mod types;
mod value_fetcher;

pub use self::adhoc_builder::{
    AdhocColumnType, AdhocDataframeBuilder, AdhocDataframeBuilderOptions, NullabilityType,
};
pub use self::cursor::{CellCallback, Cursor};
pub use self::dataframe::Dataframe;
pub use self::errors::{BuildError, PlanError};
pub use self::query_plan::QueryPlan;
pub use self::runtime_builder::RuntimeDataframeBuilder;
pub use self::shared_storage::{DataframeSharedStorage, Tag};
pub use self::specs::{
    ColumnSpec, DuplicateState, FilterSpec, Nullability, Op, SortState, StorageType,
};
pub use self::value_fetcher::{FetchedValueType, ValueFetcher};

// Re-exports
pub use tf_containers::{BitVector, FlexVector, Slab};
pub use tf_string_pool::{StringId, StringPool};
