//! Space-efficient primitive containers used throughout the query engine.
//!
//! The engine's hot loops operate on flat buffers of trivially-copyable
//! values, so everything in this crate is built on [`bytemuck::Pod`] types
//! and zero-initialized allocations:
//!
//! * [`Slab`] — a fixed-size buffer, allocated once and reused across query
//!   executions as register scratch.
//! * [`FlexVector`] — a growable vector with power-of-two capacity and no
//!   per-element bookkeeping.
//! * [`BitVector`] — a packed bitmap (64 bits per word) with popcount
//!   helpers and bulk filtering.

mod bit_vector;
mod flex_vector;
mod slab;

pub use self::bit_vector::BitVector;
pub use self::flex_vector::FlexVector;
pub use self::slab::Slab;
