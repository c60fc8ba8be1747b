//! Machine execution and constraint checking.
//!
//! Definitions ([`machine`]) are validated and compiled by the [`loader`],
//! executed row by row into write-once [`trace`] stores by the [`executor`]
//! and [`linker`], then checked by the [`constraints`], [`lookup`] and
//! [`bus`] passes.

pub mod bus;
pub mod constraints;
pub mod executor;
pub mod expr;
pub mod linker;
pub mod loader;
pub mod lookup;
pub mod machine;
pub mod query;
pub mod registers;
pub mod solver;
pub mod trace;
