//! Store adapter over the shared Redis instance.
//!
//! Redis is the single source of truth for all cross-process state. This
//! module provides:
//!
//! - [`Store`]: a thin handle over a managed async connection, plus the
//!   server-side clock used for every score written to a sorted set
//! - [`Keys`]: the prefix-based key naming scheme
//! - [`Batch`]: the unit-of-work type through which all composed atomic
//!   writes flow

mod atomic;
mod connection;

pub use atomic::Batch;
pub use connection::{Keys, Store};
