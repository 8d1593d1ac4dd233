//! Testing utilities for STRATA.
//!
//! Provides an in-memory target store so the executor and runner can be
//! exercised without a database server.

mod memory;

pub use memory::{MemoryBackend, MemorySnapshot};
