//! Adapters that live inside the domain crate for convenience.
//!
//! The in-memory store backs unit tests and local runs. The persistent
//! document store lives in the `sqlite-adapter` crate.

pub mod memory_repo;
