//! Storage seams and backends.
//!
//! `traits` defines what the vault and the sync engine persist; `memory`
//! keeps everything in-process (tests, local tooling) and `sqlite` is the
//! durable single-file backend.

pub mod memory;
pub mod models;
pub mod sqlite;
pub mod traits;
