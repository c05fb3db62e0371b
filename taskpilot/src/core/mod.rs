//! Deterministic, pure logic shared by the engine.
//!
//! Core modules are free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod deps;
pub mod marker;
pub mod reconcile;
pub mod record;
pub mod retry;
pub mod types;
