//! Deterministic, pure logic shared by the fetch controller.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod budget;
pub mod code_block;
pub mod compare;
pub mod fallback;
pub mod types;
pub mod verdict;
