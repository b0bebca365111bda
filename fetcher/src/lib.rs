//! Reflective data-fetch controller.
//!
//! Turns a natural-language data request into executed, critic-validated code
//! through repeated generate, execute, critique cycles under a two-level retry
//! policy. The architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (canonical digests, fallback
//!   selection, code and verdict parsing, session state). No I/O.
//! - **[`io`]**: Side-effecting collaborators (chat client, process sandbox,
//!   config, agent log, traces). Behind traits so tests can script them.
//! - **[`agents`]**: The code author and the critic, each one model call.
//!
//! [`controller`] sequences them into a session.

pub mod agents;
pub mod controller;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use controller::ReflectiveFetchController;
pub use core::types::{FetchRequest, FetchResult, FetchStatus, Outcome, StopReason};
pub use error::{FetchError, ModelError};
