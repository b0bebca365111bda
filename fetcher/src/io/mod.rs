//! Side-effecting collaborators: model client, sandbox, config, logs and traces.

pub mod clock;
pub mod config;
pub mod log_sink;
pub mod model;
pub mod process;
pub mod prompt;
pub mod retry;
pub mod sandbox;
pub mod session_trace;
