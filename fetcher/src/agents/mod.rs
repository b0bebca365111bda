//! The two model-backed roles of a reflection cycle: authoring code and judging it.

use thiserror::Error;

use crate::core::budget::{BudgetExhausted, Deadline};
use crate::error::ModelError;

pub mod coder;
pub mod critic;

/// Why an agent call produced nothing usable.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("{0}")]
    Budget(BudgetExhausted),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// Prompt rendering failed.
    #[error("{0}")]
    Prompt(String),
}

/// Attribute a model failure to the session budget when the budget ran out meanwhile.
pub(crate) fn model_failure(err: ModelError, deadline: &Deadline) -> AgentError {
    match deadline.remaining() {
        Err(exhausted) => AgentError::Budget(exhausted),
        Ok(_) => AgentError::Model(err),
    }
}
