//! Engine error types.
//!
//! Protocol outcomes (lost races, replayed or unknown links) are not errors;
//! they are `ResponseOutcome` values. What lands here is either a store
//! failure or something that must never happen.

use crate::selector::SelectionError;
use thiserror::Error;
use vetdispatch_db::DbError;
use vetdispatch_ids::CaseId;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error("Case not found: {0}")]
    CaseNotFound(CaseId),

    #[error("Dispatch invariant violated: {0}")]
    InvariantViolation(String),
}

impl DispatchError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }
}
