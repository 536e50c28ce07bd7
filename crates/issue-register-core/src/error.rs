use serde::{Deserialize, Serialize};

use crate::model::{Author, IssueField, IssueId, IssueStatus, RevisionSeq};

/// Details reported when a proposed revision was derived from an outdated issue version.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StaleRevisionConflict {
    pub issue_id: IssueId,
    pub base_revision: RevisionSeq,
    pub current_revision: RevisionSeq,
    pub competing_author: Author,
    pub competing_summary: String,
    pub attempted_fields: Vec<IssueField>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum RegisterError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("similarity oracle unavailable: {0}")]
    OracleUnavailable(String),
    #[error(
        "stale revision for issue {}: based on {} but current is {} ({} revision: {})",
        .0.issue_id,
        .0.base_revision,
        .0.current_revision,
        .0.competing_author.as_str(),
        .0.competing_summary
    )]
    StaleRevision(Box<StaleRevisionConflict>),
    #[error("invalid transition from {} to {}: {reason}", .from.as_str(), .to.as_str())]
    InvalidTransition { from: IssueStatus, to: IssueStatus, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl RegisterError {
    /// Stable machine-readable code for transport layers.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::OracleUnavailable(_) => "oracle_unavailable",
            Self::StaleRevision(_) => "stale_revision",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Storage(_) => "storage_error",
        }
    }

    #[must_use]
    pub fn stale(conflict: StaleRevisionConflict) -> Self {
        Self::StaleRevision(Box::new(conflict))
    }
}

pub type RegisterResult<T> = Result<T, RegisterError>;
