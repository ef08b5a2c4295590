use ulid::Ulid;

use crate::model::{AppointmentStatus, Span};
use crate::repository::StoreError;

/// A secondary effect of a status change that did not happen. The status
/// change itself is already committed when one of these is reported.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SideEffectFailure {
    #[error("revenue not recorded: {0}")]
    Revenue(String),
    #[error("loyalty not updated: {0}")]
    Loyalty(String),
}

impl SideEffectFailure {
    pub fn kind(&self) -> &'static str {
        match self {
            SideEffectFailure::Revenue(_) => "revenue",
            SideEffectFailure::Loyalty(_) => "loyalty",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("scheduling conflict: [{}, {}) overlaps appointment {existing} at [{}, {})",
        .requested.start, .requested.end, .conflicting.start, .conflicting.end)]
    SchedulingConflict {
        requested: Span,
        existing: Ulid,
        conflicting: Span,
    },
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },
    #[error("cannot change status from {from} to {to}")]
    InvalidTransition {
        from: AppointmentStatus,
        to: AppointmentStatus,
    },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),
    #[error("appointment {appointment_id} is {status}, but: {}", join_failures(.failures))]
    SideEffectFailure {
        appointment_id: Ulid,
        status: AppointmentStatus,
        failures: Vec<SideEffectFailure>,
    },
}

impl EngineError {
    pub fn not_found(entity: &'static str, key: impl ToString) -> Self {
        EngineError::NotFound {
            entity,
            key: key.to_string(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        EngineError::InvalidRequest(msg.into())
    }
}

fn join_failures(failures: &[SideEffectFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
