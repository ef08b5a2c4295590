use crate::config::RestorePolicy;
use crate::model::AppointmentStatus::{self, *};

use super::EngineError;

/// What a requested status change amounts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Same status: accepted, nothing happens.
    Unchanged,
    /// Scheduled → Completed. Records revenue and recomputes loyalty.
    Complete,
    /// Scheduled → Cancelled.
    Cancel,
    /// Completed/Cancelled → Scheduled. Audited, and re-checked for conflicts.
    Restore,
}

pub fn plan_transition(
    from: AppointmentStatus,
    to: AppointmentStatus,
    restore: RestorePolicy,
) -> Result<Transition, EngineError> {
    match (from, to) {
        (a, b) if a == b => Ok(Transition::Unchanged),
        (Scheduled, Completed) => Ok(Transition::Complete),
        (Scheduled, Cancelled) => Ok(Transition::Cancel),
        (Completed | Cancelled, Scheduled) if restore == RestorePolicy::Allow => Ok(Transition::Restore),
        _ => Err(EngineError::InvalidTransition { from, to }),
    }
}

impl Transition {
    /// Whether the set of completed appointments changes.
    pub fn touches_completed(&self, from: AppointmentStatus) -> bool {
        match self {
            Transition::Complete => true,
            Transition::Restore => from == Completed,
            Transition::Unchanged | Transition::Cancel => false,
        }
    }
}
