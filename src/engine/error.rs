use ulid::Ulid;

use crate::model::ScheduleStatus;

/// Why a request lost against the current state of a schedule.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConflictReason {
    #[error("Schedule is currently {0}")]
    ScheduleNotActive(ScheduleStatus),
    #[error("Schedule is full")]
    ScheduleFull,
    #[error("Max patients cannot be less than already booked count ({booked})")]
    CapacityBelowBooked { capacity: u32, booked: u32 },
    #[error("Cannot delete schedule with existing bookings. Cancel it instead.")]
    HasBookings(u32),
    #[error("{0} already exists")]
    AlreadyExists(Ulid),
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Ulid },
    #[error("Authentication required: patient id missing")]
    Unauthenticated,
    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
    #[error(transparent)]
    Conflict(#[from] ConflictReason),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// The commit did not reach the WAL; nothing was applied.
    #[error("WAL error: {0}")]
    Internal(String),
}

impl EngineError {
    pub(crate) fn schedule_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "schedule", id }
    }

    pub(crate) fn appointment_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "appointment", id }
    }

    pub(crate) fn doctor_not_found(id: Ulid) -> Self {
        EngineError::NotFound { entity: "doctor", id }
    }

    /// SQLSTATE reported to Postgres clients.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "P0002",
            EngineError::Unauthenticated => "28000",
            EngineError::InvalidInput(_) => "22023",
            EngineError::Conflict(_) => "55000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::Internal(_) => "XX000",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound { .. } => "not_found",
            EngineError::Unauthenticated => "unauthenticated",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::Conflict(_) => "conflict",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Internal(_) => "internal",
        }
    }
}
