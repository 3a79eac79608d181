use ulid::Ulid;

use crate::model::BookingStatus;

#[derive(Debug)]
pub enum SchedulerError {
    /// Malformed, misaligned or self-overlapping input. Always raised before any write.
    Validation(String),
    NotFound {
        entity: &'static str,
        id: Ulid,
    },
    /// The caller does not own the resource.
    Forbidden(String),
    /// Lost an occupancy race, or overlaps already-committed data.
    Conflict(String),
    InvalidTransition {
        booking: Ulid,
        from: BookingStatus,
        action: &'static str,
    },
    LimitExceeded(&'static str),
    Storage(String),
}

impl SchedulerError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        SchedulerError::Validation(msg.into())
    }

    pub(crate) fn conflict(msg: impl Into<String>) -> Self {
        SchedulerError::Conflict(msg.into())
    }

    pub(crate) fn not_found(entity: &'static str, id: Ulid) -> Self {
        SchedulerError::NotFound { entity, id }
    }

    /// HTTP status family a request handler should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            SchedulerError::Validation(_) | SchedulerError::LimitExceeded(_) => 400,
            SchedulerError::Forbidden(_) => 403,
            SchedulerError::NotFound { .. } => 404,
            SchedulerError::Conflict(_) | SchedulerError::InvalidTransition { .. } => 409,
            SchedulerError::Storage(_) => 500,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerError::Validation(_) => "validation",
            SchedulerError::NotFound { .. } => "not_found",
            SchedulerError::Forbidden(_) => "forbidden",
            SchedulerError::Conflict(_) => "conflict",
            SchedulerError::InvalidTransition { .. } => "invalid_transition",
            SchedulerError::LimitExceeded(_) => "limit_exceeded",
            SchedulerError::Storage(_) => "storage",
        }
    }
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::Validation(msg) => write!(f, "invalid request: {msg}"),
            SchedulerError::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            SchedulerError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            SchedulerError::Conflict(msg) => write!(f, "conflict: {msg}"),
            SchedulerError::InvalidTransition {
                booking,
                from,
                action,
            } => write!(f, "cannot {action} booking {booking} in state {from}"),
            SchedulerError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            SchedulerError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

impl std::error::Error for SchedulerError {}
