use serde::Serialize;
use std::fmt;
use thiserror::Error as ThisError;

/// Which capacity limit rejected an admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityUnit {
    Players,
    Teams,
}

impl fmt::Display for CapacityUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapacityUnit::Players => f.write_str("players"),
            CapacityUnit::Teams => f.write_str("teams"),
        }
    }
}

/// Coarse failure classes. Clients decide whether to retry from the class alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    Capacity,
    State,
    RateLimited,
    Transient,
}

#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("already registered for this tournament")]
    AlreadyRegistered,
    #[error("team already has an open request for this tournament")]
    RequestPending,
    #[error("{0}")]
    Conflict(String),
    #[error("Tournament is full ({current}/{max} {unit})")]
    CapacityExceeded {
        current: u32,
        max: u32,
        unit: CapacityUnit,
    },
    #[error("{0}")]
    InvalidState(String),
    #[error("too many attempts, retry in {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("transient failure: {0}")]
    Transient(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Unauthorized => ErrorKind::Unauthorized,
            Error::Forbidden(_) => ErrorKind::Forbidden,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::AlreadyRegistered | Error::RequestPending | Error::Conflict(_) => {
                ErrorKind::Conflict
            }
            Error::CapacityExceeded { .. } => ErrorKind::Capacity,
            Error::InvalidState(_) => ErrorKind::State,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::Transient(_) => ErrorKind::Transient,
        }
    }

    /// Stable machine-readable code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "validation_error",
            Error::Unauthorized => "unauthorized",
            Error::Forbidden(_) => "forbidden",
            Error::NotFound(_) => "not_found",
            Error::AlreadyRegistered => "already_registered",
            Error::RequestPending => "request_pending",
            Error::Conflict(_) => "conflict",
            Error::CapacityExceeded { .. } => "tournament_full",
            Error::InvalidState(_) => "invalid_state",
            Error::RateLimited { .. } => "rate_limited",
            Error::Transient(_) => "transient_error",
        }
    }

    /// Only transient failures are safe to retry with the same idempotency key
    /// and expect a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
