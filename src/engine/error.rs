use ulid::Ulid;

use crate::model::{BookingStatus, VisitTime};

#[derive(Debug)]
pub enum EngineError {
    /// Listing, booking, apartment or location does not exist.
    NotFound(Ulid),
    /// Listing exists but is not open for visit requests.
    Unavailable(Ulid),
    /// Acting user is not the listing's controlling party.
    Forbidden(Ulid),
    InvalidStatus(InvalidStatus),
    /// Requested visit window overlaps an approved visit.
    Conflict {
        booking_id: Ulid,
        visit_at: VisitTime,
    },
    AlreadyExists(Ulid),
    InvalidInput(&'static str),
    LimitExceeded(&'static str),
    WalError(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidStatus {
    /// Only `approved` and `rejected` may be requested.
    Target(String),
    /// Booking has already left `pending`.
    AlreadyFinal { id: Ulid, status: BookingStatus },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Unavailable(id) => {
                write!(f, "listing {id} is not available for visits")
            }
            EngineError::Forbidden(id) => {
                write!(f, "not the controlling party of listing {id}")
            }
            EngineError::InvalidStatus(InvalidStatus::Target(s)) => {
                write!(f, "invalid status update: {s:?} (expected approved or rejected)")
            }
            EngineError::InvalidStatus(InvalidStatus::AlreadyFinal { id, status }) => {
                write!(f, "booking {id} is already {status}")
            }
            EngineError::Conflict { booking_id, visit_at } => write!(
                f,
                "visit conflicts with approved visit {booking_id} at {}",
                visit_at.to_rfc3339()
            ),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
