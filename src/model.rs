use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for all window arithmetic.
pub type Ms = i64;

/// A requested visit instant. The offset the requester supplied is kept so
/// it can be echoed back and used for calendar-date queries.
pub type VisitTime = DateTime<FixedOffset>;

/// Length of the window an approved visit occupies.
pub const VISIT_WINDOW_MS: Ms = 2 * 3_600_000;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The window `[t, t + 2h)` blocked by a visit at `t`.
    pub fn visit_window(t: Ms) -> Self {
        Self::new(t, t + VISIT_WINDOW_MS)
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Status enums ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

/// Declares a lowercase wire name for each variant, with `Display`/`FromStr`.
macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(ParseEnumError { kind: $kind, value: s.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingKind {
    Apartment,
    RoomShare,
}

wire_enum!(ListingKind, "listing kind", {
    Apartment => "apartment",
    RoomShare => "room_share",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListingStatus {
    Available,
    Rented,
    Inactive,
}

wire_enum!(ListingStatus, "listing status", {
    Available => "available",
    Rented => "rented",
    Inactive => "inactive",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verification {
    Pending,
    Verified,
    Unverified,
}

wire_enum!(Verification, "verification status", {
    Pending => "pending",
    Verified => "verified",
    Unverified => "unverified",
});

/// Lifecycle of a visit request. `Approved` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Approved,
    Rejected,
}

wire_enum!(BookingStatus, "booking status", {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
});

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BookingStatus::Pending)
    }
}

// ── Entities ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Apartment {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub title: Option<String>,
    pub location_id: Option<Ulid>,
    pub total_rent: Option<i64>,
    pub max_occupancy: Option<u32>,
}

impl Apartment {
    /// Rent per person, or `None` when rent or occupancy is missing or zero.
    pub fn rent_per_person(&self) -> Option<f64> {
        match (self.total_rent, self.max_occupancy) {
            (Some(rent), Some(occ)) if rent > 0 && occ > 0 => Some(rent as f64 / occ as f64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub id: Ulid,
    pub apartment_id: Ulid,
    pub kind: ListingKind,
    pub price_per_person: i64,
    pub status: ListingStatus,
    pub verification: Verification,
    /// Apartment owner, or the hosting occupant of a room share.
    pub controller_id: Ulid,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisitBooking {
    pub id: Ulid,
    pub listing_id: Ulid,
    pub requester_id: Ulid,
    pub visit_at: Option<VisitTime>,
    pub status: BookingStatus,
    pub created_at: DateTime<Utc>,
}

impl VisitBooking {
    /// Local calendar date of the visit in the offset the requester used.
    pub fn visit_date(&self) -> Option<NaiveDate> {
        self.visit_at.map(|t| t.date_naive())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationBucket {
    pub id: Ulid,
    pub area_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApartmentMetrics {
    pub apartment_id: Ulid,
    pub fair_rent_score: u8,
    pub view_count: u64,
    pub wishlist_count: u64,
    pub last_calculated: DateTime<Utc>,
}

/// A listing together with every visit request ever made against it.
/// Guarded by one lock per listing; see `Engine::listings`.
#[derive(Debug, Clone)]
pub struct ListingState {
    pub listing: Listing,
    /// In creation order.
    pub bookings: Vec<VisitBooking>,
}

impl ListingState {
    pub fn new(listing: Listing) -> Self {
        Self {
            listing,
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: Ulid) -> Option<&VisitBooking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn booking_mut(&mut self, id: Ulid) -> Option<&mut VisitBooking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }
}

/// WAL record. Creation events carry the whole entity; updates carry the
/// post-update field values so replay never has to recompute anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    LocationCreated {
        bucket: LocationBucket,
    },
    ApartmentCreated {
        apartment: Apartment,
    },
    ApartmentUpdated {
        id: Ulid,
        total_rent: Option<i64>,
        max_occupancy: Option<u32>,
    },
    ListingCreated {
        listing: Listing,
    },
    ListingUpdated {
        id: Ulid,
        price_per_person: i64,
        status: ListingStatus,
        verification: Verification,
    },
    VisitRequested {
        booking: VisitBooking,
    },
    VisitStatusChanged {
        id: Ulid,
        listing_id: Ulid,
        status: BookingStatus,
    },
    MetricsRecorded {
        metrics: ApartmentMetrics,
    },
}

impl Event {
    /// The listing whose lock must be held while this event is applied.
    pub fn listing_id(&self) -> Option<Ulid> {
        match self {
            Event::ListingUpdated { id, .. } => Some(*id),
            Event::VisitRequested { booking } => Some(booking.listing_id),
            Event::VisitStatusChanged { listing_id, .. } => Some(*listing_id),
            Event::ListingCreated { .. }
            | Event::LocationCreated { .. }
            | Event::ApartmentCreated { .. }
            | Event::ApartmentUpdated { .. }
            | Event::MetricsRecorded { .. } => None,
        }
    }
}

// ── Read projections ────────────────────────────────────────────

/// A booking plus display-only fields joined in from its listing and
/// location. Never written back.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingView {
    pub booking: VisitBooking,
    pub listing_kind: ListingKind,
    pub price_per_person: i64,
    pub area_name: Option<String>,
}
