//! Booking store: the only code that reads or writes visit bookings.
//!
//! Writers take `&mut ListingState`, i.e. they run under the listing's write
//! guard held by the caller. The `Engine` readers take the read guard
//! themselves, so they always observe the latest committed write; the free
//! functions read under a guard the caller already holds.

use chrono::NaiveDate;
use dashmap::mapref::entry::Entry;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Approved bookings on the guarded listing, minus `exclude`, with their
/// visit instants.
pub(super) fn approved_slots(ls: &ListingState, exclude: Option<Ulid>) -> Vec<(Ulid, VisitTime)> {
    ls.bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Approved && Some(b.id) != exclude)
        .filter_map(|b| b.visit_at.map(|t| (b.id, t)))
        .collect()
}

pub(super) fn pending_bookings(ls: &ListingState) -> Vec<VisitBooking> {
    ls.bookings
        .iter()
        .filter(|b| b.status == BookingStatus::Pending)
        .cloned()
        .collect()
}

pub(super) fn booking_on(ls: &ListingState, booking_id: Ulid) -> Result<VisitBooking, EngineError> {
    ls.booking(booking_id)
        .cloned()
        .ok_or(EngineError::NotFound(booking_id))
}

impl Engine {
    /// Visit instants of the listing's approved bookings, minus `exclude`.
    pub async fn approved_visits_for_listing(
        &self,
        listing_id: Ulid,
        exclude: Option<Ulid>,
    ) -> Result<Vec<VisitTime>, EngineError> {
        let ls = self
            .listing_handle(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        Ok(approved_slots(&guard, exclude).into_iter().map(|(_, t)| t).collect())
    }

    /// Approved visits whose local date (in the requester's offset) is `date`,
    /// earliest first.
    pub async fn approved_visits_on_date(
        &self,
        listing_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<VisitTime>, EngineError> {
        let ls = self
            .listing_handle(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        let mut visits: Vec<VisitTime> = guard
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Approved && b.visit_date() == Some(date))
            .filter_map(|b| b.visit_at)
            .collect();
        visits.sort();
        Ok(visits)
    }

    pub async fn find_booking(&self, booking_id: Ulid) -> Result<VisitBooking, EngineError> {
        let listing_id = self
            .booking_to_listing
            .get(&booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(booking_id))?;
        let ls = self
            .listing_handle(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let guard = ls.read().await;
        booking_on(&guard, booking_id)
    }

    /// Persist a new booking on the guarded listing.
    ///
    /// Booking ids are unique across listings, and the guard only covers
    /// this one, so the id is claimed in the index before the WAL append
    /// and released again if the append fails.
    pub(super) async fn store_booking(
        &self,
        ls: &mut ListingState,
        booking: VisitBooking,
    ) -> Result<VisitBooking, EngineError> {
        let pending = ls
            .bookings
            .iter()
            .filter(|b| b.status == BookingStatus::Pending)
            .count();
        if pending >= MAX_PENDING_VISITS_PER_LISTING {
            return Err(EngineError::LimitExceeded("too many pending visit requests on listing"));
        }
        match self.booking_to_listing.entry(booking.id) {
            Entry::Occupied(_) => return Err(EngineError::AlreadyExists(booking.id)),
            Entry::Vacant(slot) => {
                slot.insert(ls.listing.id);
            }
        }
        let event = Event::VisitRequested {
            booking: booking.clone(),
        };
        if let Err(e) = self.persist_to_listing(ls, &event).await {
            self.booking_to_listing.remove(&booking.id);
            return Err(e);
        }
        Ok(booking)
    }

    /// Persist a status change on the guarded listing. No lifecycle rules
    /// here; the state machine has already checked them.
    pub(super) async fn store_status(
        &self,
        ls: &mut ListingState,
        booking_id: Ulid,
        status: BookingStatus,
    ) -> Result<VisitBooking, EngineError> {
        if ls.booking(booking_id).is_none() {
            return Err(EngineError::NotFound(booking_id));
        }
        let event = Event::VisitStatusChanged {
            id: booking_id,
            listing_id: ls.listing.id,
            status,
        };
        self.persist_to_listing(ls, &event).await?;
        booking_on(ls, booking_id)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;

    fn state_with(statuses: &[(&str, BookingStatus)]) -> (ListingState, Vec<Ulid>) {
        let listing = Listing {
            id: Ulid::new(),
            apartment_id: Ulid::new(),
            kind: ListingKind::Apartment,
            price_per_person: 5000,
            status: ListingStatus::Available,
            verification: Verification::Pending,
            controller_id: Ulid::new(),
            created_at: Utc::now(),
        };
        let mut ls = ListingState::new(listing);
        let mut ids = Vec::new();
        for (at, status) in statuses {
            let id = Ulid::new();
            ids.push(id);
            ls.bookings.push(VisitBooking {
                id,
                listing_id: ls.listing.id,
                requester_id: Ulid::new(),
                visit_at: Some(DateTime::parse_from_rfc3339(at).unwrap()),
                status: *status,
                created_at: Utc::now(),
            });
        }
        (ls, ids)
    }

    #[test]
    fn approved_slots_skip_pending_and_excluded() {
        let (ls, ids) = state_with(&[
            ("2026-01-10T10:00:00+06:00", BookingStatus::Approved),
            ("2026-01-10T14:00:00+06:00", BookingStatus::Approved),
            ("2026-01-10T18:00:00+06:00", BookingStatus::Pending),
            ("2026-01-10T20:00:00+06:00", BookingStatus::Rejected),
        ]);

        assert_eq!(approved_slots(&ls, None).len(), 2);
        let without_first = approved_slots(&ls, Some(ids[0]));
        assert_eq!(without_first.len(), 1);
        assert_eq!(without_first[0].0, ids[1]);

        let pending = pending_bookings(&ls);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, ids[2]);

        assert_eq!(booking_on(&ls, ids[3]).unwrap().status, BookingStatus::Rejected);
        assert!(matches!(booking_on(&ls, Ulid::new()), Err(EngineError::NotFound(_))));
    }
}
