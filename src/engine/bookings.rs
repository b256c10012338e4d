//! Visit request lifecycle: `pending` → `approved` | `rejected`.

use std::str::FromStr;

use chrono::Utc;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{VISITS_REQUESTED_TOTAL, VISIT_CONFLICTS_TOTAL, VISIT_TRANSITIONS_TOTAL};

use super::conflict::{check_no_conflict, validate_visit_time};
use super::store::{approved_slots, booking_on, pending_bookings};
use super::{Engine, EngineError, InvalidStatus};

/// What happens to other pending requests on a listing when one is approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CascadePolicy {
    /// Leave them; the controlling party resolves them one by one.
    #[default]
    Off,
    /// Reject pending requests whose window clashes with the approved visit.
    Conflicting,
    /// Reject every other pending request.
    AllPending,
}

impl FromStr for CascadePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(CascadePolicy::Off),
            "conflicting" => Ok(CascadePolicy::Conflicting),
            "all_pending" | "all" => Ok(CascadePolicy::AllPending),
            other => Err(format!("unknown cascade policy: {other}")),
        }
    }
}

impl Engine {
    /// Create a `pending` visit request.
    ///
    /// The conflict check here is advisory: two overlapping requests can both
    /// be created while neither is approved. `transition` re-checks.
    pub async fn request_visit(
        &self,
        id: Ulid,
        listing_id: Ulid,
        requester_id: Ulid,
        visit_at: Option<VisitTime>,
    ) -> Result<VisitBooking, EngineError> {
        let ls = self
            .listing_handle(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        if let Some(t) = &visit_at {
            validate_visit_time(t)?;
        }
        let mut guard = ls.write().await;

        if guard.listing.status != ListingStatus::Available {
            return Err(EngineError::Unavailable(listing_id));
        }
        if let Some(t) = &visit_at
            && let Err(e) = check_no_conflict(&approved_slots(&guard, None), t)
        {
            metrics::counter!(VISIT_CONFLICTS_TOTAL, "stage" => "request").increment(1);
            return Err(e);
        }

        let booking = VisitBooking {
            id,
            listing_id,
            requester_id,
            visit_at,
            status: BookingStatus::Pending,
            created_at: Utc::now(),
        };
        let booking = self.store_booking(&mut guard, booking).await?;
        metrics::counter!(VISITS_REQUESTED_TOTAL).increment(1);
        info!(booking = %id, listing = %listing_id, "visit requested");
        Ok(booking)
    }

    /// Move a pending booking to `approved` or `rejected`.
    ///
    /// The listing's write guard is held from the approved-visits read to the
    /// status write, so two approvals for clashing slots on one listing
    /// cannot both succeed.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        new_status: BookingStatus,
        acting_user_id: Ulid,
    ) -> Result<VisitBooking, EngineError> {
        if !new_status.is_terminal() {
            return Err(EngineError::InvalidStatus(InvalidStatus::Target(
                new_status.to_string(),
            )));
        }

        let mut guard = self.resolve_booking_write(&booking_id).await?;
        let listing_id = guard.listing.id;
        let current = booking_on(&guard, booking_id)?;

        // Terminal first: a settled booking is settled whoever asks.
        if current.status.is_terminal() {
            return Err(EngineError::InvalidStatus(InvalidStatus::AlreadyFinal {
                id: booking_id,
                status: current.status,
            }));
        }
        if guard.listing.controller_id != acting_user_id {
            return Err(EngineError::Forbidden(listing_id));
        }
        if new_status == BookingStatus::Approved
            && let Some(t) = &current.visit_at
            && let Err(e) = check_no_conflict(&approved_slots(&guard, Some(booking_id)), t)
        {
            metrics::counter!(VISIT_CONFLICTS_TOTAL, "stage" => "approve").increment(1);
            return Err(e);
        }

        let updated = self.store_status(&mut guard, booking_id, new_status).await?;
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "status" => new_status.as_str()).increment(1);
        info!(booking = %booking_id, listing = %listing_id, status = %new_status, "visit status changed");

        if new_status == BookingStatus::Approved && self.cascade != CascadePolicy::Off {
            let victims: Vec<Ulid> = pending_bookings(&guard)
                .into_iter()
                .filter(|b| match self.cascade {
                    CascadePolicy::AllPending => true,
                    _ => match (&b.visit_at, &updated.visit_at) {
                        (Some(t), Some(approved)) => super::conflicts(t, std::slice::from_ref(approved)),
                        _ => false,
                    },
                })
                .map(|b| b.id)
                .collect();
            for victim in victims {
                match self.store_status(&mut guard, victim, BookingStatus::Rejected).await {
                    Ok(_) => debug!(booking = %victim, "cascade-rejected"),
                    Err(e) => {
                        warn!(booking = %victim, "cascade rejection failed: {e}");
                        break;
                    }
                }
            }
        }

        Ok(updated)
    }

    /// `transition` with the target status given as wire text.
    pub async fn update_visit_status(
        &self,
        booking_id: Ulid,
        status: &str,
        acting_user_id: Ulid,
    ) -> Result<VisitBooking, EngineError> {
        let target = status
            .parse::<BookingStatus>()
            .map_err(|_| EngineError::InvalidStatus(InvalidStatus::Target(status.to_string())))?;
        self.transition(booking_id, target, acting_user_id).await
    }

    /// Reject every pending request on a listing. A convenience for the
    /// controlling party; approvals never depend on it.
    pub async fn reject_pending_for_listing(
        &self,
        listing_id: Ulid,
        acting_user_id: Ulid,
    ) -> Result<Vec<Ulid>, EngineError> {
        let ls = self
            .listing_handle(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        let mut guard = ls.write().await;
        if guard.listing.controller_id != acting_user_id {
            return Err(EngineError::Forbidden(listing_id));
        }

        let pending: Vec<Ulid> = pending_bookings(&guard).into_iter().map(|b| b.id).collect();
        for id in &pending {
            self.store_status(&mut guard, *id, BookingStatus::Rejected).await?;
        }
        metrics::counter!(VISIT_TRANSITIONS_TOTAL, "status" => "rejected").increment(pending.len() as u64);
        info!(listing = %listing_id, rejected = pending.len(), "pending visits rejected");
        Ok(pending)
    }
}
