use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError, SharedListing};

impl Engine {
    fn all_listing_handles(&self) -> Vec<SharedListing> {
        self.listings.iter().map(|e| e.value().clone()).collect()
    }

    fn area_name_for_apartment(&self, apartment_id: Ulid) -> Option<String> {
        let location_id = self.apartments.get(&apartment_id)?.location_id?;
        self.locations.get(&location_id).map(|l| l.area_name.clone())
    }

    fn view_of(&self, listing: &Listing, booking: &VisitBooking) -> BookingView {
        BookingView {
            booking: booking.clone(),
            listing_kind: listing.kind,
            price_per_person: listing.price_per_person,
            area_name: self.area_name_for_apartment(listing.apartment_id),
        }
    }

    /// Bookings matching `keep`, newest request first.
    async fn collect_views<F>(&self, keep: F) -> Vec<BookingView>
    where
        F: Fn(&Listing, &VisitBooking) -> bool,
    {
        let mut out = Vec::new();
        for shared in self.all_listing_handles() {
            let guard = shared.read().await;
            for booking in guard.bookings.iter().filter(|b| keep(&guard.listing, b)) {
                out.push(self.view_of(&guard.listing, booking));
            }
        }
        out.sort_by(|a, b| b.booking.created_at.cmp(&a.booking.created_at).then(b.booking.id.cmp(&a.booking.id)));
        out
    }

    /// One booking with its display fields.
    pub async fn get_booking_view(&self, booking_id: Ulid) -> Result<BookingView, EngineError> {
        let booking = self.find_booking(booking_id).await?;
        let listing = self.get_listing(booking.listing_id).await?;
        Ok(self.view_of(&listing, &booking))
    }

    /// Every visit request the user has made.
    pub async fn list_bookings_for_requester(&self, requester_id: Ulid) -> Vec<BookingView> {
        self.collect_views(|_, b| b.requester_id == requester_id).await
    }

    /// Every visit request on listings the user controls.
    pub async fn list_bookings_for_controller(&self, controller_id: Ulid) -> Vec<BookingView> {
        self.collect_views(|l, _| l.controller_id == controller_id).await
    }

    /// All listings, oldest first.
    pub async fn list_listings(&self) -> Vec<Listing> {
        let mut out = Vec::new();
        for shared in self.all_listing_handles() {
            out.push(shared.read().await.listing.clone());
        }
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    pub fn list_metrics(&self) -> Vec<ApartmentMetrics> {
        let mut out: Vec<ApartmentMetrics> = self.metrics.iter().map(|e| e.value().clone()).collect();
        out.sort_by_key(|m| m.apartment_id);
        out
    }
}
