//! Minimal apartment/listing/location storage. The marketplace owns the rich
//! versions of these; the scheduler only needs enough to answer "does it
//! exist", "is it bookable", "who controls it" and "what are its neighbours".

use chrono::Utc;
use tracing::{debug, info};
use ulid::Ulid;

use crate::geo;
use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

/// Where a new apartment sits.
#[derive(Debug, Clone, PartialEq)]
pub enum SiteRef {
    /// An existing location bucket.
    Bucket(Ulid),
    /// Raw coordinates, bucketed through `find_or_create_location`.
    Coordinates {
        latitude: f64,
        longitude: f64,
        area_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewApartment {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub title: Option<String>,
    pub total_rent: Option<i64>,
    pub max_occupancy: Option<u32>,
    pub site: Option<SiteRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub id: Ulid,
    pub apartment_id: Ulid,
    pub kind: ListingKind,
    /// Required for room shares; must be absent for whole apartments.
    pub host_id: Option<Ulid>,
    pub price_per_person: i64,
}

fn validate_rent(rent: Option<i64>) -> Result<(), EngineError> {
    match rent {
        Some(r) if !(0..=MAX_RENT).contains(&r) => Err(EngineError::InvalidInput("rent out of range")),
        _ => Ok(()),
    }
}

fn validate_occupancy(occ: Option<u32>) -> Result<(), EngineError> {
    match occ {
        Some(o) if o > MAX_OCCUPANCY => Err(EngineError::InvalidInput("occupancy out of range")),
        _ => Ok(()),
    }
}

impl Engine {
    // ── Locations ────────────────────────────────────────────

    /// Return the nearest bucket within 50 m of the point, or create one.
    ///
    /// Lookup and insert share the catalog lock, so one process never
    /// creates two buckets for the same spot. Buckets are never renamed:
    /// the first caller's name sticks.
    pub async fn find_or_create_location(
        &self,
        latitude: f64,
        longitude: f64,
        area_name: Option<String>,
    ) -> Result<LocationBucket, EngineError> {
        let _catalog = self.catalog_lock.lock().await;
        self.locate_or_insert(latitude, longitude, area_name).await
    }

    /// Caller holds `catalog_lock`.
    async fn locate_or_insert(
        &self,
        latitude: f64,
        longitude: f64,
        area_name: Option<String>,
    ) -> Result<LocationBucket, EngineError> {
        if !geo::valid_coordinates(latitude, longitude) {
            return Err(EngineError::InvalidInput("coordinates out of range"));
        }
        if let Some(ref n) = area_name
            && n.len() > MAX_AREA_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("area name too long"));
        }

        let buckets: Vec<LocationBucket> = self.locations.iter().map(|e| e.value().clone()).collect();
        if let Some(hit) = geo::nearest_within_radius(&buckets, latitude, longitude) {
            debug!(location = %hit.id, "reusing location bucket");
            return Ok(hit.clone());
        }

        let bucket = LocationBucket {
            id: Ulid::new(),
            area_name: area_name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| geo::generated_area_name(latitude, longitude)),
            latitude,
            longitude,
        };
        self.persist_catalog(&Event::LocationCreated { bucket: bucket.clone() })
            .await?;
        info!(location = %bucket.id, name = %bucket.area_name, "location bucket created");
        Ok(bucket)
    }

    /// All buckets, sorted by area name.
    pub fn list_locations(&self) -> Vec<LocationBucket> {
        let mut all: Vec<LocationBucket> = self.locations.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.area_name.cmp(&b.area_name));
        all
    }

    // ── Apartments ───────────────────────────────────────────

    pub async fn create_apartment(&self, new: NewApartment) -> Result<Apartment, EngineError> {
        validate_rent(new.total_rent)?;
        validate_occupancy(new.max_occupancy)?;
        if let Some(ref t) = new.title
            && t.len() > MAX_TITLE_LEN
        {
            return Err(EngineError::LimitExceeded("title too long"));
        }

        let apartment = {
            let _catalog = self.catalog_lock.lock().await;
            if self.apartments.contains_key(&new.id) {
                return Err(EngineError::AlreadyExists(new.id));
            }
            if self.apartments.len() >= MAX_APARTMENTS {
                return Err(EngineError::LimitExceeded("too many apartments"));
            }
            let location_id = match new.site {
                None => None,
                Some(SiteRef::Bucket(id)) => {
                    if !self.locations.contains_key(&id) {
                        return Err(EngineError::NotFound(id));
                    }
                    Some(id)
                }
                Some(SiteRef::Coordinates {
                    latitude,
                    longitude,
                    area_name,
                }) => Some(self.locate_or_insert(latitude, longitude, area_name).await?.id),
            };

            let apartment = Apartment {
                id: new.id,
                owner_id: new.owner_id,
                title: new.title,
                location_id,
                total_rent: new.total_rent,
                max_occupancy: new.max_occupancy,
            };
            self.persist_catalog(&Event::ApartmentCreated {
                apartment: apartment.clone(),
            })
            .await?;
            apartment
        };

        info!(apartment = %apartment.id, "apartment created");
        self.schedule_recompute_around(apartment.id, apartment.location_id);
        Ok(apartment)
    }

    /// Change rent and/or occupancy; `None` leaves a field as it is.
    pub async fn update_apartment(
        &self,
        id: Ulid,
        total_rent: Option<i64>,
        max_occupancy: Option<u32>,
    ) -> Result<Apartment, EngineError> {
        validate_rent(total_rent)?;
        validate_occupancy(max_occupancy)?;

        let (before, after) = {
            let _catalog = self.catalog_lock.lock().await;
            let before = self.get_apartment(id)?;
            let event = Event::ApartmentUpdated {
                id,
                total_rent: total_rent.or(before.total_rent),
                max_occupancy: max_occupancy.or(before.max_occupancy),
            };
            self.persist_catalog(&event).await?;
            (before, self.get_apartment(id)?)
        };

        if before.total_rent != after.total_rent || before.max_occupancy != after.max_occupancy {
            self.schedule_recompute_around(id, after.location_id);
        }
        Ok(after)
    }

    pub fn get_apartment(&self, id: Ulid) -> Result<Apartment, EngineError> {
        self.apartments
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(EngineError::NotFound(id))
    }

    pub fn apartments_in_location(&self, location_id: Ulid) -> Vec<Apartment> {
        self.apartments
            .iter()
            .filter(|e| e.value().location_id == Some(location_id))
            .map(|e| e.value().clone())
            .collect()
    }

    /// A price move shifts the bucket average, so neighbours are rescored too.
    fn schedule_recompute_around(&self, apartment_id: Ulid, location_id: Option<Ulid>) {
        self.recompute.enqueue(apartment_id);
        if let Some(loc) = location_id {
            for other in self.apartments_in_location(loc) {
                if other.id != apartment_id {
                    self.recompute.enqueue(other.id);
                }
            }
        }
    }

    // ── Listings ─────────────────────────────────────────────

    pub async fn create_listing(&self, new: NewListing) -> Result<Listing, EngineError> {
        if !(0..=MAX_RENT).contains(&new.price_per_person) {
            return Err(EngineError::InvalidInput("price out of range"));
        }
        let _catalog = self.catalog_lock.lock().await;
        if self.listings.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }
        if self.listings.len() >= MAX_LISTINGS {
            return Err(EngineError::LimitExceeded("too many listings"));
        }
        let apartment = self.get_apartment(new.apartment_id)?;
        let controller_id = match (new.kind, new.host_id) {
            (ListingKind::Apartment, None) => apartment.owner_id,
            (ListingKind::RoomShare, Some(host)) => host,
            (ListingKind::Apartment, Some(_)) => {
                return Err(EngineError::InvalidInput("apartment listings have no host"));
            }
            (ListingKind::RoomShare, None) => {
                return Err(EngineError::InvalidInput("room share listing needs a host"));
            }
        };

        let listing = Listing {
            id: new.id,
            apartment_id: new.apartment_id,
            kind: new.kind,
            price_per_person: new.price_per_person,
            status: ListingStatus::Available,
            verification: Verification::Pending,
            controller_id,
            created_at: Utc::now(),
        };
        self.persist_catalog(&Event::ListingCreated {
            listing: listing.clone(),
        })
        .await?;
        info!(listing = %listing.id, kind = %listing.kind, "listing created");
        Ok(listing)
    }

    /// Partial update; `None` leaves a field as it is. A price change
    /// schedules a fair-rent recompute for the listing's apartment.
    pub async fn update_listing(
        &self,
        id: Ulid,
        price_per_person: Option<i64>,
        status: Option<ListingStatus>,
        verification: Option<Verification>,
    ) -> Result<Listing, EngineError> {
        if let Some(p) = price_per_person
            && !(0..=MAX_RENT).contains(&p)
        {
            return Err(EngineError::InvalidInput("price out of range"));
        }
        let ls = self.listing_handle(&id).ok_or(EngineError::NotFound(id))?;
        let mut guard = ls.write().await;
        let before = guard.listing.clone();
        let event = Event::ListingUpdated {
            id,
            price_per_person: price_per_person.unwrap_or(before.price_per_person),
            status: status.unwrap_or(before.status),
            verification: verification.unwrap_or(before.verification),
        };
        self.persist_to_listing(&mut guard, &event).await?;
        let after = guard.listing.clone();
        drop(guard);

        if after.price_per_person != before.price_per_person {
            self.recompute.enqueue(after.apartment_id);
        }
        Ok(after)
    }

    pub async fn get_listing(&self, id: Ulid) -> Result<Listing, EngineError> {
        let ls = self.listing_handle(&id).ok_or(EngineError::NotFound(id))?;
        let guard = ls.read().await;
        Ok(guard.listing.clone())
    }

    pub async fn listing_availability(&self, id: Ulid) -> Result<ListingStatus, EngineError> {
        Ok(self.get_listing(id).await?.status)
    }

    pub async fn listing_controlling_party(&self, id: Ulid) -> Result<Ulid, EngineError> {
        Ok(self.get_listing(id).await?.controller_id)
    }
}
