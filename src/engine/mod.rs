mod bookings;
mod conflict;
mod error;
mod fair_rent;
mod listings;
mod queries;
mod store;

pub use bookings::CascadePolicy;
pub use conflict::{conflicts, find_conflict};
pub use error::{EngineError, InvalidStatus};
pub use fair_rent::{fair_rent_score, NEUTRAL_SCORE};
pub use listings::{NewApartment, NewListing, SiteRef};

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::recompute::RecomputeQueue;
use crate::wal::Wal;

/// One lock per listing. Holding the write half is what makes an approval's
/// read-check-write sequence atomic with respect to other approvals.
pub type SharedListing = Arc<RwLock<ListingState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL file. Appends that queue up while a flush is in progress are
/// written together and made durable with a single fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        commit_batch(&mut wal, &mut batch);
        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so half-written bytes don't leak
    // into the next batch.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_snapshot(wal.path(), &events).and_then(|()| wal.install_snapshot());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// The scheduling engine and its in-memory store. Every mutation is logged
/// to the WAL before it becomes visible here.
pub struct Engine {
    pub(super) listings: DashMap<Ulid, SharedListing>,
    /// Reverse lookup: booking id → listing id.
    pub(super) booking_to_listing: DashMap<Ulid, Ulid>,
    pub(super) apartments: DashMap<Ulid, Apartment>,
    pub(super) locations: DashMap<Ulid, LocationBucket>,
    pub(super) metrics: DashMap<Ulid, ApartmentMetrics>,
    /// Serializes writes to apartments, locations, metrics and the listing
    /// map so WAL order matches apply order.
    pub(super) catalog_lock: Mutex<()>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) recompute: RecomputeQueue,
    pub(super) cascade: CascadePolicy,
}

/// Apply a listing-scoped event. Caller holds the listing's write lock.
fn apply_to_listing(ls: &mut ListingState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ListingUpdated {
            price_per_person,
            status,
            verification,
            ..
        } => {
            ls.listing.price_per_person = *price_per_person;
            ls.listing.status = *status;
            ls.listing.verification = *verification;
        }
        Event::VisitRequested { booking } => {
            index.insert(booking.id, booking.listing_id);
            ls.bookings.push(booking.clone());
        }
        Event::VisitStatusChanged { id, status, .. } => {
            if let Some(b) = ls.booking_mut(*id) {
                b.status = *status;
            }
        }
        // Catalog events never reach a listing lock.
        Event::ListingCreated { .. }
        | Event::LocationCreated { .. }
        | Event::ApartmentCreated { .. }
        | Event::ApartmentUpdated { .. }
        | Event::MetricsRecorded { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        recompute: RecomputeQueue,
        cascade: CascadePolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            listings: DashMap::new(),
            booking_to_listing: DashMap::new(),
            apartments: DashMap::new(),
            locations: DashMap::new(),
            metrics: DashMap::new(),
            catalog_lock: Mutex::new(()),
            wal_tx,
            recompute,
            cascade,
        };

        // Nobody else holds these Arcs yet, so try_write never contends.
        // blocking_write would panic if we're already inside the runtime.
        for event in &events {
            match event.listing_id() {
                Some(listing_id) => {
                    if let Some(entry) = engine.listings.get(&listing_id) {
                        let shared = entry.value().clone();
                        drop(entry);
                        let mut guard = shared
                            .try_write()
                            .map_err(|_| io::Error::other("replay: listing lock contended"))?;
                        apply_to_listing(&mut guard, event, &engine.booking_to_listing);
                    }
                }
                None => engine.apply_catalog(event),
            }
        }

        tracing::info!(
            events = events.len(),
            listings = engine.listings.len(),
            apartments = engine.apartments.len(),
            "engine state replayed"
        );
        Ok(engine)
    }

    /// Apply an event that is not scoped to a single listing's lock.
    pub(super) fn apply_catalog(&self, event: &Event) {
        match event {
            Event::LocationCreated { bucket } => {
                self.locations.insert(bucket.id, bucket.clone());
            }
            Event::ApartmentCreated { apartment } => {
                self.apartments.insert(apartment.id, apartment.clone());
            }
            Event::ApartmentUpdated {
                id,
                total_rent,
                max_occupancy,
            } => {
                if let Some(mut apt) = self.apartments.get_mut(id) {
                    apt.total_rent = *total_rent;
                    apt.max_occupancy = *max_occupancy;
                }
            }
            Event::ListingCreated { listing } => {
                let ls = ListingState::new(listing.clone());
                self.listings.insert(listing.id, Arc::new(RwLock::new(ls)));
            }
            Event::MetricsRecorded { metrics } => {
                self.metrics.insert(metrics.apartment_id, metrics.clone());
            }
            Event::ListingUpdated { .. }
            | Event::VisitRequested { .. }
            | Event::VisitStatusChanged { .. } => {}
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Log, then apply to the listing whose write guard the caller holds.
    pub(super) async fn persist_to_listing(
        &self,
        ls: &mut ListingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_listing(ls, event, &self.booking_to_listing);
        Ok(())
    }

    /// Log, then apply a catalog event. Caller holds `catalog_lock`.
    pub(super) async fn persist_catalog(&self, event: &Event) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply_catalog(event);
        Ok(())
    }

    pub(super) fn listing_handle(&self, id: &Ulid) -> Option<SharedListing> {
        self.listings.get(id).map(|e| e.value().clone())
    }

    /// Booking → listing → write guard.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<ListingState>, EngineError> {
        let listing_id = self
            .booking_to_listing
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(*booking_id))?;
        let ls = self
            .listing_handle(&listing_id)
            .ok_or(EngineError::NotFound(listing_id))?;
        Ok(ls.write_owned().await)
    }

    /// Rewrite the WAL as the minimal event list that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        {
            // Hold the catalog lock so no catalog write slips between
            // the snapshot and the file swap.
            let _catalog = self.catalog_lock.lock().await;

            for entry in self.locations.iter() {
                events.push(Event::LocationCreated { bucket: entry.value().clone() });
            }
            for entry in self.apartments.iter() {
                events.push(Event::ApartmentCreated { apartment: entry.value().clone() });
            }
            // Read guards stay alive until the swap: a listing write that
            // lands after the snapshot would otherwise vanish with the old file.
            let handles: Vec<SharedListing> =
                self.listings.iter().map(|e| e.value().clone()).collect();
            let mut guards = Vec::with_capacity(handles.len());
            for shared in handles {
                let guard = shared.read_owned().await;
                events.push(Event::ListingCreated { listing: guard.listing.clone() });
                for booking in &guard.bookings {
                    events.push(Event::VisitRequested { booking: booking.clone() });
                }
                guards.push(guard);
            }
            for entry in self.metrics.iter() {
                events.push(Event::MetricsRecorded { metrics: entry.value().clone() });
            }

            let (tx, rx) = oneshot::channel();
            self.wal_tx
                .send(WalCommand::Compact { events, response: tx })
                .await
                .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
            rx.await
                .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
                .map_err(|e| EngineError::WalError(e.to_string()))?;
            drop(guards);
        }
        tracing::info!("WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
