use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::engine::Engine;
use crate::observability::{RECOMPUTE_DROPPED_TOTAL, RECOMPUTE_DURATION_SECONDS};

/// Most ids pulled off the queue per worker pass.
const MAX_BATCH: usize = 256;

/// Producer half of the fair-rent recompute queue. Enqueueing never waits:
/// a full queue drops the request, and the score stays stale until the next
/// mutation touching that apartment.
#[derive(Clone)]
pub struct RecomputeQueue {
    tx: mpsc::Sender<Ulid>,
}

impl RecomputeQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Ulid>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Returns false if the request was dropped.
    pub fn enqueue(&self, apartment_id: Ulid) -> bool {
        match self.tx.try_send(apartment_id) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                metrics::counter!(RECOMPUTE_DROPPED_TOTAL).increment(1);
                warn!(apartment = %apartment_id, "recompute queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(apartment = %apartment_id, "recompute worker gone");
                false
            }
        }
    }
}

/// Drain the queue in batches, dedup ids, and recompute each once.
/// Failures are logged here and go no further.
pub async fn run_worker(engine: Arc<Engine>, mut rx: mpsc::Receiver<Ulid>) {
    let mut batch = Vec::with_capacity(MAX_BATCH);
    while rx.recv_many(&mut batch, MAX_BATCH).await > 0 {
        let unique: HashSet<Ulid> = batch.drain(..).collect();
        for apartment_id in unique {
            let started = Instant::now();
            match engine.recompute_fair_rent(apartment_id).await {
                Ok(Some(score)) => debug!(apartment = %apartment_id, score, "fair-rent updated"),
                Ok(None) => {}
                Err(e) => error!(apartment = %apartment_id, "fair-rent recompute failed: {e}"),
            }
            metrics::histogram!(RECOMPUTE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
        }
    }
    info!("recompute worker stopped");
}

/// Compact the WAL once enough appends have piled up since the last snapshot.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        info!(appends, "compacting WAL");
        if let Err(e) = engine.compact_wal().await {
            error!("WAL compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CascadePolicy, NewApartment, SiteRef};
    use std::path::PathBuf;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("visitd_test_recompute");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn full_queue_drops_requests() {
        let (queue, mut rx) = RecomputeQueue::new(2);
        assert!(queue.enqueue(Ulid::new()));
        assert!(queue.enqueue(Ulid::new()));
        assert!(!queue.enqueue(Ulid::new()));

        rx.recv().await.unwrap();
        assert!(queue.enqueue(Ulid::new()));
    }

    #[tokio::test]
    async fn closed_queue_reports_drop() {
        let (queue, rx) = RecomputeQueue::new(4);
        drop(rx);
        assert!(!queue.enqueue(Ulid::new()));
    }

    #[tokio::test]
    async fn worker_scores_queued_apartments() {
        let (queue, rx) = RecomputeQueue::new(64);
        let engine = Arc::new(
            Engine::new(test_wal_path("worker.wal"), queue, CascadePolicy::Off).unwrap(),
        );
        let worker = tokio::spawn(run_worker(engine.clone(), rx));

        let site = SiteRef::Coordinates {
            latitude: 52.52,
            longitude: 13.405,
            area_name: Some("Mitte".into()),
        };
        let a = engine
            .create_apartment(NewApartment {
                id: Ulid::new(),
                owner_id: Ulid::new(),
                title: None,
                total_rent: Some(12_000),
                max_occupancy: Some(2),
                site: Some(site.clone()),
            })
            .await
            .unwrap();
        let b = engine
            .create_apartment(NewApartment {
                id: Ulid::new(),
                owner_id: Ulid::new(),
                title: None,
                total_rent: Some(6_000),
                max_occupancy: Some(2),
                site: Some(site),
            })
            .await
            .unwrap();
        assert_eq!(a.location_id, b.location_id);

        // b's creation re-queued a, so a is eventually scored against b.
        let mut score = None;
        for _ in 0..100 {
            score = engine.get_metrics(a.id).map(|m| m.fair_rent_score);
            if score == Some(25) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(score, Some(25));
        worker.abort();
    }
}
