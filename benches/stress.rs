use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use tokio_postgres::{Client, Config, NoTls};
use ulid::Ulid;

async fn connect(host: &str, port: u16, user: Ulid) -> Client {
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname("visitd")
        .user(user.to_string())
        .password("visitd");

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

/// Visit slot `i`, three hours after slot `i - 1` so approved slots never clash.
fn slot(i: i64) -> String {
    let base: DateTime<Utc> = Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap();
    (base + chrono::Duration::hours(3 * i)).to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Create an apartment plus a whole-apartment listing owned by `owner`.
async fn new_listing(client: &Client, lat: f64, lon: f64) -> Ulid {
    let apartment = Ulid::new();
    let listing = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO apartments (id, total_rent, max_occupancy, latitude, longitude) \
             VALUES ('{apartment}', 12000, 3, {lat}, {lon})"
        ))
        .await
        .unwrap();
    client
        .batch_execute(&format!(
            "INSERT INTO listings (id, apartment_id, kind, price_per_person) \
             VALUES ('{listing}', '{apartment}', 'apartment', 4000)"
        ))
        .await
        .unwrap();
    listing
}

async fn request(client: &Client, listing: Ulid, at: &str) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO visits (id, listing_id, visit_at) VALUES ('{id}', '{listing}', '{at}')"
        ))
        .await?;
    Ok(id)
}

async fn phase1_sequential(host: &str, port: u16) {
    let owner = connect(host, port, Ulid::new()).await;
    let visitor = connect(host, port, Ulid::new()).await;
    let listing = new_listing(&owner, 10.0, 10.0).await;

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let at = slot(i as i64);
        let t = Instant::now();
        request(&visitor, listing, &at).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} visit requests in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("request latency", &mut latencies);
}

/// Many connections race to approve overlapping requests on the same slots.
/// Exactly one approval per slot may win.
async fn phase2_approval_race(host: &str, port: u16) {
    let owner_id = Ulid::new();
    let owner = connect(host, port, owner_id).await;
    let visitor = connect(host, port, Ulid::new()).await;
    let listing = new_listing(&owner, 20.0, 20.0).await;

    let slots = 50;
    let per_slot = 8;
    let mut requests = Vec::new();
    for s in 0..slots {
        for k in 0..per_slot {
            // Requests within one slot are minutes apart, so they all clash.
            let at = slot(s).replace(":00:00Z", &format!(":{:02}:00Z", k * 5));
            requests.push(request(&visitor, listing, &at).await.unwrap());
        }
    }

    let n_tasks = 10;
    let approved = Arc::new(AtomicUsize::new(0));
    let conflicted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(requests);
    let start = Instant::now();
    let mut handles = Vec::new();

    for t in 0..n_tasks {
        let host = host.to_string();
        let requests = requests.clone();
        let approved = approved.clone();
        let conflicted = conflicted.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, owner_id).await;
            for id in requests.iter().skip(t).step_by(n_tasks) {
                let sql = format!("UPDATE visits SET status = 'approved' WHERE id = '{id}'");
                match client.batch_execute(&sql).await {
                    Ok(()) => approved.fetch_add(1, Ordering::Relaxed),
                    Err(_) => conflicted.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }

    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let ok = approved.load(Ordering::Relaxed);
    let lost = conflicted.load(Ordering::Relaxed);
    println!(
        "  {} approvals over {slots} slots in {:.2}s: {ok} approved, {lost} conflicted",
        requests.len(),
        elapsed.as_secs_f64()
    );
    if ok != slots as usize {
        println!("  WARNING: expected exactly {slots} approvals");
    }
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for w in 0..5 {
        let host = host.to_string();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let owner = connect(&host, port, Ulid::new()).await;
            let listing = new_listing(&owner, 30.0 + w as f64, 30.0).await;
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = request(&owner, listing, &slot(i)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();

    for r in 0..n_readers {
        let host = host.to_string();
        reader_handles.push(tokio::spawn(async move {
            let visitor_id = Ulid::new();
            let owner = connect(&host, port, Ulid::new()).await;
            let visitor = connect(&host, port, visitor_id).await;
            let listing = new_listing(&owner, 40.0, 40.0 + r as f64).await;
            for i in 0..50 {
                request(&visitor, listing, &slot(i)).await.unwrap();
            }

            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                visitor
                    .simple_query(&format!("SELECT * FROM visits WHERE requester_id = '{visitor_id}'"))
                    .await
                    .unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }

    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("visit list query", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let mut handles = Vec::new();
    let success = Arc::new(AtomicUsize::new(0));

    for c in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let owner = connect(&host, port, Ulid::new()).await;
            let listing = new_listing(&owner, -10.0, c as f64).await;
            for i in 0..ops_per_conn {
                request(&owner, listing, &slot(i)).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }

    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} ops each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("VISITD_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("VISITD_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid VISITD_PORT");

    println!("=== visitd stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential visit requests");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] concurrent approval race");
    phase2_approval_race(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
