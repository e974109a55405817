use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

use courtside::clock::SystemClock;
use courtside::engine::{Engine, EngineSettings};
use courtside::notify::NotifyHub;
use courtside::wire;

const PASSWORD: &str = "courtside";
/// Hourly slots per day, 00:00 through 23:00.
const SLOTS_PER_DAY: usize = 23;

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("courtside")
        .user("bench")
        .password(PASSWORD);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

/// Serve an engine in-process on an ephemeral port.
async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("no local addr");
    let dir = std::env::temp_dir().join(format!("courtside_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).expect("cannot create bench dir");
    let engine = Arc::new(
        Engine::new(
            dir.join("courtside.wal"),
            Arc::new(NotifyHub::new()),
            Arc::new(SystemClock),
            EngineSettings::default(),
        )
        .expect("engine failed to start"),
    );
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let engine = engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, PASSWORD.to_string(), None).await;
            });
        }
    });
    addr
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

/// Slot `i` as (date, start, end), counting hourly slots from `base`.
fn slot(base: NaiveDate, i: usize) -> (NaiveDate, String, String) {
    let date = base + Days::new((i / SLOTS_PER_DAY) as u64);
    let hour = i % SLOTS_PER_DAY;
    (date, format!("{hour:02}:00"), format!("{:02}:00", hour + 1))
}

fn hold_sql(court: Ulid, base: NaiveDate, i: usize, user: Ulid) -> String {
    let (date, start, end) = slot(base, i);
    format!(
        "INSERT INTO holds (id, court_id, date, start_time, end_time, user_id, guest_name, guest_phone, total_price) \
         VALUES ('{}', '{court}', '{date}', '{start}', '{end}', '{user}', NULL, NULL, 100000)",
        Ulid::new()
    )
}

async fn new_court(client: &tokio_postgres::Client) -> Ulid {
    let court = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO courts (id, venue_id, name) VALUES ('{court}', '{}', 'bench')",
            Ulid::new()
        ))
        .await
        .expect("create court failed");
    court
}

async fn phase1_sequential(addr: SocketAddr, base: NaiveDate) {
    let client = connect(addr).await;
    let court = new_court(&client).await;
    let user = Ulid::new();

    let n = 2000;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        client
            .batch_execute(&hold_sql(court, base, i, user))
            .await
            .expect("hold failed");
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} holds in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("hold latency", &mut latencies);
}

/// Many clients race for the same slots; each slot must have one winner.
async fn phase2_contended(addr: SocketAddr, base: NaiveDate) {
    let setup = connect(addr).await;
    let court = new_court(&setup).await;

    let n_tasks = 32;
    let n_slots = 100;
    let won = Arc::new(AtomicUsize::new(0));
    let lost = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let won = won.clone();
        let lost = lost.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let user = Ulid::new();
            for i in 0..n_slots {
                match client.batch_execute(&hold_sql(court, base, i, user)).await {
                    Ok(()) => won.fetch_add(1, Ordering::Relaxed),
                    Err(_) => lost.fetch_add(1, Ordering::Relaxed),
                };
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let lost = lost.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} clients x {n_slots} slots: {won} won, {lost} refused in {:.2}s",
        elapsed.as_secs_f64()
    );
    if won != n_slots {
        println!("  !! expected exactly {n_slots} winners");
    }
}

async fn phase3_read_under_load(addr: SocketAddr, base: NaiveDate) {
    let setup = connect(addr).await;
    let court = new_court(&setup).await;
    let user = Ulid::new();
    for i in 0..SLOTS_PER_DAY / 2 {
        setup
            .batch_execute(&hold_sql(court, base, i * 2, user))
            .await
            .expect("prefill failed");
    }
    drop(setup);

    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for _ in 0..5 {
        let stop = stop.clone();
        writers.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let court = new_court(&client).await;
            let user = Ulid::new();
            let mut i = 0;
            while !stop.load(Ordering::Relaxed) {
                let _ = client.batch_execute(&hold_sql(court, base, i, user)).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for _ in 0..n_readers {
        readers.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                client
                    .simple_query(&format!(
                        "SELECT * FROM availability WHERE court_id = '{court}' AND date = '{base}'"
                    ))
                    .await
                    .expect("availability failed");
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        if let Ok(latencies) = h.await {
            all.extend(latencies);
        }
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("availability query", &mut all);
}

async fn phase4_connection_storm(addr: SocketAddr, base: NaiveDate) {
    let n_conns = 50;
    let ops_per_conn = 10;
    let success = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(addr).await;
            let court = new_court(&client).await;
            let user = Ulid::new();
            for i in 0..ops_per_conn {
                if client.batch_execute(&hold_sql(court, base, i, user)).await.is_err() {
                    return;
                }
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} holds each: {ok}/{n_conns} succeeded in {:.2}s",
        start.elapsed().as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let addr = start_server().await;
    // A week out, so every slot is bookable regardless of the wall clock.
    let base = Utc::now().date_naive() + Days::new(7);

    println!("=== courtside stress benchmark ===");
    println!("server: {addr}, first slot date {base}\n");

    println!("[phase 1] sequential hold throughput");
    phase1_sequential(addr, base).await;

    println!("\n[phase 2] contended holds on shared slots");
    phase2_contended(addr, base).await;

    println!("\n[phase 3] availability latency under write load");
    phase3_read_under_load(addr, base).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(addr, base).await;

    println!("\n=== benchmark complete ===");
}
