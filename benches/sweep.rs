use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate};
use ulid::Ulid;

use roomledger::directory::InMemoryDirectory;
use roomledger::engine::Engine;
use roomledger::model::{BookingRequest, RequestContext};
use roomledger::notify::NotifyHub;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn day(offset: u64) -> NaiveDate {
    let season_start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    season_start.checked_add_days(Days::new(offset)).unwrap()
}

/// Deterministic stay generator so runs are comparable.
struct Stays(u64);

impl Stays {
    fn next(&mut self) -> (NaiveDate, NaiveDate) {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        let start = (self.0 >> 33) % 330;
        let nights = 1 + (self.0 >> 17) % 7;
        (day(start), day(start + nights))
    }
}

async fn setup() -> (Engine, Vec<Ulid>) {
    let path = std::env::temp_dir().join(format!("roomledger_bench_{}.wal", Ulid::new()));
    let engine = Engine::new(
        path,
        Arc::new(InMemoryDirectory::new()),
        Arc::new(NotifyHub::new()),
    )
    .expect("open engine");

    let ctx = RequestContext::system();
    let mut room_types = Vec::new();
    for (i, qty) in [10u32, 25, 50, 120].into_iter().enumerate() {
        let id = Ulid::new();
        engine
            .create_room_type(&ctx, id, Some(format!("type-{i}")), qty, 10_000 + 2_500 * i as u64)
            .await
            .unwrap();
        room_types.push(id);
    }
    println!("  created {} room types", room_types.len());
    (engine, room_types)
}

async fn phase1_booking_throughput(engine: &Engine, room_types: &[Ulid]) {
    let ctx = RequestContext::system();
    let mut stays = Stays(7);
    let n = 2_000;
    let mut committed = 0;
    let start = Instant::now();
    for i in 0..n {
        let (check_in, check_out) = stays.next();
        let rt = room_types[i % room_types.len()];
        if engine
            .create_reservation(&ctx, BookingRequest::new(rt, check_in, check_out))
            .await
            .is_ok()
        {
            committed += 1;
        }
    }
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!(
        "  {n} attempts ({committed} committed) in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase2_availability(engine: &Engine, room_types: &[Ulid]) {
    let mut stays = Stays(42);
    let mut single = Vec::new();
    let mut nightly = Vec::new();
    let mut search = Vec::new();
    for i in 0..500 {
        let (check_in, check_out) = stays.next();
        let rt = room_types[i % room_types.len()];

        let t = Instant::now();
        engine.check_availability(rt, check_in, check_out, 1).await.unwrap();
        single.push(t.elapsed());

        let t = Instant::now();
        engine
            .nightly_availability(rt, check_in, check_in.checked_add_days(Days::new(30)).unwrap())
            .await
            .unwrap();
        nightly.push(t.elapsed());

        let t = Instant::now();
        engine.search_availability(check_in, check_out, 2).await.unwrap();
        search.push(t.elapsed());
    }
    print_latency("check_availability", &mut single);
    print_latency("nightly_availability (30 nights)", &mut nightly);
    print_latency("search_availability", &mut search);
}

async fn phase3_compaction(engine: &Engine) {
    let appended = engine.wal_appends_since_compact().await;
    let start = Instant::now();
    engine.compact_wal().await.unwrap();
    println!(
        "  compacted {appended} appended events in {:.2}ms",
        start.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== roomledger sweep benchmark ===");

    println!("\n[setup]");
    let (engine, room_types) = setup().await;

    println!("\n[phase 1] sequential booking throughput");
    phase1_booking_throughput(&engine, &room_types).await;

    println!("\n[phase 2] availability latency");
    phase2_availability(&engine, &room_types).await;

    println!("\n[phase 3] log compaction");
    phase3_compaction(&engine).await;

    println!("\n=== benchmark complete ===");
}
