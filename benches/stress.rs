use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ulid::Ulid;

use carebook::Engine;
use carebook::clock::FixedClock;
use carebook::compactor::run_compactor;
use carebook::config::SchedulerConfig;
use carebook::directory::InMemoryDirectory;
use carebook::model::{BookingFilter, CreateBooking, Ms, NewSlot};
use carebook::observability;

const HALF_HOUR: Ms = 1_800_000;
const DAY: Ms = 86_400_000;
/// 2025-01-06 00:00 UTC. Every slot in the bench lies after it.
const EPOCH: Ms = 1_736_121_600_000;

struct Bench {
    engine: Arc<Engine>,
    dir: Arc<InMemoryDirectory>,
}

/// Configured like an embedding service would be: `CAREBOOK_*` environment,
/// tracing, optional metrics endpoint, background compactor. Without an
/// explicit data dir each run gets a fresh one.
fn open_engine() -> Bench {
    let mut config = SchedulerConfig::from_env();
    if std::env::var_os("CAREBOOK_DATA_DIR").is_none() {
        config.data_dir = std::env::temp_dir().join(format!("carebook_bench_{}", Ulid::new()));
    }
    observability::init_tracing();
    observability::init(config.metrics_port).expect("metrics exporter");

    let dir = Arc::new(InMemoryDirectory::new());
    let engine = Engine::open(&config, dir.clone(), Arc::new(FixedClock::new(EPOCH)))
        .expect("open engine");
    let engine = Arc::new(engine);
    tokio::spawn(run_compactor(
        engine.clone(),
        config.compact_threshold,
        config.compact_interval,
    ));
    println!("data dir: {}\n", config.data_dir.display());
    Bench { engine, dir }
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
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

fn slot_at(i: i64) -> NewSlot {
    let start = EPOCH + DAY + i * HALF_HOUR;
    NewSlot::new(start, start + HALF_HOUR)
}

async fn publish(engine: &Engine, specialist: Ulid, n: i64) -> Vec<Ulid> {
    let batch: Vec<NewSlot> = (0..n).map(slot_at).collect();
    engine
        .create_slots(specialist, batch)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.id)
        .collect()
}

async fn phase1_sequential(b: &Bench) {
    let specialist = Ulid::new();
    b.dir.approve(specialist);

    let n = 2000;
    let mut latencies = Vec::with_capacity(n as usize);
    let start = Instant::now();
    for i in 0..n {
        let t = Instant::now();
        b.engine
            .create_slots(specialist, vec![slot_at(i)])
            .await
            .unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} slots in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("create_slots latency", &mut latencies);
}

async fn phase2_concurrent(b: &Bench) {
    let n_tasks = 10;
    let n_per_task = 200;

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = b.engine.clone();
        let specialist = Ulid::new();
        b.dir.approve(specialist);
        handles.push(tokio::spawn(async move {
            let slots = publish(&engine, specialist, n_per_task).await;
            let parent = Ulid::new();
            for slot_id in slots {
                engine
                    .create_booking(
                        parent,
                        CreateBooking {
                            slot_id,
                            child_id: None,
                            message: None,
                        },
                    )
                    .await
                    .unwrap();
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks * n_per_task;
    let ops = total as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} specialists x {n_per_task} bookings = {total} total in {:.2}s = {ops:.0} ops/sec",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(b: &Bench) {
    let specialist = Ulid::new();
    b.dir.approve(specialist);
    publish(&b.engine, specialist, 200).await;

    // Writers keep publishing on their own calendars in the background.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let engine = b.engine.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let own = Ulid::new();
            let mut i = 0i64;
            while !stop.load(Ordering::Relaxed) {
                let _ = engine.create_slots(own, vec![slot_at(i)]).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut reader_handles = Vec::new();
    for _ in 0..n_readers {
        let engine = b.engine.clone();
        reader_handles.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for _ in 0..reads_per_reader {
                let t = Instant::now();
                engine
                    .list_free_slots(specialist, EPOCH, EPOCH + 30 * DAY)
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

    print_latency("list_free_slots", &mut all_latencies);
}

async fn phase4_booking_storm(b: &Bench) {
    let specialist = Ulid::new();
    b.dir.approve(specialist);
    let slots = Arc::new(publish(&b.engine, specialist, 50).await);

    let n_parents = 200;
    let won = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for p in 0..n_parents {
        let engine = b.engine.clone();
        let slots = slots.clone();
        let won = won.clone();
        handles.push(tokio::spawn(async move {
            let parent = Ulid::new();
            // Everyone goes for the same handful of slots.
            for k in 0..slots.len() {
                let slot_id = slots[(p + k) % slots.len()];
                let booked = engine
                    .create_booking(
                        parent,
                        CreateBooking {
                            slot_id,
                            child_id: None,
                            message: None,
                        },
                    )
                    .await;
                if booked.is_ok() {
                    won.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let won = won.load(Ordering::Relaxed);
    let stored = b
        .engine
        .specialist_bookings(specialist, BookingFilter::default())
        .await
        .unwrap()
        .len();
    println!(
        "  {n_parents} parents racing for {} slots: {won} bookings ({stored} stored) in {:.2}s",
        slots.len(),
        elapsed.as_secs_f64()
    );
    assert_eq!(won, slots.len(), "every slot booked exactly once");
    assert_eq!(stored, won);
}

#[tokio::main]
async fn main() {
    println!("=== carebook stress benchmark ===\n");
    let bench = open_engine();

    println!("[phase 1] sequential slot publishing");
    phase1_sequential(&bench).await;

    println!("\n[phase 2] concurrent booking throughput");
    phase2_concurrent(&bench).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&bench).await;

    println!("\n[phase 4] booking storm on one calendar");
    phase4_booking_storm(&bench).await;

    let t = Instant::now();
    bench.engine.compact_wal().await.unwrap();
    println!("\n[compaction] {:.2}ms", t.elapsed().as_secs_f64() * 1000.0);

    println!("\n=== benchmark complete ===");
}
