//! Descriptor-pool meter: drives a flow-controlled pool with simulated
//! producers and a completion thread, printing per-second rates until
//! Ctrl-C.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use rand::Rng;

use txpool_rs::{
    AcCascade, AcThresholds, AccessCategory, PauseReason, PoolTable, QueueAction,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Descriptors in the transmit pool.
    #[clap(short, long, default_value_t = 1024)]
    capacity: usize,

    /// Producer threads (assigned round-robin to access categories).
    #[clap(short, long, default_value_t = 4)]
    producers: usize,

    /// Page size in bytes for the backing arena.
    #[clap(long, default_value_t = 4096)]
    page_size: usize,

    /// Simulated completion latency per descriptor, in microseconds.
    #[clap(long, default_value_t = 20)]
    completion_us: u64,
}

const ACS: [AccessCategory; 4] = [
    AccessCategory::BestEffort,
    AccessCategory::Video,
    AccessCategory::Voice,
    AccessCategory::HighPriority,
];

fn main() -> Result<()> {
    let args = Args::parse();
    println!("txpool meter:");
    println!("* capacity: {}", args.capacity);
    println!("* producers: {}", args.producers);
    println!("* page size: {}", args.page_size);

    let term = Arc::new(AtomicBool::new(false));
    {
        let term = term.clone();
        ctrlc::set_handler(move || {
            term.store(true, Ordering::SeqCst);
        })
        .expect("Error setting Ctrl-C handler");
    }

    // Paused access categories, maintained by the pause hook as a bitmask.
    let paused = Arc::new(AtomicU8::new(0));
    let hook = {
        let paused = paused.clone();
        move |pool: u8, action: QueueAction, _reason: PauseReason| match action {
            QueueAction::Stop(ac) => {
                paused.fetch_or(1 << ac.index(), Ordering::SeqCst);
                println!("pool {pool}: paused {ac:?}");
            }
            QueueAction::Start(ac) => {
                paused.fetch_and(!(1 << ac.index()), Ordering::SeqCst);
                println!("pool {pool}: resumed {ac:?}");
            }
            QueueAction::StopAll => {
                paused.store(0x0f, Ordering::SeqCst);
            }
            QueueAction::StartAll => {
                paused.store(0, Ordering::SeqCst);
            }
        }
    };

    // Thresholds at 20/15/10/5 percent of capacity, starts one step higher.
    let c = args.capacity;
    let thresholds = AcThresholds::new(
        [c / 5, c * 3 / 20, c / 10, c / 20],
        [c / 4, c / 5, c * 3 / 20, c / 10],
    )?;
    let pool = txpool_rs::FlowControlPool::new(
        0,
        args.capacity,
        args.page_size,
        AcCascade::new(thresholds),
        hook,
    )?;

    let table: Arc<PoolTable> = Arc::new(PoolTable::new(1)?);
    table.attach(pool)?;

    let allocs = Arc::new(AtomicU64::new(0));
    let frees = Arc::new(AtomicU64::new(0));
    let in_flight = Arc::new(Mutex::new(VecDeque::new()));

    let mut handles = Vec::new();
    for i in 0..args.producers {
        let table = table.clone();
        let term = term.clone();
        let paused = paused.clone();
        let allocs = allocs.clone();
        let in_flight = in_flight.clone();
        let ac = ACS[i % ACS.len()];
        handles.push(thread::spawn(move || {
            let mut rng = rand::rng();
            while !term.load(Ordering::SeqCst) {
                if paused.load(Ordering::SeqCst) & (1 << ac.index()) != 0 {
                    thread::sleep(Duration::from_micros(50));
                    continue;
                }
                let burst = rng.random_range(1..=8);
                for _ in 0..burst {
                    match table.allocate(0) {
                        Some(id) => {
                            allocs.fetch_add(1, Ordering::Relaxed);
                            in_flight.lock().unwrap().push_back(id);
                        }
                        None => break,
                    }
                }
                thread::sleep(Duration::from_micros(10));
            }
        }));
    }

    // Completion thread: frees in-flight descriptors after a delay.
    {
        let table = table.clone();
        let term = term.clone();
        let frees = frees.clone();
        let in_flight = in_flight.clone();
        let delay = Duration::from_micros(args.completion_us);
        handles.push(thread::spawn(move || {
            while !term.load(Ordering::SeqCst) {
                let id = in_flight.lock().unwrap().pop_front();
                match id {
                    Some(id) => {
                        thread::sleep(delay);
                        if table.free(id).is_ok() {
                            frees.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => thread::sleep(Duration::from_micros(100)),
                }
            }
        }));
    }

    let mut old_allocs = 0;
    let mut old_frees = 0;
    while !term.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_secs(1));
        let a = allocs.load(Ordering::Relaxed);
        let f = frees.load(Ordering::Relaxed);
        let pool = table.get(0).expect("pool detached");
        let stats = pool.stats();
        println!(
            "alloc/sec: {:8}  free/sec: {:8}  avail: {:5}  drops: {:6}  status: {:?}",
            a.saturating_sub(old_allocs),
            f.saturating_sub(old_frees),
            stats.free,
            pool.no_desc_drops(),
            pool.status(),
        );
        old_allocs = a;
        old_frees = f;
    }

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    // Drain whatever is still in flight so the pool tears down cleanly.
    let leftover: Vec<_> = in_flight.lock().unwrap().drain(..).collect();
    for id in leftover {
        let _ = table.free(id);
    }
    println!(
        "done: {} allocated, {} freed",
        allocs.load(Ordering::Relaxed),
        frees.load(Ordering::Relaxed)
    );
    Ok(())
}
