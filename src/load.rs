//! Background load generation.
//!
//! Runs alongside the echo server to keep the host busy:
//! - CPU stressors spin in tight loops, one thread each
//! - Memory stressors allocate and retain fixed-size chunks on a timer
//!
//! Workers run until `LoadGenerator::stop` is called. Dropping the
//! generator without stopping leaves them running until process exit.

use crate::config::LoadConfig;
use std::hint::black_box;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counters shared by all stressors
#[derive(Debug, Default)]
pub struct LoadStats {
    cpu_workers: usize,
    memory_workers: usize,
    cpu_rounds: AtomicU64,
    allocations: AtomicU64,
    bytes_held: AtomicUsize,
}

/// Point-in-time copy of `LoadStats`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSnapshot {
    pub cpu_workers: usize,
    pub memory_workers: usize,
    pub cpu_rounds: u64,
    pub allocations: u64,
    pub bytes_held: usize,
}

/// Handle to the running stressor threads
pub struct LoadGenerator {
    stop: Arc<AtomicBool>,
    stats: Arc<LoadStats>,
    handles: Vec<JoinHandle<()>>,
}

impl LoadGenerator {
    /// Spawn the CPU and memory stressors described by `config`.
    pub fn start(config: &LoadConfig) -> io::Result<Self> {
        let cpu_workers = config.cpu_worker_count();
        let memory_workers = config.memory_worker_count();
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(LoadStats {
            cpu_workers,
            memory_workers,
            ..LoadStats::default()
        });

        info!(
            cpu_workers,
            memory_workers,
            memory_chunk = config.memory_chunk,
            memory_interval_ms = config.memory_interval_ms,
            max_memory = config.max_memory,
            "Starting load workers"
        );

        let mut generator = LoadGenerator {
            stop,
            stats,
            handles: Vec::with_capacity(cpu_workers + memory_workers),
        };

        for worker_id in 0..cpu_workers {
            let stop = Arc::clone(&generator.stop);
            let stats = Arc::clone(&generator.stats);
            let spin_iterations = config.spin_iterations;

            let handle = thread::Builder::new()
                .name(format!("cpu-{}", worker_id))
                .spawn(move || cpu_stress(&stop, &stats, spin_iterations));

            generator.track(handle)?;
        }

        for worker_id in 0..memory_workers {
            let stop = Arc::clone(&generator.stop);
            let stats = Arc::clone(&generator.stats);
            let chunk = config.memory_chunk;
            let interval = config.memory_interval();
            let cap = config.max_memory;

            let handle = thread::Builder::new()
                .name(format!("memory-{}", worker_id))
                .spawn(move || memory_stress(worker_id, &stop, &stats, chunk, interval, cap));

            generator.track(handle)?;
        }

        Ok(generator)
    }

    /// Record a spawned worker, stopping the others if the spawn failed.
    fn track(&mut self, handle: io::Result<JoinHandle<()>>) -> io::Result<()> {
        match handle {
            Ok(handle) => {
                self.handles.push(handle);
                Ok(())
            }
            Err(e) => {
                self.shutdown();
                Err(e)
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> LoadSnapshot {
        self.stats.snapshot()
    }

    /// Shared counters, for reporters that outlive a borrow of the generator.
    pub fn stats_handle(&self) -> Arc<LoadStats> {
        Arc::clone(&self.stats)
    }

    /// Signal all workers, wait for them and release held memory.
    pub fn stop(mut self) -> LoadSnapshot {
        self.shutdown();
        let final_stats = self.stats();
        info!(
            cpu_workers = final_stats.cpu_workers,
            memory_workers = final_stats.memory_workers,
            cpu_rounds = final_stats.cpu_rounds,
            allocations = final_stats.allocations,
            bytes_held = final_stats.bytes_held,
            "Load workers stopped"
        );
        final_stats
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Load worker panicked");
            }
        }
    }
}

impl LoadStats {
    pub fn snapshot(&self) -> LoadSnapshot {
        LoadSnapshot {
            cpu_workers: self.cpu_workers,
            memory_workers: self.memory_workers,
            cpu_rounds: self.cpu_rounds.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            bytes_held: self.bytes_held.load(Ordering::Relaxed),
        }
    }

    /// Reserve `chunk` bytes against `cap` (0 = no cap).
    fn reserve(&self, chunk: usize, cap: usize) -> bool {
        self.bytes_held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |held| {
                let next = held.checked_add(chunk)?;
                if cap == 0 || next <= cap {
                    Some(next)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        self.bytes_held.fetch_sub(bytes, Ordering::SeqCst);
    }
}

/// Busy loop, checking the stop flag once per round.
fn cpu_stress(stop: &AtomicBool, stats: &LoadStats, spin_iterations: u64) {
    while !stop.load(Ordering::Relaxed) {
        for i in 0..spin_iterations {
            black_box(i);
        }
        stats.cpu_rounds.fetch_add(1, Ordering::Relaxed);
    }
}

/// Allocate and keep `chunk` bytes every `interval` until stopped.
fn memory_stress(
    worker_id: usize,
    stop: &AtomicBool,
    stats: &LoadStats,
    chunk: usize,
    interval: Duration,
    cap: usize,
) {
    let mut allocations: Vec<Vec<u8>> = Vec::new();
    let mut capped = false;

    while !stop.load(Ordering::Relaxed) {
        if stats.reserve(chunk, cap) {
            // Filled with spaces so every page is touched
            allocations.push(vec![b' '; chunk]);
            stats.allocations.fetch_add(1, Ordering::Relaxed);
        } else if !capped {
            capped = true;
            info!(worker = worker_id, max_memory = cap, "Memory cap reached");
        }
        thread::sleep(interval);
    }

    let held = allocations.len() * chunk;
    drop(allocations);
    stats.release(held);
    debug!(worker = worker_id, released = held, "Memory worker exiting");
}
