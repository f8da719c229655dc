//! Global counters read by the supervisor and by SHOW-style tooling.
//!
//! These are plain atomics rather than a metrics registry; an exporter can
//! scrape them without the workers knowing about it.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::worker::Termination;

/// Total clients accepted since start.
pub static TOTAL_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How many times a backend write failure escalated into a failover.
pub static FAILOVER_COUNTER: AtomicU64 = AtomicU64::new(0);

/// How many backend connections the pool has established.
pub static SERVER_CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

static TERMINATIONS: [AtomicU64; 6] = [
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
    AtomicU64::new(0),
];

/// Record a worker termination so the supervisor can account for it.
pub fn record_termination(termination: Termination) {
    TERMINATIONS[termination as usize].fetch_add(1, Ordering::Relaxed);
}

/// How many workers have terminated with the given code.
pub fn termination_count(termination: Termination) -> u64 {
    TERMINATIONS[termination as usize].load(Ordering::Relaxed)
}
