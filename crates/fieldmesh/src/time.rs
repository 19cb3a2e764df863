// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process-wide microsecond clock for group revision stamps.
//!
//! The clock is a single confined global: `init()` seeds it from the wall
//! clock, and the manager's tick timer is the only writer afterwards
//! (`tick()`). Readers never touch the OS clock, so a revision stamp costs
//! one relaxed atomic load.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

static CLOCK_US: OnceLock<AtomicU64> = OnceLock::new();

fn wall_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Seed the clock. Idempotent; safe to call from tests.
pub fn init() {
    let cell = CLOCK_US.get_or_init(|| AtomicU64::new(wall_us()));
    cell.fetch_max(wall_us(), Ordering::Relaxed);
}

/// Advance the clock from the wall clock. Called by the manager's tick
/// timer; never moves backwards.
pub fn tick() {
    init();
}

/// Current clock value in microseconds since the Unix epoch.
pub fn now_us() -> u64 {
    match CLOCK_US.get() {
        Some(cell) => cell.load(Ordering::Relaxed),
        None => {
            init();
            now_us()
        }
    }
}
