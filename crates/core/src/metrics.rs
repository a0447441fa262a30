// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::MachineObserver;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct PerformanceMetrics {
    batch_count: AtomicU64,
    cycle_count: AtomicU64,
    input_bytes: AtomicU64,
    input_chunks: AtomicU64,
    forced_idle: AtomicU64,
    start_time: Instant,
}

/// Point-in-time copy of [`PerformanceMetrics`], suitable for reports.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub batches: u64,
    pub cycles: u64,
    pub input_bytes: u64,
    pub input_chunks: u64,
    pub forced_idle_ticks: u64,
    pub cycles_per_second: f64,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        Self {
            batch_count: AtomicU64::new(0),
            cycle_count: AtomicU64::new(0),
            input_bytes: AtomicU64::new(0),
            input_chunks: AtomicU64::new(0),
            forced_idle: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn reset(&self) {
        self.batch_count.store(0, Ordering::SeqCst);
        self.cycle_count.store(0, Ordering::SeqCst);
        self.input_bytes.store(0, Ordering::SeqCst);
        self.input_chunks.store(0, Ordering::SeqCst);
        self.forced_idle.store(0, Ordering::SeqCst);
    }

    pub fn get_batches(&self) -> u64 {
        self.batch_count.load(Ordering::SeqCst)
    }

    pub fn get_cycles(&self) -> u64 {
        self.cycle_count.load(Ordering::SeqCst)
    }

    pub fn get_forced_idle(&self) -> u64 {
        self.forced_idle.load(Ordering::SeqCst)
    }

    pub fn get_cps(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.get_cycles() as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            batches: self.get_batches(),
            cycles: self.get_cycles(),
            input_bytes: self.input_bytes.load(Ordering::SeqCst),
            input_chunks: self.input_chunks.load(Ordering::SeqCst),
            forced_idle_ticks: self.get_forced_idle(),
            cycles_per_second: self.get_cps(),
        }
    }
}

impl MachineObserver for PerformanceMetrics {
    fn on_batch_end(&self, cycles: u64) {
        self.batch_count.fetch_add(1, Ordering::SeqCst);
        self.cycle_count.fetch_add(cycles, Ordering::SeqCst);
    }

    fn on_input(&self, bytes: usize) {
        self.input_chunks.fetch_add(1, Ordering::SeqCst);
        self.input_bytes.fetch_add(bytes as u64, Ordering::SeqCst);
    }

    fn on_idle_forced(&self) {
        self.forced_idle.fetch_add(1, Ordering::SeqCst);
    }
}
