// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Wall-clock paced pump for tests that talk to a live network.
//!
//! Frames from the host arrive on their own schedule and do not wake an idle
//! guest, so while the guest sits idle with nothing to read the pump sleeps a
//! little, forces the idle flag off and runs a short batch. That gives the
//! guest's bounded poll loops a chance to look for frames again.

use std::thread;
use std::time::{Duration, Instant};

use bootcache_config::RealtimeTuning;

use crate::decoder::OutputDecoder;
use crate::scheduler::{ExecutionOutcome, GuestSignals, PendingInput};
use crate::{Guest, SimResult, StopReason};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealtimeConfig {
    pub idle_sleep: Duration,
    pub idle_batch: u64,
    pub run_batch: u64,
    pub grace_batches: u32,
    pub grace_batch: u64,
    pub grace_sleep: Duration,
    pub max_steps: u64,
}

impl RealtimeConfig {
    pub fn from_tuning(tuning: &RealtimeTuning) -> Self {
        Self {
            idle_sleep: Duration::from_millis(tuning.idle_sleep_ms),
            idle_batch: tuning.idle_batch.max(1),
            run_batch: tuning.run_batch.max(1),
            grace_batches: tuning.grace_batches,
            grace_batch: tuning.grace_batch.max(1),
            grace_sleep: Duration::from_millis(tuning.grace_sleep_ms),
            max_steps: tuning.max_steps,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self::from_tuning(&RealtimeTuning::default())
    }
}

#[derive(Debug, Clone)]
pub struct RealtimePump {
    config: RealtimeConfig,
    timeout: Duration,
    sentinel: Option<String>,
}

impl RealtimePump {
    pub fn new(config: RealtimeConfig, timeout: Duration) -> Self {
        Self {
            config,
            timeout,
            sentinel: None,
        }
    }

    /// Stop early once `sentinel` shows up in the decoded output. Empty is ignored.
    pub fn with_sentinel(mut self, sentinel: Option<String>) -> Self {
        self.sentinel = sentinel.filter(|s| !s.is_empty());
        self
    }

    pub fn run<G: Guest + ?Sized>(
        &self,
        guest: &mut G,
        input: &mut PendingInput,
    ) -> SimResult<ExecutionOutcome> {
        let start = Instant::now();
        let mut decoder = OutputDecoder::new();
        let mut steps: u64 = 0;
        let mut forced_ticks: u64 = 0;

        let reason = loop {
            if start.elapsed() > self.timeout {
                break StopReason::WallClockTimeout;
            }
            if guest.is_halted() {
                break StopReason::Halted;
            }
            if let Some(sentinel) = &self.sentinel {
                if self.sentinel_seen(&mut decoder, guest.output(), sentinel) {
                    tracing::debug!("Sentinel {:?} seen after {} steps", sentinel, steps);
                    steps = steps.saturating_add(self.grace(guest)?);
                    break StopReason::SentinelMatched;
                }
            }

            let remaining = self.config.max_steps.saturating_sub(steps);
            let cycles = if GuestSignals::observe(guest).wants_input() {
                if let Some(chunk) = input.next_chunk() {
                    guest.inject_input(&chunk);
                    continue;
                }
                thread::sleep(self.config.idle_sleep);
                guest.clear_idle();
                forced_ticks += 1;
                guest.run_batch(self.config.idle_batch.min(remaining))?
            } else {
                guest.run_batch(self.config.run_batch.min(remaining))?
            };

            steps = steps.saturating_add(cycles);
            if steps >= self.config.max_steps {
                break StopReason::BudgetExhausted;
            }
        };

        tracing::debug!(
            "Realtime pump stopped after {} steps, {} forced idle ticks, {:?}: {}",
            steps,
            forced_ticks,
            start.elapsed(),
            reason
        );
        Ok(ExecutionOutcome { steps, reason })
    }

    /// Scan only the newly decoded tail, overlapping enough to catch a
    /// sentinel split across two batches.
    fn sentinel_seen(&self, decoder: &mut OutputDecoder, raw: &[u8], sentinel: &str) -> bool {
        let new_start = decoder.update(raw);
        let from = new_start.saturating_sub(sentinel.len() - 1);
        decoder.text()[from..].contains(sentinel)
    }

    /// Let the guest finish what it is printing after the sentinel.
    fn grace<G: Guest + ?Sized>(&self, guest: &mut G) -> SimResult<u64> {
        let mut steps = 0u64;
        for _ in 0..self.config.grace_batches {
            if guest.is_halted() {
                break;
            }
            steps = steps.saturating_add(guest.run_batch(self.config.grace_batch)?);
            thread::sleep(self.config.grace_sleep);
        }
        Ok(steps)
    }
}
