// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Batch-mode pump.
//!
//! The host feeds console input one line at a time, and only when the guest is
//! idle with an empty receive queue. The decision of what to do next is a pure
//! function of the observed [`GuestSignals`] ([`PumpState::next`]), so the
//! protocol can be tested without a guest at all.

use std::collections::VecDeque;

use bootcache_config::{BootConfig, TestLimits};
use serde::Serialize;

use crate::{Guest, SimResult, StopReason};

/// Host input waiting to be fed, split into newline-terminated chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingInput {
    chunks: VecDeque<Vec<u8>>,
    fed: usize,
}

impl PendingInput {
    /// Split raw text after every `\n`. A trailing partial line is its own chunk.
    pub fn from_payload(payload: &[u8]) -> Self {
        let chunks = payload
            .split_inclusive(|&b| b == b'\n')
            .map(<[u8]>::to_vec)
            .collect();
        Self { chunks, fed: 0 }
    }

    /// One chunk per line, then `terminator` as a final line if given.
    pub fn from_lines<S: AsRef<str>>(lines: &[S], terminator: Option<&str>) -> Self {
        let mut payload = Vec::new();
        for line in lines.iter().map(|l| l.as_ref()).chain(terminator) {
            payload.extend_from_slice(line.as_bytes());
            if !line.ends_with('\n') {
                payload.push(b'\n');
            }
        }
        Self::from_payload(&payload)
    }

    pub fn next_chunk(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.pop_front()?;
        self.fed += 1;
        Some(chunk)
    }

    pub fn is_exhausted(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks_fed(&self) -> usize {
        self.fed
    }
}

/// The coarse guest signals a pump decision depends on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuestSignals {
    pub halted: bool,
    pub idle: bool,
    pub input_pending: bool,
}

impl GuestSignals {
    pub fn observe<G: Guest + ?Sized>(guest: &G) -> Self {
        Self {
            halted: guest.is_halted(),
            idle: guest.is_idle(),
            input_pending: guest.has_pending_input(),
        }
    }

    /// Idle with nothing left to read: the guest is waiting on the host.
    pub fn wants_input(&self) -> bool {
        self.idle && !self.input_pending
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpState {
    Running,
    AwaitingInput,
    Halted,
    Exhausted(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpAction {
    /// Feed the next input chunk.
    Inject,
    /// Run one bounded batch.
    Run,
    Stop(StopReason),
}

impl PumpState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PumpState::Halted | PumpState::Exhausted(_))
    }

    /// Decide the next action. Terminal states are absorbing and a halted
    /// guest wins over a simultaneous idle.
    pub fn next(
        self,
        signals: GuestSignals,
        input_remaining: bool,
        budget_left: u64,
    ) -> (PumpState, PumpAction) {
        match self {
            PumpState::Halted => return (self, PumpAction::Stop(StopReason::Halted)),
            PumpState::Exhausted(reason) => return (self, PumpAction::Stop(reason)),
            PumpState::Running | PumpState::AwaitingInput => {}
        }

        if signals.halted {
            return (PumpState::Halted, PumpAction::Stop(StopReason::Halted));
        }
        if signals.wants_input() {
            return if input_remaining {
                (PumpState::AwaitingInput, PumpAction::Inject)
            } else {
                let reason = StopReason::InputExhausted;
                (PumpState::Exhausted(reason), PumpAction::Stop(reason))
            };
        }
        if budget_left == 0 {
            let reason = StopReason::BudgetExhausted;
            return (PumpState::Exhausted(reason), PumpAction::Stop(reason));
        }
        (PumpState::Running, PumpAction::Run)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub steps: u64,
    pub reason: StopReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepScheduler {
    pub batch_size: u64,
    pub max_steps: u64,
}

impl StepScheduler {
    pub fn new(batch_size: u64, max_steps: u64) -> Self {
        Self {
            batch_size: batch_size.max(1),
            max_steps,
        }
    }

    pub fn from_limits(limits: &TestLimits) -> Self {
        Self::new(limits.batch_size, limits.max_steps)
    }

    pub fn for_boot(boot: &BootConfig) -> Self {
        Self::new(boot.batch_size, boot.max_steps)
    }

    /// Pump `guest` until it halts, runs out of input, or spends the budget.
    pub fn run<G: Guest + ?Sized>(
        &self,
        guest: &mut G,
        input: &mut PendingInput,
    ) -> SimResult<ExecutionOutcome> {
        let mut state = PumpState::Running;
        let mut steps: u64 = 0;

        loop {
            let signals = GuestSignals::observe(guest);
            let budget_left = self.max_steps.saturating_sub(steps);
            let (next, action) = state.next(signals, !input.is_exhausted(), budget_left);
            state = next;

            match action {
                PumpAction::Inject => {
                    if let Some(chunk) = input.next_chunk() {
                        tracing::debug!(
                            "Feeding chunk {} ({} bytes) at step {}",
                            input.chunks_fed(),
                            chunk.len(),
                            steps
                        );
                        guest.inject_input(&chunk);
                    }
                }
                PumpAction::Run => {
                    let cycles = guest.run_batch(self.batch_size.min(budget_left))?;
                    steps = steps.saturating_add(cycles.max(1));
                }
                PumpAction::Stop(reason) => {
                    tracing::debug!("Scheduler stopped after {} steps: {}", steps, reason);
                    return Ok(ExecutionOutcome { steps, reason });
                }
            }
        }
    }

    /// Run with no input until the guest settles.
    pub fn settle<G: Guest + ?Sized>(&self, guest: &mut G) -> SimResult<ExecutionOutcome> {
        self.run(guest, &mut PendingInput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_never_span_newlines() {
        let mut input = PendingInput::from_payload(b"1 2 +\n.\nBYE");
        assert_eq!(input.remaining(), 3);
        assert_eq!(input.next_chunk().unwrap(), b"1 2 +\n");
        assert_eq!(input.next_chunk().unwrap(), b".\n");
        assert_eq!(input.next_chunk().unwrap(), b"BYE");
        assert!(input.is_exhausted());
        assert_eq!(input.chunks_fed(), 3);
        assert!(PendingInput::from_payload(b"").is_exhausted());
    }

    #[test]
    fn test_lines_get_terminator() {
        let mut input = PendingInput::from_lines(&["2 2 + .", "CR\n"], Some("BYE"));
        let chunks: Vec<_> = std::iter::from_fn(|| input.next_chunk()).collect();
        assert_eq!(chunks, vec![b"2 2 + .\n".to_vec(), b"CR\n".to_vec(), b"BYE\n".to_vec()]);
    }

    #[test]
    fn test_next_is_total_and_terminal_states_absorb() {
        let idle = GuestSignals {
            idle: true,
            ..Default::default()
        };
        let both = GuestSignals {
            halted: true,
            idle: true,
            input_pending: false,
        };
        let busy = GuestSignals::default();

        assert_eq!(
            PumpState::Running.next(both, true, 10),
            (PumpState::Halted, PumpAction::Stop(StopReason::Halted))
        );
        assert_eq!(
            PumpState::Running.next(idle, true, 10),
            (PumpState::AwaitingInput, PumpAction::Inject)
        );
        assert_eq!(
            PumpState::AwaitingInput.next(idle, false, 10).1,
            PumpAction::Stop(StopReason::InputExhausted)
        );
        assert_eq!(
            PumpState::Running.next(busy, true, 0).1,
            PumpAction::Stop(StopReason::BudgetExhausted)
        );
        assert_eq!(PumpState::Running.next(busy, false, 1).1, PumpAction::Run);

        let done = PumpState::Exhausted(StopReason::InputExhausted);
        assert_eq!(done.next(busy, true, 10).0, done);
        assert_eq!(PumpState::Halted.next(idle, true, 10).0, PumpState::Halted);
        assert!(done.is_terminal());
    }
}
