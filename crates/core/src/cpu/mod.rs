// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod monitor;

pub use monitor::StackMonitor;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        const ZERO = 1 << 0;
        const CARRY = 1 << 1;
        const NEGATIVE = 1 << 2;
        const OVERFLOW = 1 << 3;
        const INTERRUPTS = 1 << 4;
        /// Executing the storage boot script; suppresses prompts.
        const QUIET = 1 << 5;
        /// The current input line overflowed the line buffer.
        const LINE_OVERRUN = 1 << 6;
    }
}

impl Flags {
    /// Set ZERO/NEGATIVE from `result`, CARRY/OVERFLOW from the operation.
    pub fn set_arith(&mut self, result: i64, carry: bool, overflow: bool) {
        self.set(Flags::ZERO, result == 0);
        self.set(Flags::NEGATIVE, result < 0);
        self.set(Flags::CARRY, carry);
        self.set(Flags::OVERFLOW, overflow);
    }
}

pub const NUM_REGS: usize = 16;

/// Complete architectural state of a guest CPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuState {
    pub regs: [u64; NUM_REGS],
    pub pc: u64,
    pub flags: Flags,
    pub priv_level: u8,
    pub halted: bool,
    pub idle: bool,
    pub cycle_count: u64,
}
