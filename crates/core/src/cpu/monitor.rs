// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Stack monitor: a line-oriented stack-language guest.
//!
//! Every piece of interpreter state lives in [`CpuState`] or guest RAM, so a
//! snapshot of registers plus memory is a complete checkpoint. One call to
//! [`Cpu::step`] is one cycle: one input byte consumed, one token executed, or
//! one frame poll.

use super::{CpuState, Flags};
use crate::bus::{Bus, SystemBus, EXT_MEM_BASE};
use crate::{Cpu, SimResult, SimulationError};

pub const REG_MODE: usize = 0;
pub const REG_DEPTH: usize = 1;
pub const REG_LINE_LEN: usize = 2;
pub const REG_VAR_COUNT: usize = 3;
pub const REG_BOOT_CURSOR: usize = 4;
pub const REG_WAIT_LEFT: usize = 5;
pub const REG_WAIT_KIND: usize = 6;
pub const REG_WAIT_TARGET: usize = 7;

pub const MODE_READ: u64 = 0;
pub const MODE_BOOT: u64 = 1;
pub const MODE_EXEC: u64 = 2;
pub const MODE_NET_WAIT: u64 = 3;

pub const LINE_BASE: u64 = 0x000;
pub const LINE_MAX: u64 = 0x100;
pub const STACK_BASE: u64 = 0x100;
pub const STACK_CELLS: u64 = 128;
pub const VAR_BASE: u64 = 0x800;
pub const VAR_ENTRY: u64 = 32;
pub const VAR_NAME_LEN: usize = 24;
pub const MAX_VARS: u64 = 64;

const WAIT_ANY: u64 = 0;
const WAIT_ARP_REPLY: u64 = 1;

pub const GUEST_MAC: [u8; 6] = [0x02, 0x00, 0x00, 0x64, 0x00, 0x02];
pub const GUEST_IP: [u8; 4] = [10, 64, 0, 2];

enum WordError {
    /// Print `<msg> ?`, drop the stack and the rest of the line.
    Abort(String),
    Fault(SimulationError),
}

impl From<SimulationError> for WordError {
    fn from(e: SimulationError) -> Self {
        WordError::Fault(e)
    }
}

type WordResult<T> = Result<T, WordError>;

fn abort<T>(msg: impl Into<String>) -> WordResult<T> {
    Err(WordError::Abort(msg.into()))
}

#[derive(Debug, Default)]
pub struct StackMonitor {
    state: CpuState,
}

impl StackMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn reg(&self, r: usize) -> u64 {
        self.state.regs[r]
    }

    fn set_reg(&mut self, r: usize, v: u64) {
        self.state.regs[r] = v;
    }

    fn print(&self, bus: &mut SystemBus, text: &str) {
        bus.uart.transmit_all(text.as_bytes());
    }

    fn line_byte(&self, bus: &SystemBus, i: u64) -> SimResult<u8> {
        bus.ram
            .read_u8(LINE_BASE + i)
            .ok_or(SimulationError::MemoryViolation(LINE_BASE + i))
    }

    fn accept_byte(&mut self, bus: &mut SystemBus, byte: u8) -> SimResult<()> {
        match byte {
            b'\n' => {
                self.set_reg(REG_MODE, MODE_EXEC);
                self.state.pc = 0;
            }
            b'\r' => {}
            _ => {
                let len = self.reg(REG_LINE_LEN);
                if len < LINE_MAX {
                    bus.write_u8(LINE_BASE + len, byte)?;
                    self.set_reg(REG_LINE_LEN, len + 1);
                } else {
                    self.state.flags.insert(Flags::LINE_OVERRUN);
                }
            }
        }
        Ok(())
    }

    fn resume_input(&mut self) {
        self.set_reg(REG_LINE_LEN, 0);
        self.state.pc = 0;
        self.state.flags.remove(Flags::LINE_OVERRUN);
        let mode = if self.state.flags.contains(Flags::QUIET) {
            MODE_BOOT
        } else {
            MODE_READ
        };
        self.set_reg(REG_MODE, mode);
    }

    fn end_line(&mut self, bus: &mut SystemBus) {
        if !self.state.flags.contains(Flags::QUIET) {
            self.print(bus, " ok\n");
        }
        self.resume_input();
    }

    fn abort_line(&mut self, bus: &mut SystemBus, msg: &str) {
        self.print(bus, &format!("{} ?\n", msg));
        self.set_reg(REG_DEPTH, 0);
        self.resume_input();
    }

    fn finish_boot(&mut self) {
        self.state.flags.remove(Flags::QUIET);
        self.state.priv_level = 1;
        self.set_reg(REG_MODE, MODE_READ);
        tracing::debug!("Stack monitor boot script finished");
    }

    /// Depth register, which a hand-edited snapshot could have corrupted.
    fn depth(&self) -> WordResult<u64> {
        let depth = self.reg(REG_DEPTH);
        if depth > STACK_CELLS {
            return Err(WordError::Fault(SimulationError::StackFault(
                "data stack depth out of range",
            )));
        }
        Ok(depth)
    }

    fn push(&mut self, bus: &mut SystemBus, value: i64) -> WordResult<()> {
        let depth = self.depth()?;
        if depth == STACK_CELLS {
            return abort("stack overflow");
        }
        bus.ram.write_u64(STACK_BASE + depth * 8, value as u64)?;
        self.set_reg(REG_DEPTH, depth + 1);
        Ok(())
    }

    fn pop(&mut self, bus: &SystemBus) -> WordResult<i64> {
        let depth = self.depth()?;
        if depth == 0 {
            return abort("stack underflow");
        }
        let value = bus.ram.read_u64(STACK_BASE + (depth - 1) * 8)?;
        self.set_reg(REG_DEPTH, depth - 1);
        Ok(value as i64)
    }

    fn skip_blanks(&mut self, bus: &SystemBus) -> SimResult<()> {
        let len = self.reg(REG_LINE_LEN);
        while self.state.pc < len && self.line_byte(bus, self.state.pc)?.is_ascii_whitespace() {
            self.state.pc += 1;
        }
        Ok(())
    }

    fn next_token(&mut self, bus: &SystemBus) -> SimResult<Option<Vec<u8>>> {
        self.skip_blanks(bus)?;
        let len = self.reg(REG_LINE_LEN);
        if self.state.pc >= len {
            return Ok(None);
        }
        let mut token = Vec::new();
        while self.state.pc < len {
            let b = self.line_byte(bus, self.state.pc)?;
            if b.is_ascii_whitespace() {
                break;
            }
            token.push(b);
            self.state.pc += 1;
        }
        Ok(Some(token))
    }

    fn var_name_slot(name: &str) -> [u8; VAR_NAME_LEN] {
        let mut slot = [0u8; VAR_NAME_LEN];
        for (dst, src) in slot.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        slot
    }

    fn find_var(&self, bus: &SystemBus, name: &str) -> Option<u64> {
        let wanted = Self::var_name_slot(name);
        (0..self.reg(REG_VAR_COUNT)).find_map(|i| {
            let entry = (VAR_BASE + i * VAR_ENTRY) as usize;
            let stored = bus.ram.data.get(entry..entry + VAR_NAME_LEN)?;
            (stored == wanted.as_slice()).then_some(VAR_BASE + i * VAR_ENTRY + VAR_NAME_LEN as u64)
        })
    }

    fn define_var(&mut self, bus: &mut SystemBus, name: &str) -> WordResult<()> {
        if let Some(addr) = self.find_var(bus, name) {
            bus.write_u64(addr, 0)?;
            return Ok(());
        }
        let count = self.reg(REG_VAR_COUNT);
        if count >= MAX_VARS {
            return abort("dictionary full");
        }
        let entry = VAR_BASE + count * VAR_ENTRY;
        for (i, b) in Self::var_name_slot(name).iter().enumerate() {
            bus.write_u8(entry + i as u64, *b)?;
        }
        bus.write_u64(entry + VAR_NAME_LEN as u64, 0)?;
        self.set_reg(REG_VAR_COUNT, count + 1);
        Ok(())
    }

    fn print_string(&mut self, bus: &mut SystemBus) -> WordResult<()> {
        let len = self.reg(REG_LINE_LEN);
        // One delimiting blank follows `."`.
        let mut pc = (self.state.pc + 1).min(len);
        let mut text = Vec::new();
        while pc < len {
            let b = self.line_byte(bus, pc)?;
            pc += 1;
            if b == b'"' {
                break;
            }
            text.push(b);
        }
        self.state.pc = pc;
        bus.uart.transmit_all(&text);
        Ok(())
    }

    fn binary(
        &mut self,
        bus: &mut SystemBus,
        op: fn(i64, i64) -> (i64, bool, bool),
    ) -> WordResult<()> {
        let b = self.pop(bus)?;
        let a = self.pop(bus)?;
        let (result, carry, overflow) = op(a, b);
        self.state.flags.set_arith(result, carry, overflow);
        self.push(bus, result)
    }

    fn start_wait(&mut self, kind: u64, target: u64, tries: i64) {
        self.set_reg(REG_WAIT_KIND, kind);
        self.set_reg(REG_WAIT_TARGET, target);
        self.set_reg(REG_WAIT_LEFT, tries.max(1) as u64);
        self.set_reg(REG_MODE, MODE_NET_WAIT);
    }

    fn arp_probe(&mut self, bus: &mut SystemBus) -> WordResult<()> {
        let tries = self.pop(bus)?;
        let mut ip = [0u8; 4];
        for slot in ip.iter_mut().rev() {
            let octet = self.pop(bus)?;
            *slot = u8::try_from(octet).or_else(|_| abort("bad address"))?;
        }
        let Some(nic) = bus.nic.as_mut() else {
            return abort("no network");
        };
        nic.transmit(arp_request(ip));
        self.start_wait(WAIT_ARP_REPLY, u32::from_be_bytes(ip) as u64, tries);
        Ok(())
    }

    fn execute(&mut self, bus: &mut SystemBus, token: &[u8]) -> WordResult<()> {
        let text = String::from_utf8_lossy(token).into_owned();
        let word = text.to_ascii_uppercase();

        match word.as_str() {
            "+" => self.binary(bus, |a, b| {
                let (r, o) = a.overflowing_add(b);
                (r, (a as u64).overflowing_add(b as u64).1, o)
            }),
            "-" => self.binary(bus, |a, b| {
                let (r, o) = a.overflowing_sub(b);
                (r, (a as u64) < (b as u64), o)
            }),
            "*" => self.binary(bus, |a, b| {
                let (r, o) = a.overflowing_mul(b);
                (r, o, o)
            }),
            "/" | "MOD" => {
                let b = self.pop(bus)?;
                let a = self.pop(bus)?;
                if b == 0 {
                    return abort("division by zero");
                }
                let r = if word == "/" {
                    a.wrapping_div(b)
                } else {
                    a.wrapping_rem(b)
                };
                self.state.flags.set_arith(r, false, false);
                self.push(bus, r)
            }
            "NEGATE" => {
                let a = self.pop(bus)?;
                self.push(bus, a.wrapping_neg())
            }
            "DUP" => {
                let a = self.pop(bus)?;
                self.push(bus, a)?;
                self.push(bus, a)
            }
            "DROP" => self.pop(bus).map(|_| ()),
            "SWAP" => {
                let b = self.pop(bus)?;
                let a = self.pop(bus)?;
                self.push(bus, b)?;
                self.push(bus, a)
            }
            "OVER" => {
                let b = self.pop(bus)?;
                let a = self.pop(bus)?;
                self.push(bus, a)?;
                self.push(bus, b)?;
                self.push(bus, a)
            }
            "DEPTH" => {
                let depth = self.reg(REG_DEPTH) as i64;
                self.push(bus, depth)
            }
            "." => {
                let a = self.pop(bus)?;
                self.print(bus, &format!("{} ", a));
                Ok(())
            }
            "CR" => {
                self.print(bus, "\n");
                Ok(())
            }
            "SPACE" => {
                self.print(bus, " ");
                Ok(())
            }
            "EMIT" => {
                let c = self.pop(bus)?;
                bus.uart.transmit(c as u8);
                Ok(())
            }
            ".\"" => self.print_string(bus),
            "VARIABLE" => match self.next_token(bus)? {
                Some(name) => {
                    let name = String::from_utf8_lossy(&name).to_ascii_uppercase();
                    self.define_var(bus, &name)
                }
                None => abort("VARIABLE needs a name"),
            },
            "!" => {
                let addr = self.pop(bus)?;
                let value = self.pop(bus)?;
                bus.write_u64(addr as u64, value as u64)?;
                Ok(())
            }
            "@" => {
                let addr = self.pop(bus)?;
                let value = bus.read_u64(addr as u64)?;
                self.push(bus, value as i64)
            }
            "+!" => {
                let addr = self.pop(bus)? as u64;
                let n = self.pop(bus)?;
                let value = bus.read_u64(addr)? as i64;
                bus.write_u64(addr, value.wrapping_add(n) as u64)?;
                Ok(())
            }
            "X!" => {
                let offset = self.pop(bus)? as u64;
                let value = self.pop(bus)?;
                bus.ext_mem
                    .write_u64(EXT_MEM_BASE.wrapping_add(offset), value as u64)?;
                Ok(())
            }
            "X@" => {
                let offset = self.pop(bus)? as u64;
                let value = bus.ext_mem.read_u64(EXT_MEM_BASE.wrapping_add(offset))?;
                self.push(bus, value as i64)
            }
            "BLK@" => {
                let offset = self.pop(bus)?;
                let byte = u64::try_from(offset)
                    .ok()
                    .and_then(|o| bus.storage.read_u8(o))
                    .map_or(-1, i64::from);
                self.push(bus, byte)
            }
            "BLK-SIZE" => {
                let size = if bus.storage.is_present() {
                    bus.storage.image().len() as i64
                } else {
                    0
                };
                self.push(bus, size)
            }
            "WAIT-FRAME" => {
                let tries = self.pop(bus)?;
                if bus.nic.is_none() {
                    return abort("no network");
                }
                self.start_wait(WAIT_ANY, 0, tries);
                Ok(())
            }
            "ARP-PROBE" => self.arp_probe(bus),
            "BYE" => {
                self.state.halted = true;
                Ok(())
            }
            _ => {
                if let Ok(n) = word.parse::<i64>() {
                    return self.push(bus, n);
                }
                match self.find_var(bus, &word) {
                    Some(addr) => self.push(bus, addr as i64),
                    None => abort(text),
                }
            }
        }
    }

    fn exec_step(&mut self, bus: &mut SystemBus) -> SimResult<()> {
        if self.state.pc == 0 && self.state.flags.contains(Flags::LINE_OVERRUN) {
            self.abort_line(bus, "line too long");
            return Ok(());
        }

        let Some(token) = self.next_token(bus)? else {
            self.end_line(bus);
            return Ok(());
        };

        match self.execute(bus, &token) {
            Ok(()) => Ok(()),
            Err(WordError::Abort(msg)) => {
                self.abort_line(bus, &msg);
                Ok(())
            }
            Err(WordError::Fault(e)) => Err(e),
        }
    }

    fn wait_step(&mut self, bus: &mut SystemBus) {
        let Some(nic) = bus.nic.as_mut() else {
            self.set_reg(REG_MODE, MODE_EXEC);
            return;
        };

        match nic.poll_receive() {
            Some(frame) => {
                let wanted = match self.reg(REG_WAIT_KIND) {
                    WAIT_ARP_REPLY => is_arp_reply_from(&frame, self.reg(REG_WAIT_TARGET) as u32),
                    _ => true,
                };
                if wanted {
                    self.print(bus, "1 received\n");
                    self.set_reg(REG_MODE, MODE_EXEC);
                }
            }
            None => {
                let left = self.reg(REG_WAIT_LEFT).saturating_sub(1);
                self.set_reg(REG_WAIT_LEFT, left);
                if left == 0 {
                    self.print(bus, "0 received\n");
                    self.set_reg(REG_MODE, MODE_EXEC);
                } else {
                    // Sleep until something wakes us; the poll is retried then.
                    self.state.idle = true;
                }
            }
        }
    }
}

impl Cpu for StackMonitor {
    fn reset(&mut self, bus: &mut SystemBus) {
        self.state = CpuState::default();
        self.state.flags.insert(Flags::INTERRUPTS);
        if bus.storage.is_present() && !bus.storage.image().is_empty() {
            self.state.flags.insert(Flags::QUIET);
            self.set_reg(REG_MODE, MODE_BOOT);
        } else {
            self.state.priv_level = 1;
            self.set_reg(REG_MODE, MODE_READ);
        }
    }

    fn step(&mut self, bus: &mut SystemBus) -> SimResult<()> {
        match self.reg(REG_MODE) {
            MODE_BOOT => {
                let cursor = self.reg(REG_BOOT_CURSOR);
                match bus.storage.read_u8(cursor) {
                    Some(byte) => {
                        self.set_reg(REG_BOOT_CURSOR, cursor + 1);
                        self.accept_byte(bus, byte)?;
                    }
                    // Unterminated last line still runs.
                    None if self.reg(REG_LINE_LEN) > 0 => self.accept_byte(bus, b'\n')?,
                    None => self.finish_boot(),
                }
            }
            MODE_READ => match bus.uart.read_byte() {
                Some(byte) => self.accept_byte(bus, byte)?,
                None => self.state.idle = true,
            },
            MODE_EXEC => self.exec_step(bus)?,
            MODE_NET_WAIT => self.wait_step(bus),
            _ => self.set_reg(REG_MODE, MODE_READ),
        }
        Ok(())
    }

    fn state(&self) -> &CpuState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut CpuState {
        &mut self.state
    }
}

/// Broadcast ARP who-has for `target`, padded to the Ethernet minimum.
pub fn arp_request(target: [u8; 4]) -> Vec<u8> {
    let mut f = Vec::with_capacity(60);
    f.extend_from_slice(&[0xFF; 6]);
    f.extend_from_slice(&GUEST_MAC);
    f.extend_from_slice(&0x0806u16.to_be_bytes());
    f.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x01]);
    f.extend_from_slice(&GUEST_MAC);
    f.extend_from_slice(&GUEST_IP);
    f.extend_from_slice(&[0; 6]);
    f.extend_from_slice(&target);
    f.resize(60, 0);
    f
}

/// ARP reply whose sender protocol address is `target`.
pub fn is_arp_reply_from(frame: &[u8], target: u32) -> bool {
    frame.len() >= 42
        && frame[12..14] == [0x08, 0x06]
        && frame[20..22] == [0x00, 0x02]
        && frame[28..32] == target.to_be_bytes()
}

/// Build the reply a host would send to one of our [`arp_request`]s.
pub fn arp_reply_to(request: &[u8], host_mac: [u8; 6]) -> Option<Vec<u8>> {
    if request.len() < 42 || request[12..14] != [0x08, 0x06] || request[20..22] != [0x00, 0x01] {
        return None;
    }
    let mut f = Vec::with_capacity(60);
    f.extend_from_slice(&request[6..12]);
    f.extend_from_slice(&host_mac);
    f.extend_from_slice(&0x0806u16.to_be_bytes());
    f.extend_from_slice(&[0x00, 0x01, 0x08, 0x00, 6, 4, 0x00, 0x02]);
    f.extend_from_slice(&host_mac);
    f.extend_from_slice(&request[38..42]);
    f.extend_from_slice(&request[22..28]);
    f.extend_from_slice(&request[28..32]);
    f.resize(60, 0);
    Some(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Guest, Machine, MachineBlueprint};

    fn monitor(boot: Option<&[u8]>) -> Machine<StackMonitor> {
        let mut bp = MachineBlueprint::new(0x4000, 0x1000);
        if let Some(script) = boot {
            bp = bp.with_storage(script.to_vec());
        }
        let mut m = Machine::<StackMonitor>::from_blueprint(&bp, None).unwrap();
        m.reset();
        m.run_batch(1_000_000).unwrap();
        m
    }

    fn type_line(m: &mut Machine<StackMonitor>, line: &str) -> String {
        m.clear_output();
        m.inject_input(line.as_bytes());
        m.run_batch(1_000_000).unwrap();
        String::from_utf8_lossy(m.output()).into_owned()
    }

    #[test]
    fn test_boot_script_is_quiet_and_persists_variables() {
        let mut m = monitor(Some(b"VARIABLE X\n5 X !"));
        assert!(m.is_idle());
        assert!(m.output().is_empty());
        assert_eq!(m.cpu.state().priv_level, 1);

        assert_eq!(type_line(&mut m, "X @ .\n"), "5  ok\n");
        assert_eq!(type_line(&mut m, "3 X +! X @ . CR\n"), "8 \n ok\n");
    }

    #[test]
    fn test_arithmetic_and_stack_words() {
        let mut m = monitor(None);
        assert_eq!(type_line(&mut m, "1 2 + 4 * .\n"), "12  ok\n");
        assert_eq!(type_line(&mut m, "7 2 MOD . 7 2 / .\n"), "1 3  ok\n");
        assert_eq!(type_line(&mut m, "1 2 SWAP . . 5 NEGATE .\n"), "1 2 -5  ok\n");
        assert_eq!(type_line(&mut m, "1 2 OVER DEPTH . DROP DROP DROP\n"), "3  ok\n");
        assert_eq!(type_line(&mut m, ".\" hello there\" 33 EMIT\n"), "hello there! ok\n");
    }

    #[test]
    fn test_errors_abandon_the_line() {
        let mut m = monitor(None);
        assert_eq!(type_line(&mut m, "1 FOO 2 .\n"), "FOO ?\n");
        assert_eq!(m.cpu.state().regs[REG_DEPTH], 0);
        assert_eq!(type_line(&mut m, "+\n"), "stack underflow ?\n");
        assert_eq!(type_line(&mut m, "1 0 /\n"), "division by zero ?\n");
        assert_eq!(type_line(&mut m, "10 64 0 1 3 ARP-PROBE\n"), "no network ?\n");
        // Still responsive afterwards.
        assert_eq!(type_line(&mut m, "2 .\n"), "2  ok\n");
    }

    #[test]
    fn test_long_line_is_rejected() {
        let mut m = monitor(None);
        let long = format!("{}\n", "1 ".repeat(200));
        assert_eq!(type_line(&mut m, &long), "line too long ?\n");
        assert_eq!(type_line(&mut m, "DEPTH .\n"), "0  ok\n");
    }

    #[test]
    fn test_out_of_range_store_faults() {
        let mut m = monitor(None);
        m.inject_input(b"1 999999999 !\n");
        assert_eq!(
            m.run_batch(1_000_000),
            Err(SimulationError::MemoryViolation(999_999_999))
        );
    }

    #[test]
    fn test_extended_memory_and_storage_words() {
        let mut m = monitor(Some(b"\n"));
        assert_eq!(type_line(&mut m, "42 8 X! 8 X@ .\n"), "42  ok\n");
        assert_eq!(type_line(&mut m, "BLK-SIZE . 0 BLK@ . 99 BLK@ .\n"), "1 10 -1  ok\n");
    }

    #[test]
    fn test_corrupt_depth_register_faults() {
        let mut m = monitor(None);
        m.cpu.state_mut().regs[REG_DEPTH] = STACK_CELLS + 1;
        m.inject_input(b"DUP\n");
        assert!(matches!(
            m.run_batch(1_000_000),
            Err(SimulationError::StackFault(_))
        ));
    }

    #[test]
    fn test_bye_halts() {
        let mut m = monitor(None);
        m.inject_input(b"1 . BYE\n");
        m.run_batch(1_000_000).unwrap();
        assert!(m.is_halted());
        assert_eq!(m.output(), b"1 ");
    }

    #[test]
    fn test_arp_request_and_reply_shapes() {
        let req = arp_request([10, 64, 0, 1]);
        assert_eq!(req.len(), 60);
        assert_eq!(&req[0..6], &[0xFF; 6]);
        assert_eq!(&req[28..32], &GUEST_IP);

        let reply = arp_reply_to(&req, [0x02, 0, 0, 0, 0, 0xAA]).unwrap();
        assert!(is_arp_reply_from(&reply, u32::from_be_bytes([10, 64, 0, 1])));
        assert!(!is_arp_reply_from(&reply, u32::from_be_bytes([10, 64, 0, 9])));
        assert_eq!(&reply[0..6], &GUEST_MAC);
        assert!(arp_reply_to(&reply, [0; 6]).is_none());
    }
}
