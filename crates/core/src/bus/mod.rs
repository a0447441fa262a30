// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::memory::LinearMemory;
use crate::peripherals::nic::Nic;
use crate::peripherals::storage::Storage;
use crate::peripherals::uart::Uart;
use crate::{SimResult, SimulationError};

/// Extended memory is mapped above primary RAM at this address.
pub const EXT_MEM_BASE: u64 = 0x1000_0000;

/// Trait representing the guest's memory bus
pub trait Bus {
    fn read_u8(&self, addr: u64) -> SimResult<u8>;
    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()>;

    fn read_u64(&self, addr: u64) -> SimResult<u64> {
        let mut value = 0u64;
        for i in 0..8 {
            value |= (self.read_u8(addr + i)? as u64) << (8 * i);
        }
        // Little Endian
        Ok(value)
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> SimResult<()> {
        for i in 0..8 {
            self.write_u8(addr + i, ((value >> (8 * i)) & 0xFF) as u8)?;
        }
        Ok(())
    }
}

pub struct SystemBus {
    pub ram: LinearMemory,
    pub ext_mem: LinearMemory,
    pub uart: Uart,
    pub storage: Storage,
    pub nic: Option<Nic>,
}

impl SystemBus {
    pub fn new(ram_size: usize, ext_mem_size: usize) -> Self {
        Self {
            ram: LinearMemory::new(ram_size, 0),
            ext_mem: LinearMemory::new(ext_mem_size, EXT_MEM_BASE),
            uart: Uart::new(),
            storage: Storage::new(),
            nic: None,
        }
    }
}

impl Bus for SystemBus {
    fn read_u8(&self, addr: u64) -> SimResult<u8> {
        if let Some(byte) = self.ram.read_u8(addr) {
            return Ok(byte);
        }
        if let Some(byte) = self.ext_mem.read_u8(addr) {
            return Ok(byte);
        }
        Err(SimulationError::MemoryViolation(addr))
    }

    fn write_u8(&mut self, addr: u64, value: u8) -> SimResult<()> {
        if self.ram.write_u8(addr, value) || self.ext_mem.write_u8(addr, value) {
            return Ok(());
        }
        Err(SimulationError::MemoryViolation(addr))
    }

    fn read_u64(&self, addr: u64) -> SimResult<u64> {
        self.ram
            .read_u64(addr)
            .or_else(|_| self.ext_mem.read_u64(addr))
            .map_err(|_| SimulationError::MemoryViolation(addr))
    }

    fn write_u64(&mut self, addr: u64, value: u64) -> SimResult<()> {
        if self.ram.write_u64(addr, value).is_ok() || self.ext_mem.write_u64(addr, value).is_ok() {
            return Ok(());
        }
        Err(SimulationError::MemoryViolation(addr))
    }
}
