// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

use crate::{SimResult, SimulationError};

/// A simple flat memory storage
#[derive(Debug, Clone)]
pub struct LinearMemory {
    pub data: Vec<u8>,
    pub base_addr: u64,
}

impl LinearMemory {
    pub fn new(size: usize, base_addr: u64) -> Self {
        Self {
            data: vec![0; size],
            base_addr,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn offset(&self, addr: u64, width: usize) -> Option<usize> {
        let offset = addr.checked_sub(self.base_addr)? as usize;
        if offset.checked_add(width)? <= self.data.len() {
            Some(offset)
        } else {
            None
        }
    }

    pub fn read_u8(&self, addr: u64) -> Option<u8> {
        self.offset(addr, 1).map(|o| self.data[o])
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) -> bool {
        match self.offset(addr, 1) {
            Some(o) => {
                self.data[o] = value;
                true
            }
            None => false,
        }
    }

    /// Little-endian 64-bit cell read.
    pub fn read_u64(&self, addr: u64) -> SimResult<u64> {
        let o = self
            .offset(addr, 8)
            .ok_or(SimulationError::MemoryViolation(addr))?;
        let mut cell = [0u8; 8];
        cell.copy_from_slice(&self.data[o..o + 8]);
        Ok(u64::from_le_bytes(cell))
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) -> SimResult<()> {
        let o = self
            .offset(addr, 8)
            .ok_or(SimulationError::MemoryViolation(addr))?;
        self.data[o..o + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Overwrite the start of this region with `image`. Caller checks the size.
    pub fn load_image(&mut self, image: &[u8]) -> bool {
        if image.len() > self.data.len() {
            return false;
        }
        self.data[..image.len()].copy_from_slice(image);
        true
    }
}
