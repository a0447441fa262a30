// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Machine checkpoints.
//!
//! A [`MachineSnapshot`] is an immutable deep copy of everything a guest can
//! observe: the CPU register file and flags, both memory regions and the
//! storage image. Restoring always builds a brand new [`Machine`], so restored
//! runs never share buffers with each other or with the snapshot.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cpu::{CpuState, Flags, NUM_REGS};
use crate::memory::LinearMemory;
use crate::{Cpu, HarnessError, HarnessResult, Machine, MachineBlueprint, NicBackend};

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CpuSnapshot {
    registers: [u64; NUM_REGS],
    pc: u64,
    flags: u32,
    priv_level: u8,
    halted: bool,
    idle: bool,
    cycle_count: u64,
}

impl From<&CpuState> for CpuSnapshot {
    fn from(state: &CpuState) -> Self {
        Self {
            registers: state.regs,
            pc: state.pc,
            flags: state.flags.bits(),
            priv_level: state.priv_level,
            halted: state.halted,
            idle: state.idle,
            cycle_count: state.cycle_count,
        }
    }
}

impl CpuSnapshot {
    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn flags(&self) -> Flags {
        Flags::from_bits_retain(self.flags)
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    pub fn cycle_count(&self) -> u64 {
        self.cycle_count
    }

    pub fn to_state(&self) -> CpuState {
        CpuState {
            regs: self.registers,
            pc: self.pc,
            flags: self.flags(),
            priv_level: self.priv_level,
            halted: self.halted,
            idle: self.idle,
            cycle_count: self.cycle_count,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct MachineSnapshot {
    cpu: CpuSnapshot,
    #[serde(with = "base64_bytes")]
    ram: Vec<u8>,
    #[serde(with = "base64_bytes")]
    ext_mem: Vec<u8>,
    storage_present: bool,
    #[serde(with = "base64_bytes")]
    storage: Vec<u8>,
}

impl MachineSnapshot {
    /// Copy the complete state of `machine`.
    ///
    /// The caller must only capture a quiescent machine: idle, with no unread
    /// console input and no frames in flight. That last condition is invisible
    /// from here, so only the first two are checked, and a violation is logged
    /// rather than refused. Replaying a snapshot taken mid-activity is undefined.
    pub fn capture<C: Cpu>(machine: &Machine<C>) -> Self {
        if !machine.is_quiescent() {
            tracing::warn!(
                "Capturing a machine that is not quiescent (idle={}, rx pending={})",
                machine.cpu.state().idle,
                machine.bus.uart.has_rx_data()
            );
        }

        let snapshot = Self {
            cpu: CpuSnapshot::from(machine.cpu.state()),
            ram: machine.bus.ram.data.clone(),
            ext_mem: machine.bus.ext_mem.data.clone(),
            storage_present: machine.bus.storage.is_present(),
            storage: machine.bus.storage.image().to_vec(),
        };
        tracing::debug!(
            "Captured snapshot at cycle {} ({} bytes RAM, {} bytes ext)",
            snapshot.cpu.cycle_count,
            snapshot.ram.len(),
            snapshot.ext_mem.len()
        );
        snapshot
    }

    /// Build a fresh machine from `blueprint` and load this snapshot into it.
    ///
    /// Regions larger than the recorded images are fine; the image fills the
    /// prefix and the rest stays zeroed.
    pub fn restore<C: Cpu + Default>(
        &self,
        blueprint: &MachineBlueprint,
        backend: Option<NicBackend>,
    ) -> HarnessResult<Machine<C>> {
        let mut machine = Machine::<C>::from_blueprint(blueprint, backend)?;

        load_region("ram", &mut machine.bus.ram, &self.ram)?;
        load_region("ext_mem", &mut machine.bus.ext_mem, &self.ext_mem)?;

        if self.storage_present {
            machine.bus.storage.attach(self.storage.clone());
        } else {
            machine.bus.storage.detach();
        }

        *machine.cpu.state_mut() = self.cpu.to_state();
        Ok(machine)
    }

    pub fn cpu(&self) -> &CpuSnapshot {
        &self.cpu
    }

    pub fn ram(&self) -> &[u8] {
        &self.ram
    }

    pub fn ext_mem(&self) -> &[u8] {
        &self.ext_mem
    }

    pub fn storage(&self) -> Option<&[u8]> {
        self.storage_present.then_some(self.storage.as_slice())
    }

    /// Hex SHA-256 over every field. Equal digests mean equal snapshots.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for reg in &self.cpu.registers {
            hasher.update(reg.to_le_bytes());
        }
        hasher.update(self.cpu.pc.to_le_bytes());
        hasher.update(self.cpu.flags.to_le_bytes());
        hasher.update([
            self.cpu.priv_level,
            self.cpu.halted as u8,
            self.cpu.idle as u8,
            self.storage_present as u8,
        ]);
        hasher.update(self.cpu.cycle_count.to_le_bytes());
        for region in [&self.ram, &self.ext_mem, &self.storage] {
            hasher.update((region.len() as u64).to_le_bytes());
            hasher.update(region);
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn save(&self, path: impl AsRef<Path>) -> HarnessResult<()> {
        let file = File::create(path.as_ref())?;
        serde_json::to_writer(BufWriter::new(file), self)?;
        tracing::info!("Snapshot saved to {}", path.as_ref().display());
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> HarnessResult<Self> {
        let file = File::open(path.as_ref())?;
        let snapshot: Self = serde_json::from_reader(BufReader::new(file))?;
        tracing::info!(
            "Snapshot loaded from {} (digest {})",
            path.as_ref().display(),
            snapshot.digest()
        );
        Ok(snapshot)
    }
}

fn load_region(region: &'static str, memory: &mut LinearMemory, image: &[u8]) -> HarnessResult<()> {
    if !memory.load_image(image) {
        return Err(HarnessError::RegionTooSmall {
            region,
            required: image.len(),
            available: memory.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::StackMonitor;
    use crate::Guest;

    fn booted(blueprint: &MachineBlueprint) -> Machine<StackMonitor> {
        let mut m = Machine::<StackMonitor>::from_blueprint(blueprint, None).unwrap();
        m.reset();
        m.run_batch(1_000_000).unwrap();
        assert!(m.is_quiescent());
        m
    }

    fn blueprint() -> MachineBlueprint {
        MachineBlueprint::new(0x2000, 0x100).with_storage(b"VARIABLE N\n7 N !\n".to_vec())
    }

    #[test]
    fn test_restore_reproduces_state() {
        let bp = blueprint();
        let m = booted(&bp);
        let snap = MachineSnapshot::capture(&m);

        let r = snap.restore::<StackMonitor>(&bp, None).unwrap();
        assert_eq!(r.cpu.state(), m.cpu.state());
        assert_eq!(snap.cpu().pc(), m.cpu.state().pc);
        assert_eq!(snap.cpu().cycle_count(), m.cpu.state().cycle_count);
        assert_eq!(r.bus.ram.data, m.bus.ram.data);
        assert!(r.output().is_empty());
        assert!(!r.has_pending_input());
        assert_eq!(snap.storage(), Some(&b"VARIABLE N\n7 N !\n"[..]));
    }

    #[test]
    fn test_restore_into_smaller_region_fails() {
        let bp = blueprint();
        let snap = MachineSnapshot::capture(&booted(&bp));

        let small = MachineBlueprint::new(0x1000, 0x100);
        let err = snap.restore::<StackMonitor>(&small, None).err().unwrap();
        assert!(matches!(
            err,
            HarnessError::RegionTooSmall {
                region: "ram",
                required: 0x2000,
                available: 0x1000
            }
        ));

        let no_ext = MachineBlueprint::new(0x2000, 0x80);
        let err = snap.restore::<StackMonitor>(&no_ext, None).err().unwrap();
        assert!(matches!(
            err,
            HarnessError::RegionTooSmall {
                region: "ext_mem",
                required: 0x100,
                available: 0x80
            }
        ));

        let big = MachineBlueprint::new(0x4000, 0x200);
        let r = snap.restore::<StackMonitor>(&big, None).unwrap();
        assert_eq!(&r.bus.ram.data[..0x2000], snap.ram());
        assert!(r.bus.ram.data[0x2000..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_digest_is_stable_and_sensitive() {
        let bp = blueprint();
        let a = MachineSnapshot::capture(&booted(&bp));
        let b = MachineSnapshot::capture(&booted(&bp));
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.digest().len(), 64);

        let mut m = booted(&bp);
        m.inject_input(b"1 N +!\n");
        m.run_batch(1_000_000).unwrap();
        m.clear_output();
        assert_ne!(MachineSnapshot::capture(&m).digest(), a.digest());
    }

    #[test]
    fn test_save_and_load_preserve_digest() {
        let snap = MachineSnapshot::capture(&booted(&blueprint()));
        let path = std::env::temp_dir().join(format!("bootcache-snap-{}.json", std::process::id()));
        snap.save(&path).unwrap();
        let loaded = MachineSnapshot::load(&path).unwrap();
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded, snap);
        assert_eq!(loaded.digest(), snap.digest());
    }
}
