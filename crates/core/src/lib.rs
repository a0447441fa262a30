// Bootcache - Checkpointed Guest Test Harness
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

pub mod bus;
pub mod cpu;
pub mod decoder;
pub mod memory;
pub mod metrics;
pub mod net;
pub mod peripherals;
pub mod realtime;
pub mod report;
pub mod runner;
pub mod scheduler;
pub mod snapshot;

pub use bootcache_config::StopReason;

use std::sync::Arc;

mod tests;

/// Faults raised by the guest while executing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SimulationError {
    #[error("Memory access violation at {0:#x}")]
    MemoryViolation(u64),
    #[error("Stack fault: {0}")]
    StackFault(&'static str),
}

pub type SimResult<T> = Result<T, SimulationError>;

/// Harness-level failures (configuration, setup, guest faults surfacing through a pump).
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("{region} region too small for snapshot: need {required} bytes, machine has {available}")]
    RegionTooSmall {
        region: &'static str,
        required: usize,
        available: usize,
    },
    #[error("Invalid machine blueprint: {0}")]
    InvalidBlueprint(String),
    #[error("Guest fault: {0}")]
    Guest(#[from] SimulationError),
    #[error("Boot did not reach quiescence (stopped: {0})")]
    BootIncomplete(StopReason),
    #[error("Network interface '{0}' not found")]
    MissingInterface(String),
    #[error("TAP device error: {0}")]
    Tap(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

/// Trait for observing machine activity without touching it.
pub trait MachineObserver: std::fmt::Debug + Send + Sync {
    fn on_batch_end(&self, _cycles: u64) {}
    fn on_input(&self, _bytes: usize) {}
    fn on_idle_forced(&self) {}
}

/// Trait representing a guest CPU model.
///
/// All architectural state must live in [`cpu::CpuState`] or on the bus, otherwise
/// snapshots will not capture it.
pub trait Cpu {
    fn reset(&mut self, bus: &mut bus::SystemBus);
    fn step(&mut self, bus: &mut bus::SystemBus) -> SimResult<()>;
    fn state(&self) -> &cpu::CpuState;
    fn state_mut(&mut self) -> &mut cpu::CpuState;
}

/// The coarse signals and controls a pump needs from a guest.
///
/// Pumps only ever see a guest through this trait, so they can be driven by
/// scripted fakes in tests.
pub trait Guest {
    fn is_halted(&self) -> bool;
    fn is_idle(&self) -> bool;
    /// Unread bytes are waiting in the console receive queue.
    fn has_pending_input(&self) -> bool;
    fn inject_input(&mut self, bytes: &[u8]);
    /// Knock the guest out of idle so its poll loops run again.
    fn clear_idle(&mut self);
    /// Run up to `max_cycles`; returns the cycles actually executed.
    fn run_batch(&mut self, max_cycles: u64) -> SimResult<u64>;
    /// Raw console output captured since construction or the last clear.
    fn output(&self) -> &[u8];
    fn clear_output(&mut self);
}

/// Recipe for building fresh machines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineBlueprint {
    pub ram_size: usize,
    pub ext_mem_size: usize,
    pub storage_image: Option<Vec<u8>>,
}

/// Smallest RAM the stack monitor's fixed layout fits in.
pub const MIN_RAM_SIZE: usize = 0x1000;

impl MachineBlueprint {
    pub fn new(ram_size: usize, ext_mem_size: usize) -> Self {
        Self {
            ram_size,
            ext_mem_size,
            storage_image: None,
        }
    }

    pub fn with_storage(mut self, image: Vec<u8>) -> Self {
        self.storage_image = Some(image);
        self
    }

    pub fn from_config(config: &bootcache_config::MachineConfig) -> anyhow::Result<Self> {
        Ok(Self {
            ram_size: config.ram_bytes()? as usize,
            ext_mem_size: config.ext_mem_bytes()? as usize,
            storage_image: config.storage_image()?,
        })
    }

    pub fn validate(&self) -> HarnessResult<()> {
        if self.ram_size < MIN_RAM_SIZE {
            return Err(HarnessError::InvalidBlueprint(format!(
                "RAM must be at least {:#x} bytes, got {:#x}",
                MIN_RAM_SIZE, self.ram_size
            )));
        }
        Ok(())
    }
}

pub type NicBackend = Box<dyn net::NetworkBackend + Send>;

pub struct Machine<C: Cpu> {
    pub cpu: C,
    pub bus: bus::SystemBus,
    pub observers: Vec<Arc<dyn MachineObserver>>,
}

impl<C: Cpu + Default> Machine<C> {
    /// Construct an unbooted machine from a blueprint, optionally wiring a NIC to `backend`.
    pub fn from_blueprint(
        blueprint: &MachineBlueprint,
        backend: Option<NicBackend>,
    ) -> HarnessResult<Self> {
        blueprint.validate()?;
        let mut bus = bus::SystemBus::new(blueprint.ram_size, blueprint.ext_mem_size);
        if let Some(image) = &blueprint.storage_image {
            bus.storage.attach(image.clone());
        }
        if let Some(backend) = backend {
            bus.nic = Some(peripherals::nic::Nic::new(backend));
        }
        Ok(Self {
            cpu: C::default(),
            bus,
            observers: Vec::new(),
        })
    }
}

impl<C: Cpu> Machine<C> {
    pub fn with_observer(mut self, observer: Arc<dyn MachineObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn reset(&mut self) {
        self.cpu.reset(&mut self.bus);
    }

    /// Guest has no pending console input and no in-flight frames on its side.
    pub fn is_quiescent(&self) -> bool {
        self.cpu.state().idle && !self.bus.uart.has_rx_data()
    }

    /// Frames sent and received by the guest NIC, if one is attached.
    pub fn frame_counts(&self) -> Option<(u64, u64)> {
        self.bus.nic.as_ref().map(|nic| nic.frame_counts())
    }
}

impl<C: Cpu> Guest for Machine<C> {
    fn is_halted(&self) -> bool {
        self.cpu.state().halted
    }

    fn is_idle(&self) -> bool {
        self.cpu.state().idle
    }

    fn has_pending_input(&self) -> bool {
        self.bus.uart.has_rx_data()
    }

    fn inject_input(&mut self, bytes: &[u8]) {
        let accepted = self.bus.uart.inject_input(bytes);
        for observer in &self.observers {
            observer.on_input(accepted);
        }
    }

    fn clear_idle(&mut self) {
        self.cpu.state_mut().idle = false;
        for observer in &self.observers {
            observer.on_idle_forced();
        }
    }

    fn run_batch(&mut self, max_cycles: u64) -> SimResult<u64> {
        // Console receive interrupt; frame arrival deliberately does not wake the CPU.
        if self.cpu.state().idle && self.bus.uart.has_rx_data() {
            self.cpu.state_mut().idle = false;
        }

        let mut cycles = 0;
        while cycles < max_cycles {
            let state = self.cpu.state();
            if state.halted || state.idle {
                break;
            }
            self.cpu.step(&mut self.bus)?;
            self.cpu.state_mut().cycle_count += 1;
            cycles += 1;
        }

        for observer in &self.observers {
            observer.on_batch_end(cycles);
        }
        Ok(cycles)
    }

    fn output(&self) -> &[u8] {
        self.bus.uart.output()
    }

    fn clear_output(&mut self) {
        self.bus.uart.clear_output();
    }
}
