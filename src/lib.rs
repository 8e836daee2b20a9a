// Cycle-accurate emulator for the CESC16 CPU: a 16-bit Harvard
// architecture with 16 registers, a privileged/user mode distinction,
// memory-mapped peripherals (keyboard, display, timer, disk) and a
// separate 32-bit-wide program ROM.

pub mod alu;
pub mod config;
pub mod controller;
pub mod cpi;
pub mod cpu;
pub mod devices;
pub mod disk;
pub mod errors;
pub mod exit;
pub mod memory;
pub mod terminal;
pub mod timer;

pub use crate::config::{Config, RuntimeState};
pub use crate::controller::CpuController;
pub use crate::cpu::{Cpu, RunOutcome};
pub use crate::errors::{Exception, Fault};
