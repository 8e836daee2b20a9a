use std::fmt;
use std::io;

use thiserror::Error;

/// Faults the emulator core can raise. There is no recoverable class:
/// every variant ends up in the shared exit path with a diagnostic.
#[derive(Debug, Error)]
pub enum Exception {
    #[error("Illegal opcode or sub-encoding")]
    IllegalOpcode,

    #[error("Invalid memory access at 0x{addr:04X}")]
    InvalidMemoryAccess { addr: u16 },

    #[error("Invalid regfile access (register {index})")]
    InvalidRegisterAccess { index: u16 },

    #[error("SP overflowed")]
    StackOverflow,

    #[error("PC overflowed")]
    PcOverflow,

    #[error("{0}")]
    PeripheralProtocol(String),

    #[error("Host I/O error: {0}")]
    HostIo(#[from] io::Error),

    #[error("Target clock frequency too high for real-time emulation, try a slower clock")]
    RealtimeOverrun,
}

/// An [`Exception`] annotated with the execution context it was raised in.
/// The driver loop formats this into the fatal diagnostic.
#[derive(Debug)]
pub struct Fault {
    pub pc: u16,
    pub opcode: u16,
    pub argument: u16,
    /// True if the faulting instruction was fetched from RAM.
    pub user_mode: bool,
    pub cause: Exception,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Error at PC = 0x{:04X} [{}] (OP = 0x{:04X}, ARG = 0x{:04X}):\n{}",
            self.pc,
            if self.user_mode { "RAM" } else { "ROM" },
            self.opcode,
            self.argument,
            self.cause
        )
    }
}
