use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Immutable emulator configuration, fixed at startup from the command line.
#[derive(Debug, Clone)]
pub struct Config {
    /// Emulated clock frequency, in Hz.
    pub clk_freq: i64,
    /// Addresses that pause execution when the PC lands on them.
    pub breakpoints: Vec<u16>,
    /// Addresses that terminate the emulator, returning `a0` as exit code.
    pub exitpoints: Vec<u16>,
    /// Capture file for everything the program prints.
    pub out_file: Option<PathBuf>,
    /// Microseconds the display controller stays busy after each write.
    pub terminal_delay_us: u64,
    /// Microseconds the keyboard controller stays busy after each write.
    pub keyboard_delay_us: u64,
    /// Disable the soft protections, like the real hardware.
    pub strict: bool,
    /// Skip the status UI and print program output directly to stdout.
    pub silent: bool,
    /// Instructions the OS must complete before the first interrupt.
    pub os_critical_instr: u16,
    /// Root directory used for disk emulation.
    pub disk_root: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            clk_freq: 2_000_000,
            breakpoints: Vec::new(),
            exitpoints: Vec::new(),
            out_file: None,
            terminal_delay_us: 0,
            keyboard_delay_us: 0,
            strict: false,
            silent: false,
            os_critical_instr: 0x20,
            disk_root: None,
        }
    }
}

/// Mutable run state shared between the driver loop, the UI tick and the
/// terminal input handler.
#[derive(Debug, Default)]
pub struct RuntimeState {
    /// Cycles the CPU has executed since the last reset.
    pub elapsed_cycles: AtomicU64,
    /// True while the emulator is paused (breakpoint, F5).
    pub is_paused: AtomicBool,
    /// True while in single-step mode (break after every instruction).
    pub single_step: AtomicBool,
}

impl RuntimeState {
    pub fn paused(&self) -> bool {
        self.is_paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.is_paused.store(paused, Ordering::SeqCst);
    }

    pub fn single_step(&self) -> bool {
        self.single_step.load(Ordering::SeqCst)
    }

    pub fn elapsed(&self) -> u64 {
        self.elapsed_cycles.load(Ordering::SeqCst)
    }
}
