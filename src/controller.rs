// The driver: loads the ROM image, schedules the periodic UI update and
// paces the CPU against the wall clock. Never returns; every way out goes
// through the shared exit path.

use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::info;

use crate::config::{Config, RuntimeState};
use crate::cpu::{Cpu, RunOutcome, MAX_INSTR_CYCLES};
use crate::errors::Exception;
use crate::exit;
use crate::terminal::Terminal;

/// Length of one fast-regime execution slice, in microseconds.
const SLICE_US: i64 = 10_000;
/// UI refresh period, in milliseconds.
const UPDATE_INTERVAL_MS: u64 = 30;

pub struct CpuController {
    cpu: Arc<Mutex<Cpu>>,
    config: Arc<Config>,
    state: Arc<RuntimeState>,
}

impl CpuController {
    /// Build the terminal, the CPU and its peripherals; register the
    /// terminal with the exit path and install the SIGINT handler.
    pub fn new(config: Arc<Config>) -> CpuController {
        let state = Arc::new(RuntimeState::default());
        let terminal = match Terminal::new(&config, Arc::clone(&state)) {
            Ok(terminal) => Arc::new(Mutex::new(terminal)),
            Err(error) => exit::error(&format!("Error: {}", error)),
        };
        exit::register_terminal(Arc::clone(&terminal));
        exit::catch_sigint();

        let cpu = match Cpu::new(Arc::clone(&config), Arc::clone(&state), terminal) {
            Ok(mut cpu) => {
                cpu.reset();
                Arc::new(Mutex::new(cpu))
            }
            Err(error) => exit::error(&format!("Error: {}", error)),
        };
        CpuController { cpu, config, state }
    }

    /// Load a ROM image into the ROM pair.
    pub fn read_rom_file(&self, path: &Path) {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(error) => exit::error(&format!(
                "Error: ROM file [{}] could not be found/opened: {}",
                path.display(),
                error
            )),
        };
        let pairs = match parse_rom(&contents) {
            Ok(pairs) => pairs,
            Err(message) => exit::error(&format!("Error: {}", message)),
        };
        let mut cpu = self.cpu.lock().unwrap();
        for (address, &(high, low)) in pairs.iter().enumerate() {
            cpu.write_rom(address as u16, high, low);
        }
        info!("loaded {} instruction words from {}", pairs.len(), path.display());
    }

    /// Run the emulator. Does not return.
    pub fn execute(&self) -> ! {
        // The UI thread calls update() roughly every 30 ms for as long as
        // the emulator runs.
        let cpu = Arc::clone(&self.cpu);
        thread::spawn(move || loop {
            let next = Instant::now() + Duration::from_millis(UPDATE_INTERVAL_MS);
            cpu.lock().unwrap().update();
            let now = Instant::now();
            if next > now {
                thread::sleep(next - now);
            }
        });

        // Give the terminal some time to come up, so the first program
        // outputs are not lost.
        thread::sleep(Duration::from_millis(20));

        // Breakpoints are checked after each instruction, so one at the
        // reset address has to pause the machine up front.
        if self.config.breakpoints.contains(&0) {
            self.state.set_paused(true);
        }

        // Cycles to execute per slice
        let cycles = ((self.config.clk_freq * SLICE_US) / 1_000_000) as i32;
        if (cycles as u32) < MAX_INSTR_CYCLES {
            self.run_slow()
        } else {
            self.run_fast(cycles, SLICE_US)
        }
    }

    fn wait_while_paused(&self) {
        while self.state.paused() {
            if exit::exit_requested() {
                exit::exit_code(0, "");
            }
            thread::yield_now();
        }
    }

    /// High clock speeds: execute a whole slice, then sleep off the rest
    /// of its wall-clock window. Falling out of the window is fatal.
    fn run_fast(&self, cycles: i32, slice_us: i64) -> ! {
        let mut extra_cycles: i32 = 0;
        loop {
            if exit::exit_requested() {
                exit::exit_code(0, "");
            }
            self.wait_while_paused();

            let end_wait = Instant::now() + Duration::from_micros(slice_us as u64);
            {
                let mut cpu = self.cpu.lock().unwrap();
                // Subtract the extra cycles the previous slice consumed
                extra_cycles = match cpu.execute(cycles - extra_cycles) {
                    Ok(RunOutcome::Ran(extra)) => extra,
                    Ok(RunOutcome::Paused) => 0,
                    Ok(RunOutcome::Exit(a0)) => finish(a0),
                    Err(fault) => exit::error(&fault.to_string()),
                };
            }

            let now = Instant::now();
            if now > end_wait {
                exit::error(&Exception::RealtimeOverrun.to_string());
            }
            thread::sleep(end_wait - now);
        }
    }

    /// Low clock speeds: execute exactly one instruction per turn and
    /// sleep its real-time duration.
    fn run_slow(&self) -> ! {
        loop {
            if exit::exit_requested() {
                exit::exit_code(0, "");
            }
            self.wait_while_paused();

            // Requesting a single cycle executes exactly one instruction;
            // the extra cycles are the rest of its cost.
            let required_timesteps;
            {
                let mut cpu = self.cpu.lock().unwrap();
                required_timesteps = match cpu.execute(1) {
                    Ok(RunOutcome::Ran(extra)) => extra + 1,
                    Ok(RunOutcome::Paused) => 1,
                    Ok(RunOutcome::Exit(a0)) => finish(a0),
                    Err(fault) => exit::error(&fault.to_string()),
                };
            }
            let required_us = 1_000_000i64 * i64::from(required_timesteps) / self.config.clk_freq;
            thread::sleep(Duration::from_micros(required_us as u64));
        }
    }
}

fn finish(a0: u16) -> ! {
    if a0 > 0xFF {
        exit::exit_code(
            (a0 & 0xFF) as u8,
            &format!(
                "Warning: the exit code 0x{:X} is bigger than 255 and will be truncated",
                a0
            ),
        );
    }
    exit::exit_code(a0 as u8, "")
}

/// Parse a ROM image: a whitespace-delimited sequence of 4-hex-digit
/// words, pairs of (high, low) starting at address 0.
fn parse_rom(contents: &str) -> Result<Vec<(u16, u16)>, String> {
    let mut words = contents.split_whitespace();
    let mut pairs = Vec::new();
    while let Some(first) = words.next() {
        let high = parse_word(first)?;
        let low = match words.next() {
            Some(word) => parse_word(word)?,
            None => return Err("make sure the ROM file is a valid binary file".to_string()),
        };
        if pairs.len() >= 0x10000 {
            return Err("ROM file is too large".to_string());
        }
        pairs.push((high, low));
    }
    Ok(pairs)
}

fn parse_word(word: &str) -> Result<u16, String> {
    u16::from_str_radix(word, 16)
        .map_err(|_| "make sure the ROM file is a valid binary file".to_string())
}
