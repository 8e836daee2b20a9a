use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;

use cesc16::{Config, CpuController};

/// Run binary files for the CESC16 architecture.
#[derive(Parser, Debug)]
#[command(name = "cesc16-emu", version, about)]
struct Args {
    /// Frequency of the emulated CPU clock, in Hertz
    #[arg(short = 'f', long = "freq", default_value_t = 2_000_000)]
    freq: i64,

    /// Pause execution when the PC reaches this address (hex, repeatable)
    #[arg(short = 'b', long = "breakpoint", value_parser = parse_hex_addr)]
    breakpoints: Vec<u16>,

    /// Terminate with the value of a0 when the PC reaches this address
    /// (hex, repeatable)
    #[arg(short = 'x', long = "exitpoint", value_parser = parse_hex_addr)]
    exitpoints: Vec<u16>,

    /// Write everything the program prints to this file
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,

    /// Microseconds the display controller stays busy after each write
    #[arg(short = 't', long = "terminal-delay", default_value_t = 0)]
    terminal_delay: u64,

    /// Microseconds the keyboard controller stays busy after each write
    #[arg(short = 'k', long = "keyboard-delay", default_value_t = 0)]
    keyboard_delay: u64,

    /// Disable the soft protection layers, like the real hardware
    #[arg(short = 'S', long = "strict")]
    strict: bool,

    /// Skip the status UI and print program output directly to stdout
    #[arg(short = 's', long = "silent")]
    silent: bool,

    /// Root directory used for disk emulation
    #[arg(short = 'd', long = "disk-root")]
    disk_root: Option<PathBuf>,

    /// Instructions the OS needs to set up its interrupt handlers
    #[arg(long = "os-ready", default_value_t = 0x20)]
    os_ready: u16,

    /// Path to the ROM image to load
    rom: PathBuf,
}

fn parse_hex_addr(text: &str) -> Result<u16, String> {
    let digits = text.trim_start_matches("0x");
    u16::from_str_radix(digits, 16).map_err(|error| format!("invalid address: {}", error))
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if args.freq <= 0 {
        eprintln!("Error: Invalid clock frequency, make sure it's a positive integer");
        process::exit(1);
    }

    let config = Arc::new(Config {
        clk_freq: args.freq,
        breakpoints: args.breakpoints,
        exitpoints: args.exitpoints,
        out_file: args.output,
        terminal_delay_us: args.terminal_delay,
        keyboard_delay_us: args.keyboard_delay,
        strict: args.strict,
        silent: args.silent,
        os_critical_instr: args.os_ready,
        disk_root: args.disk_root,
    });

    let controller = CpuController::new(config);
    controller.read_rom_file(&args.rom);
    controller.execute();
}
