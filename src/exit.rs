// Every error in the emulator is fatal. This is the single exit path: it
// serializes against the peripheral threads, restores the host terminal
// and terminates the process with a diagnostic on stderr.

use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::terminal::Terminal;

// Held briefly by peripheral threads around every mailbox access and
// unconditionally by the exit path, so no background thread is mid-access
// to a mailbox or the terminal while the process is being torn down.
static EXIT_MUTEX: Mutex<()> = Mutex::new(());

// Set by the SIGINT handler; the driver loop winds down when it sees it.
static EXIT_REQUESTED: AtomicBool = AtomicBool::new(false);

static TERMINAL: Mutex<Option<Arc<Mutex<Terminal>>>> = Mutex::new(None);

/// Register the terminal so the exit path can restore the host screen.
pub fn register_terminal(terminal: Arc<Mutex<Terminal>>) {
    *TERMINAL.lock().unwrap() = Some(terminal);
}

/// Serialize a mailbox access from a peripheral thread against teardown.
pub fn lock() -> MutexGuard<'static, ()> {
    EXIT_MUTEX.lock().unwrap()
}

pub fn request_exit() {
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

pub fn exit_requested() -> bool {
    EXIT_REQUESTED.load(Ordering::SeqCst)
}

/// Install the SIGINT handler. ^C only requests a graceful exit; the
/// actual teardown happens on the driver thread.
pub fn catch_sigint() {
    let handler: extern "C" fn(libc::c_int) = handle_sigint;
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

extern "C" fn handle_sigint(_signal: libc::c_int) {
    // Only async-signal-safe work is allowed here.
    EXIT_REQUESTED.store(true, Ordering::SeqCst);
}

fn teardown_and_exit(code: i32, message: &str) -> ! {
    let _guard = EXIT_MUTEX.lock().unwrap();
    if let Some(terminal) = TERMINAL.lock().unwrap().take() {
        if let Ok(mut terminal) = terminal.lock() {
            terminal.destroy();
        }
    }
    if !message.is_empty() {
        eprintln!("{}", message);
    }
    process::exit(code);
}

/// Terminate with a failure status and a diagnostic.
pub fn error(message: &str) -> ! {
    teardown_and_exit(1, message)
}

/// Terminate with the given exit code, optionally printing a warning.
pub fn exit_code(code: u8, message: &str) -> ! {
    teardown_and_exit(i32::from(code), message)
}
