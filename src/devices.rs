// The memory-mapped peripherals that talk through mailbox register pairs:
// keyboard and display. The disk, which additionally runs a controller
// worker, lives in its own module. Each mailbox is a pair of atomic words;
// the CPU-visible read composes the device's output register with the busy
// bit of the input register.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::errors::Exception;
use crate::exit;
use crate::terminal::{PrintMode, TermColor, Terminal, COLS, ROWS};

/// CPU-to-device busy indicator, embedded in the input mailbox word.
pub const BUSY_BIT: u16 = 1 << 9;

/// One mailbox register pair shared between the CPU and a device thread.
#[derive(Debug, Default)]
pub struct Mailbox {
    input: AtomicU16,
    output: AtomicU16,
}

impl Mailbox {
    pub fn new() -> Mailbox {
        Mailbox::default()
    }

    /// CPU-visible read: the output register plus the busy bit of the
    /// input register.
    pub fn read(&self) -> u16 {
        self.output.load(Ordering::SeqCst) | (self.input.load(Ordering::SeqCst) & BUSY_BIT)
    }

    /// CPU write: store the masked payload with the busy bit set. In
    /// non-strict mode a busy controller or an over-wide payload is a
    /// protocol error; in strict mode the payload is silently masked.
    pub fn post(
        &self,
        value: u16,
        payload_mask: u16,
        payload_bits: u32,
        strict: bool,
        device: &str,
    ) -> Result<u16, Exception> {
        if !strict {
            if self.input.load(Ordering::SeqCst) != 0 {
                return Err(Exception::PeripheralProtocol(format!(
                    "{}: attempting to output while the controller was busy",
                    device
                )));
            }
            if value > payload_mask {
                return Err(Exception::PeripheralProtocol(format!(
                    "{}: value written is bigger than {} bit and will be truncated",
                    device, payload_bits
                )));
            }
        }
        let payload = value & payload_mask;
        self.input.store(payload | BUSY_BIT, Ordering::SeqCst);
        Ok(payload)
    }

    pub fn input(&self) -> u16 {
        self.input.load(Ordering::SeqCst)
    }

    pub fn clear_input(&self) {
        self.input.store(0, Ordering::SeqCst);
    }

    pub fn output(&self) -> u16 {
        self.output.load(Ordering::SeqCst)
    }

    pub fn set_output(&self, value: u16) {
        self.output.store(value, Ordering::SeqCst);
    }

    pub fn clear_output(&self) {
        self.output.store(0, Ordering::SeqCst);
    }
}

/// Clear the busy word after the configured device delay. A zero delay
/// settles immediately; otherwise a transient helper thread does it.
fn settle_busy(mailbox: &Arc<Mailbox>, delay_us: u64) {
    if delay_us == 0 {
        mailbox.clear_input();
        return;
    }
    let mailbox = Arc::clone(mailbox);
    thread::spawn(move || {
        thread::sleep(Duration::from_micros(delay_us));
        let _guard = exit::lock();
        mailbox.clear_input();
    });
}

/// Keyboard controller commands.
const KBD_ACK: u16 = 0x06;
const KBD_RDY: u16 = 0x07;

/// Keyboard/serial controller at port 0. Keypresses land in the output
/// register and raise an IRQ; the OS answers with ACK/RDY commands.
pub struct Keyboard {
    mailbox: Arc<Mailbox>,
    terminal: Arc<Mutex<Terminal>>,
    /// True once the OS has signaled that it is safe to interrupt again.
    can_interrupt: bool,
    delay_us: u64,
    strict: bool,
}

impl Keyboard {
    pub fn new(terminal: Arc<Mutex<Terminal>>, config: &Config) -> Keyboard {
        Keyboard {
            mailbox: Arc::new(Mailbox::new()),
            terminal,
            can_interrupt: true,
            delay_us: config.keyboard_delay_us,
            strict: config.strict,
        }
    }

    pub fn read(&self) -> u16 {
        self.mailbox.read()
    }

    pub fn write(&mut self, value: u16) -> Result<(), Exception> {
        let payload = self
            .mailbox
            .post(value, 0x7F, 7, self.strict, "Keyboard/Serial")?;
        match payload {
            KBD_ACK => {
                // Input acknowledged: clear the output register
                self.mailbox.clear_output();
            }
            KBD_RDY => {
                // The OS is ready to be interrupted again
                self.can_interrupt = true;
                self.mailbox.clear_output();
            }
            _ => {
                return Err(Exception::PeripheralProtocol(
                    "Invalid keyboard command".to_string(),
                ))
            }
        }
        settle_busy(&self.mailbox, self.delay_us);
        Ok(())
    }

    /// Called from the UI tick. Latches a pending keypress into the output
    /// register; returns true if an IRQ must be raised.
    pub fn poll(&mut self) -> bool {
        let pressed = {
            let mut terminal = self.terminal.lock().unwrap();
            terminal.update_input();
            // While a char is being presented, or the CPU is inside the
            // service routine, hold any further input back.
            if self.mailbox.output() != 0 || !self.can_interrupt {
                return false;
            }
            terminal.get_input()
        };
        if pressed != 0 {
            self.mailbox.set_output(u16::from(pressed));
            self.can_interrupt = false;
            return true;
        }
        false
    }
}

/// Two-byte display command state.
enum Pending {
    First,
    ColorLine,
    ColorScreen,
}

const WHITE6: u8 = 0b111111;

/// Character display at port 1. Bytes are either printable characters or
/// a small command grammar for cursor movement, colors and clearing.
pub struct Display {
    mailbox: Arc<Mailbox>,
    terminal: Arc<Mutex<Terminal>>,
    /// Color RAM: one color per display row.
    cram: [TermColor; ROWS],
    pending: Pending,
    saved_row: usize,
    saved_col: usize,
    delay_us: u64,
    strict: bool,
}

impl Display {
    pub fn new(terminal: Arc<Mutex<Terminal>>, config: &Config) -> Display {
        Display {
            mailbox: Arc::new(Mailbox::new()),
            terminal,
            cram: [TermColor::White; ROWS],
            pending: Pending::First,
            saved_row: 0,
            saved_col: 0,
            delay_us: config.terminal_delay_us,
            strict: config.strict,
        }
    }

    pub fn read(&self) -> u16 {
        self.mailbox.read()
    }

    pub fn write(&mut self, value: u16) -> Result<(), Exception> {
        let payload = self.mailbox.post(value, 0xFF, 8, self.strict, "Terminal")? as u8;
        settle_busy(&self.mailbox, self.delay_us);

        let terminal = Arc::clone(&self.terminal);
        let mut terminal = terminal.lock().unwrap();
        self.process_char(&mut terminal, payload);
        Ok(())
    }

    fn set_color(&mut self, terminal: &mut Terminal, color6: u8, row: usize) {
        let color = TermColor::from_rgb6(color6);
        self.cram[row] = color;
        terminal.set_color(color, Some(row));
    }

    /// Give the line below `row` the color of `row`.
    fn propagate_color(&mut self, terminal: &mut Terminal, row: usize) {
        let color = self.cram[row];
        self.cram[row + 1] = color;
        terminal.set_color(color, Some(row + 1));
    }

    /// New characters are printed in the color of the given row.
    fn update_cursor_color(&mut self, terminal: &mut Terminal, row: usize) {
        terminal.set_color(self.cram[row], None);
    }

    /// Process one display byte (see the VGA terminal command grammar).
    fn process_char(&mut self, terminal: &mut Terminal, inbyte: u8) {
        let (mut row, mut col) = terminal.get_coords();
        let mut update_coords = true;

        // Second byte of a 2-byte sequence
        match self.pending {
            Pending::ColorLine => {
                self.set_color(terminal, inbyte & 0x3F, row);
                self.pending = Pending::First;
                terminal.set_coords(row, col);
                return;
            }
            Pending::ColorScreen => {
                for r in 0..ROWS {
                    self.set_color(terminal, inbyte & 0x3F, r);
                }
                self.pending = Pending::First;
                terminal.set_coords(row, col);
                return;
            }
            Pending::First => {}
        }

        if inbyte & 0x80 != 0 {
            // COMMAND
            if inbyte & 0x40 != 0 {
                // Move to column
                let new_col = usize::from(inbyte & 0x3F);
                if new_col < COLS {
                    col = new_col;
                }
            } else if inbyte & 0x20 != 0 {
                // Move to line/row
                let new_row = usize::from(inbyte & 0x1F);
                if new_row < ROWS {
                    row = new_row;
                    self.update_cursor_color(terminal, row);
                }
            } else if inbyte & 0x08 != 0 {
                self.pending = if inbyte & 0x01 != 0 {
                    Pending::ColorLine
                } else {
                    Pending::ColorScreen
                };
            } else if inbyte & 0x04 != 0 {
                if inbyte & 0x02 != 0 {
                    if inbyte & 0x01 != 0 {
                        terminal.clear_line(row);
                    } else {
                        for r in 0..ROWS {
                            terminal.clear_line(r);
                        }
                    }
                } else if inbyte & 0x01 != 0 {
                    // Restore cursor position
                    row = self.saved_row;
                    col = self.saved_col;
                    self.update_cursor_color(terminal, row);
                } else {
                    // Save cursor position
                    self.saved_row = row;
                    self.saved_col = col;
                }
            } else if inbyte & 0x02 != 0 {
                terminal.set_cursor_blink(inbyte & 0x01 != 0);
            } else if inbyte & 0x01 != 0 {
                // Reset: cursor to top-left, clear, all white
                row = 0;
                col = 0;
                self.set_color(terminal, WHITE6, 0);
                for r in 0..ROWS {
                    terminal.clear_line(r);
                    self.cram[r] = TermColor::White;
                }
            }
        } else {
            // ASCII CHAR
            terminal.print(inbyte, PrintMode::OnlyFile);
            match inbyte {
                0x08 => {
                    // Backspace: remove one character, staying on the line
                    if col > 0 {
                        col -= 1;
                        terminal.set_coords(row, col);
                        terminal.print(b' ', PrintMode::OnlyScreen);
                    }
                }
                0x7F => {
                    // Delete: remove one character, moving right
                    if col < COLS - 1 {
                        terminal.print(b' ', PrintMode::OnlyScreen);
                    } else {
                        terminal.clear_to_eol();
                    }
                    update_coords = false;
                }
                b'\t' => {
                    // Move to the next multiple of 4
                    col &= !0x03;
                    if col < COLS - 5 {
                        col += 4;
                    } else {
                        col = COLS - 1;
                    }
                }
                b'\n' | 0x0B => {
                    // Newline; vertical tab is LF without CR
                    if inbyte == b'\n' {
                        col = 0;
                    }
                    if row < ROWS - 1 {
                        self.propagate_color(terminal, row);
                        row += 1;
                    } else {
                        // Scroll; color propagation is implicit
                        terminal.print(b'\n', PrintMode::OnlyScreen);
                        for r in 0..ROWS - 1 {
                            self.cram[r] = self.cram[r + 1];
                        }
                    }
                }
                0x0C => {
                    // Form feed: page break
                    row = ROWS - 1;
                    col = 0;
                    for r in 0..ROWS {
                        terminal.clear_line(r);
                        self.cram[r] = TermColor::White;
                    }
                    self.set_color(terminal, WHITE6, ROWS - 1);
                }
                b'\r' => col = 0,
                0x1C => {
                    if col > 0 {
                        col -= 1;
                    }
                }
                0x1D => {
                    if col < COLS - 1 {
                        col += 1;
                    }
                }
                0x1E => {
                    if row < ROWS - 1 {
                        row += 1;
                        self.update_cursor_color(terminal, row);
                    }
                }
                0x1F => {
                    if row > 0 {
                        row -= 1;
                        self.update_cursor_color(terminal, row);
                    }
                }
                _ => {
                    if inbyte < b' ' {
                        return;
                    }
                    let old_row = row;
                    // Print the character; the line may overflow
                    terminal.print(inbyte, PrintMode::OnlyScreen);
                    let coords = terminal.get_coords();
                    row = coords.0;
                    col = coords.1;
                    update_coords = false;

                    if row > old_row {
                        // Line overflowed without scrolling
                        self.propagate_color(terminal, row - 1);
                    } else if col == 0 {
                        // Line overflowed at the bottom; the screen scrolled
                        for r in 0..ROWS - 1 {
                            self.cram[r] = self.cram[r + 1];
                        }
                    }
                }
            }
        }
        if update_coords {
            terminal.set_coords(row, col);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeState;

    fn terminal(config: &Config) -> Arc<Mutex<Terminal>> {
        Arc::new(Mutex::new(
            Terminal::new(config, Arc::new(RuntimeState::default())).unwrap(),
        ))
    }

    fn silent_config() -> Config {
        Config { silent: true, ..Config::default() }
    }

    #[test]
    fn mailbox_read_composes_busy_bit() {
        let mailbox = Mailbox::new();
        mailbox.post(0x41, 0xFF, 8, false, "test").unwrap();
        mailbox.set_output(0x55);
        assert_eq!(mailbox.read(), 0x55 | BUSY_BIT);
        mailbox.clear_input();
        assert_eq!(mailbox.read(), 0x55);
    }

    #[test]
    fn mailbox_rejects_busy_overwrite_when_not_strict() {
        let mailbox = Mailbox::new();
        mailbox.post(0x01, 0x1FF, 9, false, "test").unwrap();
        assert!(mailbox.post(0x02, 0x1FF, 9, false, "test").is_err());
        // Strict mode overwrites silently
        assert!(mailbox.post(0x02, 0x1FF, 9, true, "test").is_ok());
    }

    #[test]
    fn mailbox_masks_payload_in_strict_mode() {
        let mailbox = Mailbox::new();
        assert!(mailbox.post(0x1FF, 0xFF, 8, false, "test").is_err());
        let payload = mailbox.post(0x1FF, 0xFF, 8, true, "test").unwrap();
        assert_eq!(payload, 0xFF);
    }

    #[test]
    fn keyboard_ack_clears_output() {
        let config = silent_config();
        let mut keyboard = Keyboard::new(terminal(&config), &config);
        keyboard.mailbox.set_output(b'x' as u16);
        keyboard.write(0x06).unwrap();
        assert_eq!(keyboard.mailbox.output(), 0);
        // Delay is 0: busy settles immediately
        assert_eq!(keyboard.read(), 0);
    }

    #[test]
    fn keyboard_rejects_unknown_command() {
        let config = silent_config();
        let mut keyboard = Keyboard::new(terminal(&config), &config);
        assert!(matches!(
            keyboard.write(0x41),
            Err(Exception::PeripheralProtocol(_))
        ));
    }

    #[test]
    fn keypress_raises_irq_once_until_rdy() {
        let config = silent_config();
        let term = terminal(&config);
        let mut keyboard = Keyboard::new(Arc::clone(&term), &config);

        term.lock().unwrap().inject_input(b'k');
        assert!(keyboard.poll());
        assert_eq!(keyboard.read(), u16::from(b'k'));

        // A second key must wait: output is full and interrupts are off
        term.lock().unwrap().inject_input(b'q');
        assert!(!keyboard.poll());

        // ACK frees the output register, RDY re-enables interrupts
        keyboard.write(0x06).unwrap();
        assert!(!keyboard.poll());
        keyboard.write(0x07).unwrap();
        assert!(keyboard.poll());
        assert_eq!(keyboard.read(), u16::from(b'q'));
    }

    #[test]
    fn display_prints_characters() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        for &b in b"Hi" {
            display.write(u16::from(b)).unwrap();
        }
        let term = term.lock().unwrap();
        assert_eq!(term.char_at(0, 0), b'H');
        assert_eq!(term.char_at(0, 1), b'i');
    }

    #[test]
    fn display_newline_and_carriage_return() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        display.write(u16::from(b'a')).unwrap();
        display.write(u16::from(b'\n')).unwrap();
        display.write(u16::from(b'b')).unwrap();
        let term = term.lock().unwrap();
        assert_eq!(term.char_at(0, 0), b'a');
        assert_eq!(term.char_at(1, 0), b'b');
    }

    #[test]
    fn display_move_commands_position_cursor() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        display.write(0xA0 | 0x03).unwrap(); // move to row 3
        display.write(0xC0 | 0x05).unwrap(); // move to column 5
        display.write(u16::from(b'X')).unwrap();
        assert_eq!(term.lock().unwrap().char_at(3, 5), b'X');
    }

    #[test]
    fn display_set_color_line_is_two_bytes() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        display.write(0x89).unwrap(); // set color for line
        display.write(0b110000).unwrap(); // red
        assert_eq!(term.lock().unwrap().row_color(0), TermColor::Red);
    }

    #[test]
    fn display_reset_clears_screen_and_colors() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        display.write(u16::from(b'Z')).unwrap();
        display.write(0x89).unwrap();
        display.write(0b000011).unwrap(); // blue line
        display.write(0x81).unwrap(); // reset
        let term = term.lock().unwrap();
        assert_eq!(term.char_at(0, 0), b' ');
        assert_eq!(term.row_color(0), TermColor::White);
        assert_eq!(term.get_coords(), (0, 0));
    }

    #[test]
    fn display_save_and_restore_cursor() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        display.write(0xA0 | 2).unwrap();
        display.write(0xC0 | 7).unwrap();
        display.write(0x84).unwrap(); // save
        display.write(0xA0 | 0).unwrap();
        display.write(0xC0 | 0).unwrap();
        display.write(0x85).unwrap(); // restore
        assert_eq!(term.lock().unwrap().get_coords(), (2, 7));
    }

    #[test]
    fn display_wide_payload_errors_unless_strict() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        assert!(matches!(
            display.write(0x1FF),
            Err(Exception::PeripheralProtocol(_))
        ));

        let strict = Config { strict: true, ..silent_config() };
        let term = terminal(&strict);
        let mut display = Display::new(Arc::clone(&term), &strict);
        display.write(0x1FF).unwrap(); // masked to 0xFF, a command byte
    }

    #[test]
    fn display_tab_advances_to_multiple_of_four() {
        let config = silent_config();
        let term = terminal(&config);
        let mut display = Display::new(Arc::clone(&term), &config);
        display.write(u16::from(b'a')).unwrap();
        display.write(u16::from(b'\t')).unwrap();
        assert_eq!(term.lock().unwrap().get_coords(), (0, 4));
    }
}
