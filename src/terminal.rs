// Terminal front-end: an emulated character screen with a status panel and
// a performance line, drawn with termion, plus the keyboard input queue.
// The screen model (character grid, per-row colors, cursor) is kept even
// in silent mode; silent mode only skips the rendering.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Stdout, Write};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use termion::event::Key;
use termion::input::{Keys, TermRead};
use termion::raw::{IntoRawMode, RawTerminal};
use termion::{async_stdin, clear, color, cursor, AsyncReader};

use crate::alu::Flags;
use crate::config::{Config, RuntimeState};
use crate::errors::Exception;
use crate::exit;
use crate::memory::{Regfile, ABI_NAMES};

/// Emulated VGA terminal dimensions.
pub const ROWS: usize = 28;
pub const COLS: usize = 64;
/// Width of the status side panel.
const COLS_STATUS: usize = 14;

/// The 8 colors of the emulated terminal, ordered by their reduced
/// 1-bit-per-channel RGB value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermColor {
    Black,
    Blue,
    Green,
    Cyan,
    Red,
    Magenta,
    Yellow,
    White,
}

impl TermColor {
    /// Reduce a 6-bit color (2 bits per channel) to the 8 colors most
    /// terminals support.
    pub fn from_rgb6(color: u8) -> TermColor {
        let mut reduced = 0;
        if (color & 0b110000) >= 0b100000 {
            reduced |= 0b100;
        }
        if (color & 0b001100) >= 0b001000 {
            reduced |= 0b010;
        }
        if (color & 0b000011) >= 0b000010 {
            reduced |= 0b001;
        }
        match reduced {
            0 => TermColor::Black,
            1 => TermColor::Blue,
            2 => TermColor::Green,
            3 => TermColor::Cyan,
            4 => TermColor::Red,
            5 => TermColor::Magenta,
            6 => TermColor::Yellow,
            _ => TermColor::White,
        }
    }

    fn write_fg<W: Write>(&self, out: &mut W) -> io::Result<()> {
        match self {
            TermColor::Black => write!(out, "{}", color::Fg(color::Black)),
            TermColor::Blue => write!(out, "{}", color::Fg(color::Blue)),
            TermColor::Green => write!(out, "{}", color::Fg(color::Green)),
            TermColor::Cyan => write!(out, "{}", color::Fg(color::Cyan)),
            TermColor::Red => write!(out, "{}", color::Fg(color::Red)),
            TermColor::Magenta => write!(out, "{}", color::Fg(color::Magenta)),
            TermColor::Yellow => write!(out, "{}", color::Fg(color::Yellow)),
            TermColor::White => write!(out, "{}", color::Fg(color::White)),
        }
    }
}

/// Where a program-emitted byte goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrintMode {
    Both,
    OnlyScreen,
    OnlyFile,
}

enum Input {
    /// Raw-mode key events.
    Screen(Keys<AsyncReader>),
    /// Silent mode: plain bytes from stdin.
    Raw(AsyncReader),
}

pub struct Terminal {
    out: Option<RawTerminal<Stdout>>,
    input: Input,
    input_buffer: VecDeque<u8>,
    output_file: Option<File>,
    silent: bool,
    state: Arc<RuntimeState>,

    chars: [[u8; COLS]; ROWS],
    row_colors: [TermColor; ROWS],
    cursor_color: TermColor,
    cur_row: usize,
    cur_col: usize,
    cursor_blink: bool,
}

impl Terminal {
    pub fn new(config: &Config, state: Arc<RuntimeState>) -> Result<Terminal, Exception> {
        let output_file = match &config.out_file {
            Some(path) => Some(File::create(path).map_err(|e| {
                Exception::HostIo(io::Error::new(
                    e.kind(),
                    format!("Output file [{}] could not be opened", path.display()),
                ))
            })?),
            None => None,
        };

        let (out, input) = if config.silent {
            (None, Input::Raw(async_stdin()))
        } else {
            size_check()?;
            let mut out = io::stdout().into_raw_mode().map_err(Exception::HostIo)?;
            write!(out, "{}{}", clear::All, cursor::Hide).map_err(Exception::HostIo)?;
            (Some(out), Input::Screen(async_stdin().keys()))
        };

        let mut terminal = Terminal {
            out,
            input,
            input_buffer: VecDeque::new(),
            output_file,
            silent: config.silent,
            state,
            chars: [[b' '; COLS]; ROWS],
            row_colors: [TermColor::White; ROWS],
            cursor_color: TermColor::White,
            cur_row: 0,
            cur_col: 0,
            cursor_blink: true,
        };
        terminal.draw_frame();
        Ok(terminal)
    }

    /// Draw the frames around the three panels. Done once at startup.
    fn draw_frame(&mut self) {
        let out = match self.out.as_mut() {
            Some(out) => out,
            None => return,
        };
        let top = format!(
            "╔{}╦{}╗",
            boxed_title("Terminal output", COLS),
            boxed_title("Status", COLS_STATUS)
        );
        let separator = format!(
            "╠{}╩{}╣",
            boxed_title("Performance", COLS),
            "═".repeat(COLS_STATUS)
        );
        let bottom = format!("╚{}╝", "═".repeat(COLS + COLS_STATUS + 1));

        let _ = write!(out, "{}{}", cursor::Goto(1, 1), top);
        for row in 0..ROWS {
            let y = (row + 2) as u16;
            let _ = write!(
                out,
                "{}║{}║{}║",
                cursor::Goto(1, y),
                cursor::Goto((COLS + 2) as u16, y),
                cursor::Goto((COLS + COLS_STATUS + 3) as u16, y)
            );
        }
        let _ = write!(out, "{}{}", cursor::Goto(1, (ROWS + 2) as u16), separator);
        let _ = write!(
            out,
            "{}║{}║",
            cursor::Goto(1, (ROWS + 3) as u16),
            cursor::Goto((COLS + COLS_STATUS + 3) as u16, (ROWS + 3) as u16)
        );
        let _ = write!(out, "{}{}", cursor::Goto(1, (ROWS + 4) as u16), bottom);
        let _ = out.flush();
    }

    /// Route one program byte to the screen model, the capture file, or
    /// both.
    pub fn print(&mut self, byte: u8, mode: PrintMode) {
        match mode {
            // The model is updated even in silent mode so coordinate reads
            // stay consistent; rendering is what silent mode skips.
            PrintMode::OnlyScreen => self.put_char(byte),
            PrintMode::OnlyFile => self.print_to_file(byte),
            PrintMode::Both => {
                self.print_to_file(byte);
                self.put_char(byte);
            }
        }
    }

    fn print_to_file(&mut self, byte: u8) {
        if let Some(file) = self.output_file.as_mut() {
            let _ = file.write_all(&[byte]);
        }
        if self.silent {
            let _ = io::stdout().write_all(&[byte]);
        }
    }

    /// Write one character into the screen model, wrapping and scrolling
    /// the way the hardware terminal does.
    fn put_char(&mut self, byte: u8) {
        if byte == b'\n' {
            self.cur_col = 0;
            if self.cur_row + 1 < ROWS {
                self.cur_row += 1;
            } else {
                self.scroll_up();
            }
            return;
        }
        self.chars[self.cur_row][self.cur_col] = byte;
        self.cur_col += 1;
        if self.cur_col == COLS {
            self.cur_col = 0;
            if self.cur_row + 1 < ROWS {
                self.cur_row += 1;
            } else {
                self.scroll_up();
            }
        }
    }

    fn scroll_up(&mut self) {
        for row in 0..ROWS - 1 {
            self.chars[row] = self.chars[row + 1];
            self.row_colors[row] = self.row_colors[row + 1];
        }
        self.chars[ROWS - 1] = [b' '; COLS];
    }

    pub fn get_coords(&self) -> (usize, usize) {
        (self.cur_row, self.cur_col)
    }

    pub fn set_coords(&mut self, row: usize, col: usize) {
        self.cur_row = row.min(ROWS - 1);
        self.cur_col = col.min(COLS - 1);
    }

    /// Blank an entire row.
    pub fn clear_line(&mut self, row: usize) {
        self.chars[row] = [b' '; COLS];
    }

    /// Blank from the cursor to the end of the current row.
    pub fn clear_to_eol(&mut self) {
        for col in self.cur_col..COLS {
            self.chars[self.cur_row][col] = b' ';
        }
    }

    /// Set the color for newly printed characters and, if given, repaint a
    /// whole row with it.
    pub fn set_color(&mut self, color: TermColor, row: Option<usize>) {
        self.cursor_color = color;
        if let Some(row) = row {
            if row < ROWS {
                self.row_colors[row] = color;
            }
        }
    }

    pub fn set_cursor_blink(&mut self, blink: bool) {
        self.cursor_blink = blink;
    }

    /// Render the status panel and the performance line.
    pub fn display_status(
        &mut self,
        pc: u16,
        user_mode: bool,
        flags: &Flags,
        regs: &Regfile,
        cpi: f64,
    ) {
        if self.silent {
            return;
        }
        let paused = self.state.paused();
        let elapsed = self.state.elapsed();

        let mut lines: Vec<String> = Vec::with_capacity(ROWS);
        lines.push(format!(" PC=0x{:04X}{}", pc, if user_mode { " [U]" } else { "" }));
        lines.push(format!(" Mode: {}", if user_mode { "RAM" } else { "ROM" }));
        lines.push(format!(
            " Flags: {}{}{}{}",
            if flags.z { 'Z' } else { '.' },
            if flags.c { 'C' } else { '.' },
            if flags.v { 'V' } else { '.' },
            if flags.s { 'S' } else { '.' }
        ));
        lines.push(String::new());
        for i in 1..16u16 {
            lines.push(format!(
                " {:>4} = 0x{:04X}",
                ABI_NAMES[i as usize],
                regs.get(i).unwrap_or(0)
            ));
        }
        lines.push(String::new());
        if paused {
            lines.push(" [PAUSED]".to_string());
            lines.push(" F5: Resume".to_string());
            lines.push(" F6: Step".to_string());
            lines.push(" F7: Cycle=0".to_string());
        }
        while lines.len() < ROWS {
            lines.push(String::new());
        }

        if let Some(out) = self.out.as_mut() {
            for (i, line) in lines.iter().take(ROWS).enumerate() {
                let _ = write!(
                    out,
                    "{}{:<width$}",
                    cursor::Goto((COLS + 3) as u16, (i + 2) as u16),
                    line,
                    width = COLS_STATUS
                );
            }
            let perf = format!(" CPI: {:.4}    Elapsed cycles: {}", cpi, elapsed);
            let _ = write!(
                out,
                "{}{:<width$}",
                cursor::Goto(2, (ROWS + 3) as u16),
                perf,
                width = COLS + COLS_STATUS + 1
            );
        }
    }

    /// Render the screen model to the host terminal.
    pub fn flush(&mut self) {
        let chars = &self.chars;
        let row_colors = &self.row_colors;
        if let Some(out) = self.out.as_mut() {
            for row in 0..ROWS {
                let _ = write!(out, "{}", cursor::Goto(2, (row + 2) as u16));
                let _ = row_colors[row].write_fg(out);
                for &byte in chars[row].iter() {
                    let printable = if byte < b' ' || byte > b'~' { b' ' } else { byte };
                    let _ = out.write_all(&[printable]);
                }
            }
            let _ = write!(out, "{}", color::Fg(color::Reset));
            if self.cursor_blink {
                // Park the host cursor on the emulated one, in the pen color
                let _ = self.cursor_color.write_fg(out);
                let _ = write!(
                    out,
                    "{}{}",
                    cursor::Goto((self.cur_col + 2) as u16, (self.cur_row + 2) as u16),
                    cursor::Show
                );
            } else {
                let _ = write!(out, "{}", cursor::Hide);
            }
            let _ = out.flush();
        } else {
            let _ = io::stdout().flush();
        }
    }

    /// Drain host keystrokes into the input queue, translating function
    /// keys into emulator controls and special keys into the fixed
    /// byte-code table.
    pub fn update_input(&mut self) {
        loop {
            let key = match &mut self.input {
                Input::Screen(keys) => match keys.next() {
                    Some(Ok(key)) => key,
                    _ => break,
                },
                Input::Raw(reader) => {
                    let mut buf = [0u8; 64];
                    match reader.read(&mut buf) {
                        Ok(n) if n > 0 => {
                            for &byte in &buf[..n] {
                                if byte <= 0x7F {
                                    self.input_buffer.push_back(byte);
                                }
                            }
                            continue;
                        }
                        _ => break,
                    }
                }
            };
            self.handle_key(key);
        }
    }

    fn handle_key(&mut self, key: Key) {
        match key {
            Key::F(5) => {
                // Pause/unpause the emulator
                let paused = self.state.paused();
                self.state.set_paused(!paused);
                self.state.single_step.store(false, Ordering::SeqCst);
            }
            Key::F(6) => {
                // Execute one instruction; only works while paused
                if self.state.paused() {
                    self.state.single_step.store(true, Ordering::SeqCst);
                    self.state.set_paused(false);
                }
            }
            Key::F(7) => {
                // Reset the cycle counter; only works while paused
                if self.state.paused() {
                    self.state.elapsed_cycles.store(0, Ordering::SeqCst);
                }
            }
            Key::Ctrl('c') => exit::request_exit(),
            Key::Backspace => self.input_buffer.push_back(0x08),
            Key::PageUp => self.input_buffer.push_back(0x0B),
            Key::PageDown => self.input_buffer.push_back(0x0C),
            Key::Home => self.input_buffer.push_back(0x0D),
            Key::Insert => self.input_buffer.push_back(0x0E),
            Key::End | Key::Esc => self.input_buffer.push_back(0x1B),
            Key::Left => self.input_buffer.push_back(0x1C),
            Key::Right => self.input_buffer.push_back(0x1D),
            Key::Down => self.input_buffer.push_back(0x1E),
            Key::Up => self.input_buffer.push_back(0x1F),
            Key::Delete => self.input_buffer.push_back(0x7F),
            Key::F(n @ 1..=4) => self.input_buffer.push_back(0x0E + n),
            Key::F(n @ 8..=12) => self.input_buffer.push_back(0x0E + n),
            Key::Char(c) => {
                // Multi-byte characters are dropped
                if c.is_ascii() {
                    self.input_buffer.push_back(c as u8);
                }
            }
            _ => {}
        }
    }

    /// Pop one input byte, or 0 when the queue is empty.
    pub fn get_input(&mut self) -> u8 {
        self.update_input();
        self.input_buffer.pop_front().unwrap_or(0)
    }

    /// Restore the host terminal. Called from every exit path.
    pub fn destroy(&mut self) {
        self.flush();
        if let Some(mut out) = self.out.take() {
            let _ = write!(
                out,
                "{}{}{}",
                color::Fg(color::Reset),
                cursor::Show,
                cursor::Goto(1, (ROWS + 5) as u16)
            );
            let _ = out.flush();
            let _ = out.suspend_raw_mode();
        }
        if let Some(file) = self.output_file.take() {
            let _ = file.sync_all();
        }
        let _ = io::stdout().flush();
    }

    #[cfg(test)]
    pub(crate) fn inject_input(&mut self, byte: u8) {
        self.input_buffer.push_back(byte);
    }

    #[cfg(test)]
    pub(crate) fn char_at(&self, row: usize, col: usize) -> u8 {
        self.chars[row][col]
    }

    #[cfg(test)]
    pub(crate) fn row_color(&self, row: usize) -> TermColor {
        self.row_colors[row]
    }
}

fn boxed_title(title: &str, width: usize) -> String {
    let mut out = String::from("═ ");
    out.push_str(title);
    out.push(' ');
    while out.chars().count() < width {
        out.push('═');
    }
    out
}

fn size_check() -> Result<(), Exception> {
    let (width, height) = termion::terminal_size().map_err(Exception::HostIo)?;
    if (height as usize) < ROWS + 4 {
        return Err(Exception::HostIo(io::Error::new(
            io::ErrorKind::Other,
            "Terminal height too small",
        )));
    }
    if (width as usize) < COLS + COLS_STATUS + 3 {
        return Err(Exception::HostIo(io::Error::new(
            io::ErrorKind::Other,
            "Terminal width too small",
        )));
    }
    Ok(())
}
