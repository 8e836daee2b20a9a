// Block-device "disk" at port 3. The CPU talks to it through the usual
// mailbox pair; a controller worker consumes the written words from a
// channel, executes file operations on the host filesystem and answers
// through the output register, one ACK-gated word at a time.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::debug;

use crate::config::Config;
use crate::devices::Mailbox;
use crate::errors::Exception;
use crate::exit;

/// End-of-stream / acknowledge word.
pub const ACK: u16 = 0x100;

/// Disk controller command words.
pub mod cmd {
    pub const SET_FILE_NAME: u16 = 0x110;
    pub const OPEN_FILE: u16 = 0x111;
    pub const CLOSE_FILE: u16 = 0x112;
    pub const DELETE_FILE: u16 = 0x113;
    pub const READ_FILE: u16 = 0x114;
    pub const WRITE_FILE: u16 = 0x115;
    pub const MOVE_FILE_CURSOR: u16 = 0x116;
    pub const GET_FILE_CURSOR: u16 = 0x117;
    pub const LIST_DIR: u16 = 0x118;
    pub const CD: u16 = 0x119;
    pub const MKDIR: u16 = 0x11A;
    pub const GET_INFO: u16 = 0x11B;
}

/// Byte streams are bounded by this staging buffer size.
const BUF_SIZE: usize = 0x10000;
/// Simulated device latency between commands.
const COMMAND_LATENCY: Duration = Duration::from_millis(500);

/// The CPU-facing disk peripheral.
pub struct Disk {
    mailbox: Arc<Mailbox>,
    sender: Sender<u16>,
    strict: bool,
}

impl Disk {
    /// Validate the configured root directory and spawn the controller
    /// worker.
    pub fn new(config: &Config) -> Result<Disk, Exception> {
        let root = match &config.disk_root {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(Exception::HostIo(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("Disk root directory [{}] could not be opened", dir.display()),
                    )));
                }
                dir.clone()
            }
            None => PathBuf::from("."),
        };

        let mailbox = Arc::new(Mailbox::new());
        let (sender, receiver) = unbounded();

        let controller_mailbox = Arc::clone(&mailbox);
        thread::spawn(move || {
            let mut controller = DiskController::new(receiver, controller_mailbox, root);
            if let Err(error) = controller.main_loop() {
                exit::error(&format!("Error in Disk controller:\n{}", error));
            }
        });

        Ok(Disk { mailbox, sender, strict: config.strict })
    }

    pub fn read(&self) -> u16 {
        self.mailbox.read()
    }

    pub fn write(&mut self, value: u16) -> Result<(), Exception> {
        let payload = self.mailbox.post(value, 0x1FF, 9, self.strict, "Disk")?;
        // The controller blocks on the channel instead of polling the
        // busy bit.
        let _ = self.sender.send(payload);
        Ok(())
    }
}

pub(crate) struct DiskController {
    receiver: Receiver<u16>,
    mailbox: Arc<Mailbox>,
    /// Working directory of the emulated drive.
    cwd: PathBuf,
    /// 8.3 filename selected with setFileName.
    current_file: String,
    file: Option<File>,
    #[cfg(test)]
    pub(crate) sent: Vec<u16>,
}

impl DiskController {
    pub(crate) fn new(receiver: Receiver<u16>, mailbox: Arc<Mailbox>, cwd: PathBuf) -> Self {
        DiskController {
            receiver,
            mailbox,
            cwd,
            current_file: String::new(),
            file: None,
            #[cfg(test)]
            sent: Vec::new(),
        }
    }

    fn main_loop(&mut self) -> Result<(), Exception> {
        loop {
            let command = match self.receiver.recv() {
                Ok(word) => word,
                // The emulator is shutting down
                Err(_) => return Ok(()),
            };
            {
                let _guard = exit::lock();
                self.mailbox.clear_input();
            }
            self.dispatch(command)?;
            thread::sleep(COMMAND_LATENCY);
        }
    }

    pub(crate) fn dispatch(&mut self, command: u16) -> Result<(), Exception> {
        debug!("disk command 0x{:03X}", command);
        match command {
            cmd::SET_FILE_NAME => self.set_file_name(),
            cmd::OPEN_FILE => self.open_file(),
            cmd::CLOSE_FILE => self.close_file(),
            cmd::DELETE_FILE => self.delete_file(),
            cmd::READ_FILE => self.read_file(),
            cmd::WRITE_FILE => self.write_file(),
            cmd::MOVE_FILE_CURSOR => self.move_file_cursor(),
            cmd::GET_FILE_CURSOR => self.get_file_cursor(),
            cmd::LIST_DIR => self.list_dir(),
            cmd::CD => self.cd(),
            cmd::MKDIR => self.mkdir(),
            cmd::GET_INFO => self.get_info(),
            ACK => Err(Exception::PeripheralProtocol(
                "Unexpected ACK instead of command".to_string(),
            )),
            _ => Err(Exception::PeripheralProtocol(format!(
                "Unrecognized disk command: 0x{:03X}",
                command
            ))),
        }
    }

    /// Next word from the CPU. Consuming it clears the busy word so the
    /// CPU can send the following one.
    fn recv_word(&mut self) -> Result<u16, Exception> {
        match self.receiver.recv() {
            Ok(word) => {
                let _guard = exit::lock();
                self.mailbox.clear_input();
                Ok(word & 0x1FF)
            }
            Err(_) => Err(Exception::PeripheralProtocol(
                "Disk controller input channel closed".to_string(),
            )),
        }
    }

    /// Present one word to the CPU and wait for it to be acknowledged.
    fn send_word(&mut self, word: u16) -> Result<(), Exception> {
        {
            let _guard = exit::lock();
            self.mailbox.set_output(word);
        }
        #[cfg(test)]
        self.sent.push(word);
        self.expect_ack()
    }

    fn expect_ack(&mut self) -> Result<(), Exception> {
        if self.recv_word()? != ACK {
            return Err(Exception::PeripheralProtocol(
                "Disk controller expected an ACK".to_string(),
            ));
        }
        Ok(())
    }

    /// Read an ACK-terminated byte stream into the staging buffer.
    fn read_byte_stream(&mut self) -> Result<Vec<u8>, Exception> {
        let mut buffer = Vec::new();
        loop {
            let data = self.recv_word()?;
            if data == ACK {
                return Ok(buffer);
            }
            if buffer.len() >= BUF_SIZE {
                return Err(Exception::PeripheralProtocol(
                    "Disk byte stream overflowed the staging buffer".to_string(),
                ));
            }
            buffer.push(data as u8);
        }
    }

    /// Send a byte stream, terminated by an ACK.
    fn write_byte_stream(&mut self, data: &[u8]) -> Result<(), Exception> {
        for &byte in data {
            self.send_word(u16::from(byte))?;
        }
        self.send_word(ACK)
    }

    fn read_string(&mut self) -> Result<String, Exception> {
        let bytes = self.read_byte_stream()?;
        if bytes.iter().any(|&b| b >= 0x80) {
            return Err(Exception::PeripheralProtocol(
                "Non-ascii character received".to_string(),
            ));
        }
        Ok(bytes.iter().map(|&b| b as char).collect())
    }

    fn write_string(&mut self, text: &str) -> Result<(), Exception> {
        self.write_byte_stream(text.as_bytes())
    }

    fn check_open(&self, op: &str) -> Result<(), Exception> {
        if self.file.is_none() {
            return Err(Exception::PeripheralProtocol(format!(
                "{} was called but no file was open",
                op
            )));
        }
        Ok(())
    }

    fn check_file_name(&self, op: &str) -> Result<(), Exception> {
        if self.current_file.is_empty() {
            return Err(Exception::PeripheralProtocol(format!(
                "{} was called without using setFileName first",
                op
            )));
        }
        Ok(())
    }

    fn set_file_name(&mut self) -> Result<(), Exception> {
        self.current_file = self.read_string()?;
        self.send_word(ACK)
    }

    fn open_file(&mut self) -> Result<(), Exception> {
        self.check_file_name("openFile")?;
        let path = self.cwd.join(&self.current_file);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        self.file = Some(file);
        Ok(())
    }

    fn close_file(&mut self) -> Result<(), Exception> {
        self.check_open("closeFile")?;
        self.file = None;
        Ok(())
    }

    fn delete_file(&mut self) -> Result<(), Exception> {
        self.check_file_name("deleteFile")?;
        self.file = None;
        fs::remove_file(self.cwd.join(&self.current_file))?;
        Ok(())
    }

    fn read_file(&mut self) -> Result<(), Exception> {
        self.check_open("readFile")?;
        // 2-byte size, little endian
        let lo = self.recv_word()?;
        let hi = self.recv_word()?;
        if lo > 0xFF || hi > 0xFF {
            return Err(Exception::PeripheralProtocol(
                "readFile size bytes out of range".to_string(),
            ));
        }
        let size = usize::from(lo) | usize::from(hi) << 8;
        self.expect_ack()?;

        let mut buffer = vec![0u8; size];
        let count = {
            let file = file_mut(&mut self.file, "readFile")?;
            file.read(&mut buffer)?
        };
        self.write_byte_stream(&buffer[..count])
    }

    fn write_file(&mut self) -> Result<(), Exception> {
        self.check_open("writeFile")?;
        let data = self.read_byte_stream()?;
        {
            let file = file_mut(&mut self.file, "writeFile")?;
            file.write_all(&data)?;
        }
        self.send_word(ACK)
    }

    fn move_file_cursor(&mut self) -> Result<(), Exception> {
        self.check_open("moveFileCursor")?;
        // 4-byte position, little endian
        let mut position: u64 = 0;
        for shift in [0u32, 8, 16, 24] {
            let byte = self.recv_word()?;
            if byte > 0xFF {
                return Err(Exception::PeripheralProtocol(
                    "moveFileCursor position bytes out of range".to_string(),
                ));
            }
            position |= u64::from(byte) << shift;
        }
        self.expect_ack()?;

        {
            let file = file_mut(&mut self.file, "moveFileCursor")?;
            file.seek(SeekFrom::Start(position))?;
        }
        self.send_word(ACK)
    }

    fn get_file_cursor(&mut self) -> Result<(), Exception> {
        self.check_open("getFileCursor")?;
        let position = {
            let file = file_mut(&mut self.file, "getFileCursor")?;
            file.seek(SeekFrom::Current(0))?
        };
        // 4-byte position, little endian
        for shift in [0u32, 8, 16, 24] {
            self.send_word(((position >> shift) & 0xFF) as u16)?;
        }
        self.send_word(ACK)
    }

    fn list_dir(&mut self) -> Result<(), Exception> {
        let mut result = String::new();
        for entry in fs::read_dir(&self.cwd)? {
            let entry = entry?;
            result.push_str(&entry.file_name().to_string_lossy());
            result.push('\n');
        }
        self.write_string(&result)
    }

    fn cd(&mut self) -> Result<(), Exception> {
        let dir = self.read_string()?;
        let target = self.cwd.join(&dir);
        if !target.is_dir() {
            return Err(Exception::PeripheralProtocol(format!(
                "cd: [{}] is not a directory",
                dir
            )));
        }
        self.cwd = target;
        self.send_word(ACK)
    }

    fn mkdir(&mut self) -> Result<(), Exception> {
        let dir = self.read_string()?;
        fs::create_dir(self.cwd.join(&dir))?;
        self.send_word(ACK)
    }

    fn get_info(&mut self) -> Result<(), Exception> {
        // Dummy report for the emulated drive
        let mut info = String::new();
        info.push_str("USB device OK (v.67) - EMULATED\n");
        info.push_str("Total sectors: 10000\n");
        info.push_str("Free sectors: 1234\n");
        info.push_str("File system: FAT32\n");
        self.write_string(&info)
    }
}

fn file_mut<'a>(file: &'a mut Option<File>, op: &str) -> Result<&'a mut File, Exception> {
    file.as_mut().ok_or_else(|| {
        Exception::PeripheralProtocol(format!("{} was called but no file was open", op))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    /// Build a controller whose inbound channel is pre-loaded with the
    /// words the CPU would send; the channel is closed afterwards, so any
    /// over-consumption shows up as an error.
    fn scripted(root: &Path, script: &[u16]) -> DiskController {
        let (sender, receiver) = unbounded();
        for &word in script {
            sender.send(word).unwrap();
        }
        drop(sender);
        DiskController::new(receiver, Arc::new(Mailbox::new()), root.to_path_buf())
    }

    fn name_script(name: &str, outbound_words: usize) -> Vec<u16> {
        let mut script: Vec<u16> = name.bytes().map(u16::from).collect();
        script.push(ACK);
        script.extend(std::iter::repeat(ACK).take(outbound_words));
        script
    }

    #[test]
    fn set_file_name_reads_string_and_acks() {
        let dir = TempDir::new().unwrap();
        let mut controller = scripted(dir.path(), &name_script("test.txt", 1));
        controller.dispatch(cmd::SET_FILE_NAME).unwrap();
        assert_eq!(controller.current_file, "test.txt");
        assert_eq!(controller.sent, vec![ACK]);
    }

    #[test]
    fn open_without_name_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut controller = scripted(dir.path(), &[]);
        assert!(matches!(
            controller.dispatch(cmd::OPEN_FILE),
            Err(Exception::PeripheralProtocol(_))
        ));
    }

    #[test]
    fn write_then_read_round_trips_through_the_file() {
        let dir = TempDir::new().unwrap();

        // writeFile: stream "abc", then the controller's closing ACK
        let mut controller = scripted(dir.path(), &[0x61, 0x62, 0x63, ACK, ACK]);
        controller.current_file = "data.bin".to_string();
        controller.dispatch(cmd::OPEN_FILE).unwrap();
        controller.dispatch(cmd::WRITE_FILE).unwrap();
        assert_eq!(fs::read(dir.path().join("data.bin")).unwrap(), b"abc");
        assert_eq!(controller.sent, vec![ACK]);

        // readFile on a fresh controller: size 3, ACK, then one ACK per
        // outbound word (3 bytes + closing ACK)
        fs::write(dir.path().join("data.bin"), b"xyz").unwrap();
        let mut controller = scripted(dir.path(), &[3, 0, ACK, ACK, ACK, ACK, ACK]);
        controller.current_file = "data.bin".to_string();
        controller.dispatch(cmd::OPEN_FILE).unwrap();
        controller.dispatch(cmd::READ_FILE).unwrap();
        assert_eq!(controller.sent, vec![0x78, 0x79, 0x7A, ACK]);
    }

    #[test]
    fn short_file_streams_only_what_was_read() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("short.bin"), b"ab").unwrap();
        // Ask for 10 bytes; only 2 exist
        let mut controller = scripted(dir.path(), &[10, 0, ACK, ACK, ACK, ACK]);
        controller.current_file = "short.bin".to_string();
        controller.dispatch(cmd::OPEN_FILE).unwrap();
        controller.dispatch(cmd::READ_FILE).unwrap();
        assert_eq!(controller.sent, vec![0x61, 0x62, ACK]);
    }

    #[test]
    fn cursor_moves_and_reports_back() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("c.bin"), b"0123456789").unwrap();

        // moveFileCursor to 4, then getFileCursor
        let mut script = vec![4, 0, 0, 0, ACK, ACK]; // position + ack, outbound ack
        script.extend(std::iter::repeat(ACK).take(5)); // getFileCursor: 4 bytes + ACK
        let mut controller = scripted(dir.path(), &script);
        controller.current_file = "c.bin".to_string();
        controller.dispatch(cmd::OPEN_FILE).unwrap();
        controller.dispatch(cmd::MOVE_FILE_CURSOR).unwrap();
        controller.sent.clear();
        controller.dispatch(cmd::GET_FILE_CURSOR).unwrap();
        assert_eq!(controller.sent, vec![4, 0, 0, 0, ACK]);
    }

    #[test]
    fn delete_file_removes_it() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("gone.txt"), b"x").unwrap();
        let mut controller = scripted(dir.path(), &[]);
        controller.current_file = "gone.txt".to_string();
        controller.dispatch(cmd::DELETE_FILE).unwrap();
        assert!(!dir.path().join("gone.txt").exists());
    }

    #[test]
    fn mkdir_and_cd_change_the_working_directory() {
        let dir = TempDir::new().unwrap();
        let mut script = name_script("sub", 1); // mkdir
        script.extend(name_script("sub", 1)); // cd
        let mut controller = scripted(dir.path(), &script);
        controller.dispatch(cmd::MKDIR).unwrap();
        assert!(dir.path().join("sub").is_dir());
        controller.dispatch(cmd::CD).unwrap();
        assert_eq!(controller.cwd, dir.path().join("sub"));
    }

    #[test]
    fn cd_to_missing_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut controller = scripted(dir.path(), &name_script("nope", 0));
        assert!(matches!(
            controller.dispatch(cmd::CD),
            Err(Exception::PeripheralProtocol(_))
        ));
    }

    #[test]
    fn list_dir_reports_entries() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("only.txt"), b"x").unwrap();
        // "only.txt\n" = 9 outbound bytes + closing ACK
        let mut controller = scripted(dir.path(), &vec![ACK; 10]);
        controller.dispatch(cmd::LIST_DIR).unwrap();
        let text: String = controller
            .sent
            .iter()
            .take_while(|&&w| w != ACK)
            .map(|&w| w as u8 as char)
            .collect();
        assert_eq!(text, "only.txt\n");
    }

    #[test]
    fn ack_instead_of_command_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut controller = scripted(dir.path(), &[]);
        assert!(matches!(
            controller.dispatch(ACK),
            Err(Exception::PeripheralProtocol(_))
        ));
    }

    #[test]
    fn non_ascii_file_name_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut controller = scripted(dir.path(), &[0x80, ACK]);
        assert!(matches!(
            controller.dispatch(cmd::SET_FILE_NAME),
            Err(Exception::PeripheralProtocol(_))
        ));
    }

    #[test]
    fn controller_expects_ack_after_each_word() {
        let dir = TempDir::new().unwrap();
        // The CPU answers the controller's ACK with a stray byte
        let mut controller = scripted(dir.path(), &[0x61, ACK, 0x05]);
        assert!(matches!(
            controller.dispatch(cmd::SET_FILE_NAME),
            Err(Exception::PeripheralProtocol(_))
        ));
    }
}
