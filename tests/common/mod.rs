#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hvppman::chips::ChipProfile;
use hvppman::error::CommError;
use hvppman::interface::DeviceInterface;
use hvppman::protocols::hvpp::crc16;
use hvppman::{Chip, MemoryKind, ProgrammerSession, SessionOptions};

pub const BANNER: &[u8] = b"HVPP Configurator started, fw 1.2\r\n";

pub fn fast_options() -> SessionOptions {
    SessionOptions {
        response_timeout: Duration::from_millis(200),
        startup_timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(1),
        timeout_retries: 1,
    }
}

struct PageWrite {
    memory: MemoryKind,
    address: usize,
    expected: usize,
    received: Vec<u8>,
}

/// Emulates the adapter firmware and a chip behind it
pub struct FakeAdapter {
    pub signature: [u8; 3],
    pub fuses: [u8; 4],
    pub calibration: u8,
    pub flash: Vec<u8>,
    pub eeprom: Vec<u8>,
    pub corrupt_crc: bool,
    /// Every command received, as ASCII. Page data is not included.
    pub commands: Vec<String>,
    overrides: Vec<(String, Vec<u8>)>,
    fail_io_on: Option<String>,
    page_write: Option<PageWrite>,
}

impl FakeAdapter {
    pub fn new(profile: &ChipProfile) -> Self {
        FakeAdapter {
            signature: profile.signature(),
            fuses: [
                profile.low_fuse.default,
                profile.high_fuse.default,
                profile.extended_fuse.map(|f| f.default).unwrap_or(0xFF),
                profile.lock.default,
            ],
            calibration: 0xA5,
            flash: (0..profile.flash.total_bytes).map(|i| (i % 251) as u8).collect(),
            eeprom: (0..profile.eeprom.total_bytes).map(|i| (i % 13) as u8).collect(),
            corrupt_crc: false,
            commands: Vec::new(),
            overrides: Vec::new(),
            fail_io_on: None,
            page_write: None,
        }
    }

    /// Answer commands with opcode `opcode` with `reply` instead
    pub fn reply_with(&mut self, opcode: &str, reply: &[u8]) {
        self.overrides.push((opcode.to_owned(), reply.to_vec()));
    }

    /// Never answer commands with opcode `opcode`
    pub fn silent_on(&mut self, opcode: &str) {
        self.reply_with(opcode, b"");
    }

    /// Fail the serial write of commands with opcode `opcode`
    pub fn fail_io_on(&mut self, opcode: &str) {
        self.fail_io_on = Some(opcode.to_owned());
    }

    pub fn opcodes(&self) -> Vec<&str> {
        self.commands.iter().map(|c| &c[..2]).collect()
    }

    fn memory_mut(&mut self, memory: MemoryKind) -> &mut Vec<u8> {
        match memory {
            MemoryKind::Flash => &mut self.flash,
            MemoryKind::Eeprom => &mut self.eeprom,
        }
    }

    fn handle(&mut self, bytes: &[u8]) -> Result<Vec<u8>, CommError> {
        if self.page_write.is_some() {
            return Ok(self.receive_page_data(bytes));
        }

        let command = String::from_utf8_lossy(bytes).into_owned();
        self.commands.push(command.clone());
        let opcode = &command[..2];

        if self.fail_io_on.as_deref() == Some(opcode) {
            return Err(CommError::IoFailure("device unplugged".to_owned()));
        }
        if let Some((_, reply)) = self.overrides.iter().find(|(op, _)| op == opcode) {
            return Ok(reply.clone());
        }

        let reply = match opcode {
            "00" | "07" => {
                if opcode == "07" {
                    self.flash.iter_mut().for_each(|b| *b = 0xFF);
                    self.eeprom.iter_mut().for_each(|b| *b = 0xFF);
                    self.fuses[3] = 0xFF;
                }
                "0\r\n".to_owned()
            }
            "01" => format!(
                "{:02X}{:02X}{:02X}\r\n",
                self.signature[0], self.signature[1], self.signature[2]
            ),
            "02" => format!(
                "{:02X} {:02X} {:02X} {:02X}\r\n",
                self.fuses[0], self.fuses[1], self.fuses[2], self.fuses[3]
            ),
            "03" | "04" | "05" | "06" => {
                let index = opcode.parse::<usize>().unwrap_or(3) - 3;
                self.fuses[index] = u8::from_str_radix(&command[2..4], 16).unwrap();
                "0\r\n".to_owned()
            }
            "08" => format!("{:02X}\r\n", self.calibration),
            "09" => return Ok(self.read_page(&command)),
            "10" => {
                self.start_page_write(&command);
                "+\r\n".to_owned()
            }
            "97" => "pages written: 0\r\n".to_owned(),
            "99" => "0\r\n".to_owned(),
            _ => "1 unknown command\r\n".to_owned(),
        };
        Ok(reply.into_bytes())
    }

    fn decode_page(command: &str) -> (MemoryKind, usize, usize) {
        let field = |range: std::ops::Range<usize>| usize::from_str_radix(&command[range], 16).unwrap();
        let page_size = field(2..4);
        let page = field(4..8);
        let memory = if field(8..10) == 1 {
            MemoryKind::Flash
        } else {
            MemoryKind::Eeprom
        };
        let page_bytes = page_size * memory.unit_bytes();
        (memory, page_bytes, page * page_bytes)
    }

    fn read_page(&mut self, command: &str) -> Vec<u8> {
        let (memory, page_bytes, address) = Self::decode_page(command);
        let mut data = self.memory_mut(memory)[address..address + page_bytes].to_vec();
        let mut crc = crc16(&data);
        if self.corrupt_crc {
            crc ^= 0x0101;
        }
        data.extend(crc.to_le_bytes());
        data
    }

    fn start_page_write(&mut self, command: &str) {
        let (memory, _, page_address) = Self::decode_page(command);
        let offset = usize::from_str_radix(&command[10..12], 16).unwrap();
        let length = usize::from_str_radix(&command[12..14], 16).unwrap();
        self.page_write = Some(PageWrite {
            memory,
            address: page_address + offset,
            expected: length * memory.unit_bytes(),
            received: Vec::new(),
        });
    }

    fn receive_page_data(&mut self, bytes: &[u8]) -> Vec<u8> {
        let Some(mut write) = self.page_write.take() else {
            return Vec::new();
        };
        write.received.extend_from_slice(bytes);
        if write.received.len() < write.expected + 2 {
            self.page_write = Some(write);
            return Vec::new();
        }

        let (data, crc) = write.received.split_at(write.expected);
        if u16::from_le_bytes([crc[0], crc[1]]) != crc16(data) {
            return b"1 crc error\r\n".to_vec();
        }
        let address = write.address;
        self.memory_mut(write.memory)[address..address + data.len()].copy_from_slice(data);
        b"0\r\n".to_vec()
    }
}

/// Serial link to a `FakeAdapter`. Replies are held back while the gate is
/// closed.
pub struct ScriptedDevice {
    adapter: Arc<Mutex<FakeAdapter>>,
    banner: Option<Vec<u8>>,
    input: Vec<u8>,
    gate: Arc<AtomicBool>,
}

impl ScriptedDevice {
    pub fn new(adapter: Arc<Mutex<FakeAdapter>>, banner: Option<&[u8]>) -> Self {
        ScriptedDevice {
            adapter,
            banner: banner.map(|b| b.to_vec()),
            input: Vec::new(),
            gate: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn gate(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.gate)
    }
}

impl DeviceInterface for ScriptedDevice {
    fn send(&mut self, bytes: &[u8]) -> Result<(), CommError> {
        let reply = self.adapter.lock().unwrap().handle(bytes)?;
        self.input.extend(reply);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, CommError> {
        if !self.gate.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        if !self.input.is_empty() {
            // Hand replies over in small chunks like a real UART would
            let take = self.input.len().min(7);
            return Ok(self.input.drain(..take).collect());
        }
        Ok(self.banner.take().unwrap_or_default())
    }

    fn flush_buffers(&mut self) -> Result<(), CommError> {
        self.input.clear();
        Ok(())
    }
}

pub struct Harness {
    pub session: ProgrammerSession,
    pub adapter: Arc<Mutex<FakeAdapter>>,
    pub gate: Arc<AtomicBool>,
}

impl Harness {
    pub fn adapter(&self) -> std::sync::MutexGuard<'_, FakeAdapter> {
        self.adapter.lock().unwrap()
    }
}

/// Connected session with `chip` selected
pub fn connected(chip: Chip) -> Harness {
    connected_with(chip, |_| {})
}

pub fn connected_with(chip: Chip, setup: impl FnOnce(&mut FakeAdapter)) -> Harness {
    let mut adapter = FakeAdapter::new(chip.profile());
    setup(&mut adapter);
    let adapter = Arc::new(Mutex::new(adapter));

    let device = ScriptedDevice::new(Arc::clone(&adapter), Some(BANNER));
    let gate = device.gate();

    let mut session = ProgrammerSession::with_options(fast_options());
    session.select_chip(chip.profile());
    session.connect_with(Box::new(device)).unwrap();

    Harness {
        session,
        adapter,
        gate,
    }
}
