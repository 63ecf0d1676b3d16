//! Command/response protocol spoken by the HVPP adapter firmware.
//!
//! Commands are ASCII: a two digit decimal opcode followed by hex operands.
//! Text replies end with `\r\n`; a status reply is `0` on success or
//! `1 <message>` on failure. Memory pages come back as raw bytes followed by
//! a little-endian CRC-16.

use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::chips::{FuseKind, MemoryKind};
use crate::error::CommError;
use crate::interface::DeviceInterface;

const LINE_END: &[u8] = b"\r\n";
const ERROR_PREFIX: &[u8] = b"1 ";
const WRITE_PAGE_ACK: &str = "+";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HvppCommand {
    EnterProgMode = 0,
    ReadSignature = 1,
    ReadFuses = 2,
    WriteLowFuse = 3,
    WriteHighFuse = 4,
    WriteExtFuse = 5,
    WriteLock = 6,
    ChipErase = 7,
    ReadCalibration = 8,
    ReadPage = 9,
    WritePage = 10,
    Log = 97,
    LeaveProgMode = 99,
}

impl HvppCommand {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    pub fn write_fuse(kind: FuseKind) -> Self {
        match kind {
            FuseKind::Low => HvppCommand::WriteLowFuse,
            FuseKind::High => HvppCommand::WriteHighFuse,
            FuseKind::Extended => HvppCommand::WriteExtFuse,
        }
    }
}

impl fmt::Display for HvppCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HvppCommand::EnterProgMode => "enter programming mode",
            HvppCommand::ReadSignature => "read signature",
            HvppCommand::ReadFuses => "read fuses",
            HvppCommand::WriteLowFuse => "write low fuse",
            HvppCommand::WriteHighFuse => "write high fuse",
            HvppCommand::WriteExtFuse => "write extended fuse",
            HvppCommand::WriteLock => "write lock byte",
            HvppCommand::ChipErase => "chip erase",
            HvppCommand::ReadCalibration => "read calibration byte",
            HvppCommand::ReadPage => "read page",
            HvppCommand::WritePage => "write page",
            HvppCommand::Log => "read log",
            HvppCommand::LeaveProgMode => "leave programming mode",
        };
        write!(f, "{} ({:02})", name, self.opcode())
    }
}

/// How the reply to a command is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// Text up to `\r\n`
    Line,
    /// Exactly this many characters, or less if `\r\n` comes first
    Text(usize),
    /// Raw bytes, no terminator
    Binary(usize),
}

/// One outbound command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    pub command: HvppCommand,
    pub operands: String,
    pub reply: ReplyShape,
}

impl CommandFrame {
    fn new(command: HvppCommand, operands: String, reply: ReplyShape) -> Self {
        CommandFrame {
            command,
            operands,
            reply,
        }
    }

    pub fn enter_prog_mode(part_code: &str) -> Self {
        Self::new(
            HvppCommand::EnterProgMode,
            part_code.to_owned(),
            ReplyShape::Line,
        )
    }

    pub fn leave_prog_mode() -> Self {
        Self::new(HvppCommand::LeaveProgMode, String::new(), ReplyShape::Text(1))
    }

    pub fn read_signature() -> Self {
        Self::new(HvppCommand::ReadSignature, String::new(), ReplyShape::Text(6))
    }

    /// Reply is `LL HH EE KK`
    pub fn read_fuses() -> Self {
        Self::new(HvppCommand::ReadFuses, String::new(), ReplyShape::Text(11))
    }

    pub fn write_fuse(kind: FuseKind, value: u8) -> Self {
        Self::new(
            HvppCommand::write_fuse(kind),
            format!("{:02X}", value),
            ReplyShape::Line,
        )
    }

    pub fn write_lock(value: u8) -> Self {
        Self::new(
            HvppCommand::WriteLock,
            format!("{:02X}", value),
            ReplyShape::Line,
        )
    }

    pub fn chip_erase() -> Self {
        Self::new(HvppCommand::ChipErase, String::new(), ReplyShape::Line)
    }

    pub fn read_calibration() -> Self {
        Self::new(HvppCommand::ReadCalibration, String::new(), ReplyShape::Text(2))
    }

    pub fn log() -> Self {
        Self::new(HvppCommand::Log, String::new(), ReplyShape::Line)
    }

    /// `09 ss pppp tt`: page size in the memory's unit, page number, memory type
    pub fn read_page(memory: MemoryKind, page_size: u16, page: u16) -> Self {
        let data_bytes = page_size as usize * memory.unit_bytes();
        Self::new(
            HvppCommand::ReadPage,
            format!("{:02X}{:04X}{:02X}", page_size, page, memory.type_code()),
            ReplyShape::Binary(data_bytes + 2),
        )
    }

    /// `10 ss pppp tt oo ll`: offset in bytes, length in the memory's unit
    pub fn write_page(memory: MemoryKind, page_size: u16, page: u16, offset: u8, length: u8) -> Self {
        Self::new(
            HvppCommand::WritePage,
            format!(
                "{:02X}{:04X}{:02X}{:02X}{:02X}",
                page_size,
                page,
                memory.type_code(),
                offset,
                length
            ),
            ReplyShape::Line,
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{:02}{}", self.command.opcode(), self.operands).into_bytes()
    }
}

/// The bytes returned for one command, with line terminators and NULs removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub command: HvppCommand,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FuseBytes {
    pub low: u8,
    pub high: u8,
    pub extended: u8,
    pub lock: u8,
}

impl FuseBytes {
    pub fn get(&self, kind: FuseKind) -> u8 {
        match kind {
            FuseKind::Low => self.low,
            FuseKind::High => self.high,
            FuseKind::Extended => self.extended,
        }
    }
}

impl ResponseFrame {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }

    fn unexpected(&self) -> CommError {
        CommError::UnexpectedResponse {
            command: self.command.to_string(),
            response: self.text(),
        }
    }

    /// Adapter failure status, if this reply is one
    fn rejection(&self) -> Option<CommError> {
        let text = self.text();
        let message = if text == "1" {
            String::new()
        } else {
            text.strip_prefix("1 ")?.trim().to_owned()
        };
        Some(CommError::Rejected {
            command: self.command.to_string(),
            message,
        })
    }

    pub fn status(&self) -> Result<(), CommError> {
        if self.bytes == b"0" {
            return Ok(());
        }
        Err(self.rejection().unwrap_or_else(|| self.unexpected()))
    }

    fn hex_bytes<const N: usize>(&self, text: &str) -> Result<[u8; N], CommError> {
        if text.len() != N * 2 || !text.is_ascii() {
            return Err(self.unexpected());
        }
        let mut out = [0u8; N];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16)
                .map_err(|_| self.unexpected())?;
        }
        Ok(out)
    }

    fn checked_text(&self) -> Result<String, CommError> {
        match self.rejection() {
            Some(rejected) => Err(rejected),
            None => Ok(self.text()),
        }
    }

    pub fn signature(&self) -> Result<[u8; 3], CommError> {
        let text = self.checked_text()?;
        self.hex_bytes::<3>(text.trim())
    }

    pub fn byte(&self) -> Result<u8, CommError> {
        let text = self.checked_text()?;
        let text = text.trim();
        let text = text
            .strip_prefix("0x")
            .or_else(|| text.strip_prefix("0X"))
            .unwrap_or(text);
        let [value] = self.hex_bytes::<1>(text)?;
        Ok(value)
    }

    pub fn fuses(&self) -> Result<FuseBytes, CommError> {
        let text = self.checked_text()?;
        let fields: Vec<&str> = text.split(' ').collect();
        if fields.len() != 4 {
            return Err(self.unexpected());
        }

        let mut values = [0u8; 4];
        for (value, field) in values.iter_mut().zip(fields) {
            let [byte] = self.hex_bytes::<1>(field)?;
            *value = byte;
        }

        Ok(FuseBytes {
            low: values[0],
            high: values[1],
            extended: values[2],
            lock: values[3],
        })
    }

    /// Split a raw page reply into data, checking the trailing CRC
    pub fn page(&self, page: u16) -> Result<Vec<u8>, CommError> {
        if self.bytes.len() < 2 {
            return Err(self.unexpected());
        }
        let (data, crc) = self.bytes.split_at(self.bytes.len() - 2);
        let received = u16::from_le_bytes([crc[0], crc[1]]);
        let computed = crc16(data);
        if received != computed {
            return Err(CommError::ChecksumMismatch {
                page,
                received,
                computed,
            });
        }
        Ok(data.to_vec())
    }
}

/// CRC-16/XMODEM (poly 0x1021, init 0) as computed by the adapter
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn find_line_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(LINE_END.len()).position(|w| w == LINE_END)
}

fn strip_nul(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().copied().filter(|b| *b != 0).collect()
}

/// Command/response exchanges for a single operation. Holds the operation's
/// timeout retry budget.
pub(crate) struct Exchange<'a> {
    device: &'a mut dyn DeviceInterface,
    timeout: Duration,
    poll_interval: Duration,
    retries_left: u8,
}

impl<'a> Exchange<'a> {
    pub(crate) fn new(
        device: &'a mut dyn DeviceInterface,
        timeout: Duration,
        poll_interval: Duration,
        retries: u8,
    ) -> Self {
        Exchange {
            device,
            timeout,
            poll_interval,
            retries_left: retries,
        }
    }

    /// Send a command and read its reply, retrying once on timeout
    pub(crate) fn transact(&mut self, frame: &CommandFrame) -> Result<ResponseFrame, CommError> {
        loop {
            match self.transact_once(frame) {
                Err(CommError::Timeout(command)) if self.retries_left > 0 => {
                    self.retries_left -= 1;
                    warn!("No reply to {}, retrying", command);
                }
                other => return other,
            }
        }
    }

    fn transact_once(&mut self, frame: &CommandFrame) -> Result<ResponseFrame, CommError> {
        // Drop leftovers of earlier replies so they are not read as this one
        self.device.flush_buffers()?;

        let bytes = frame.encode();
        debug!("Sending {:?}", String::from_utf8_lossy(&bytes));
        self.device.send(&bytes)?;

        let response = self.read_reply(frame.command, frame.reply)?;
        trace!("Reply to {}: {:?}", frame.command, response.bytes);
        Ok(response)
    }

    pub(crate) fn send_raw(&mut self, bytes: &[u8]) -> Result<(), CommError> {
        self.device.send(bytes)
    }

    pub(crate) fn read_reply(
        &mut self,
        command: HvppCommand,
        shape: ReplyShape,
    ) -> Result<ResponseFrame, CommError> {
        let deadline = Instant::now() + self.timeout;
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let text = strip_nul(&buffer);
            let is_error_line = text.starts_with(ERROR_PREFIX);

            if !matches!(shape, ReplyShape::Binary(_)) {
                if let Some(end) = find_line_end(&buffer) {
                    return Ok(ResponseFrame {
                        command,
                        bytes: strip_nul(&buffer[..end]),
                    });
                }
            }

            match shape {
                // An error status is only complete at the line end
                ReplyShape::Text(len) if !is_error_line => {
                    if text.len() >= len {
                        return Ok(ResponseFrame {
                            command,
                            bytes: text[..len].to_vec(),
                        });
                    }
                }
                ReplyShape::Binary(len) if buffer.len() >= len => {
                    buffer.truncate(len);
                    return Ok(ResponseFrame {
                        command,
                        bytes: buffer,
                    });
                }
                _ => {}
            }

            if Instant::now() >= deadline {
                return Err(if buffer.is_empty() {
                    CommError::Timeout(command.to_string())
                } else {
                    CommError::UnexpectedResponse {
                        command: command.to_string(),
                        response: String::from_utf8_lossy(&buffer).into_owned(),
                    }
                });
            }

            let chunk = self.device.receive()?;
            if chunk.is_empty() {
                thread::sleep(self.poll_interval);
            } else {
                buffer.extend_from_slice(&chunk);
            }
        }
    }

    /// Write one page segment: command, `+` acknowledgement, data, CRC, status
    pub(crate) fn write_page(&mut self, frame: &CommandFrame, data: &[u8]) -> Result<(), CommError> {
        let ack = self.transact(frame)?;
        if ack.text() != WRITE_PAGE_ACK {
            ack.status()?;
            return Err(ack.unexpected());
        }

        self.send_raw(data)?;
        self.send_raw(&crc16(data).to_le_bytes())?;

        self.read_reply(frame.command, ReplyShape::Line)?.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply(command: HvppCommand, text: &str) -> ResponseFrame {
        ResponseFrame {
            command,
            bytes: text.as_bytes().to_vec(),
        }
    }

    #[test]
    fn encodes_ascii_opcodes() {
        assert_eq!(CommandFrame::enter_prog_mode("0328").encode(), b"000328");
        assert_eq!(CommandFrame::read_signature().encode(), b"01");
        assert_eq!(CommandFrame::read_fuses().encode(), b"02");
        assert_eq!(CommandFrame::write_fuse(FuseKind::Low, 0xE2).encode(), b"03E2");
        assert_eq!(CommandFrame::write_fuse(FuseKind::High, 0xD9).encode(), b"04D9");
        assert_eq!(CommandFrame::write_fuse(FuseKind::Extended, 0x05).encode(), b"0505");
        assert_eq!(CommandFrame::write_lock(0x3C).encode(), b"063C");
        assert_eq!(CommandFrame::chip_erase().encode(), b"07");
        assert_eq!(CommandFrame::read_calibration().encode(), b"08");
        assert_eq!(CommandFrame::log().encode(), b"97");
        assert_eq!(CommandFrame::leave_prog_mode().encode(), b"99");
    }

    #[test]
    fn encodes_page_commands() {
        let read = CommandFrame::read_page(MemoryKind::Flash, 64, 3);
        assert_eq!(read.encode(), b"0940000301");
        assert_eq!(read.reply, ReplyShape::Binary(130));

        let read = CommandFrame::read_page(MemoryKind::Eeprom, 4, 0x1F);
        assert_eq!(read.encode(), b"0904001F02");
        assert_eq!(read.reply, ReplyShape::Binary(6));

        let write = CommandFrame::write_page(MemoryKind::Flash, 128, 0x1FF, 0x10, 8);
        assert_eq!(write.encode(), b"108001FF011008");
    }

    #[test]
    fn status_replies() {
        assert!(reply(HvppCommand::ChipErase, "0").status().is_ok());
        assert_eq!(
            reply(HvppCommand::ChipErase, "1 Chip not responding").status(),
            Err(CommError::Rejected {
                command: HvppCommand::ChipErase.to_string(),
                message: "Chip not responding".to_owned(),
            })
        );
        assert!(matches!(
            reply(HvppCommand::ChipErase, "1").status(),
            Err(CommError::Rejected { .. })
        ));
        assert!(matches!(
            reply(HvppCommand::ChipErase, "OK").status(),
            Err(CommError::UnexpectedResponse { .. })
        ));
        assert!(matches!(
            reply(HvppCommand::ChipErase, "").status(),
            Err(CommError::UnexpectedResponse { .. })
        ));
    }

    #[test]
    fn parses_signature() {
        let frame = reply(HvppCommand::ReadSignature, "1E950F");
        assert_eq!(frame.signature(), Ok([0x1E, 0x95, 0x0F]));

        for bad in ["1E95", "1E950G", "1E950F00", ""] {
            assert!(matches!(
                reply(HvppCommand::ReadSignature, bad).signature(),
                Err(CommError::UnexpectedResponse { .. })
            ));
        }
        assert!(matches!(
            reply(HvppCommand::ReadSignature, "1 No chip").signature(),
            Err(CommError::Rejected { .. })
        ));
    }

    #[test]
    fn parses_fuses_and_bytes() {
        let fuses = reply(HvppCommand::ReadFuses, "62 D9 FD FF").fuses().unwrap();
        assert_eq!(
            fuses,
            FuseBytes {
                low: 0x62,
                high: 0xD9,
                extended: 0xFD,
                lock: 0xFF,
            }
        );
        assert_eq!(fuses.get(FuseKind::Extended), 0xFD);
        assert!(reply(HvppCommand::ReadFuses, "62 D9 FD").fuses().is_err());
        assert!(reply(HvppCommand::ReadFuses, "62D9FDFF").fuses().is_err());

        assert_eq!(reply(HvppCommand::ReadCalibration, "A7").byte(), Ok(0xA7));
        assert_eq!(reply(HvppCommand::ReadCalibration, "0xA7").byte(), Ok(0xA7));
        assert!(reply(HvppCommand::ReadCalibration, "A").byte().is_err());
    }

    #[test]
    fn crc_matches_xmodem() {
        assert_eq!(crc16(b""), 0x0000);
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(&[0xFF; 4]), crc16(&[0xFF, 0xFF, 0xFF, 0xFF]));
    }

    #[test]
    fn page_reply_checks_crc() {
        let data = [0x0C, 0x94, 0x34, 0x00];
        let mut bytes = data.to_vec();
        bytes.extend_from_slice(&crc16(&data).to_le_bytes());
        let frame = ResponseFrame {
            command: HvppCommand::ReadPage,
            bytes: bytes.clone(),
        };
        assert_eq!(frame.page(0), Ok(data.to_vec()));

        bytes[0] ^= 0xFF;
        let frame = ResponseFrame {
            command: HvppCommand::ReadPage,
            bytes,
        };
        assert!(matches!(
            frame.page(7),
            Err(CommError::ChecksumMismatch { page: 7, .. })
        ));
    }
}
