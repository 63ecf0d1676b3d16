use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::chips::{ChipProfile, FuseKind, MemoryKind};
use crate::constants::{
    POLL_INTERVAL, RESPONSE_TIMEOUT, STARTUP_BANNER, STARTUP_TIMEOUT, TIMEOUT_RETRIES,
};
use crate::error::{CommError, ConnectError, HvppError, HvppResult, ValidationError};
use crate::interface::{BaudRate, DeviceInterface, SerialPortDevice};
use crate::memory::MemoryImage;
use crate::protocols::hvpp::{CommandFrame, Exchange, FuseBytes};

/// Timing knobs for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub response_timeout: Duration,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub timeout_retries: u8,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            response_timeout: RESPONSE_TIMEOUT,
            startup_timeout: STARTUP_TIMEOUT,
            poll_interval: POLL_INTERVAL,
            timeout_retries: TIMEOUT_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Receives progress of multi-page operations and may stop them between
/// pages. A page that has been requested always completes.
pub trait OperationObserver {
    fn progress(&mut self, _done: usize, _total: usize) {}

    fn cancelled(&self) -> bool {
        false
    }
}

impl OperationObserver for () {}

/// A connection to one HVPP adapter and the chip selected for it.
///
/// Every chip operation enters high-voltage programming mode, runs its
/// payload and leaves programming mode again, also when the payload failed.
pub struct ProgrammerSession {
    device: Option<Box<dyn DeviceInterface>>,
    chip: Option<&'static ChipProfile>,
    options: SessionOptions,
    firmware_info: Option<String>,
    last_operation_failed: bool,
}

impl Default for ProgrammerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgrammerSession {
    pub fn new() -> Self {
        Self::with_options(SessionOptions::default())
    }

    pub fn with_options(options: SessionOptions) -> Self {
        ProgrammerSession {
            device: None,
            chip: None,
            options,
            firmware_info: None,
            last_operation_failed: false,
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn select_chip(&mut self, chip: &'static ChipProfile) {
        info!("Selected chip {}", chip.id);
        self.chip = Some(chip);
    }

    pub fn chip(&self) -> Option<&'static ChipProfile> {
        self.chip
    }

    pub fn state(&self) -> ConnectionState {
        if self.device.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Text the firmware sent after the comma of its startup banner
    pub fn firmware_info(&self) -> Option<&str> {
        self.firmware_info.as_deref()
    }

    pub fn last_operation_failed(&self) -> bool {
        self.last_operation_failed
    }

    /// Open `port` and wait for the adapter's startup banner
    pub fn connect(&mut self, port: &str, baud: BaudRate) -> Result<(), ConnectError> {
        self.disconnect();
        let device = SerialPortDevice::new(port, baud)?;
        self.connect_with(Box::new(device))
    }

    /// Run the startup handshake on an already opened link and keep it
    pub fn connect_with(&mut self, mut device: Box<dyn DeviceInterface>) -> Result<(), ConnectError> {
        self.disconnect();

        let info = wait_for_banner(&mut *device, &self.options)?;
        info!("Programmer ready ({})", info.as_deref().unwrap_or("no firmware info"));

        self.firmware_info = info;
        self.device = Some(device);
        self.last_operation_failed = false;
        Ok(())
    }

    /// Release the serial link. Safe to call when not connected.
    pub fn disconnect(&mut self) {
        if self.device.take().is_some() {
            info!("Disconnected from programmer");
        }
        self.firmware_info = None;
    }

    fn require_chip(&self) -> HvppResult<&'static ChipProfile> {
        if self.device.is_none() {
            return Err(HvppError::NotConnected);
        }
        self.chip.ok_or(HvppError::NoChipSelected)
    }

    fn finish<T>(&mut self, result: HvppResult<T>) -> HvppResult<T> {
        self.last_operation_failed = result.is_err();
        if let Err(HvppError::Comm(CommError::IoFailure(reason))) = &result {
            warn!("Serial link failed ({}), disconnecting", reason);
            self.disconnect();
        }
        result
    }

    /// Bracket `payload` with programming mode enter/leave
    fn in_programming_mode<T>(
        &mut self,
        payload: impl FnOnce(&mut Exchange<'_>, &'static ChipProfile) -> HvppResult<T>,
    ) -> HvppResult<T> {
        let chip = self.require_chip()?;
        let options = self.options;
        let device = self
            .device
            .as_deref_mut()
            .ok_or(HvppError::NotConnected)?;

        let mut exchange = Exchange::new(
            device,
            options.response_timeout,
            options.poll_interval,
            options.timeout_retries,
        );

        let result = exchange
            .transact(&CommandFrame::enter_prog_mode(chip.part_code))
            .and_then(|reply| reply.status())
            .map_err(HvppError::from)
            .and_then(|_| {
                debug!("Entered programming mode for {}", chip.id);
                payload(&mut exchange, chip)
            });

        let link_failed = matches!(result, Err(HvppError::Comm(CommError::IoFailure(_))));
        let left = if link_failed {
            Ok(())
        } else {
            exchange
                .transact(&CommandFrame::leave_prog_mode())
                .and_then(|reply| reply.status())
        };

        let leave_link_failed = matches!(left, Err(CommError::IoFailure(_)));
        let result = match (result, left) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(HvppError::LeaveProgModeFailed(e)),
            (Err(e), left) => {
                if let Err(leave_error) = left {
                    warn!("Failed to leave programming mode: {}", leave_error);
                }
                Err(e)
            }
        };

        let result = self.finish(result);
        if leave_link_failed {
            self.disconnect();
        }
        result
    }

    pub fn read_signature(&mut self) -> HvppResult<[u8; 3]> {
        let signature = self.in_programming_mode(|exchange, _| {
            Ok(exchange.transact(&CommandFrame::read_signature())?.signature()?)
        })?;
        info!("Signature {:02X?}", signature);
        Ok(signature)
    }

    /// Read the signature and check it belongs to the selected chip
    pub fn verify_signature(&mut self) -> HvppResult<[u8; 3]> {
        let chip = self.require_chip()?;
        let signature = self.read_signature()?;
        if chip.matches_signature(signature) {
            info!("Verified signature for {}", chip.id);
            Ok(signature)
        } else {
            Err(ValidationError::SignatureMismatch {
                chip: chip.id,
                expected: chip.signatures.to_vec(),
                actual: signature,
            }
            .into())
        }
    }

    /// Low, high, extended fuse and lock byte in one exchange
    pub fn read_fuses(&mut self) -> HvppResult<FuseBytes> {
        self.in_programming_mode(|exchange, _| {
            Ok(exchange.transact(&CommandFrame::read_fuses())?.fuses()?)
        })
    }

    pub fn read_fuse(&mut self, kind: FuseKind) -> HvppResult<u8> {
        self.require_chip()?.fuse(kind)?;
        Ok(self.read_fuses()?.get(kind))
    }

    /// `LeaveProgModeFailed` means the fuse was written; read it back
    /// rather than writing again.
    pub fn write_fuse(&mut self, kind: FuseKind, value: u8) -> HvppResult<()> {
        self.require_chip()?.validate_fuse(kind, value)?;
        self.in_programming_mode(|exchange, _| {
            Ok(exchange
                .transact(&CommandFrame::write_fuse(kind, value))?
                .status()?)
        })?;
        info!("Wrote {} fuse {:#04x}", kind, value);
        Ok(())
    }

    pub fn read_calibration(&mut self) -> HvppResult<u8> {
        self.in_programming_mode(|exchange, _| {
            Ok(exchange.transact(&CommandFrame::read_calibration())?.byte()?)
        })
    }

    /// Chip erase. Irreversible; confirming with the user is up to the caller.
    pub fn erase(&mut self) -> HvppResult<()> {
        self.in_programming_mode(|exchange, _| {
            Ok(exchange.transact(&CommandFrame::chip_erase())?.status()?)
        })?;
        info!("Chip erased");
        Ok(())
    }

    /// See `write_fuse` for `LeaveProgModeFailed`
    pub fn write_lock(&mut self, value: u8) -> HvppResult<()> {
        self.require_chip()?.validate_lock(value)?;
        self.in_programming_mode(|exchange, _| {
            Ok(exchange.transact(&CommandFrame::write_lock(value))?.status()?)
        })?;
        info!("Wrote lock byte {:#04x}", value);
        Ok(())
    }

    /// Diagnostic log kept by the adapter; needs no chip
    pub fn read_log(&mut self) -> HvppResult<String> {
        let options = self.options;
        let device = self
            .device
            .as_deref_mut()
            .ok_or(HvppError::NotConnected)?;

        let result = Exchange::new(
            device,
            options.response_timeout,
            options.poll_interval,
            options.timeout_retries,
        )
        .transact(&CommandFrame::log())
        .map(|reply| reply.text())
        .map_err(HvppError::from);

        self.finish(result)
    }

    /// Read the whole flash or EEPROM page by page
    pub fn read_memory(
        &mut self,
        memory: MemoryKind,
        observer: &mut dyn OperationObserver,
    ) -> HvppResult<Vec<u8>> {
        let layout = *self.require_chip()?.memory(memory);
        if observer.cancelled() {
            return Err(HvppError::Cancelled);
        }
        let page_bytes = layout.page_size as usize * memory.unit_bytes();
        let total_pages = layout.total_bytes as usize / page_bytes;
        info!(
            "Reading {} ({} pages of {} bytes)",
            memory.name(),
            total_pages,
            page_bytes
        );

        self.in_programming_mode(|exchange, _| {
            let mut data = Vec::with_capacity(layout.total_bytes as usize);
            observer.progress(0, total_pages);

            for page in 0..total_pages as u16 {
                if observer.cancelled() {
                    return Err(HvppError::Cancelled);
                }
                let frame = CommandFrame::read_page(memory, layout.page_size, page);
                data.extend(exchange.transact(&frame)?.page(page)?);
                observer.progress(page as usize + 1, total_pages);
            }

            Ok(data)
        })
    }

    /// Program the bytes present in `image`, page segment by page segment
    pub fn write_memory(
        &mut self,
        memory: MemoryKind,
        image: &MemoryImage,
        observer: &mut dyn OperationObserver,
    ) -> HvppResult<()> {
        let layout = *self.require_chip()?.memory(memory);
        if image.is_empty() {
            return Err(HvppError::FirmwareError(
                "HEX file contains no data".to_owned(),
            ));
        }
        image.check_fits(memory, layout.total_bytes)?;
        if observer.cancelled() {
            return Err(HvppError::Cancelled);
        }

        let unit = memory.unit_bytes();
        let page_bytes = layout.page_size as usize * unit;
        let segments = image.page_segments(page_bytes, unit);
        let total_pages = segments
            .iter()
            .map(|segment| segment.page)
            .collect::<BTreeSet<_>>()
            .len();
        info!(
            "Writing {} bytes of {} over {} pages",
            image.len(),
            memory.name(),
            total_pages
        );

        self.in_programming_mode(|exchange, _| {
            let mut done = 0;
            let mut current_page = None;
            observer.progress(0, total_pages);

            for segment in &segments {
                if current_page != Some(segment.page) {
                    if current_page.is_some() {
                        done += 1;
                        observer.progress(done, total_pages);
                    }
                    if observer.cancelled() {
                        return Err(HvppError::Cancelled);
                    }
                    current_page = Some(segment.page);
                }

                let offset = u8::try_from(segment.offset).map_err(|_| {
                    HvppError::FirmwareError(format!("Page offset {} too large", segment.offset))
                })?;
                let length = u8::try_from(segment.data.len() / unit).map_err(|_| {
                    HvppError::FirmwareError(format!(
                        "Segment of {} bytes too large",
                        segment.data.len()
                    ))
                })?;

                let frame =
                    CommandFrame::write_page(memory, layout.page_size, segment.page, offset, length);
                exchange.write_page(&frame, &segment.data)?;
            }

            observer.progress(total_pages, total_pages);
            Ok(())
        })
    }
}

fn wait_for_banner(
    device: &mut dyn DeviceInterface,
    options: &SessionOptions,
) -> Result<Option<String>, ConnectError> {
    let io_failed = |e: CommError| ConnectError::HandshakeFailed(e.to_string());

    device.flush_buffers().map_err(io_failed)?;
    info!("Waiting for programmer startup message...");

    let deadline = Instant::now() + options.startup_timeout;
    let mut received = String::new();
    let mut pending = String::new();

    while Instant::now() < deadline {
        let chunk = device.receive().map_err(io_failed)?;
        if chunk.is_empty() {
            thread::sleep(options.poll_interval);
            continue;
        }
        let text = String::from_utf8_lossy(&chunk).replace('\0', "");
        received.push_str(&text);
        pending.push_str(&text);

        while let Some(end) = pending.find('\n') {
            let line: String = pending.drain(..=end).collect();
            let line = line.trim();
            if let Some(rest) = line.strip_prefix(STARTUP_BANNER) {
                let info = rest
                    .strip_prefix(',')
                    .map(|info| info.trim().to_owned())
                    .filter(|info| !info.is_empty());
                return Ok(info);
            }
            if !line.is_empty() {
                warn!("Unexpected startup line {:?}", line);
            }
        }
    }

    Err(ConnectError::HandshakeFailed(format!(
        "Programmer did not send its startup message. Received: {:?}",
        received.trim()
    )))
}
