pub mod serialport;

use crate::error::CommError;

/// Byte-level link to the HVPP adapter. The session owns exactly one of
/// these; tests substitute a scripted implementation.
pub trait DeviceInterface: Send {
    /// Send raw bytes to the adapter
    fn send(&mut self, bytes: &[u8]) -> Result<(), CommError>;

    /// Return whatever bytes have arrived, possibly none
    fn receive(&mut self) -> Result<Vec<u8>, CommError>;

    /// Discard anything still waiting in the receive buffer
    fn flush_buffers(&mut self) -> Result<(), CommError>;
}

pub use self::serialport::{BaudRate, ComPort, SerialPortDevice, available_ports};
