use tracing::{info, trace};

use super::DeviceInterface;
use crate::constants::{MAX_RESPONSE_SIZE, SERIAL_TIMEOUT_MS};

use crate::error::{CommError, ConnectError};
use std::io::{Read, Write};

pub type ComPort = String;
pub type BaudRate = u32;

/// Serial port device_interface layer
pub struct SerialPortDevice {
    serial_port: Box<dyn serialport::SerialPort>,
}

impl SerialPortDevice {
    pub fn new(port: &str, baud: BaudRate) -> Result<SerialPortDevice, ConnectError> {
        let serial_port = serialport::new(port, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::Two)
            .flow_control(serialport::FlowControl::None)
            .timeout(std::time::Duration::from_millis(SERIAL_TIMEOUT_MS))
            .open()
            .map_err(|e| ConnectError::PortUnavailable {
                port: port.to_owned(),
                reason: e.to_string(),
            })?;

        info!("Port {} opened at {} baud", port, baud);
        Ok(SerialPortDevice { serial_port })
    }
}

impl DeviceInterface for SerialPortDevice {
    fn send(&mut self, bytes: &[u8]) -> Result<(), CommError> {
        self.serial_port
            .write_all(bytes)
            .and_then(|_| self.serial_port.flush())
            .map_err(|e| CommError::IoFailure(format!("{:?}", e)))?;
        trace!("Sent bytes {:?}", bytes);
        Ok(())
    }

    fn receive(&mut self) -> Result<Vec<u8>, CommError> {
        let mut buffer = vec![0; MAX_RESPONSE_SIZE];

        let size = self
            .serial_port
            .read(&mut buffer)
            // Timeout error is fine, just continue
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    Ok(0)
                } else {
                    Err(e)
                }
            })
            .map_err(|e| CommError::IoFailure(format!("{:?}", e)))?;

        // Return a buffer with the actual length
        buffer.truncate(size);
        if size > 0 {
            trace!("Received bytes {:?}", buffer);
        }
        Ok(buffer)
    }

    fn flush_buffers(&mut self) -> Result<(), CommError> {
        self.serial_port
            .clear(serialport::ClearBuffer::Input)
            .map_err(|e| {
                CommError::IoFailure(format!("Failed to clear receive buffer, {}", e))
            })?;

        Ok(())
    }
}

/// Names of the serial ports the OS reports, sorted
pub fn available_ports() -> Result<Vec<ComPort>, ConnectError> {
    let ports = serialport::available_ports().map_err(|e| ConnectError::PortUnavailable {
        port: String::from("*"),
        reason: format!("Could not get available ports. Err {:?}", e),
    })?;

    let mut names: Vec<ComPort> = ports.into_iter().map(|port| port.port_name).collect();
    names.sort();
    Ok(names)
}
