// Wireless serial transport
//
// The driver boards expose their command channel as a serial device
// (Bluetooth SPP / BLE-UART bridge, e.g. /dev/rfcomm0). Frames are written raw;
// the driver sends nothing back.

use std::io::{self, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info};

use super::{Connection, LinkError, Transport};

pub const DEFAULT_BAUDRATE: u32 = 115_200;

#[derive(Debug, Clone, Copy)]
pub struct SerialTransport {
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(baud_rate: u32) -> Self {
        Self { baud_rate }
    }
}

impl Transport for SerialTransport {
    type Conn = SerialConnection;

    fn open(&self, address: &str, timeout: Duration) -> Result<SerialConnection, LinkError> {
        info!("Opening {} at {} baud", address, self.baud_rate);
        let port = serialport::new(address, self.baud_rate)
            .timeout(timeout)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::Io(io::ErrorKind::TimedOut) => LinkError::ConnectTimeout {
                    address: address.to_string(),
                },
                _ => LinkError::ConnectFailed {
                    address: address.to_string(),
                    reason: e.to_string(),
                },
            })?;

        Ok(SerialConnection {
            port,
            address: address.to_string(),
        })
    }
}

pub struct SerialConnection {
    port: Box<dyn SerialPort>,
    address: String,
}

impl Connection for SerialConnection {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn is_alive(&mut self) -> bool {
        // Fails once the underlying device node is gone
        self.port.bytes_to_read().is_ok()
    }

    fn close(&mut self) {
        if let Err(e) = self.port.flush() {
            debug!("Flush on close of {} failed: {}", self.address, e);
        }
        if let Err(e) = self.port.clear(ClearBuffer::All) {
            debug!("Clear on close of {} failed: {}", self.address, e);
        }
    }
}
