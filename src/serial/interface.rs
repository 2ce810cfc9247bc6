use std::io::{Read, Write};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::{Result, SerialDeviceInfo, SerialError};

/// Baud rates the programmer firmware can be built for.
pub const SUPPORTED_BAUD_RATES: [u32; 17] = [
    300, 600, 1200, 2400, 4800, 9600, 14400, 19200, 38400, 57600, 115200, 230400, 250000,
    460800, 500000, 1_000_000, 2_000_000,
];
pub const DEFAULT_BAUD_RATE: u32 = 115200;

// Per-call OS timeout; the response wait is governed by `timeout_secs`.
const PORT_IO_TIMEOUT: Duration = Duration::from_millis(1000);

/// Serial link parameters for one programmer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialPortSettings {
    pub baud_rate: u32,
    pub dtr_enable: bool,
    pub rts_enable: bool,
    /// Seconds to wait for a response before a command times out.
    pub timeout_secs: u64,
}

impl Default for SerialPortSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            dtr_enable: true,
            rts_enable: true,
            timeout_secs: 10,
        }
    }
}

impl SerialPortSettings {
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_BAUD_RATES.contains(&self.baud_rate) {
            return Err(SerialError::InvalidArgument(format!("Unsupported baud rate: {}", self.baud_rate)));
        }
        if self.timeout_secs == 0 {
            return Err(SerialError::InvalidArgument("Timeout must be at least one second".to_string()));
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| SerialError::InvalidArgument(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reads settings from a JSON file; missing keys keep their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

/// Byte-stream access to a programmer.
///
/// `SerialInterface` implements this over a real port; tests implement it
/// with a simulated device.
#[async_trait]
pub trait SerialPortIO: Send {
    /// Writes and flushes `data`.
    async fn send_data(&mut self, data: &[u8]) -> Result<usize>;

    /// Reads whatever is available, waiting at most `timeout_ms` for the
    /// first byte. Returns `SerialError::Timeout` when nothing arrived.
    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize>;

    /// Drops pending input and output; returns how many input bytes were thrown away.
    async fn discard_buffers(&mut self) -> Result<usize>;

    /// Whether the underlying device still answers at the OS level.
    fn is_alive(&mut self) -> bool;

    fn close(&mut self);
}

pub struct SerialInterface {
    port: Option<Box<dyn SerialPort>>,
    device_info: SerialDeviceInfo,
}

impl SerialInterface {
    /// Opens `port_name` with 8N1 framing and the DTR/RTS levels from `settings`.
    pub fn open(port_name: &str, settings: &SerialPortSettings) -> Result<Self> {
        settings.validate()?;

        let mut port = serialport::new(port_name, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(PORT_IO_TIMEOUT)
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(std::io::ErrorKind::NotFound) => {
                    SerialError::PortNotFound(port_name.to_string())
                }
                _ => SerialError::ConnectionFailed(format!("{}: {}", port_name, e)),
            })?;

        port.write_data_terminal_ready(settings.dtr_enable)?;
        port.write_request_to_send(settings.rts_enable)?;

        let device_info = discover_ports()
            .unwrap_or_default()
            .into_iter()
            .find(|p| p.port_name == port_name)
            .unwrap_or_else(|| SerialDeviceInfo {
                port_name: port_name.to_string(),
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            });

        log::info!("Opened {} at {} baud", port_name, settings.baud_rate);
        Ok(Self { port: Some(port), device_info })
    }

    pub fn device_info(&self) -> &SerialDeviceInfo {
        &self.device_info
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(SerialError::NotConnected)
    }
}

#[async_trait]
impl SerialPortIO for SerialInterface {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> Result<usize> {
        let port = self.port_mut()?;
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            let available = port.bytes_to_read()? as usize;
            if available > 0 {
                let want = available.min(buffer.len());
                return match port.read(&mut buffer[..want]) {
                    Ok(n) => Ok(n),
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => Err(SerialError::Timeout),
                    Err(e) => Err(SerialError::IoError(e)),
                };
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SerialError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn discard_buffers(&mut self) -> Result<usize> {
        let port = self.port_mut()?;
        let pending = port.bytes_to_read()? as usize;
        if pending > 0 || port.bytes_to_write()? > 0 {
            port.clear(ClearBuffer::All)?;
        }
        Ok(pending)
    }

    fn is_alive(&mut self) -> bool {
        match self.port.as_mut() {
            Some(port) => port.bytes_to_read().is_ok(),
            None => false,
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            log::info!("Closed {}", self.device_info.port_name);
        }
    }
}

/// Lists the serial ports a programmer could be attached to.
pub fn discover_ports() -> Result<Vec<SerialDeviceInfo>> {
    let ports = serialport::available_ports()?;
    let mut devices: Vec<SerialDeviceInfo> = ports
        .into_iter()
        .map(|port| match port.port_type {
            SerialPortType::UsbPort(usb_info) => SerialDeviceInfo {
                port_name: port.port_name,
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number,
                manufacturer: usb_info.manufacturer,
                product: usb_info.product,
            },
            _ => SerialDeviceInfo {
                port_name: port.port_name,
                vid: None,
                pid: None,
                serial_number: None,
                manufacturer: None,
                product: None,
            },
        })
        .collect();
    devices.sort_by(|a, b| a.port_name.cmp(&b.port_name));
    devices.dedup_by(|a, b| a.port_name == b.port_name);
    Ok(devices)
}

/// Port names only, deduplicated.
pub fn list_ports() -> Result<Vec<String>> {
    Ok(discover_ports()?.into_iter().map(|d| d.port_name).collect())
}
