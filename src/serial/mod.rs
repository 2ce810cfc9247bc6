pub mod alerts;
pub mod commands;
pub mod interface;
pub mod protocol;
pub mod reader;
pub mod slot;
pub mod types;

pub use alerts::{AlertCode, AlertDispatcher, AlertEvent, SubscriptionId};
pub use interface::{list_ports, SerialInterface, SerialPortIO, SerialPortSettings};
pub use protocol::{Command, FrameCodec, FromPayload, HeaderKind};
pub use slot::{CloseReason, ResponseSlot, Ticket};
pub use types::{MetricsSnapshot, ResponseFrame};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Device is not connected")]
    NotConnected,

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost")]
    ConnectionLost,

    #[error("Communication timeout")]
    Timeout,

    #[error("Invalid response header 0x{header:02X}")]
    Framing { header: u8 },

    #[error("Response checksum error: expected 0x{expected:02X}, got 0x{actual:02X}")]
    Integrity { expected: u8, actual: u8 },

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{port} failed to execute command {command}: {source}")]
    CommandFailed {
        port: String,
        command: String,
        #[source]
        source: Box<SerialError>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    /// The underlying failure, with any `CommandFailed` wrapping removed.
    pub fn root(&self) -> &SerialError {
        match self {
            SerialError::CommandFailed { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.root(), SerialError::Timeout)
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_command_failure() {
        let err = SerialError::CommandFailed {
            port: "COM3".into(),
            command: "76".into(),
            source: Box::new(SerialError::Timeout),
        };
        assert!(err.is_timeout());
        assert!(matches!(err.root(), SerialError::Timeout));
        assert_eq!(err.to_string(), "COM3 failed to execute command 76: Communication timeout");
    }

    #[test]
    fn test_integrity_message_is_hex() {
        let err = SerialError::Integrity { expected: 0x0A, actual: 0xFF };
        assert_eq!(err.to_string(), "Response checksum error: expected 0x0A, got 0xFF");
    }
}
