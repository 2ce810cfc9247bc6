//! Host-side link to SPD EEPROM programmers over a serial port.
//!
//! [`serial`] holds the wire protocol: framing, the response slot, alert
//! dispatch and the port transport. [`device`] builds the programmer facade,
//! the connection watchdog and discovery on top of it.
pub mod device;
pub mod serial;

pub use device::{ConnectionState, Device, DeviceError, DeviceManager, Programmer, WatchdogConfig};
pub use serial::{AlertCode, AlertEvent, Command, SerialError, SerialPortIO, SerialPortSettings};
