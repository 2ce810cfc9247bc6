pub mod manager;
pub mod models;
pub mod programmer;
pub mod watchdog;

pub use manager::DeviceManager;
pub use models::*;
pub use programmer::Programmer;
pub use watchdog::{ConnectionWatchdog, LivenessProbe, WatchdogConfig, WatchdogState};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device not found")]
    NotFound,

    #[error("Device already connected on {0}")]
    AlreadyConnected(String),

    #[error("Device not connected")]
    NotConnected,

    #[error("Invalid device configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Serial communication error: {0}")]
    Serial(#[from] crate::serial::SerialError),
}

pub type Result<T> = std::result::Result<T, DeviceError>;
