use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Link state of one programmer connection
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}

/// Raised once when the watchdog finds the link dead
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLost {
    pub port_name: String,
    pub timestamp: DateTime<Utc>,
}

/// A discovered programmer as shown to the application
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub port_name: String,
    pub name: String,
    pub firmware_version: i32,
    pub connection_state: ConnectionState,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    pub fn new(port_name: String, name: String, firmware_version: i32) -> Self {
        Self {
            id: Uuid::new_v4(),
            port_name,
            name,
            firmware_version,
            connection_state: ConnectionState::Connected,
            last_seen: Utc::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.connection_state, ConnectionState::Connected)
    }

    pub fn update_connection_state(&mut self, state: ConnectionState) {
        self.connection_state = state;
        self.last_seen = Utc::now();
    }
}
