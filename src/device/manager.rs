use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{ConnectionState, Device, DeviceError, Programmer, Result};
use crate::serial::{list_ports, SerialPortSettings};

struct Entry {
    device: Device,
    programmer: Programmer,
}

/// Keeps track of discovered programmers and their live connections.
pub struct DeviceManager {
    settings: SerialPortSettings,
    entries: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

/// Connects to `port_name`, or `None` if no working programmer answers there.
pub async fn try_connect(settings: SerialPortSettings, port_name: String) -> Option<Programmer> {
    match Programmer::connect(settings, &port_name).await {
        Ok(programmer) => Some(programmer),
        Err(e) => {
            log::debug!("No programmer on {}: {}", port_name, e);
            None
        }
    }
}

/// Tries the given ports concurrently and returns every programmer that answered.
pub async fn find_on_ports(settings: &SerialPortSettings, ports: Vec<String>) -> Vec<Programmer> {
    let attempts = ports.into_iter().map(|port| try_connect(settings.clone(), port));
    join_all(attempts).await.into_iter().flatten().collect()
}

/// Probes every serial port on the system for a programmer.
pub async fn find_programmers(settings: &SerialPortSettings) -> crate::serial::Result<Vec<Programmer>> {
    let ports = list_ports()?;
    log::info!("Searching for programmers on {} ports", ports.len());
    Ok(find_on_ports(settings, ports).await)
}

impl DeviceManager {
    pub fn new(settings: SerialPortSettings) -> Result<Self> {
        settings.validate().map_err(|e| DeviceError::InvalidConfiguration(e.to_string()))?;
        Ok(Self { settings, entries: Arc::new(RwLock::new(HashMap::new())) })
    }

    pub fn settings(&self) -> &SerialPortSettings {
        &self.settings
    }

    /// Adopts an already-connected programmer and records its identity.
    pub async fn register(&self, programmer: Programmer) -> Result<Device> {
        if !programmer.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        if self.find_by_port(programmer.port_name()).await.is_some() {
            return Err(DeviceError::AlreadyConnected(programmer.port_name().to_string()));
        }

        let firmware_version = programmer.firmware_version().await?;
        let name = programmer.name().await?;
        let device = Device::new(programmer.port_name().to_string(), name, firmware_version);
        log::info!("Registered {} ({}) firmware {}", device.name, device.port_name, firmware_version);

        let mut entries = self.entries.write().await;
        if entries.values().any(|e| e.device.port_name == device.port_name) {
            return Err(DeviceError::AlreadyConnected(device.port_name));
        }
        entries.insert(device.id, Entry { device: device.clone(), programmer });
        Ok(device)
    }

    /// Connects to one port and registers the programmer found there.
    pub async fn connect(&self, port_name: &str) -> Result<Device> {
        if self.find_by_port(port_name).await.is_some() {
            return Err(DeviceError::AlreadyConnected(port_name.to_string()));
        }
        let programmer = Programmer::connect(self.settings.clone(), port_name).await?;
        match self.register(programmer.clone()).await {
            Ok(device) => Ok(device),
            Err(e) => {
                programmer.disconnect().await;
                Err(e)
            }
        }
    }

    /// Finds programmers on ports not already in use and registers them.
    pub async fn discover(&self) -> Result<Vec<Device>> {
        let known: Vec<String> = {
            let entries = self.entries.read().await;
            entries.values().map(|e| e.device.port_name.clone()).collect()
        };
        let ports: Vec<String> = list_ports()?.into_iter().filter(|p| !known.contains(p)).collect();

        let mut found = Vec::new();
        for programmer in find_on_ports(&self.settings, ports).await {
            match self.register(programmer.clone()).await {
                Ok(device) => found.push(device),
                Err(e) => {
                    log::warn!("Failed to register programmer on {}: {}", programmer.port_name(), e);
                    programmer.disconnect().await;
                }
            }
        }
        Ok(found)
    }

    pub async fn devices(&self) -> Vec<Device> {
        let mut entries = self.entries.write().await;
        entries.values_mut().map(|e| Self::refreshed(e).clone()).collect()
    }

    pub async fn get(&self, device_id: &Uuid) -> Option<Device> {
        let mut entries = self.entries.write().await;
        entries.get_mut(device_id).map(|e| Self::refreshed(e).clone())
    }

    pub async fn programmer(&self, device_id: &Uuid) -> Option<Programmer> {
        self.entries.read().await.get(device_id).map(|e| e.programmer.clone())
    }

    pub async fn find_by_port(&self, port_name: &str) -> Option<Uuid> {
        let entries = self.entries.read().await;
        entries.values().find(|e| e.device.port_name == port_name).map(|e| e.device.id)
    }

    /// Disconnects a programmer and forgets it.
    pub async fn disconnect(&self, device_id: &Uuid) -> Result<()> {
        let entry = self.entries.write().await.remove(device_id).ok_or(DeviceError::NotFound)?;
        entry.programmer.disconnect().await;
        log::info!("Disconnected {}", entry.device.port_name);
        Ok(())
    }

    pub async fn disconnect_all(&self) {
        let entries: Vec<Entry> = self.entries.write().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.programmer.disconnect().await;
        }
    }

    /// Drops entries whose connection has gone away; returns their ids.
    pub async fn cleanup_lost(&self) -> Vec<Uuid> {
        let mut entries = self.entries.write().await;
        let lost: Vec<Uuid> = entries
            .values()
            .filter(|e| !e.programmer.is_connected())
            .map(|e| e.device.id)
            .collect();
        for id in &lost {
            if let Some(entry) = entries.remove(id) {
                log::info!("Removed lost programmer on {}", entry.device.port_name);
            }
        }
        lost
    }

    fn refreshed(entry: &mut Entry) -> &Device {
        let state = entry.programmer.state();
        if state != entry.device.connection_state {
            entry.device.update_connection_state(state);
        } else if state == ConnectionState::Connected {
            entry.device.last_seen = chrono::Utc::now();
        }
        &entry.device
    }
}
