//! Unsolicited alert frames and their subscribers
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Alert codes the firmware is known to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlertCode {
    /// A device appeared on the I2C bus.
    SlaveDeviceAttached,
    /// A device left the I2C bus.
    SlaveDeviceDetached,
    /// Bus clock switched to fast mode.
    ClockIncreased,
    /// Bus clock switched to standard mode.
    ClockDecreased,
}

impl AlertCode {
    pub fn from_byte(code: u8) -> Option<Self> {
        match code {
            b'+' => Some(AlertCode::SlaveDeviceAttached),
            b'-' => Some(AlertCode::SlaveDeviceDetached),
            b'/' => Some(AlertCode::ClockIncreased),
            b'\\' => Some(AlertCode::ClockDecreased),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            AlertCode::SlaveDeviceAttached => b'+',
            AlertCode::SlaveDeviceDetached => b'-',
            AlertCode::ClockIncreased => b'/',
            AlertCode::ClockDecreased => b'\\',
        }
    }

    /// Whether the set of devices on the bus may have changed.
    pub fn affects_bus_population(self) -> bool {
        matches!(self, AlertCode::SlaveDeviceAttached | AlertCode::SlaveDeviceDetached)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub port_name: String,
    pub code: AlertCode,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type AlertHandler = Arc<dyn Fn(&AlertEvent) + Send + Sync>;

/// Fans alerts out to subscribers without blocking the reader.
///
/// Every handler runs on tokio's blocking pool, so a slow, blocking or
/// panicking subscriber delays neither the reader nor other subscribers.
/// Handlers are called in no particular order.
pub struct AlertDispatcher {
    port_name: String,
    handlers: RwLock<HashMap<SubscriptionId, AlertHandler>>,
    next_id: AtomicU64,
    events_tx: broadcast::Sender<AlertEvent>,
}

impl AlertDispatcher {
    pub fn new(port_name: impl Into<String>) -> Self {
        let (events_tx, _events_rx) = broadcast::channel(64);
        Self {
            port_name: port_name.into(),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events_tx,
        }
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AlertEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(id, Arc::new(handler));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.remove(&id).is_some()
    }

    /// Channel-style subscription; dropping the receiver unsubscribes.
    pub fn subscribe_events(&self) -> broadcast::Receiver<AlertEvent> {
        self.events_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.len() + self.events_tx.receiver_count()
    }

    /// Raises `code` to every subscriber. Unknown codes are dropped.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&self, code: u8) -> Option<AlertCode> {
        let Some(alert) = AlertCode::from_byte(code) else {
            log::warn!("Ignoring unknown alert code 0x{:02X} on {}", code, self.port_name);
            return None;
        };

        let event = AlertEvent {
            port_name: self.port_name.clone(),
            code: alert,
            timestamp: Utc::now(),
        };
        log::debug!("Alert {:?} on {}", alert, self.port_name);

        // Snapshot so handlers may (un)subscribe while running.
        let handlers: Vec<AlertHandler> = {
            let guard = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            guard.values().cloned().collect()
        };
        // Handlers are plain closures and may block; keep them off the async workers.
        for handler in handlers {
            let event = event.clone();
            tokio::task::spawn_blocking(move || handler(&event));
        }

        let _ = self.events_tx.send(event);
        Some(alert)
    }
}
