//! Connection liveness monitor.
//!
//! A pulled cable or a powered-off programmer often produces no read or
//! write error on its own. The watchdog polls the link and reports the loss
//! exactly once.
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::serial::reader::SharedLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    /// Delay before the first check, leaving room for the connect handshake.
    pub grace_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self { grace_ms: 2000, poll_interval_ms: 50 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Armed = 0,
    Monitoring = 1,
    /// Loss detected and reported. Terminal.
    Fired = 2,
    /// Cancelled by an orderly disconnect. Terminal.
    Stopped = 3,
}

impl WatchdogState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WatchdogState::Armed,
            1 => WatchdogState::Monitoring,
            2 => WatchdogState::Fired,
            _ => WatchdogState::Stopped,
        }
    }
}

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self) -> bool;
}

/// Checks the port itself and the reader's I/O failure flag.
pub struct LinkProbe {
    pub link: SharedLink,
    pub io_failed: Arc<AtomicBool>,
}

#[async_trait]
impl LivenessProbe for LinkProbe {
    async fn is_alive(&self) -> bool {
        if self.io_failed.load(Ordering::SeqCst) {
            return false;
        }
        self.link.lock().await.io.is_alive()
    }
}

pub struct ConnectionWatchdog {
    state: Arc<AtomicU8>,
    stop_tx: mpsc::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionWatchdog {
    /// Starts monitoring. `on_lost` runs once, on the watchdog task, when the probe fails.
    pub fn spawn<P, F, Fut>(port_name: String, config: WatchdogConfig, probe: P, on_lost: F) -> Self
    where
        P: LivenessProbe + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let state = Arc::new(AtomicU8::new(WatchdogState::Armed as u8));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let handle = tokio::spawn(watchdog_loop(port_name, config, probe, state.clone(), stop_rx, on_lost));
        Self { state, stop_tx, handle: Some(handle) }
    }

    pub fn state(&self) -> WatchdogState {
        WatchdogState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Asks the task to stop without waiting for it.
    pub fn cancel(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Cancels monitoring. Safe to call from inside `on_lost`.
    pub async fn stop(&mut self) {
        self.cancel();
        if let Some(handle) = self.handle.take() {
            // After firing, the task is the one calling us; don't wait on ourselves.
            if self.state() != WatchdogState::Fired {
                let _ = tokio::time::timeout(Duration::from_secs(1), handle).await;
            }
        }
    }
}

async fn watchdog_loop<P, F, Fut>(
    port_name: String,
    config: WatchdogConfig,
    probe: P,
    state: Arc<AtomicU8>,
    mut stop_rx: mpsc::Receiver<()>,
    on_lost: F,
) where
    P: LivenessProbe,
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    use tokio::select;

    let set = |s: WatchdogState| state.store(s as u8, Ordering::SeqCst);

    select! {
        _ = stop_rx.recv() => { set(WatchdogState::Stopped); return; }
        _ = tokio::time::sleep(Duration::from_millis(config.grace_ms)) => {}
    }

    set(WatchdogState::Monitoring);
    log::debug!("Watchdog monitoring {}", port_name);
    let mut interval = tokio::time::interval(Duration::from_millis(config.poll_interval_ms.max(1)));

    loop {
        select! {
            _ = stop_rx.recv() => { set(WatchdogState::Stopped); return; }
            _ = interval.tick() => {
                if !probe.is_alive().await {
                    set(WatchdogState::Fired);
                    log::error!("Lost connection to {}", port_name);
                    on_lost().await;
                    return;
                }
            }
        }
    }
}
