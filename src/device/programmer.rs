use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use super::models::{ConnectionLost, ConnectionState};
use super::watchdog::{ConnectionWatchdog, LinkProbe, WatchdogConfig, WatchdogState};
use crate::serial::alerts::{AlertDispatcher, AlertEvent, SubscriptionId};
use crate::serial::commands::{self, I2cClock, RswpSupport};
use crate::serial::interface::{SerialInterface, SerialPortIO, SerialPortSettings};
use crate::serial::protocol::{Command, FrameCodec, FromPayload, HeaderKind};
use crate::serial::reader::{spawn_reader, Link, ReaderContext, SharedLink};
use crate::serial::slot::{CloseReason, ResponseSlot, SlotResetGuard};
use crate::serial::types::{LinkMetrics, MetricsSnapshot, ResponseFrame};
use crate::serial::{Result, SerialError};

/// Results cached per connection and dropped when the bus changes.
#[derive(Debug, Default)]
struct ProgrammerCache {
    /// Bumped on every invalidation; a result fetched across a bump is stale.
    generation: u64,
    addresses: Option<Vec<u8>>,
    rswp_support: Option<RswpSupport>,
}

struct BackgroundTasks {
    reader_stop: mpsc::Sender<()>,
    reader: JoinHandle<()>,
    watchdog: Option<ConnectionWatchdog>,
    alert_subscription: SubscriptionId,
}

struct ProgrammerInner {
    port_name: String,
    settings: SerialPortSettings,
    link: SharedLink,
    slot: Arc<ResponseSlot>,
    alerts: Arc<AlertDispatcher>,
    metrics: Arc<LinkMetrics>,
    io_failed: Arc<AtomicBool>,
    /// Held for the whole write-then-wait sequence: one command in flight.
    exchange_lock: Mutex<()>,
    state_tx: watch::Sender<ConnectionState>,
    lost_tx: broadcast::Sender<ConnectionLost>,
    lost_raised: AtomicBool,
    tasks: Mutex<Option<BackgroundTasks>>,
    cache: StdMutex<ProgrammerCache>,
}

/// A connected SPD programmer.
///
/// All traffic goes through [`Programmer::execute`], which allows a single
/// command on the wire at a time. Clones share the same connection.
#[derive(Clone)]
pub struct Programmer {
    inner: Arc<ProgrammerInner>,
}

impl Programmer {
    /// Opens `port_name` and performs the connect handshake.
    pub async fn connect(settings: SerialPortSettings, port_name: &str) -> Result<Self> {
        let interface = SerialInterface::open(port_name, &settings)?;
        Self::connect_with_io(port_name, settings, WatchdogConfig::default(), Box::new(interface)).await
    }

    /// Connects over an already-open transport.
    pub async fn connect_with_io(
        port_name: &str,
        settings: SerialPortSettings,
        watchdog_config: WatchdogConfig,
        io: Box<dyn SerialPortIO>,
    ) -> Result<Self> {
        settings.validate()?;

        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connected);
        let (lost_tx, _lost_rx) = broadcast::channel(4);
        let inner = Arc::new(ProgrammerInner {
            port_name: port_name.to_string(),
            settings,
            link: Arc::new(Mutex::new(Link::new(io))),
            slot: Arc::new(ResponseSlot::new()),
            alerts: Arc::new(AlertDispatcher::new(port_name)),
            metrics: Arc::new(LinkMetrics::default()),
            io_failed: Arc::new(AtomicBool::new(false)),
            exchange_lock: Mutex::new(()),
            state_tx,
            lost_tx,
            lost_raised: AtomicBool::new(false),
            tasks: Mutex::new(None),
            cache: StdMutex::new(ProgrammerCache::default()),
        });

        let (reader_stop, stop_rx) = mpsc::channel(1);
        let reader = spawn_reader(
            ReaderContext {
                port_name: inner.port_name.clone(),
                link: inner.link.clone(),
                slot: inner.slot.clone(),
                alerts: inner.alerts.clone(),
                metrics: inner.metrics.clone(),
                io_failed: inner.io_failed.clone(),
            },
            stop_rx,
        );

        // Devices coming and going invalidate what we know about the bus.
        let weak: Weak<ProgrammerInner> = Arc::downgrade(&inner);
        let alert_subscription = inner.alerts.subscribe(move |event: &AlertEvent| {
            if event.code.affects_bus_population() {
                if let Some(inner) = weak.upgrade() {
                    inner.invalidate_cache();
                }
            }
        });

        *inner.tasks.lock().await = Some(BackgroundTasks { reader_stop, reader, watchdog: None, alert_subscription });

        let programmer = Programmer { inner };
        match programmer.test().await {
            Ok(true) => {}
            Ok(false) => {
                programmer.inner.teardown().await;
                return Err(SerialError::ConnectionFailed(format!("{}: device failed communication test", port_name)));
            }
            Err(e) => {
                programmer.inner.teardown().await;
                return Err(SerialError::ConnectionFailed(format!("{}: {}", port_name, e)));
            }
        }

        let weak = Arc::downgrade(&programmer.inner);
        let watchdog = ConnectionWatchdog::spawn(
            programmer.inner.port_name.clone(),
            watchdog_config,
            LinkProbe { link: programmer.inner.link.clone(), io_failed: programmer.inner.io_failed.clone() },
            move || async move {
                if let Some(inner) = weak.upgrade() {
                    inner.handle_connection_lost().await;
                }
            },
        );
        if let Some(tasks) = programmer.inner.tasks.lock().await.as_mut() {
            tasks.watchdog = Some(watchdog);
        }

        log::info!("Connected to programmer on {}", port_name);
        Ok(programmer)
    }

    /// Closes the connection. Calling it again is a no-op.
    pub async fn disconnect(&self) {
        if self.is_connected() {
            log::info!("Disconnecting from {}", self.inner.port_name);
        }
        self.inner.teardown().await;
    }

    pub fn port_name(&self) -> &str {
        &self.inner.port_name
    }

    pub fn settings(&self) -> &SerialPortSettings {
        &self.inner.settings
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe_connection_lost(&self) -> broadcast::Receiver<ConnectionLost> {
        self.inner.lost_tx.subscribe()
    }

    pub fn alerts(&self) -> &AlertDispatcher {
        &self.inner.alerts
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn watchdog_state(&self) -> Option<WatchdogState> {
        let tasks = self.inner.tasks.lock().await;
        tasks.as_ref().and_then(|t| t.watchdog.as_ref()).map(|w| w.state())
    }

    /// Sends `command` and decodes the reply as `T`.
    ///
    /// Any failure comes back as `SerialError::CommandFailed` naming the port
    /// and the command bytes; `SerialError::root` gives the cause.
    pub async fn execute<T: FromPayload>(&self, command: impl Into<Command>) -> Result<T> {
        let command = command.into();
        let result = match self.inner.exchange(&command).await {
            Ok(frame) => FrameCodec::decode::<T>(&frame.payload),
            Err(e) => Err(e),
        };
        result.map_err(|source| {
            LinkMetrics::incr(&self.inner.metrics.command_failures);
            log::debug!("{}: command {} failed: {}", self.inner.port_name, command.to_hex(), source);
            SerialError::CommandFailed {
                port: self.inner.port_name.clone(),
                command: command.to_hex(),
                source: Box::new(source),
            }
        })
    }

    pub async fn test(&self) -> Result<bool> {
        self.execute(commands::TEST).await
    }

    pub async fn firmware_version(&self) -> Result<i32> {
        self.execute(commands::VERSION).await
    }

    pub async fn name(&self) -> Result<String> {
        let raw: String = self.execute(Command::new(commands::NAME).param(commands::GET)).await?;
        Ok(raw.trim_end_matches('\0').trim().to_string())
    }

    /// Stores a new device name. Returns `false` if the name was already set.
    pub async fn set_name(&self, name: &str) -> Result<bool> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SerialError::InvalidArgument("Name can't be blank".to_string()));
        }
        if !name.is_ascii() {
            return Err(SerialError::InvalidArgument("Name must be ASCII".to_string()));
        }
        if name.len() > commands::NAME_MAX_LENGTH {
            return Err(SerialError::InvalidArgument(format!(
                "Name can't be longer than {} characters",
                commands::NAME_MAX_LENGTH
            )));
        }
        if self.name().await? == name {
            return Ok(false);
        }
        let command = Command::new(commands::NAME).param(name.len() as u8).params(name.as_bytes());
        self.execute(command).await
    }

    pub async fn i2c_clock(&self) -> Result<I2cClock> {
        let fast: bool = self.execute(Command::new(commands::I2C_CLOCK).param(commands::GET)).await?;
        Ok(if fast { I2cClock::Fast } else { I2cClock::Standard })
    }

    pub async fn set_i2c_clock(&self, clock: I2cClock) -> Result<bool> {
        self.execute(Command::new(commands::I2C_CLOCK).flag(clock == I2cClock::Fast)).await
    }

    pub async fn rswp_support(&self) -> Result<RswpSupport> {
        let generation = {
            let cache = self.inner.cache();
            if let Some(cached) = cache.rswp_support {
                return Ok(cached);
            }
            cache.generation
        };
        let support = RswpSupport(self.execute(commands::RSWP_REPORT).await?);
        let mut cache = self.inner.cache();
        if cache.generation == generation {
            cache.rswp_support = Some(support);
        }
        Ok(support)
    }

    /// EEPROM addresses (0x50-0x57) that answer on the bus.
    ///
    /// Cached until the programmer reports a device attached or detached.
    pub async fn scan(&self) -> Result<Vec<u8>> {
        let generation = {
            let cache = self.inner.cache();
            if let Some(cached) = &cache.addresses {
                return Ok(cached.clone());
            }
            cache.generation
        };
        let mask: u8 = self.execute(commands::SCAN_BUS).await?;
        let addresses = commands::addresses_from_mask(mask);
        let mut cache = self.inner.cache();
        // The bus changed while the scan was on the wire.
        if cache.generation == generation {
            cache.addresses = Some(addresses.clone());
        }
        Ok(addresses)
    }

    /// Probes every non-reserved 7-bit address. Per-address failures count as absent.
    pub async fn scan_full(&self) -> Result<Vec<u8>> {
        let mut found = Vec::new();
        for address in commands::I2C_FIRST_ADDRESS..=commands::I2C_LAST_ADDRESS {
            match self.probe_address(address).await {
                Ok(true) => found.push(address),
                Ok(false) => {}
                Err(e) if matches!(e.root(), SerialError::NotConnected | SerialError::ConnectionLost) => {
                    return Err(e)
                }
                Err(e) => log::debug!("Probe of 0x{:02X} failed: {}", address, e),
            }
        }
        Ok(found)
    }

    pub async fn probe_address(&self, address: u8) -> Result<bool> {
        self.execute(Command::new(commands::PROBE_ADDRESS).param(address)).await
    }

    fn offset_command(opcode: u8, address: u8, offset: u16) -> Command {
        let [hi, lo] = offset.to_be_bytes();
        Command::new(opcode).param(address).param(hi).param(lo)
    }

    pub async fn read_byte(&self, address: u8, offset: u16) -> Result<u8> {
        self.execute(Self::offset_command(commands::READ_BYTE, address, offset).param(1)).await
    }

    pub async fn read_bytes(&self, address: u8, offset: u16, count: u8) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(SerialError::InvalidArgument("Read count must be at least 1".to_string()));
        }
        self.execute(Self::offset_command(commands::READ_BYTE, address, offset).param(count)).await
    }

    /// Reads `length` bytes from offset 0 in firmware-sized chunks.
    /// Stops early if the device returns a short chunk.
    pub async fn read_dump(&self, address: u8, length: usize) -> Result<Vec<u8>> {
        if length == 0 || length > usize::from(u16::MAX) + 1 {
            return Err(SerialError::InvalidArgument(format!("Invalid dump length {}", length)));
        }
        let mut data = Vec::with_capacity(length);
        while data.len() < length {
            let chunk = (length - data.len()).min(commands::READ_CHUNK_SIZE as usize) as u8;
            let portion = self.read_bytes(address, data.len() as u16, chunk).await?;
            let short = portion.len() < chunk as usize;
            data.extend_from_slice(&portion);
            if portion.is_empty() || short {
                break;
            }
        }
        Ok(data)
    }

    pub async fn write_byte(&self, address: u8, offset: u16, value: u8) -> Result<bool> {
        self.execute(Self::offset_command(commands::WRITE_BYTE, address, offset).param(value)).await
    }

    /// Writes only if the stored byte differs.
    pub async fn update_byte(&self, address: u8, offset: u16, value: u8) -> Result<bool> {
        match self.read_byte(address, offset).await {
            Ok(current) if current == value => return Ok(true),
            Ok(_) => {}
            Err(e) => log::debug!("Pre-write read at 0x{:04X} failed, writing anyway: {}", offset, e),
        }
        self.write_byte(address, offset, value).await
    }

    pub async fn write_page(&self, address: u8, offset: u16, data: &[u8]) -> Result<bool> {
        if data.is_empty() || data.len() > commands::PAGE_MAX_SIZE {
            return Err(SerialError::InvalidArgument(format!(
                "Page size must be between 1 and {} bytes",
                commands::PAGE_MAX_SIZE
            )));
        }
        let command = Self::offset_command(commands::WRITE_PAGE, address, offset)
            .param(data.len() as u8)
            .params(data);
        self.execute(command).await
    }

    pub async fn get_rswp(&self, address: u8, block: u8) -> Result<bool> {
        self.execute(Command::with_params(commands::RSWP, &[address, block, commands::GET])).await
    }

    pub async fn set_rswp(&self, address: u8, block: u8) -> Result<bool> {
        self.execute(Command::with_params(commands::RSWP, &[address, block, 1])).await
    }

    pub async fn clear_rswp(&self, address: u8) -> Result<bool> {
        self.execute(Command::with_params(commands::RSWP, &[address, 0, 0])).await
    }

    pub async fn detect_ddr4(&self, address: u8) -> Result<bool> {
        self.execute(Command::new(commands::DDR4_DETECT).param(address)).await
    }

    pub async fn detect_ddr5(&self, address: u8) -> Result<bool> {
        self.execute(Command::new(commands::DDR5_DETECT).param(address)).await
    }

    pub async fn read_spd5_hub(&self, address: u8, register: u8) -> Result<u8> {
        self.execute(Command::with_params(commands::SPD5_HUB, &[address, register, commands::GET])).await
    }

    pub async fn write_spd5_hub(&self, address: u8, register: u8, value: u8) -> Result<bool> {
        self.execute(Command::with_params(commands::SPD5_HUB, &[address, register, 1, value])).await
    }

    /// Raw SPD size code for the EEPROM at `address`.
    pub async fn spd_size_code(&self, address: u8) -> Result<u8> {
        self.execute(Command::new(commands::SPD_SIZE).param(address)).await
    }

    pub async fn factory_reset(&self) -> Result<bool> {
        let done: bool = self.execute(commands::FACTORY_RESET).await?;
        if done {
            log::warn!("{} reset to factory defaults", self.inner.port_name);
            self.inner.invalidate_cache();
        }
        Ok(done)
    }

    pub async fn reset_config_pins(&self) -> Result<bool> {
        self.execute(commands::RESET_CONFIG_PINS).await
    }
}

impl std::fmt::Display for Programmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.inner.port_name, self.inner.settings.baud_rate)
    }
}

impl ProgrammerInner {
    fn is_connected(&self) -> bool {
        *self.state_tx.borrow() == ConnectionState::Connected
    }

    fn cache(&self) -> std::sync::MutexGuard<'_, ProgrammerCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn invalidate_cache(&self) {
        let mut cache = self.cache();
        cache.generation = cache.generation.wrapping_add(1);
        cache.addresses = None;
        cache.rswp_support = None;
    }

    fn closed_error(&self) -> SerialError {
        if self.lost_raised.load(Ordering::SeqCst) {
            SerialError::ConnectionLost
        } else {
            SerialError::NotConnected
        }
    }

    /// One request/response round trip, under the exchange lock.
    async fn exchange(&self, command: &Command) -> Result<ResponseFrame> {
        if !self.is_connected() {
            return Err(self.closed_error());
        }
        let _exclusive = self.exchange_lock.lock().await;
        if !self.is_connected() {
            return Err(self.closed_error());
        }
        // Declared after the lock guard, so it drops (and resets the slot) first.
        let _reset = SlotResetGuard::new(&self.slot);

        let bytes = FrameCodec::encode(command);
        let ticket = {
            let mut link = self.link.lock().await;
            let stray = link.io.discard_buffers().await? + link.assembler.clear();
            if stray > 0 {
                LinkMetrics::add(&self.metrics.stray_bytes_discarded, stray as u64);
                log::debug!("{}: discarded {} stray bytes", self.port_name, stray);
            }
            let ticket = self.slot.arm();
            link.io.send_data(&bytes).await?;
            ticket
        };
        LinkMetrics::add(&self.metrics.bytes_sent, bytes.len() as u64);
        log::debug!("{} -> {}", self.port_name, command.to_hex());

        let frame = match self.slot.wait_and_take(ticket, self.settings.response_timeout()).await {
            Ok(frame) => frame,
            Err(e) => {
                if matches!(e, SerialError::Timeout) {
                    LinkMetrics::incr(&self.metrics.command_timeouts);
                    log::warn!("{}: response timeout for {}", self.port_name, command.to_hex());
                }
                return Err(e);
            }
        };

        if FrameCodec::classify_header(frame.header) != HeaderKind::Response {
            return Err(SerialError::Framing { header: frame.header });
        }
        FrameCodec::verify(&frame)?;

        LinkMetrics::incr(&self.metrics.commands_completed);
        Ok(frame)
    }

    async fn handle_connection_lost(&self) {
        if self.lost_raised.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.slot.close(CloseReason::ConnectionLost);
        let _ = self.lost_tx.send(ConnectionLost { port_name: self.port_name.clone(), timestamp: Utc::now() });
        self.teardown().await;
    }

    /// Stops background tasks and closes the port.
    async fn teardown(&self) {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.slot.close(CloseReason::Disconnected);
        let tasks = self.tasks.lock().await.take();
        if let Some(mut tasks) = tasks {
            if let Some(watchdog) = tasks.watchdog.as_mut() {
                watchdog.stop().await;
            }
            let _ = tasks.reader_stop.try_send(());
            if tokio::time::timeout(Duration::from_secs(1), &mut tasks.reader).await.is_err() {
                tasks.reader.abort();
            }
            self.alerts.unsubscribe(tasks.alert_subscription);
        }
        self.link.lock().await.io.close();
        self.invalidate_cache();
    }
}

impl Drop for ProgrammerInner {
    fn drop(&mut self) {
        // Last handle gone without a disconnect; the port closes once the reader exits.
        if let Some(tasks) = self.tasks.get_mut().take() {
            let _ = tasks.reader_stop.try_send(());
            if let Some(watchdog) = &tasks.watchdog {
                watchdog.cancel();
            }
        }
    }
}
