//! Simulated SPD programmer used by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use spd_link::device::{Programmer, WatchdogConfig};
use spd_link::serial::{ResponseFrame, SerialError, SerialPortIO, SerialPortSettings};

pub const PORT: &str = "SIM0";
pub const EEPROM_SIZE: usize = 1024;

/// Programmer state plus the knobs tests use to misbehave.
pub struct SimState {
    pub name: String,
    pub version: i32,
    pub scan_mask: u8,
    pub rswp_support: u8,
    pub fast_clock: bool,
    pub eeprom: Vec<u8>,
    pub protected_blocks: u8,
    pub hub_registers: [u8; 128],
    pub ddr4: bool,
    pub ddr5: bool,
    pub size_code: u8,

    /// Extra reply latency per opcode.
    pub delays: HashMap<u8, Duration>,
    /// Raw bytes sent instead of the normal reply, per opcode.
    pub raw_replies: HashMap<u8, Vec<u8>>,
    /// Opcodes that get no reply at all.
    pub silent: HashSet<u8>,

    pub alive: bool,
    pub closed: bool,
    pub writes: Vec<(Instant, Vec<u8>)>,
    pub discards: usize,
    inbound: VecDeque<u8>,
    scheduled: Vec<(Instant, Vec<u8>, bool)>,
    outstanding: usize,
    pub max_outstanding: usize,
}

impl Default for SimState {
    fn default() -> Self {
        let eeprom = (0..EEPROM_SIZE).map(|i| (i % 251) as u8).collect();
        Self {
            name: "SPD Programmer".into(),
            version: 20240215,
            scan_mask: 0b0000_0101,
            rswp_support: (1 << 4) | (1 << 5),
            fast_clock: false,
            eeprom,
            protected_blocks: 0,
            hub_registers: [0; 128],
            ddr4: true,
            ddr5: false,
            size_code: 2,
            delays: HashMap::new(),
            raw_replies: HashMap::new(),
            silent: HashSet::new(),
            alive: true,
            closed: false,
            writes: Vec::new(),
            discards: 0,
            inbound: VecDeque::new(),
            scheduled: Vec::new(),
            outstanding: 0,
            max_outstanding: 0,
        }
    }
}

impl SimState {
    fn reply_payload(&mut self, cmd: &[u8]) -> Vec<u8> {
        let op = cmd[0];
        let p = &cmd[1..];
        let offset = |p: &[u8]| usize::from(u16::from_be_bytes([p[1], p[2]]));
        match op {
            b't' => vec![1],
            b'v' => self.version.to_le_bytes().to_vec(),
            b'n' if p.first() == Some(&b'?') => self.name.as_bytes().to_vec(),
            b'n' => {
                let len = usize::from(p[0]);
                self.name = String::from_utf8_lossy(&p[1..1 + len]).into_owned();
                vec![1]
            }
            b'c' if p.first() == Some(&b'?') => vec![self.fast_clock as u8],
            b'c' => {
                self.fast_clock = p[0] == 1;
                vec![1]
            }
            b'f' => vec![self.rswp_support],
            b's' => vec![self.scan_mask],
            b'r' => {
                let start = offset(p);
                let end = (start + usize::from(p[3])).min(self.eeprom.len());
                self.eeprom[start.min(end)..end].to_vec()
            }
            b'w' => {
                let at = offset(p);
                self.eeprom[at] = p[3];
                vec![1]
            }
            b'g' => {
                let at = offset(p);
                let len = usize::from(p[3]);
                self.eeprom[at..at + len].copy_from_slice(&p[4..4 + len]);
                vec![1]
            }
            b'b' => match p[2] {
                b'?' => vec![(self.protected_blocks >> p[1]) & 1],
                1 => {
                    self.protected_blocks |= 1 << p[1];
                    vec![1]
                }
                _ => {
                    self.protected_blocks = 0;
                    vec![1]
                }
            },
            b'4' => vec![self.ddr4 as u8],
            b'5' => vec![self.ddr5 as u8],
            b'a' => {
                let addr = p[0];
                let present = (0x50..=0x57).contains(&addr) && (self.scan_mask >> (addr - 0x50)) & 1 == 1;
                vec![present as u8]
            }
            b'h' => {
                let reg = usize::from(p[1] & 0x7F);
                if p[2] == b'?' {
                    vec![self.hub_registers[reg]]
                } else {
                    self.hub_registers[reg] = p[3];
                    vec![1]
                }
            }
            b'z' => vec![self.size_code],
            b'-' => {
                self.name = "SPD Programmer".into();
                self.fast_clock = false;
                vec![1]
            }
            b'd' => vec![1],
            _ => vec![0],
        }
    }

    fn respond(&mut self, cmd: &[u8]) {
        let op = cmd[0];
        if self.silent.contains(&op) {
            return;
        }
        let bytes = match self.raw_replies.get(&op) {
            Some(raw) => raw.clone(),
            None => ResponseFrame::new(self.reply_payload(cmd)).to_bytes(),
        };
        let delay = self.delays.get(&op).copied().unwrap_or(Duration::from_millis(1));
        self.outstanding += 1;
        self.max_outstanding = self.max_outstanding.max(self.outstanding);
        self.scheduled.push((Instant::now() + delay, bytes, true));
    }

    fn deliver_due(&mut self) {
        let now = Instant::now();
        let mut pending = Vec::new();
        for (at, bytes, is_reply) in self.scheduled.drain(..) {
            if at <= now {
                self.inbound.extend(bytes);
                if is_reply {
                    self.outstanding -= 1;
                }
            } else {
                pending.push((at, bytes, is_reply));
            }
        }
        self.scheduled = pending;
    }
}

/// Test-side handle onto the simulated device.
#[derive(Clone, Default)]
pub struct SimHandle(pub Arc<Mutex<SimState>>);

impl SimHandle {
    pub fn state(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    pub fn io(&self) -> Box<dyn SerialPortIO> {
        Box::new(SimIo(self.0.clone()))
    }

    /// Queues unsolicited bytes, arriving after `delay`.
    pub fn inject_after(&self, delay: Duration, bytes: &[u8]) {
        self.state().scheduled.push((Instant::now() + delay, bytes.to_vec(), false));
    }

    pub fn alert(&self, code: u8) {
        self.inject_after(Duration::ZERO, &[b'@', code]);
    }

    pub fn set_delay(&self, opcode: u8, delay: Duration) {
        self.state().delays.insert(opcode, delay);
    }

    pub fn set_raw_reply(&self, opcode: u8, bytes: &[u8]) {
        self.state().raw_replies.insert(opcode, bytes.to_vec());
    }

    pub fn set_alive(&self, alive: bool) {
        self.state().alive = alive;
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.iter().map(|(_, w)| w.clone()).collect()
    }

    pub fn write_count(&self, opcode: u8) -> usize {
        self.state().writes.iter().filter(|(_, w)| w.first() == Some(&opcode)).count()
    }
}

pub struct SimIo(Arc<Mutex<SimState>>);

#[async_trait]
impl SerialPortIO for SimIo {
    async fn send_data(&mut self, data: &[u8]) -> spd_link::serial::Result<usize> {
        let mut state = self.0.lock().unwrap();
        if state.closed || !state.alive {
            return Err(SerialError::NotConnected);
        }
        state.writes.push((Instant::now(), data.to_vec()));
        if !data.is_empty() {
            state.respond(data);
        }
        Ok(data.len())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout_ms: u64) -> spd_link::serial::Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            {
                let mut state = self.0.lock().unwrap();
                if state.closed {
                    return Err(SerialError::NotConnected);
                }
                state.deliver_due();
                if !state.inbound.is_empty() {
                    let n = buffer.len().min(state.inbound.len());
                    for slot in buffer.iter_mut().take(n) {
                        *slot = state.inbound.pop_front().unwrap();
                    }
                    return Ok(n);
                }
            }
            if Instant::now() >= deadline {
                return Err(SerialError::Timeout);
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    async fn discard_buffers(&mut self) -> spd_link::serial::Result<usize> {
        let mut state = self.0.lock().unwrap();
        state.deliver_due();
        let n = state.inbound.len();
        state.inbound.clear();
        state.discards += 1;
        Ok(n)
    }

    fn is_alive(&mut self) -> bool {
        let state = self.0.lock().unwrap();
        state.alive && !state.closed
    }

    fn close(&mut self) {
        self.0.lock().unwrap().closed = true;
    }
}

pub fn settings() -> SerialPortSettings {
    SerialPortSettings { timeout_secs: 1, ..Default::default() }
}

pub fn fast_watchdog() -> WatchdogConfig {
    WatchdogConfig { grace_ms: 50, poll_interval_ms: 10 }
}

/// Connects a programmer to a fresh simulated device.
pub async fn connect() -> (Programmer, SimHandle) {
    let sim = SimHandle::default();
    let programmer = Programmer::connect_with_io(PORT, settings(), fast_watchdog(), sim.io())
        .await
        .expect("connect to simulated programmer");
    (programmer, sim)
}
