//! Frame and metrics types shared by the reader and the command path
use std::sync::atomic::{AtomicU64, Ordering};
use serde::{Serialize, Deserialize};
use super::protocol::{FrameCodec, RESPONSE_MARKER};

/// A complete inbound frame as assembled by the reader.
///
/// `header` is whatever byte opened the frame. The reader only hands
/// response-marked frames to a waiting command, but the command path
/// checks the marker again before trusting the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: u8,
    pub length: u8,
    pub payload: Vec<u8>,
    pub checksum: u8,
}

impl ResponseFrame {
    /// Builds a well-formed response around `payload`.
    pub fn new(payload: Vec<u8>) -> Self {
        let checksum = FrameCodec::checksum(&payload);
        Self { header: RESPONSE_MARKER, length: payload.len() as u8, payload, checksum }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 3);
        out.push(self.header);
        out.push(self.length);
        out.extend_from_slice(&self.payload);
        out.push(self.checksum);
        out
    }
}

/// Something the reader pulled off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Response(ResponseFrame),
    Alert(u8),
    /// Two bytes that opened with neither marker.
    Unrecognized { header: u8, next: u8 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_completed: u64,
    pub command_timeouts: u64,
    pub command_failures: u64,
    pub alerts_dispatched: u64,
    pub unknown_alerts: u64,
    pub late_responses_discarded: u64,
    pub stray_bytes_discarded: u64,
}

/// Live counters, updated from the reader task and the command path.
#[derive(Debug, Default)]
pub struct LinkMetrics {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub commands_completed: AtomicU64,
    pub command_timeouts: AtomicU64,
    pub command_failures: AtomicU64,
    pub alerts_dispatched: AtomicU64,
    pub unknown_alerts: AtomicU64,
    pub late_responses_discarded: AtomicU64,
    pub stray_bytes_discarded: AtomicU64,
}

impl LinkMetrics {
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn incr(counter: &AtomicU64) {
        Self::add(counter, 1);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            bytes_sent: get(&self.bytes_sent),
            bytes_received: get(&self.bytes_received),
            commands_completed: get(&self.commands_completed),
            command_timeouts: get(&self.command_timeouts),
            command_failures: get(&self.command_failures),
            alerts_dispatched: get(&self.alerts_dispatched),
            unknown_alerts: get(&self.unknown_alerts),
            late_responses_discarded: get(&self.late_responses_discarded),
            stray_bytes_discarded: get(&self.stray_bytes_discarded),
        }
    }
}
