//! Background reader: drains the port, splits the byte stream into frames and
//! routes them. Responses go to the [`ResponseSlot`], alerts to the
//! [`AlertDispatcher`].
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::alerts::AlertDispatcher;
use super::interface::SerialPortIO;
use super::protocol::{FrameCodec, HeaderKind, HEADER_SIZE};
use super::slot::{FillOutcome, ResponseSlot};
use super::types::{InboundFrame, LinkMetrics, ResponseFrame};
use super::SerialError;

// How long one read may hold the link before letting a writer in.
const READ_POLL_MS: u64 = 10;
const READ_CHUNK: usize = 256;

/// Accumulates raw bytes until a whole frame is available.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pops the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Option<InboundFrame> {
        if self.buffer.len() < HEADER_SIZE {
            return None;
        }
        let header = self.buffer[0];
        match FrameCodec::classify_header(header) {
            HeaderKind::Alert => {
                let code = self.buffer[1];
                self.buffer.drain(..HEADER_SIZE);
                Some(InboundFrame::Alert(code))
            }
            HeaderKind::Response => {
                let length = self.buffer[1];
                let total = HEADER_SIZE + length as usize + 1;
                if self.buffer.len() < total {
                    return None;
                }
                let frame = ResponseFrame {
                    header,
                    length,
                    payload: self.buffer[HEADER_SIZE..total - 1].to_vec(),
                    checksum: self.buffer[total - 1],
                };
                self.buffer.drain(..total);
                Some(InboundFrame::Response(frame))
            }
            HeaderKind::Unknown => {
                let next = self.buffer[1];
                self.buffer.drain(..HEADER_SIZE);
                Some(InboundFrame::Unrecognized { header, next })
            }
        }
    }

    pub fn drain_frames(&mut self) -> Vec<InboundFrame> {
        std::iter::from_fn(|| self.next_frame()).collect()
    }

    /// Drops any partial frame; returns how many bytes were thrown away.
    pub fn clear(&mut self) -> usize {
        let n = self.buffer.len();
        self.buffer.clear();
        n
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

/// The port plus whatever partial frame has been read from it.
///
/// Both halves sit behind one lock so that discarding stray input also
/// discards a half-assembled frame.
pub struct Link {
    pub io: Box<dyn SerialPortIO>,
    pub assembler: FrameAssembler,
}

impl Link {
    pub fn new(io: Box<dyn SerialPortIO>) -> Self {
        Self { io, assembler: FrameAssembler::new() }
    }
}

pub type SharedLink = Arc<Mutex<Link>>;

/// Everything the reader task touches.
#[derive(Clone)]
pub struct ReaderContext {
    pub port_name: String,
    pub link: SharedLink,
    pub slot: Arc<ResponseSlot>,
    pub alerts: Arc<AlertDispatcher>,
    pub metrics: Arc<LinkMetrics>,
    /// Set when the port reports a hard I/O failure.
    pub io_failed: Arc<AtomicBool>,
}

impl ReaderContext {
    /// Routes one frame. Never blocks on subscribers.
    pub fn route(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Response(frame) => {
                log::debug!("{} <- response, {} byte payload", self.port_name, frame.payload.len());
                match self.slot.fill(frame) {
                    FillOutcome::Delivered => {}
                    FillOutcome::Overwrote => {
                        log::warn!("{}: response overwrote an unconsumed one", self.port_name);
                    }
                    FillOutcome::Discarded => {
                        LinkMetrics::incr(&self.metrics.late_responses_discarded);
                        log::warn!("{}: discarding response with no command waiting", self.port_name);
                    }
                }
            }
            InboundFrame::Alert(code) => match self.alerts.dispatch(code) {
                Some(_) => LinkMetrics::incr(&self.metrics.alerts_dispatched),
                None => LinkMetrics::incr(&self.metrics.unknown_alerts),
            },
            InboundFrame::Unrecognized { header, next } => {
                if self.slot.is_armed() {
                    // Let the waiting command fail fast on the bad header.
                    self.slot.fill(ResponseFrame { header, length: next, payload: Vec::new(), checksum: 0 });
                } else {
                    LinkMetrics::add(&self.metrics.stray_bytes_discarded, HEADER_SIZE as u64);
                    log::warn!("{}: dropping stray bytes {:02X} {:02X}", self.port_name, header, next);
                }
            }
        }
    }
}

pub fn spawn_reader(ctx: ReaderContext, stop_rx: mpsc::Receiver<()>) -> JoinHandle<()> {
    tokio::spawn(reader_task(ctx, stop_rx))
}

pub(crate) async fn reader_task(ctx: ReaderContext, mut stop_rx: mpsc::Receiver<()>) {
    use tokio::select;

    log::debug!("Reader started on {}", ctx.port_name);
    let mut buf = [0u8; READ_CHUNK];

    loop {
        select! {
            _ = stop_rx.recv() => break,
            read_res = async {
                let mut link = ctx.link.lock().await;
                let n = link.io.read_data(&mut buf, READ_POLL_MS).await?;
                link.assembler.push(&buf[..n]);
                Ok::<_, SerialError>((n, link.assembler.drain_frames()))
            } => {
                match read_res {
                    Ok((n, frames)) => {
                        LinkMetrics::add(&ctx.metrics.bytes_received, n as u64);
                        for frame in frames {
                            ctx.route(frame);
                        }
                    }
                    Err(SerialError::Timeout) => {}
                    Err(e) => {
                        log::error!("Reader on {} stopped: {}", ctx.port_name, e);
                        ctx.io_failed.store(true, Ordering::SeqCst);
                        break;
                    }
                }
            }
        }
    }
    log::debug!("Reader stopped on {}", ctx.port_name);
}
