//! Hand-off point between the reader task and the one command in flight.
//!
//! The wire carries no request ids, so the slot tags each transaction with a
//! generation number instead. A command arms the slot and gets a [`Ticket`];
//! the reader can only deliver into an armed slot, and the frame is stamped
//! with the ticket that was armed at delivery time. A reply that shows up
//! after its command already timed out finds the slot disarmed and is
//! dropped instead of being handed to the next command.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::types::ResponseFrame;
use super::{Result, SerialError};

/// Identifies one armed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket(u64);

/// What became of a frame handed to [`ResponseSlot::fill`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillOutcome {
    Delivered,
    /// Replaced a frame nobody had taken yet.
    Overwrote,
    /// Nobody was waiting; the frame was dropped.
    Discarded,
}

/// Why a slot stopped accepting transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The link died underneath the connection.
    ConnectionLost,
    /// The connection was shut down on request.
    Disconnected,
}

impl CloseReason {
    fn to_error(self) -> SerialError {
        match self {
            CloseReason::ConnectionLost => SerialError::ConnectionLost,
            CloseReason::Disconnected => SerialError::NotConnected,
        }
    }
}

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    armed: Option<u64>,
    frame: Option<(u64, ResponseFrame)>,
    closed: Option<CloseReason>,
}

#[derive(Debug, Default)]
pub struct ResponseSlot {
    state: Mutex<SlotState>,
    notify: Notify,
}

impl ResponseSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotState> {
        // The state is plain data; a panic elsewhere can't leave it half-written.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens a new transaction, dropping anything left from the previous one.
    pub fn arm(&self) -> Ticket {
        let mut state = self.lock();
        state.generation = state.generation.wrapping_add(1);
        state.armed = Some(state.generation);
        state.frame = None;
        Ticket(state.generation)
    }

    /// Stores a frame for the armed transaction and wakes the waiter.
    pub fn fill(&self, frame: ResponseFrame) -> FillOutcome {
        let outcome = {
            let mut state = self.lock();
            match state.armed {
                _ if state.closed.is_some() => FillOutcome::Discarded,
                None => FillOutcome::Discarded,
                Some(generation) => {
                    let replaced = state.frame.replace((generation, frame)).is_some();
                    if replaced { FillOutcome::Overwrote } else { FillOutcome::Delivered }
                }
            }
        };
        if outcome != FillOutcome::Discarded {
            self.notify.notify_waiters();
        }
        outcome
    }

    fn try_take(&self, ticket: Ticket) -> Result<Option<ResponseFrame>> {
        let mut state = self.lock();
        if let Some(reason) = state.closed {
            state.armed = None;
            state.frame = None;
            return Err(reason.to_error());
        }
        match state.frame.take() {
            Some((generation, frame)) if generation == ticket.0 => {
                state.armed = None;
                Ok(Some(frame))
            }
            Some(stale) => {
                log::debug!("Dropping frame from transaction {} (waiting on {})", stale.0, ticket.0);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Waits until the reader delivers a frame for `ticket` or `timeout` runs out.
    pub async fn wait_and_take(&self, ticket: Ticket, timeout: Duration) -> Result<ResponseFrame> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(frame) = self.try_take(ticket)? {
                return Ok(frame);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                if let Some(frame) = self.try_take(ticket)? {
                    return Ok(frame);
                }
                self.reset();
                return Err(SerialError::Timeout);
            }
        }
    }

    /// Fails the waiting transaction, and every later one, with `reason`.
    ///
    /// The first reason sticks: a loss reported by the watchdog is not
    /// downgraded by the teardown that follows it.
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
        }
        self.notify.notify_waiters();
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().closed
    }

    /// Disarms and clears the slot unconditionally.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.armed = None;
        state.frame = None;
    }

    pub fn is_armed(&self) -> bool {
        self.lock().armed.is_some()
    }

    /// True when nothing is armed and no frame is pending.
    pub fn is_clear(&self) -> bool {
        let state = self.lock();
        state.armed.is_none() && state.frame.is_none()
    }
}

/// Resets the slot when dropped, so every exit from a transaction leaves it clean.
pub struct SlotResetGuard<'a> {
    slot: &'a ResponseSlot,
}

impl<'a> SlotResetGuard<'a> {
    pub fn new(slot: &'a ResponseSlot) -> Self {
        Self { slot }
    }
}

impl Drop for SlotResetGuard<'_> {
    fn drop(&mut self) {
        self.slot.reset();
    }
}
