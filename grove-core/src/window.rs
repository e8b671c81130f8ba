//! Per-peer sliding window: AIMD pacing for DatumRequest traffic.
//!
//! Additive growth on each verified Datum, halving on retry exhaustion.
//! Senders park on a `Notify` instead of polling; every success or timeout
//! frees one in-flight slot and wakes a waiter.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

pub const WINDOW_MIN: u32 = 1;
pub const WINDOW_INITIAL: u32 = 32;
pub const WINDOW_MAX: u32 = 10_000;

#[derive(Debug)]
struct WindowState {
    size: u32,
    min: u32,
    max: u32,
    inflight: u32,
}

#[derive(Debug)]
pub struct SlidingWindow {
    state: Mutex<WindowState>,
    notify: Notify,
}

impl Default for SlidingWindow {
    fn default() -> Self {
        Self::new(WINDOW_MIN, WINDOW_INITIAL, WINDOW_MAX)
    }
}

impl SlidingWindow {
    pub fn new(min: u32, initial: u32, max: u32) -> Self {
        let initial = initial.clamp(min, max);
        Self {
            state: Mutex::new(WindowState {
                size: initial,
                min,
                max,
                inflight: 0,
            }),
            notify: Notify::new(),
        }
    }

    /// Wait until an in-flight slot is free and take it.
    pub async fn acquire(&self) {
        loop {
            {
                let mut state = self.state.lock().expect("window lock");
                if state.inflight < state.size {
                    state.inflight += 1;
                    return;
                }
            }
            // notify_one stores a permit, so a release between the check
            // above and this await is not lost.
            self.notify.notified().await;
        }
    }

    /// Take a slot without waiting. Returns false when the window is full.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().expect("window lock");
        if state.inflight < state.size {
            state.inflight += 1;
            true
        } else {
            false
        }
    }

    /// A request completed and verified: free its slot, grow the window.
    pub fn on_success(&self, rtt: Duration) {
        let mut state = self.state.lock().expect("window lock");
        state.inflight = state.inflight.saturating_sub(1);
        if state.size < state.max {
            state.size += 1;
        }
        trace!(rtt_ms = rtt.as_millis() as u64, size = state.size, "window grew");
        drop(state);
        self.notify.notify_one();
    }

    /// A request timed out or failed verification: free its slot, halve the
    /// window down to the floor.
    pub fn on_timeout(&self) {
        let mut state = self.state.lock().expect("window lock");
        state.inflight = state.inflight.saturating_sub(1);
        if state.size > state.min {
            state.size = (state.size / 2).max(state.min);
        }
        trace!(size = state.size, "window halved");
        drop(state);
        self.notify.notify_one();
    }

    /// Current (size, inflight).
    pub fn snapshot(&self) -> (u32, u32) {
        let state = self.state.lock().expect("window lock");
        (state.size, state.inflight)
    }
}
