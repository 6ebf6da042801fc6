//! Sliding send-window for one remote pipe.
//!
//! The sender may not have more than `max` unacknowledged payload bytes in
//! flight per pipe. `get` blocks until enough window is available,
//! `increase` returns credit when the peer acknowledges consumption, and
//! `dead` poisons the window so every subsequent write fails with the
//! receiver-side cause.

use crate::error::ChannelError;
use parking_lot::Mutex;
use tokio::sync::Notify;

#[derive(Debug)]
struct State {
    available: usize,
    dead: Option<String>,
}

/// Per-pipe flow-control window.
#[derive(Debug)]
pub struct PipeWindow {
    max: usize,
    state: Mutex<State>,
    notify: Notify,
}

impl PipeWindow {
    pub fn new(max: usize) -> Self {
        let max = max.max(1);
        Self {
            max,
            state: Mutex::new(State {
                available: max,
                dead: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Advertised window size.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Currently available credit.
    pub fn available(&self) -> usize {
        self.state.lock().available
    }

    /// Waits until at least `min` bytes of window are available and returns
    /// the amount available at that point. The caller sends up to that much
    /// and then calls `decrease` with what it actually consumed.
    pub async fn get(&self, min: usize) -> Result<usize, ChannelError> {
        let min = min.clamp(1, self.max);
        loop {
            let notified = self.notify.notified();
            {
                let state = self.state.lock();
                if let Some(cause) = &state.dead {
                    return Err(ChannelError::PipeDead {
                        cause: cause.clone(),
                    });
                }
                if state.available >= min {
                    return Ok(state.available);
                }
            }
            notified.await;
        }
    }

    /// Returns credit acknowledged by the peer.
    pub fn increase(&self, n: usize) {
        let mut state = self.state.lock();
        state.available += n;
        if state.available > self.max {
            tracing::warn!(
                "pipe window over-credited: {} > max {}",
                state.available,
                self.max
            );
            state.available = self.max;
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Consumes credit after a chunk was sent.
    pub fn decrease(&self, n: usize) {
        let mut state = self.state.lock();
        state.available = state.available.saturating_sub(n);
    }

    /// Poisons the window; every future `get` fails with `cause`.
    pub fn dead(&self, cause: &str) {
        let mut state = self.state.lock();
        if state.dead.is_none() {
            state.dead = Some(cause.to_string());
        }
        drop(state);
        self.notify.notify_waiters();
    }
}
