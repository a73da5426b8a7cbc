//! Pin sync window: a time-boxed gate opened when an explicit bulk pin sync
//! request goes out.
//!
//! The gate is advisory. Pins arriving while it is closed are still
//! accepted (unsolicited pin traffic is normal steady-state behavior); the
//! gate only marks whether a bulk response is currently expected, for
//! logging and UI purposes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::debug;

use crate::events::CoreEvent;

/// Cancellable timed gate. Cloneable; all clones share state.
#[derive(Clone)]
pub struct SyncWindow {
    open: Arc<AtomicBool>,
    /// Bumped on every open/close so a stale timer cannot close a window
    /// reopened after it was scheduled.
    generation: Arc<AtomicU64>,
    events: broadcast::Sender<CoreEvent>,
}

impl SyncWindow {
    pub fn new(events: broadcast::Sender<CoreEvent>) -> Self {
        Self {
            open: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            events,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Open the gate and schedule it to close after `window` unless
    /// reopened or explicitly stopped first.
    pub fn open_for(&self, window: Duration) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.open.store(true, Ordering::SeqCst);
        let _ = self.events.send(CoreEvent::PinSyncOpened);
        debug!(window_secs = window.as_secs(), "pin sync window opened");

        let gate = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if gate.generation.load(Ordering::SeqCst) == generation {
                gate.open.store(false, Ordering::SeqCst);
                let _ = gate.events.send(CoreEvent::PinSyncClosed);
                debug!("pin sync window closed after timeout");
            }
        });
    }

    /// Close the gate early and cancel the pending timeout.
    pub fn close(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(CoreEvent::PinSyncClosed);
            debug!("pin sync window closed explicitly");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> SyncWindow {
        let (tx, _rx) = broadcast::channel(16);
        SyncWindow::new(tx)
    }

    #[tokio::test(start_paused = true)]
    async fn closes_after_timeout() {
        let gate = window();
        gate.open_for(Duration::from_secs(30));
        assert!(gate.is_open());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!gate.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_close_cancels_timer() {
        let gate = window();
        gate.open_for(Duration::from_secs(30));
        gate.close();
        assert!(!gate.is_open());

        // Reopen; the first timer must not close the new window.
        gate.open_for(Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(35)).await;
        assert!(gate.is_open());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!gate.is_open());
    }
}
