// StartedSignal: one-shot "container is running" notification shared between
// the monitor (or the transformer when nothing is monitored) and the step runner.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Fires at most once. Later calls to [`StartedSignal::fire`] are no-ops.
#[derive(Debug)]
pub struct StartedSignal {
    sender: Mutex<Option<oneshot::Sender<()>>>,
}

impl StartedSignal {
    /// Create a signal and the receiver that observes it.
    pub fn channel() -> (Arc<StartedSignal>, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let signal = Arc::new(StartedSignal {
            sender: Mutex::new(Some(tx)),
        });
        (signal, rx)
    }

    /// Fire the signal. Returns `true` only for the call that actually fired it.
    pub fn fire(&self) -> bool {
        match self.sender.lock().take() {
            Some(tx) => {
                // The receiver may already be gone when the runner has shut down.
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn has_fired(&self) -> bool {
        self.sender.lock().is_none()
    }
}
