//! One-shot completion capability handed to step handlers.

use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;

use crate::error::Error;

/// Receiving half awaited by the engine while a phase is in flight.
pub type CompletionSignal = oneshot::Receiver<Result<(), Error>>;

/// A one-shot capability to report success or failure of a handler.
///
/// The first call to [`resolve`](Completer::resolve) or
/// [`reject`](Completer::reject) wins; later signals are silently
/// ignored. Clones share the same underlying slot, so a handler may hand
/// a clone to a spawned task or an external subscription and signal from
/// there.
#[derive(Debug, Clone)]
pub struct Completer {
    slot: Arc<Mutex<Option<oneshot::Sender<Result<(), Error>>>>>,
}

impl Completer {
    /// Create a completer and the signal the engine awaits.
    pub fn new() -> (Self, CompletionSignal) {
        let (tx, rx) = oneshot::channel();
        let completer = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (completer, rx)
    }

    /// Report success. Ignored if a signal was already sent.
    pub fn resolve(&self) {
        self.signal(Ok(()));
    }

    /// Report failure. Ignored if a signal was already sent.
    pub fn reject(&self, error: Error) {
        self.signal(Err(error));
    }

    /// True while no signal has been sent.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    fn signal(&self, outcome: Result<(), Error>) {
        let sender = self.slot.lock().unwrap().take();
        if let Some(tx) = sender {
            // The engine may have stopped listening (timeout or abort); a
            // failed send is indistinguishable from a late signal.
            let _ = tx.send(outcome);
        }
    }
}
