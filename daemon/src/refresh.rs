//! Single-slot refresh signal between the control channel and the reconciler.
//!
//! A post while a signal is already pending is dropped, so a burst of
//! "watch set changed" events collapses into one re-seed.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub fn refresh_channel() -> (RefreshSender, RefreshReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (RefreshSender(tx), RefreshReceiver(rx))
}

#[derive(Clone, Debug)]
pub struct RefreshSender(mpsc::Sender<()>);

impl RefreshSender {
    /// Posts a refresh without waiting. Returns `false` when the signal was
    /// coalesced into one already pending or the receiver is gone.
    pub fn post(&self) -> bool {
        match self.0.try_send(()) {
            Ok(()) => true,
            Err(TrySendError::Full(())) | Err(TrySendError::Closed(())) => false,
        }
    }
}

#[derive(Debug)]
pub struct RefreshReceiver(mpsc::Receiver<()>);

impl RefreshReceiver {
    /// Waits for the next refresh. `None` once every sender is dropped.
    pub async fn recv(&mut self) -> Option<()> {
        self.0.recv().await
    }
}
