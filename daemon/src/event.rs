use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::control::ConnectionState;
use crate::reconcile::WatchSnapshot;

pub enum AgentEvent {
    /// The control channel moved to a new state.
    ConnectionChanged(ConnectionState),
    /// The reconciler published a new view of the watch set.
    WatchSetUpdated(WatchSnapshot),
    /// Ctrl+C received; the agent should stop every loop and exit.
    Shutdown,
}

/// Relays every change of `rx` into the event channel as `wrap(value)`.
/// Ends when either side goes away.
pub fn forward_changes<T, F>(
    mut rx: watch::Receiver<T>,
    tx: mpsc::Sender<AgentEvent>,
    wrap: F,
) -> JoinHandle<()>
where
    T: Clone + Send + Sync + 'static,
    F: Fn(T) -> AgentEvent + Send + 'static,
{
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let value = rx.borrow_and_update().clone();
            if tx.send(wrap(value)).await.is_err() {
                break;
            }
        }
    })
}
