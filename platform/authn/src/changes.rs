use thiserror::Error;
use tokio::sync::broadcast;

use crate::SessionChange;

const CHANGE_CAPACITY: usize = 32;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChangeStreamError {
    #[error("session change stream closed")]
    Closed,
    #[error("missed {0} session changes")]
    Lagged(u64),
}

/// Fan-out of session changes to every subscriber of one backend client.
#[derive(Debug, Clone)]
pub struct ChangeNotifier {
    tx: broadcast::Sender<SessionChange>,
}

impl Default for ChangeNotifier {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Self { tx }
    }
}

impl ChangeNotifier {
    pub fn subscribe(&self) -> SessionChanges {
        SessionChanges {
            rx: self.tx.subscribe(),
        }
    }

    /// Returns how many subscribers saw the change.
    pub fn notify(&self, change: SessionChange) -> usize {
        self.tx.send(change).unwrap_or(0)
    }

    pub fn subscribers(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// Subscription handle returned by `on_session_change`.
#[derive(Debug)]
pub struct SessionChanges {
    rx: broadcast::Receiver<SessionChange>,
}

impl SessionChanges {
    pub async fn recv(&mut self) -> Result<SessionChange, ChangeStreamError> {
        self.rx.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Closed => ChangeStreamError::Closed,
            broadcast::error::RecvError::Lagged(missed) => ChangeStreamError::Lagged(missed),
        })
    }
}
