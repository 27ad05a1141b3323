use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;

type Calls = Arc<Mutex<HashMap<String, watch::Receiver<()>>>>;

/// Per-key exclusive leases. The first caller for a key leads; later
/// callers get a [`Waiter`] that resolves once the leader's guard drops.
#[derive(Clone, Default)]
pub struct Group {
    inner: Calls,
}

pub enum Flight {
    Leader(FlightGuard),
    Follower(Waiter),
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &str) -> Flight {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = map.get(key) {
            return Flight::Follower(Waiter { rx: rx.clone() });
        }
        let (tx, rx) = watch::channel(());
        map.insert(key.to_string(), rx);
        Flight::Leader(FlightGuard {
            key: key.to_string(),
            calls: Arc::clone(&self.inner),
            _tx: tx,
        })
    }

    /// Lease only if nobody holds one.
    pub fn try_lead(&self, key: &str) -> Option<FlightGuard> {
        match self.join(key) {
            Flight::Leader(guard) => Some(guard),
            Flight::Follower(_) => None,
        }
    }

    /// A handle on the current lease for `key`, if any, without taking one.
    pub fn waiter(&self, key: &str) -> Option<Waiter> {
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(key).map(|rx| Waiter { rx: rx.clone() })
    }

    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

pub struct FlightGuard {
    key: String,
    calls: Calls,
    _tx: watch::Sender<()>,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut map = self.calls.lock().unwrap_or_else(PoisonError::into_inner);
        map.remove(&self.key);
        // `_tx` drops after this, waking every waiter.
    }
}

pub struct Waiter {
    rx: watch::Receiver<()>,
}

impl Waiter {
    /// Returns `true` if the leader finished within `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> bool {
        // The sender is never used to send, so `changed` only returns once
        // it is dropped.
        tokio::time::timeout(timeout, self.rx.changed()).await.is_ok()
    }
}
