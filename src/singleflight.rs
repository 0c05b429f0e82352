//! Single-flight coordination: at most one in-flight computation per key
//! within this process.
//!
//! The first caller for a key becomes the leader; its computation runs on a
//! spawned task so caller cancellation never cancels work that other
//! waiters (or the cache) will benefit from. Every caller, leader included,
//! awaits the slot's watch channel and observes the same outcome. Slots are
//! removed before the outcome is published, so failures are never cached: a
//! caller arriving after resolution starts a fresh flight.
//!
//! Coordination is local to one process. Two processes sharing a store can
//! still compute the same key concurrently; the store upsert makes that
//! redundant work, not incorrect results.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::sync::watch;

use crate::error::CacheError;
use crate::store::CacheKey;

enum FlightState<T> {
    Pending,
    Done(Result<Arc<T>, CacheError>),
}

pub struct SingleFlight<T> {
    // Never held across an await.
    slots: Arc<Mutex<HashMap<CacheKey, watch::Receiver<FlightState<T>>>>>,
}

impl<T> std::fmt::Debug for SingleFlight<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlight")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of keys with a computation currently in flight.
    pub fn in_flight(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

impl<T: Send + Sync + 'static> SingleFlight<T> {
    /// Run `compute` unless a computation for `key` is already in flight,
    /// in which case `compute` is dropped unpolled and this caller waits
    /// for the leader's outcome.
    pub async fn run<Fut>(&self, key: &CacheKey, compute: Fut) -> Result<Arc<T>, CacheError>
    where
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let existing = {
            let slots = self.slots.lock().unwrap();
            slots.get(key).cloned()
        };
        if let Some(rx) = existing {
            return wait(rx).await;
        }

        let (tx, rx) = watch::channel(FlightState::Pending);
        let race_winner = {
            let mut slots = self.slots.lock().unwrap();
            if let Some(other) = slots.get(key) {
                // Lost the leadership race between the check above and here.
                Some(other.clone())
            } else {
                slots.insert(key.clone(), rx.clone());
                None
            }
        };
        if let Some(other) = race_winner {
            return wait(other).await;
        }

        let slots = Arc::clone(&self.slots);
        let slot_key = key.clone();
        tokio::spawn(async move {
            let result = std::panic::AssertUnwindSafe(compute).catch_unwind().await;
            let outcome = match result {
                Ok(Ok(value)) => Ok(Arc::new(value)),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(CacheError::FlightAborted(
                    "computation panicked".to_string(),
                )),
            };
            slots.lock().unwrap().remove(&slot_key);
            let _ = tx.send(FlightState::Done(outcome));
        });

        wait(rx).await
    }
}

async fn wait<T>(mut rx: watch::Receiver<FlightState<T>>) -> Result<Arc<T>, CacheError> {
    loop {
        {
            let state = rx.borrow_and_update();
            if let FlightState::Done(outcome) = &*state {
                return outcome.clone();
            }
        }
        if rx.changed().await.is_err() {
            return Err(CacheError::FlightAborted(
                "in-flight computation dropped before publishing".to_string(),
            ));
        }
    }
}
