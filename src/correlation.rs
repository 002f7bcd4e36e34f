//! Request/response correlation.
//!
//! A [`PendingRequests`] map holds one single-resolution continuation
//! (a oneshot sender) per outstanding correlation id. The issuing side
//! keeps the matching [`PendingResponse`]; dropping it removes the entry,
//! so an id is released on response, on timeout, or when the waiting task
//! is aborted, whichever happens first. Responses that find no entry are
//! reported as unmatched and the caller discards them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{ConnectionError, Error};

struct PendingEntry<T> {
    tx: oneshot::Sender<Result<T, Error>>,
    target: String,
    token: u64,
}

struct Inner<T> {
    entries: Mutex<HashMap<String, PendingEntry<T>>>,
    next_token: AtomicU64,
}

impl<T> Inner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingEntry<T>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Outstanding requests keyed by correlation id.
pub struct PendingRequests<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingRequests<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Register a request to `target`. Fails if `id` is already live.
    pub fn register(
        &self,
        id: impl Into<String>,
        target: impl Into<String>,
    ) -> Result<PendingResponse<T>, Error> {
        let id = id.into();
        let target = target.into();
        let (tx, rx) = oneshot::channel();
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);

        {
            let mut entries = self.inner.lock();
            if entries.contains_key(&id) {
                return Err(Error::DuplicateRequest(id));
            }
            entries.insert(
                id.clone(),
                PendingEntry {
                    tx,
                    target: target.clone(),
                    token,
                },
            );
        }

        Ok(PendingResponse {
            id,
            target,
            token,
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Settle request `id` with a value. Returns false if nothing was waiting.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        let entry = self.inner.lock().remove(id);
        match entry {
            Some(entry) => entry.tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// The agent request `id` was sent to, if it is still pending.
    pub fn target_of(&self, id: &str) -> Option<String> {
        self.inner.lock().get(id).map(|e| e.target.clone())
    }

    /// Fail every request addressed to `target`. Returns how many were failed.
    pub fn fail_target(&self, target: &str, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry<T>)> = {
            let mut entries = self.inner.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.target == target)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let count = drained.len();
        for (_, entry) in drained {
            let _ = entry.tx.send(Err(Error::Connection(ConnectionError::Lost {
                agent_id: target.to_string(),
                reason: reason.to_string(),
            })));
        }
        count
    }

    /// Fail everything still pending (used when a connection drops).
    pub fn fail_all(&self, reason: &str) -> usize {
        let drained: Vec<PendingEntry<T>> = self.inner.lock().drain().map(|(_, e)| e).collect();
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(Error::Connection(ConnectionError::Lost {
                agent_id: entry.target.clone(),
                reason: reason.to_string(),
            })));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

/// The issuing side's handle on one outstanding request.
pub struct PendingResponse<T> {
    id: String,
    target: String,
    token: u64,
    rx: oneshot::Receiver<Result<T, Error>>,
    inner: Arc<Inner<T>>,
}

impl<T> PendingResponse<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the response or the deadline, whichever comes first.
    pub async fn wait(mut self, timeout: Duration) -> Result<T, Error> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Connection(ConnectionError::Lost {
                agent_id: self.target.clone(),
                reason: "request abandoned".to_string(),
            })),
            Err(_) => Err(Error::RequestTimeout {
                message_id: self.id.clone(),
                target: self.target.clone(),
                timeout,
            }),
        }
    }
}

impl<T> Drop for PendingResponse<T> {
    fn drop(&mut self) {
        let mut entries = self.inner.lock();
        if entries.get(&self.id).is_some_and(|e| e.token == self.token) {
            entries.remove(&self.id);
        }
    }
}
