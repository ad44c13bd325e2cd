//! Request correlation registry
//!
//! Maps an opaque request id to the completion waiting for the server's
//! reply. Each entry completes exactly once: the first `resolve` or `reject`
//! removes it and later calls for the same id report `false`, which lets the
//! dispatcher tell a reply to one of our calls apart from an unsolicited push
//! that shares the same message kind.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

type Completion<T, E> = Box<dyn FnOnce(std::result::Result<T, E>) + Send>;

/// Pending requests keyed by correlation id
pub struct PendingRequests<T, E> {
    pending: Mutex<HashMap<String, Completion<T, E>>>,
}

impl<T, E> PendingRequests<T, E> {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a completion for `id`.
    ///
    /// Fails with [`Error::ProtocolViolation`] if `id` is still pending; the
    /// existing entry is left untouched.
    pub fn add<F>(&self, id: impl Into<String>, completion: F) -> Result<()>
    where
        F: FnOnce(std::result::Result<T, E>) + Send + 'static,
    {
        let id = id.into();
        let mut pending = self.lock();
        if pending.contains_key(&id) {
            return Err(Error::ProtocolViolation(format!(
                "request id {} is already pending",
                id
            )));
        }
        pending.insert(id, Box::new(completion));
        Ok(())
    }

    /// Complete `id` successfully. Returns whether an entry existed.
    pub fn resolve(&self, id: &str, value: T) -> bool {
        self.complete(id, Ok(value))
    }

    /// Complete `id` with an error. Returns whether an entry existed.
    pub fn reject(&self, id: &str, err: E) -> bool {
        self.complete(id, Err(err))
    }

    /// Whether a completion is registered for `id`
    pub fn promised(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Reject every pending entry, e.g. when the channel closes
    pub fn reject_all(&self, mut make_err: impl FnMut() -> E) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (id, completion) in drained {
            tracing::debug!(request_id = %id, "Rejecting pending request");
            completion(Err(make_err()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn complete(&self, id: &str, result: std::result::Result<T, E>) -> bool {
        // The lock is released before the completion runs so it may touch
        // the registry again.
        let completion = self.lock().remove(id);
        match completion {
            Some(completion) => {
                completion(result);
                true
            }
            None => false,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Completion<T, E>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T, E> Default for PendingRequests<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> std::fmt::Debug for PendingRequests<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequests")
            .field("pending", &self.len())
            .finish()
    }
}
