use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::debug;
use tokio::time::Instant;

use crate::completion::{lock, Completion};
use crate::error::QueryError;
use crate::key::CorrelationKey;
use crate::manager::Registry;
use crate::timer::TimeoutHandle;

/// One registered, in-flight request.
pub struct SessionEntry<S> {
    key: CorrelationKey,
    completion: Arc<Completion<S>>,
    index: u64,
    registered_at: Instant,
    timeout: Mutex<Option<TimeoutHandle>>,
}

impl<S> SessionEntry<S> {
    pub(crate) fn new(key: CorrelationKey, completion: Arc<Completion<S>>, index: u64) -> Self {
        SessionEntry {
            key,
            completion,
            index,
            registered_at: Instant::now(),
            timeout: Mutex::new(None),
        }
    }

    pub fn key(&self) -> &CorrelationKey {
        &self.key
    }

    pub fn completion(&self) -> &Completion<S> {
        &self.completion
    }

    /// Monotonic across the process; orders duplicates under one key.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    pub fn is_timeout_armed(&self) -> bool {
        lock(&self.timeout).is_some()
    }

    pub(crate) fn arm_timeout(&self, handle: TimeoutHandle) {
        if let Some(previous) = lock(&self.timeout).replace(handle) {
            previous.cancel();
        }
    }

    pub(crate) fn cancel_timeout(&self) {
        if let Some(handle) = lock(&self.timeout).take() {
            handle.cancel();
        }
    }
}

impl<S> fmt::Debug for SessionEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEntry")
            .field("key", &self.key)
            .field("index", &self.index)
            .field("settled", &self.completion.is_settled())
            .finish_non_exhaustive()
    }
}

/// Fails one entry with [QueryError::ReadTimeout] if it is still registered
/// when the read timeout elapses.
///
/// Captures the entry's key and index rather than the entry itself, so a
/// task that loses the race against a response finds nothing and does nothing.
pub struct TimeoutTask<S> {
    key: CorrelationKey,
    index: u64,
    registry: Weak<Registry<S>>,
}

impl<S> TimeoutTask<S> {
    pub(crate) fn new(key: CorrelationKey, index: u64, registry: Weak<Registry<S>>) -> Self {
        TimeoutTask {
            key,
            index,
            registry,
        }
    }

    /// Returns whether this call expired the entry.
    pub fn run(&self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let Some(entry) = registry.remove_exact(&self.key, self.index) else {
            return false;
        };
        let elapsed = entry.registered_at().elapsed();
        debug!("session {} #{} timed out after {:?}", self.key, self.index, elapsed);
        entry.completion().fail(QueryError::ReadTimeout {
            key: self.key.clone(),
            elapsed,
        })
    }
}
