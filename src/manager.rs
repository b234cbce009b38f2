use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, warn};

use crate::completion::{lock, Completion};
use crate::config::MessengerConfig;
use crate::error::QueryError;
use crate::key::{CorrelationKey, KeyFactory};
use crate::message::{Request, Response};
use crate::session::{SessionEntry, TimeoutTask};
use crate::timer::TimeoutScheduler;

static NEXT_INDEX: AtomicU64 = AtomicU64::new(0);

type Entry<S> = Arc<SessionEntry<S>>;

struct Sessions<S> {
    by_key: HashMap<CorrelationKey, VecDeque<Entry<S>>>,
    len: usize,
    closed: bool,
}

/// Multi-valued, insertion-ordered map of in-flight sessions.
///
/// All mutations go through one lock so inserts, removals and snapshots are
/// linearizable.
pub(crate) struct Registry<S> {
    sessions: Mutex<Sessions<S>>,
}

impl<S> Registry<S> {
    fn new() -> Self {
        Registry {
            sessions: Mutex::new(Sessions {
                by_key: HashMap::new(),
                len: 0,
                closed: false,
            }),
        }
    }

    /// Removes the entry with this exact index and disarms its timeout.
    pub(crate) fn remove_exact(&self, key: &CorrelationKey, index: u64) -> Option<Entry<S>> {
        let mut sessions = lock(&self.sessions);
        let queue = sessions.by_key.get_mut(key)?;
        let position = queue.iter().position(|e| e.index() == index)?;
        let entry = queue.remove(position)?;
        if queue.is_empty() {
            sessions.by_key.remove(key);
        }
        sessions.len -= 1;
        drop(sessions);

        entry.cancel_timeout();
        Some(entry)
    }

    fn remove_head(&self, key: &CorrelationKey) -> Option<Entry<S>> {
        let mut sessions = lock(&self.sessions);
        let queue = sessions.by_key.get_mut(key)?;
        let entry = queue.pop_front()?;
        if queue.is_empty() {
            sessions.by_key.remove(key);
        }
        sessions.len -= 1;
        drop(sessions);

        entry.cancel_timeout();
        Some(entry)
    }

    fn head(&self, key: &CorrelationKey) -> Option<Entry<S>> {
        lock(&self.sessions)
            .by_key
            .get(key)
            .and_then(|queue| queue.front().cloned())
    }
}

/// Authoritative registry of outstanding requests.
///
/// Owns the [KeyFactory] that keys them and the [TimeoutScheduler] that
/// expires them. Duplicate registrations under one key are queued and served
/// oldest first.
pub struct SessionManager<S> {
    factory: KeyFactory,
    registry: Arc<Registry<S>>,
    scheduler: TimeoutScheduler,
    read_timeout: Duration,
}

impl<S: Send + 'static> SessionManager<S> {
    pub fn new(factory: KeyFactory, read_timeout: Duration, scheduler: TimeoutScheduler) -> Self {
        SessionManager {
            factory,
            registry: Arc::new(Registry::new()),
            scheduler,
            read_timeout,
        }
    }

    /// Builds a manager whose scheduler runs on the current tokio runtime.
    pub fn from_config(factory: KeyFactory, config: &MessengerConfig) -> Result<Self, QueryError> {
        let scheduler = TimeoutScheduler::new()?;
        Ok(SessionManager::new(factory, config.read_timeout(), scheduler))
    }

    pub fn factory(&self) -> &KeyFactory {
        &self.factory
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Keys `request`, arms its read timeout and registers it.
    ///
    /// Fails with [QueryError::UnmappedRequestType] before anything is
    /// scheduled or inserted, and with [QueryError::Shutdown] after
    /// [close](SessionManager::close).
    pub fn register<R: Request + ?Sized>(
        &self,
        request: &R,
        completion: Arc<Completion<S>>,
    ) -> Result<Entry<S>, QueryError> {
        let key = self.factory.derive_from_request(request)?;

        let mut sessions = lock(&self.registry.sessions);
        if sessions.closed {
            return Err(QueryError::Shutdown);
        }
        let index = NEXT_INDEX.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SessionEntry::new(key.clone(), completion, index));

        // armed while the lock is held: the task cannot observe the registry
        // before the entry is in it
        let task = TimeoutTask::new(key.clone(), index, Arc::downgrade(&self.registry));
        entry.arm_timeout(self.scheduler.schedule(self.read_timeout, move || {
            task.run();
        }));

        sessions.by_key.entry(key).or_default().push_back(entry.clone());
        sessions.len += 1;
        drop(sessions);

        debug!("registered session {} #{}", entry.key(), index);
        Ok(entry)
    }

    /// The oldest entry registered under `key`.
    pub fn lookup(&self, key: &CorrelationKey) -> Option<Entry<S>> {
        self.registry.head(key)
    }

    /// Removes exactly `entry`. Returns `false` if it was already gone.
    pub fn unregister(&self, entry: &SessionEntry<S>) -> bool {
        let removed = self.registry.remove_exact(entry.key(), entry.index()).is_some();
        if removed {
            debug!("unregistered session {} #{}", entry.key(), entry.index());
        }
        removed
    }

    /// Removes and returns the oldest entry under `key`.
    pub fn take(&self, key: &CorrelationKey) -> Option<Entry<S>> {
        let entry = self.registry.remove_head(key)?;
        debug!("unregistered session {} #{}", entry.key(), entry.index());
        Some(entry)
    }

    /// Point-in-time view of every registered entry, oldest first.
    pub fn snapshot(&self) -> Vec<(CorrelationKey, Entry<S>)> {
        let mut entries: Vec<_> = lock(&self.registry.sessions)
            .by_key
            .iter()
            .flat_map(|(key, queue)| queue.iter().map(move |e| (key.clone(), e.clone())))
            .collect();
        entries.sort_by_key(|(_, e)| e.index());
        entries
    }

    pub fn len(&self) -> usize {
        lock(&self.registry.sessions).len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The task that expires `entry`; running it by hand is equivalent to the
    /// read timeout elapsing.
    pub fn timeout_task(&self, entry: &SessionEntry<S>) -> TimeoutTask<S> {
        TimeoutTask::new(
            entry.key().clone(),
            entry.index(),
            Arc::downgrade(&self.registry),
        )
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.registry.sessions).closed
    }

    /// Stops the scheduler and clears the registry.
    ///
    /// Entries still pending are abandoned, which their callers observe as
    /// [QueryError::Abandoned].
    pub fn close(&self) {
        self.scheduler.stop();
        let drained = {
            let mut sessions = lock(&self.registry.sessions);
            sessions.closed = true;
            sessions.len = 0;
            std::mem::take(&mut sessions.by_key)
        };

        let pending: usize = drained.values().map(VecDeque::len).sum();
        if pending > 0 {
            warn!("closing session manager with {} pending sessions", pending);
        }
        for entry in drained.into_values().flatten() {
            entry.cancel_timeout();
            entry.completion().abandon();
        }
    }
}

impl<S: Response> SessionManager<S> {
    /// The oldest entry waiting for a response like `response`.
    pub fn lookup_response(&self, response: &S) -> Option<Entry<S>> {
        self.registry.head(&self.factory.derive_from_response(response))
    }

    pub fn is_registered(&self, response: &S) -> bool {
        self.lookup_response(response).is_some()
    }
}
