use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{self, AtomicU64};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::completion::{lock, Completion, ResponseFuture};
use crate::config::{Dispatch, MessengerConfig};
use crate::error::QueryError;
use crate::key::KeyFactory;
use crate::manager::SessionManager;
use crate::message::{Priority, Request, Response};

/// Write side of the network, supplied by the protocol client.
///
/// `send` resolves once the datagram is written, not when it is answered.
#[async_trait]
pub trait Transport<R>: Send + Sync + 'static {
    async fn send(&self, request: &R) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Dispatch-side lifecycle of a request. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RequestState {
    New,
    Accepted,
    Registered,
    Sent,
    Done,
}

struct Queued<R, S> {
    request: R,
    priority: Priority,
    seq: u64,
    completion: Arc<Completion<S>>,
    state: RequestState,
}

impl<R, S> Queued<R, S> {
    fn advance(&mut self, next: RequestState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        trace!("request #{}: {:?} -> {:?}", self.seq, self.state, next);
        self.state = next;
    }
}

// highest priority first, then oldest first
impl<R, S> Ord for Queued<R, S> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<R, S> PartialOrd for Queued<R, S> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R, S> PartialEq for Queued<R, S> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<R, S> Eq for Queued<R, S> {}

struct Shared<R, S> {
    config: MessengerConfig,
    sessions: SessionManager<S>,
    transport: Arc<dyn Transport<R>>,
    queue: Mutex<BinaryHeap<Queued<R, S>>>,
    wake: Notify,
    shutdown: CancellationToken,
    seq: AtomicU64,
}

/// Sends requests and matches their responses.
///
/// A single background task drains the priority queue, registering each
/// request with the [SessionManager] before handing it to the [Transport].
/// Decoded responses come back through [receive](Messenger::receive).
pub struct Messenger<R, S> {
    shared: Arc<Shared<R, S>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<R: Request, S: Response> Messenger<R, S> {
    /// Must be called from within a tokio runtime.
    pub fn new(
        transport: Arc<dyn Transport<R>>,
        factory: KeyFactory,
        config: MessengerConfig,
    ) -> Result<Self, QueryError> {
        let sessions = SessionManager::from_config(factory, &config)?;
        let shared = Arc::new(Shared {
            config,
            sessions,
            transport,
            queue: Mutex::new(BinaryHeap::new()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            seq: AtomicU64::new(0),
        });
        let worker = tokio::spawn(Shared::run(shared.clone()));
        Ok(Messenger {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queues `request` and returns the future its response settles.
    ///
    /// Requests whose type has no expected response fail here, before they
    /// are queued.
    pub fn send(&self, request: R) -> Result<ResponseFuture<S>, QueryError> {
        if self.shared.shutdown.is_cancelled() {
            return Err(QueryError::Shutdown);
        }
        self.shared.sessions.factory().derive_from_request(&request)?;

        let (completion, future) = Completion::channel();
        let mut queued = Queued {
            priority: request.priority(),
            request,
            seq: self.shared.seq.fetch_add(1, atomic::Ordering::Relaxed),
            completion: Arc::new(completion),
            state: RequestState::New,
        };

        {
            let mut queue = lock(&self.shared.queue);
            let capacity = self.shared.config.queue_capacity();
            if queue.len() >= capacity {
                return Err(QueryError::QueueFull { capacity });
            }
            queued.advance(RequestState::Accepted);
            queue.push(queued);
        }
        self.shared.wake.notify_one();
        Ok(future)
    }

    /// Sends `request` and waits for its response or failure.
    pub async fn query(&self, request: R) -> Result<S, QueryError> {
        self.send(request)?.await
    }

    /// Settles the oldest session waiting for `response`.
    ///
    /// Returns `false` if nothing was waiting; unsolicited and late responses
    /// are logged and dropped.
    pub fn receive(&self, response: S) -> bool {
        let key = self.shared.sessions.factory().derive_from_response(&response);
        match self.shared.sessions.take(&key) {
            Some(entry) => {
                if !entry.completion().complete(response) {
                    debug!("session {} #{} was already settled", key, entry.index());
                }
                true
            }
            None => {
                warn!("dropping unsolicited response {}", key);
                false
            }
        }
    }

    pub fn sessions(&self) -> &SessionManager<S> {
        &self.shared.sessions
    }

    pub fn config(&self) -> &MessengerConfig {
        &self.shared.config
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.shared.transport.local_addr()
    }

    /// Registered requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Accepted requests not yet picked up by the dispatch task.
    pub fn queued(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves once [close](Messenger::close) has been called.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Stops dispatching, closes the session manager and abandons every
    /// queued request.
    pub fn close(&self) {
        if self.shared.shutdown.is_cancelled() {
            return;
        }
        self.shared.shutdown.cancel();
        self.shared.sessions.close();

        let queued = std::mem::take(&mut *lock(&self.shared.queue));
        if !queued.is_empty() {
            warn!("abandoning {} queued requests", queued.len());
        }
        for request in queued {
            request.completion.abandon();
        }
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

impl<R, S> Drop for Messenger<R, S> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        if let Some(worker) = lock(&self.worker).take() {
            worker.abort();
        }
    }
}

impl<R: Request, S: Response> Shared<R, S> {
    async fn run(self: Arc<Self>) {
        loop {
            let next = lock(&self.queue).pop();
            let queued = match next {
                Some(queued) => queued,
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = self.wake.notified() => {}
                    }
                    continue;
                }
            };

            let completion = self.dispatch(queued).await;
            if self.config.dispatch() == Dispatch::Synchronous {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = completion.settled() => {}
                }
            }
        }
        debug!("dispatch task stopped");
    }

    async fn dispatch(&self, mut queued: Queued<R, S>) -> Arc<Completion<S>> {
        let completion = queued.completion.clone();
        let entry = match self.sessions.register(&queued.request, completion.clone()) {
            Ok(entry) => entry,
            Err(err) => {
                queued.advance(RequestState::Done);
                completion.fail(err);
                return completion;
            }
        };
        queued.advance(RequestState::Registered);

        match self.transport.send(&queued.request).await {
            Ok(()) => queued.advance(RequestState::Sent),
            Err(err) => {
                warn!("failed to send request to {}: {}", entry.key().peer(), err);
                queued.advance(RequestState::Done);
                if self.sessions.unregister(&entry) {
                    completion.fail(QueryError::Send(err));
                }
            }
        }
        completion
    }
}
