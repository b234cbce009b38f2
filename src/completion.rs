use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::{oneshot, Notify};

use crate::error::QueryError;

/// Every critical section in this crate leaves its data consistent, so a
/// poisoned lock is still safe to use.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resolve-once completion handle for one outstanding request.
///
/// The first of [complete](Completion::complete), [fail](Completion::fail) or
/// [abandon](Completion::abandon) wins; later calls return `false` and change
/// nothing.
#[derive(Debug)]
pub struct Completion<S> {
    sender: Mutex<Option<oneshot::Sender<Result<S, QueryError>>>>,
    settled: AtomicBool,
    notify: Notify,
}

impl<S> Completion<S> {
    /// Creates the handle together with the future the caller awaits.
    pub fn channel() -> (Completion<S>, ResponseFuture<S>) {
        let (tx, rx) = oneshot::channel();
        let completion = Completion {
            sender: Mutex::new(Some(tx)),
            settled: AtomicBool::new(false),
            notify: Notify::new(),
        };
        (completion, ResponseFuture { rx })
    }

    pub fn complete(&self, response: S) -> bool {
        self.settle(Some(Ok(response)))
    }

    pub fn fail(&self, error: QueryError) -> bool {
        self.settle(Some(Err(error)))
    }

    /// Settles without a result; the caller observes [QueryError::Abandoned].
    pub fn abandon(&self) -> bool {
        self.settle(None)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Resolves once the handle has been settled by any path.
    pub async fn settled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_settled() {
                return;
            }
            notified.await;
        }
    }

    fn settle(&self, result: Option<Result<S, QueryError>>) -> bool {
        let Some(tx) = lock(&self.sender).take() else {
            return false;
        };
        if let Some(result) = result {
            // the caller may have stopped waiting; that is not our concern
            let _ = tx.send(result);
        }
        self.settled.store(true, Ordering::Release);
        self.notify.notify_waiters();
        true
    }
}

/// Caller side of a [Completion].
#[derive(Debug)]
pub struct ResponseFuture<S> {
    rx: oneshot::Receiver<Result<S, QueryError>>,
}

impl<S> Future for ResponseFuture<S> {
    type Output = Result<S, QueryError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.unwrap_or(Err(QueryError::Abandoned)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_writer_wins() {
        let (completion, future) = Completion::<u32>::channel();
        assert!(completion.complete(7));
        assert!(!completion.fail(QueryError::Shutdown));
        assert!(!completion.complete(8));
        assert!(completion.is_settled());
        assert_eq!(future.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn failure_reaches_caller() {
        let (completion, future) = Completion::<u32>::channel();
        assert!(completion.fail(QueryError::Shutdown));
        assert!(matches!(future.await, Err(QueryError::Shutdown)));
    }

    #[tokio::test]
    async fn abandoned_and_dropped_handles_report_abandoned() {
        let (completion, future) = Completion::<u32>::channel();
        assert!(completion.abandon());
        assert!(matches!(future.await, Err(QueryError::Abandoned)));

        let (completion, future) = Completion::<u32>::channel();
        drop(completion);
        assert!(matches!(future.await, Err(QueryError::Abandoned)));
    }

    #[tokio::test]
    async fn settled_wakes_waiters() {
        let (completion, _future) = Completion::<u32>::channel();
        let completion = std::sync::Arc::new(completion);
        let waiter = tokio::spawn({
            let completion = completion.clone();
            async move { completion.settled().await }
        });
        tokio::task::yield_now().await;
        completion.complete(1);
        waiter.await.unwrap();
    }

    #[test]
    fn completing_after_caller_dropped_is_harmless() {
        let (completion, future) = Completion::<u32>::channel();
        drop(future);
        assert!(completion.complete(1));
    }
}
