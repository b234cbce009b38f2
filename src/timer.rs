use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use crate::error::QueryError;

/// Deadline scheduler owned by one [SessionManager](crate::manager::SessionManager).
///
/// Each scheduled callback is a task on the runtime the scheduler was created
/// on. [stop](TimeoutScheduler::stop) prevents every pending callback from
/// firing.
#[derive(Debug)]
pub struct TimeoutScheduler {
    runtime: Handle,
    shutdown: CancellationToken,
}

impl TimeoutScheduler {
    /// Binds to the current tokio runtime.
    pub fn new() -> Result<Self, QueryError> {
        let runtime = Handle::try_current().map_err(|_| QueryError::NoRuntime)?;
        Ok(TimeoutScheduler::with_runtime(runtime))
    }

    pub fn with_runtime(runtime: Handle) -> Self {
        TimeoutScheduler {
            runtime,
            shutdown: CancellationToken::new(),
        }
    }

    /// Runs `task` once `delay` has elapsed, unless cancelled or stopped first.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimeoutHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        let join = self.runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => task(),
            }
        });
        TimeoutHandle {
            abort: join.abort_handle(),
        }
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cancellable reference to one scheduled callback.
#[derive(Debug)]
pub struct TimeoutHandle {
    abort: AbortHandle,
}

impl TimeoutHandle {
    /// No-op if the callback already fired or was already cancelled.
    pub fn cancel(&self) {
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.abort.is_finished()
    }
}
