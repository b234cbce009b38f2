use std::time::Duration;

/// How the [Messenger](crate::messenger::Messenger) admits queued requests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// One request in flight at a time; the next is only dequeued once the
    /// current one is settled.
    Synchronous,
    /// Requests are sent as soon as they reach the head of the queue.
    #[default]
    Asynchronous,
}

/// Settings for a [Messenger](crate::messenger::Messenger); every field has a default.
#[derive(Debug, Clone)]
pub struct MessengerConfig {
    read_timeout: Option<Duration>,
    max_retries: u32,
    dispatch: Dispatch,
    queue_capacity: usize,
}

impl MessengerConfig {
    pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
    pub const DEFAULT_MAX_RETRIES: u32 = 3;
    pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

    pub fn new() -> Self {
        MessengerConfig {
            read_timeout: None,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            dispatch: Dispatch::default(),
            queue_capacity: Self::DEFAULT_QUEUE_CAPACITY,
        }
    }

    /// A zero duration falls back to the default, same as `None`.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity.max(1);
        self
    }

    /// How long a registered request waits for its response.
    /// Defaults to 5 seconds when unset or zero.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
            .filter(|d| !d.is_zero())
            .unwrap_or(Self::DEFAULT_READ_TIMEOUT)
    }

    /// Retry budget for protocol clients; the messenger itself never retries.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

impl Default for MessengerConfig {
    fn default() -> Self {
        MessengerConfig::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rstest::rstest;

    #[rstest]
    #[case(None, Duration::from_secs(5))]
    #[case(Some(Duration::ZERO), Duration::from_secs(5))]
    #[case(Some(Duration::from_millis(250)), Duration::from_millis(250))]
    fn read_timeout_falls_back_to_default(
        #[case] configured: Option<Duration>,
        #[case] expected: Duration,
    ) {
        let config = MessengerConfig::new().with_read_timeout(configured);
        assert_eq!(config.read_timeout(), expected);
    }

    #[test]
    fn defaults() {
        let config = MessengerConfig::default();
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.dispatch(), Dispatch::Asynchronous);
        assert_eq!(config.queue_capacity(), 1024);
    }

    #[test]
    fn queue_capacity_is_at_least_one() {
        assert_eq!(MessengerConfig::new().with_queue_capacity(0).queue_capacity(), 1);
    }
}
