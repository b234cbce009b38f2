//! Async request/response correlation for UDP game-server queries, with a
//! binding for the [Source Query Protocol](https://developer.valvesoftware.com/wiki/Server_queries).
pub mod completion;
pub mod config;
pub mod error;
pub mod key;
pub mod manager;
pub mod message;
pub mod messenger;
pub mod packet;
pub mod session;
pub mod source;
pub mod split;
pub mod timer;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{Dispatch, MessengerConfig};
pub use error::{AssemblerError, QueryError};
pub use key::{CorrelationKey, KeyFactory};
pub use message::{MessageType, Priority, Request, Response};
pub use messenger::{Messenger, Transport};
