use std::fmt;
use std::net::SocketAddr;

/// Identifies the runtime kind of a request or response.
///
/// Protocol modules declare one constant per message kind, e.g.
/// `MessageType::new("A2S_INFO")`, and correlation is resolved through these
/// tags rather than through the concrete Rust type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageType(&'static str);

impl MessageType {
    pub const fn new(name: &'static str) -> Self {
        MessageType(name)
    }

    pub const fn name(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Dispatch priority of a queued request. Higher variants are sent first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// An outbound query.
pub trait Request: Send + Sync + 'static {
    /// Kind tag looked up in the request→response directory.
    fn message_type(&self) -> MessageType;

    /// The game server this request is addressed to.
    fn recipient(&self) -> SocketAddr;

    fn priority(&self) -> Priority {
        Priority::Normal
    }

    /// Serializes the request into a single datagram.
    fn encode(&self) -> Vec<u8>;
}

/// A fully decoded (and, if split, reassembled) reply.
pub trait Response: Send + 'static {
    fn message_type(&self) -> MessageType;

    /// The game server the response came from.
    fn sender(&self) -> SocketAddr;

    /// The local address the response was delivered to.
    fn recipient(&self) -> SocketAddr;
}
