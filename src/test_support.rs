//! Shared fixtures for unit tests.

use std::net::SocketAddr;

use crate::key::KeyFactory;
use crate::message::{MessageType, Priority, Request, Response};

pub const PING: MessageType = MessageType::new("PING");
pub const PONG: MessageType = MessageType::new("PONG");
pub const STATUS: MessageType = MessageType::new("STATUS");

#[derive(Debug, Clone, PartialEq)]
pub struct TestRequest {
    pub kind: MessageType,
    pub to: SocketAddr,
    pub tag: u32,
    pub priority: Priority,
}

impl TestRequest {
    pub fn new(kind: MessageType, to: SocketAddr, tag: u32) -> Self {
        TestRequest {
            kind,
            to,
            tag,
            priority: Priority::Normal,
        }
    }

    pub fn ping(to: &str, tag: u32) -> Self {
        TestRequest::new(PING, addr(to), tag)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

impl Request for TestRequest {
    fn message_type(&self) -> MessageType {
        self.kind
    }

    fn recipient(&self) -> SocketAddr {
        self.to
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn encode(&self) -> Vec<u8> {
        self.tag.to_le_bytes().to_vec()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestResponse {
    pub kind: MessageType,
    pub from: SocketAddr,
    pub tag: u32,
}

impl TestResponse {
    pub fn new(kind: MessageType, from: SocketAddr, tag: u32) -> Self {
        TestResponse { kind, from, tag }
    }

    pub fn pong(from: &str, tag: u32) -> Self {
        TestResponse::new(PONG, addr(from), tag)
    }
}

impl Response for TestResponse {
    fn message_type(&self) -> MessageType {
        self.kind
    }

    fn sender(&self) -> SocketAddr {
        self.from
    }

    fn recipient(&self) -> SocketAddr {
        addr("127.0.0.1:50000")
    }
}

pub fn factory() -> KeyFactory {
    [(PING, PONG)].into_iter().collect()
}

pub fn addr(s: &str) -> SocketAddr {
    s.parse().expect("valid socket address")
}
