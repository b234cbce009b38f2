//! Source engine query (A2S) binding: request and response kinds, the
//! request→response directory, and a datagram decoder that reassembles split
//! responses per server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace};
use tokio::time::Instant;

use crate::error::QueryError;
use crate::config::MessengerConfig;
use crate::key::KeyFactory;
use crate::message::{MessageType, Priority, Request, Response};
use crate::messenger::Messenger;
use crate::packet::{Datagram, PacketType, RequestPacket, ResponsePacket, NO_CHALLENGE};
use crate::split::{AssemblerKind, SplitAssembler};

pub const A2S_INFO: MessageType = MessageType::new("A2S_INFO");
pub const A2S_PLAYER: MessageType = MessageType::new("A2S_PLAYER");
pub const A2S_RULES: MessageType = MessageType::new("A2S_RULES");
/// Any A2S query sent only to obtain a challenge number.
pub const A2S_CHALLENGE: MessageType = MessageType::new("A2S_CHALLENGE");

pub const S2A_INFO: MessageType = MessageType::new("S2A_INFO");
pub const S2A_PLAYER: MessageType = MessageType::new("S2A_PLAYER");
pub const S2A_RULES: MessageType = MessageType::new("S2A_RULES");
pub const S2C_CHALLENGE: MessageType = MessageType::new("S2C_CHALLENGE");

/// The request→response directory for Source queries.
pub fn directory() -> KeyFactory {
    [
        (A2S_INFO, S2A_INFO),
        (A2S_PLAYER, S2A_PLAYER),
        (A2S_RULES, S2A_RULES),
        (A2S_CHALLENGE, S2C_CHALLENGE),
    ]
    .into_iter()
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Info,
    Players,
    Rules,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceRequest {
    query: Query,
    server: SocketAddr,
    challenge: Option<i32>,
    challenge_only: bool,
    priority: Priority,
}

impl SourceRequest {
    pub fn new(query: Query, server: SocketAddr) -> Self {
        SourceRequest {
            query,
            server,
            challenge: None,
            challenge_only: false,
            priority: Priority::Normal,
        }
    }

    pub fn info(server: SocketAddr) -> Self {
        SourceRequest::new(Query::Info, server)
    }

    pub fn players(server: SocketAddr) -> Self {
        SourceRequest::new(Query::Players, server)
    }

    pub fn rules(server: SocketAddr) -> Self {
        SourceRequest::new(Query::Rules, server)
    }

    /// Asks `server` for a challenge number to use with `query`.
    pub fn challenge(query: Query, server: SocketAddr) -> Self {
        SourceRequest {
            challenge_only: true,
            ..SourceRequest::new(query, server)
        }
    }

    pub fn with_challenge(mut self, challenge: i32) -> Self {
        self.challenge = Some(challenge);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn query(&self) -> Query {
        self.query
    }

    fn packet(&self) -> RequestPacket {
        let challenge = if self.challenge_only {
            Some(NO_CHALLENGE)
        } else {
            self.challenge
        };
        match self.query {
            Query::Info if self.challenge_only => RequestPacket::info(None),
            Query::Info => RequestPacket::info(challenge),
            Query::Players => RequestPacket::players(challenge.unwrap_or(NO_CHALLENGE)),
            Query::Rules => RequestPacket::rules(challenge.unwrap_or(NO_CHALLENGE)),
        }
    }
}

impl Request for SourceRequest {
    fn message_type(&self) -> MessageType {
        if self.challenge_only {
            return A2S_CHALLENGE;
        }
        match self.query {
            Query::Info => A2S_INFO,
            Query::Players => A2S_PLAYER,
            Query::Rules => A2S_RULES,
        }
    }

    fn recipient(&self) -> SocketAddr {
        self.server
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn encode(&self) -> Vec<u8> {
        self.packet().pack()
    }
}

/// A decoded reply. Field-level parsing of the body is left to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceResponse {
    packet_type: PacketType,
    message_type: MessageType,
    sender: SocketAddr,
    recipient: SocketAddr,
    body: Vec<u8>,
}

impl SourceResponse {
    /// Fails with [QueryError::UnexpectedRequest] for A2S_* packets.
    pub fn new(
        packet: ResponsePacket,
        sender: SocketAddr,
        recipient: SocketAddr,
    ) -> Result<Self, QueryError> {
        let message_type = match packet.packet_type() {
            PacketType::Challenge => S2C_CHALLENGE,
            PacketType::InfoResponse => S2A_INFO,
            PacketType::PlayersResponse => S2A_PLAYER,
            PacketType::RulesResponse => S2A_RULES,
            request => return Err(QueryError::UnexpectedRequest(request)),
        };
        Ok(SourceResponse {
            packet_type: packet.packet_type(),
            message_type,
            sender,
            recipient,
            body: packet.into_body(),
        })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The challenge number carried by an S2C_CHALLENGE reply.
    pub fn challenge(&self) -> Option<i32> {
        if self.packet_type != PacketType::Challenge {
            return None;
        }
        let bytes: [u8; 4] = self.body.get(..4)?.try_into().ok()?;
        Some(i32::from_le_bytes(bytes))
    }
}

impl Response for SourceResponse {
    fn message_type(&self) -> MessageType {
        self.message_type
    }

    fn sender(&self) -> SocketAddr {
        self.sender
    }

    fn recipient(&self) -> SocketAddr {
        self.recipient
    }
}

struct OpenGroup {
    id: i32,
    opened: Instant,
    assembler: Box<dyn SplitAssembler>,
}

/// Turns datagrams into [SourceResponse]s, reassembling split responses with
/// one assembler per server.
///
/// A group that is still incomplete after the group timeout is dropped the
/// next time a datagram is decoded.
pub struct SourceDecoder {
    kind: AssemblerKind,
    local: SocketAddr,
    group_timeout: Duration,
    groups: HashMap<SocketAddr, OpenGroup>,
}

impl SourceDecoder {
    pub fn new(kind: AssemblerKind, local: SocketAddr) -> Self {
        SourceDecoder {
            kind,
            local,
            group_timeout: MessengerConfig::DEFAULT_READ_TIMEOUT,
            groups: HashMap::new(),
        }
    }

    pub fn with_group_timeout(mut self, group_timeout: Duration) -> Self {
        self.group_timeout = group_timeout;
        self
    }

    /// Servers with a partially received split response.
    pub fn open_groups(&self) -> usize {
        self.groups.len()
    }

    /// Drops every group opened more than the group timeout ago and returns
    /// how many were dropped.
    pub fn evict_stale(&mut self) -> usize {
        let before = self.groups.len();
        let timeout = self.group_timeout;
        self.groups.retain(|sender, group| {
            let stale = group.opened.elapsed() >= timeout;
            if stale {
                debug!(
                    "evicting group {} from {} ({}/{} fragments)",
                    group.id,
                    sender,
                    group.assembler.received(),
                    group.assembler.count()
                );
            }
            !stale
        });
        before - self.groups.len()
    }

    /// Returns `Ok(None)` while a split response is still incomplete.
    pub fn decode(
        &mut self,
        sender: SocketAddr,
        datagram: &[u8],
    ) -> Result<Option<SourceResponse>, QueryError> {
        self.evict_stale();
        let fragment = match Datagram::unpack(datagram)? {
            Datagram::Single(packet) => {
                return SourceResponse::new(packet, sender, self.local).map(Some)
            }
            Datagram::Split(fragment) => fragment,
        };

        let kind = self.kind;
        let group = self.groups.entry(sender).or_insert_with(|| OpenGroup {
            id: fragment.id(),
            opened: Instant::now(),
            assembler: kind.build(),
        });
        if group.id != fragment.id() {
            debug!(
                "discarding incomplete group {} from {} ({}/{} fragments)",
                group.id,
                sender,
                group.assembler.received(),
                group.assembler.count()
            );
            group.assembler.reset();
            group.id = fragment.id();
            group.opened = Instant::now();
        }

        trace!(
            "fragment {}/{} of group {} from {}",
            fragment.number() + 1,
            fragment.total(),
            fragment.id(),
            sender
        );
        let joined = match group.assembler.add(fragment) {
            Ok(false) => return Ok(None),
            Ok(true) => group.assembler.buffer().map(|buffer| buffer.into_owned()),
            Err(err) => Err(err),
        };
        self.groups.remove(&sender);

        let packet = ResponsePacket::unpack(&joined?)?;
        SourceResponse::new(packet, sender, self.local).map(Some)
    }
}

/// Runs `query` against `server`, first obtaining a challenge number.
///
/// Every kind goes through the challenge step, so all challenge replies share
/// one key. Servers that answer A2S_INFO without a challenge should be queried
/// with a plain [SourceRequest::info] instead.
pub async fn query(
    messenger: &Messenger<SourceRequest, SourceResponse>,
    query: Query,
    server: SocketAddr,
) -> Result<SourceResponse, QueryError> {
    let reply = messenger
        .query(SourceRequest::challenge(query, server))
        .await?;
    let challenge = reply.challenge().unwrap_or(NO_CHALLENGE);
    messenger
        .query(SourceRequest::new(query, server).with_challenge(challenge))
        .await
}
