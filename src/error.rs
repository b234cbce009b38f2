use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::key::CorrelationKey;
use crate::message::MessageType;
use crate::packet::PacketType;

/// Errors surfaced to callers of the [Messenger](crate::messenger::Messenger),
/// the [SessionManager](crate::manager::SessionManager) and the Source packet decoder.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("no response type is registered for request type `{0}`")]
    UnmappedRequestType(MessageType),

    #[error("no response for {key} after {elapsed:?}")]
    ReadTimeout {
        key: CorrelationKey,
        elapsed: Duration,
    },

    #[error("failed to send request: {0}")]
    Send(#[source] io::Error),

    #[error("failed to receive datagram: {0}")]
    Receive(#[source] io::Error),

    #[error("failed to bind local port: {0}")]
    FailedPortBind(#[source] io::Error),

    #[error("request queue is full ({capacity} requests)")]
    QueueFull { capacity: usize },

    #[error("messenger has been shut down")]
    Shutdown,

    #[error("request was abandoned before a response or timeout settled it")]
    Abandoned,

    #[error("a tokio runtime is required to schedule timeouts")]
    NoRuntime,

    #[error(transparent)]
    Assembler(#[from] AssemblerError),

    #[error("unknown packet header {0}")]
    UnknownPacketHeader(i32),

    #[error("unknown packet type {0:#04x}")]
    UnknownPacketType(u8),

    #[error("server sent a request packet ({0:?})")]
    UnexpectedRequest(PacketType),

    #[error("datagram is truncated: {0}")]
    Truncated(#[from] io::Error),
}

/// Split-packet protocol violations.
///
/// Any of these poisons the current group; the assembler must be
/// [reset](crate::split::SplitAssembler::reset) before it is reused.
#[derive(Debug, Error)]
pub enum AssemblerError {
    #[error("fragment group is already complete")]
    AlreadyComplete,

    #[error("fragment belongs to group {actual}, open group is {expected}")]
    GroupMismatch { expected: i32, actual: i32 },

    #[error("fragment {0} was already received")]
    DuplicateFragment(u8),

    #[error("fragment {number} is out of range for a group of {count}")]
    FragmentOutOfRange { number: u8, count: u8 },

    #[error("fragment group is incomplete, missing {missing:?}")]
    Incomplete { missing: Vec<u8> },

    #[error("fragment {number} carries {len} bytes, group maximum is {max}")]
    OversizedFragment { number: u8, len: usize, max: usize },

    #[error("compressed fragments are not supported by this assembler")]
    CompressionUnsupported,

    #[error("assembled buffer was already taken")]
    Consumed,

    #[error("fragment group has not been started")]
    NotStarted,

    #[error(transparent)]
    Decode(#[from] PacketDecodeError),
}

/// Failures while turning a compressed group back into its payload.
#[derive(Debug, Error)]
pub enum PacketDecodeError {
    #[error("first fragment of a compressed group carries no size or checksum")]
    MissingChecksum,

    #[error("bzip2 decompression failed: {0}")]
    Decompress(#[source] io::Error),

    #[error("decompressed {actual} bytes, expected {expected}")]
    SizeMismatch { expected: u32, actual: usize },

    #[error("checksum {actual:#010x} does not match expected {expected:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
}
