use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::error::QueryError;
use crate::split::{Checksum, Fragment};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketHeader {
    Single,
    Split,
}

impl TryFrom<i32> for PacketHeader {
    type Error = QueryError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(PacketHeader::Single),
            -2 => Ok(PacketHeader::Split),
            n => Err(QueryError::UnknownPacketHeader(n)),
        }
    }
}

impl PacketHeader {
    pub fn to_le_bytes(self) -> [u8; 4] {
        let value: i32 = match self {
            PacketHeader::Single => -1,
            PacketHeader::Split => -2,
        };
        value.to_le_bytes()
    }
}

/// Source query packet types -- https://developer.valvesoftware.com/wiki/Server_queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    /// A2S_INFO
    InfoRequest,
    /// A2S_PLAYER
    PlayersRequest,
    /// A2S_RULES
    RulesRequest,
    /// S2C_CHALLENGE
    ///
    /// The client repeats its request with the 4-byte challenge appended.
    Challenge,
    /// S2A_INFO
    InfoResponse,
    /// S2A_PLAYER
    PlayersResponse,
    /// S2A_RULES
    RulesResponse,
}

impl TryFrom<u8> for PacketType {
    type Error = QueryError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x54 => Ok(PacketType::InfoRequest),
            0x55 => Ok(PacketType::PlayersRequest),
            0x56 => Ok(PacketType::RulesRequest),
            0x41 => Ok(PacketType::Challenge),
            0x49 => Ok(PacketType::InfoResponse),
            0x44 => Ok(PacketType::PlayersResponse),
            0x45 => Ok(PacketType::RulesResponse),
            n => Err(QueryError::UnknownPacketType(n)),
        }
    }
}

impl PacketType {
    pub fn to_byte(self) -> u8 {
        match self {
            PacketType::InfoRequest => 0x54,
            PacketType::PlayersRequest => 0x55,
            PacketType::RulesRequest => 0x56,
            PacketType::Challenge => 0x41,
            PacketType::InfoResponse => 0x49,
            PacketType::PlayersResponse => 0x44,
            PacketType::RulesResponse => 0x45,
        }
    }
}

/// Challenge value that asks the server to issue a fresh challenge.
pub const NO_CHALLENGE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    packet_type: PacketType,
    body: Vec<u8>,
    challenge: Option<i32>,
}

impl RequestPacket {
    const INFO_BODY: &'static [u8] = b"Source Engine Query\0";

    /// A2S_INFO. The challenge is only appended when the server asked for one.
    pub fn info(challenge: Option<i32>) -> Self {
        RequestPacket {
            packet_type: PacketType::InfoRequest,
            body: Self::INFO_BODY.to_vec(),
            challenge,
        }
    }

    pub fn players(challenge: i32) -> Self {
        RequestPacket {
            packet_type: PacketType::PlayersRequest,
            body: Vec::new(),
            challenge: Some(challenge),
        }
    }

    pub fn rules(challenge: i32) -> Self {
        RequestPacket {
            packet_type: PacketType::RulesRequest,
            body: Vec::new(),
            challenge: Some(challenge),
        }
    }

    /// Serializes the request: header, type, body, then the challenge if any.
    pub fn pack(&self) -> Vec<u8> {
        let mut payload: Vec<u8> = Vec::with_capacity(9 + self.body.len());
        payload.extend_from_slice(&PacketHeader::Single.to_le_bytes());
        payload.push(self.packet_type.to_byte());
        payload.extend_from_slice(&self.body);
        if let Some(challenge) = self.challenge {
            payload.extend_from_slice(&challenge.to_le_bytes());
        }
        payload
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }
}

/// A complete single-datagram (or reassembled) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    packet_type: PacketType,
    body: Vec<u8>,
}

impl ResponsePacket {
    /// Parses a payload that starts with the single-packet header.
    pub fn unpack(incoming: &[u8]) -> Result<Self, QueryError> {
        let mut cursor = Cursor::new(incoming);
        let header = PacketHeader::try_from(cursor.read_i32::<LittleEndian>()?)?;
        if header != PacketHeader::Single {
            return Err(QueryError::UnknownPacketHeader(-2));
        }
        Self::unpack_body(cursor)
    }

    fn unpack_body(mut cursor: Cursor<&[u8]>) -> Result<Self, QueryError> {
        let packet_type = PacketType::try_from(cursor.read_u8()?)?;
        let body = if packet_type == PacketType::Challenge {
            let mut challenge = [0u8; 4];
            cursor.read_exact(&mut challenge)?;
            challenge.to_vec()
        } else {
            let mut body = Vec::new();
            cursor.read_to_end(&mut body)?;
            body
        };
        Ok(ResponsePacket { packet_type, body })
    }

    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// One datagram off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    Single(ResponsePacket),
    Split(Fragment),
}

impl Datagram {
    const COMPRESSED_BIT: u32 = 0x8000_0000;

    /// Deserializes an incoming datagram, separating headers from body.
    ///
    /// Split datagrams use the Source layout: id (high bit set when the group
    /// is bzip2-compressed), total, number, maximum fragment size, and on the
    /// first fragment of a compressed group the decompressed size and CRC32.
    pub fn unpack(incoming: &[u8]) -> Result<Self, QueryError> {
        let mut cursor = Cursor::new(incoming);
        match PacketHeader::try_from(cursor.read_i32::<LittleEndian>()?)? {
            PacketHeader::Single => Ok(Datagram::Single(ResponsePacket::unpack_body(cursor)?)),
            PacketHeader::Split => {
                let id = cursor.read_i32::<LittleEndian>()?;
                let total = cursor.read_u8()?;
                let number = cursor.read_u8()?;
                let max_size = cursor.read_u16::<LittleEndian>()? as usize;
                let compressed = id as u32 & Self::COMPRESSED_BIT != 0;
                let checksum = if compressed && number == 0 {
                    Some(Checksum {
                        decompressed_size: cursor.read_u32::<LittleEndian>()?,
                        crc32: cursor.read_u32::<LittleEndian>()?,
                    })
                } else {
                    None
                };

                let mut payload = Vec::new();
                cursor.read_to_end(&mut payload)?;
                let fragment = Fragment::new(id, total, number, max_size, payload);
                Ok(Datagram::Split(if compressed {
                    fragment.with_compression(checksum)
                } else {
                    fragment
                }))
            }
        }
    }
}
