use std::fmt::{Debug, Display, Formatter};
use std::net::SocketAddr;

use bytes::{Buf, Bytes};
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 4 bytes of header plus up to 512 bytes of payload - the protocol's maximum transfer unit
pub const MAX_PACKET_SIZE: usize = 512 + 4;

#[repr(u16)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Opcode {
    ReadRequest = 1,
    WriteRequest = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}
impl Opcode {
    /// DATA and ACK carry a block number in bytes 3-4, nothing else does
    pub fn carries_sequence_number(&self) -> bool {
        matches!(self, Opcode::Data | Opcode::Ack)
    }

    pub fn short_name(&self) -> &'static str {
        match self {
            Opcode::ReadRequest => "RRQ",
            Opcode::WriteRequest => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
        }
    }
}

/// The result of looking at the first four bytes of a datagram. Parsing never fails: anything
///  that cannot be interpreted ends up as [ParsedMessage::Unrecognized], since the relay must
///  keep forwarding whatever it is given.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ParsedMessage {
    ReadRequest,
    WriteRequest,
    Data { block: u16 },
    Ack { block: u16 },
    Error { code: u16 },
    /// a well-formed opcode field with a value outside the protocol's opcodes
    Unknown { opcode: u16 },
    /// truncated datagram
    Unrecognized,
}

impl ParsedMessage {
    pub fn parse(buf: &[u8]) -> ParsedMessage {
        let mut buf = buf;
        if buf.remaining() < std::mem::size_of::<u16>() {
            return ParsedMessage::Unrecognized;
        }

        let raw_opcode = buf.get_u16();
        let opcode = match Opcode::try_from(raw_opcode) {
            Ok(opcode) => opcode,
            Err(_) => return ParsedMessage::Unknown { opcode: raw_opcode },
        };

        match opcode {
            Opcode::ReadRequest => ParsedMessage::ReadRequest,
            Opcode::WriteRequest => ParsedMessage::WriteRequest,
            _ if buf.remaining() < std::mem::size_of::<u16>() => ParsedMessage::Unrecognized,
            Opcode::Data => ParsedMessage::Data { block: buf.get_u16() },
            Opcode::Ack => ParsedMessage::Ack { block: buf.get_u16() },
            Opcode::Error => ParsedMessage::Error { code: buf.get_u16() },
        }
    }

    /// the raw opcode value, `None` for truncated datagrams
    pub fn opcode(&self) -> Option<u16> {
        match self {
            ParsedMessage::ReadRequest => Some(Opcode::ReadRequest.into()),
            ParsedMessage::WriteRequest => Some(Opcode::WriteRequest.into()),
            ParsedMessage::Data { .. } => Some(Opcode::Data.into()),
            ParsedMessage::Ack { .. } => Some(Opcode::Ack.into()),
            ParsedMessage::Error { .. } => Some(Opcode::Error.into()),
            ParsedMessage::Unknown { opcode } => Some(*opcode),
            ParsedMessage::Unrecognized => None,
        }
    }

    pub fn sequence_number(&self) -> Option<u16> {
        match self {
            ParsedMessage::Data { block } | ParsedMessage::Ack { block } => Some(*block),
            _ => None,
        }
    }
}

impl Display for ParsedMessage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ParsedMessage::ReadRequest => write!(f, "RRQ"),
            ParsedMessage::WriteRequest => write!(f, "WRQ"),
            ParsedMessage::Data { block } => write!(f, "DATA #{}", block),
            ParsedMessage::Ack { block } => write!(f, "ACK #{}", block),
            ParsedMessage::Error { code } => write!(f, "ERROR code {}", code),
            ParsedMessage::Unknown { opcode } => write!(f, "opcode {}", opcode),
            ParsedMessage::Unrecognized => write!(f, "<unrecognized>"),
        }
    }
}


/// One received datagram. It is never modified: forwarding sends a copy of the payload to
///  the destination endpoint.
#[derive(Clone, Eq, PartialEq)]
pub struct RawPacket {
    pub source: SocketAddr,
    pub payload: Bytes,
}
impl Debug for RawPacket {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "RawPacket{{{} from {:?}, {} bytes}}", self.parse(), self.source, self.payload.len())
    }
}

impl RawPacket {
    pub fn new(source: SocketAddr, payload: impl Into<Bytes>) -> RawPacket {
        RawPacket {
            source,
            payload: payload.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn parse(&self) -> ParsedMessage {
        ParsedMessage::parse(&self.payload)
    }

    /// Multi-line human readable rendering for verbose packet logging
    pub fn dump(&self) -> String {
        format!("source: {}\nport:   {}\nbytes:  {}\n{}\ncntn:   {}",
            self.source.ip(),
            self.source.port(),
            self.payload.len(),
            hex_dump(&self.payload),
            printable(&self.payload),
        )
    }
}

/// 16 bytes per line, offset in front
pub fn hex_dump(buf: &[u8]) -> String {
    buf.chunks(16)
        .enumerate()
        .map(|(i, chunk)| {
            let bytes = chunk.iter()
                .map(|b| format!("{:02x}", b))
                .collect::<Vec<_>>()
                .join(" ");
            format!("{:04x}  {}", i*16, bytes)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn printable(buf: &[u8]) -> String {
    buf.iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect()
}
