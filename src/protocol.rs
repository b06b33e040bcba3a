//! Wire protocol constants and messages.
//!
//! Every handshake message starts with a 4-byte message-type code; all
//! multi-byte integers are big-endian. Version negotiation is exact match
//! or reject.

/// Fixed 32-bit sentinel every handshake message must present. Used to
/// reject obviously foreign protocols early.
pub const MAGIC_NUMBER: u32 = 0xE695_5EBF;

/// The single protocol version this server speaks.
pub const PROTOCOL_VERSION: u32 = 1;

/// 4-byte message-type codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageType {
    ErrorReply = 0x0000_0001,

    ClientHello = 0x4000_0000,
    ClientHelloReply = 0x4000_0001,

    ClientTest = 0x4000_0002,
    ClientTestReply = 0x4000_0003,

    ServerHello = 0x8000_0000,
    ServerHelloReply = 0x8000_0001,
}

impl MessageType {
    /// Decode a wire code; `None` for anything this server does not speak.
    pub fn from_wire(code: u32) -> Option<MessageType> {
        match code {
            0x0000_0001 => Some(MessageType::ErrorReply),
            0x4000_0000 => Some(MessageType::ClientHello),
            0x4000_0001 => Some(MessageType::ClientHelloReply),
            0x4000_0002 => Some(MessageType::ClientTest),
            0x4000_0003 => Some(MessageType::ClientTestReply),
            0x8000_0000 => Some(MessageType::ServerHello),
            0x8000_0001 => Some(MessageType::ServerHelloReply),
            _ => None,
        }
    }
}

/// Numeric error codes carried in an ERROR_REPLY.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    InvalidMagicNumber = 1,
    UnsupportedProtocolVersion = 2,
    ClusterNameMismatch = 3,
}

pub fn invalid_magic_number_message(invalid_magic_number: u32) -> String {
    format!(
        "Server received {} as the magic number; expected {}.",
        invalid_magic_number, MAGIC_NUMBER
    )
}

pub fn unsupported_protocol_version_message(invalid_protocol_version: u32) -> String {
    format!(
        "Server received protocol version {} but this server only supports \
         the following protocol versions: [{}].",
        invalid_protocol_version, PROTOCOL_VERSION
    )
}

pub fn cluster_name_mismatch_message() -> String {
    "Cluster name mismatch.".to_string()
}
