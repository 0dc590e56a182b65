//! Message framing and the message id space.
//!
//! Every datagram starts with a little-endian `u32` message id followed by
//! the payload; total length comes from the transport's datagram boundary,
//! so there is no in-band length prefix. The payload of every message
//! therefore starts at byte [`Message::PAYLOAD_START_POS`].

use crate::error::ProtocolErrorKind;
use crate::network::serialization as ser;

/// The seven message ids of protocol version 3.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageId {
    /// Client → server: protocol version and client timestamp.
    Connect = 0,
    /// Either direction: tagged disconnect reason.
    Disconnect = 1,
    /// Server → client: accept with the server update index and the echoed
    /// client timestamp.
    ConnectionAccepted = 2,
    /// Client → server: compressed input window.
    PlayerInput = 3,
    /// Server → client: authoritative entity moves for one update.
    EntityMove = 4,
    /// Server → client: gameplay commands for one update.
    GameplayCommand = 5,
    /// Server → client: authoritative world replacement.
    WorldSnapshot = 6,
}

impl MessageId {
    /// Decodes a raw message id.
    ///
    /// # Errors
    /// Returns [`ProtocolErrorKind::UnknownMessageId`] for ids outside the
    /// protocol.
    pub fn from_u32(raw: u32) -> Result<Self, ProtocolErrorKind> {
        match raw {
            0 => Ok(Self::Connect),
            1 => Ok(Self::Disconnect),
            2 => Ok(Self::ConnectionAccepted),
            3 => Ok(Self::PlayerInput),
            4 => Ok(Self::EntityMove),
            5 => Ok(Self::GameplayCommand),
            6 => Ok(Self::WorldSnapshot),
            id => Err(ProtocolErrorKind::UnknownMessageId { id }),
        }
    }
}

/// One framed wire message: the id header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The raw bytes, id header included.
    pub data: Vec<u8>,
}

impl Message {
    /// Offset of the first payload byte (the id header is four bytes).
    pub const PAYLOAD_START_POS: usize = 4;

    /// Creates an empty message of the given id.
    #[must_use]
    pub fn new(id: MessageId) -> Self {
        let mut data = Vec::with_capacity(Self::PAYLOAD_START_POS);
        ser::append_u32(&mut data, id as u32);
        Message { data }
    }

    /// Creates a message of the given id carrying `payload`.
    #[must_use]
    pub fn with_payload(id: MessageId, payload: &[u8]) -> Self {
        let mut message = Self::new(id);
        message.data.extend_from_slice(payload);
        message
    }

    /// Reads the message id from the header.
    ///
    /// # Errors
    /// Returns a protocol error for a truncated header or unknown id.
    pub fn message_id(&self) -> Result<MessageId, ProtocolErrorKind> {
        let mut cursor = 0;
        let raw = ser::require(ser::read_u32(&self.data, &mut cursor), 0, self.data.len())?;
        MessageId::from_u32(raw)
    }

    /// The payload bytes after the id header.
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        self.data.get(Self::PAYLOAD_START_POS..).unwrap_or(&[])
    }
}

/// Why a peer is being disconnected. Serialised tag-first; the version
/// mismatch variant additionally carries both protocol versions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DisconnectReason {
    /// The two ends speak different protocol versions.
    IncompatibleNetworkProtocolVersion {
        /// The server's protocol version.
        server_version: u32,
        /// The client's protocol version.
        client_version: u32,
    },
    /// The client is shutting down.
    ClientShutdown,
    /// The server is shutting down.
    ServerShutdown,
    /// Any tag this build does not know (including the tag used to drop
    /// misbehaving peers).
    Unknown {
        /// The raw reason tag.
        tag: u8,
    },
}

impl DisconnectReason {
    /// The wire tag of this reason. The version-mismatch variant must keep
    /// tag zero.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::IncompatibleNetworkProtocolVersion { .. } => 0,
            Self::ClientShutdown => 1,
            Self::ServerShutdown => 2,
            Self::Unknown { tag } => *tag,
        }
    }

    /// Appends the reason to a payload: the tag, then any tag-specific
    /// fields.
    pub fn append(&self, buf: &mut Vec<u8>) {
        ser::append_u8(buf, self.tag());
        if let Self::IncompatibleNetworkProtocolVersion {
            server_version,
            client_version,
        } = self
        {
            ser::append_u32(buf, *server_version);
            ser::append_u32(buf, *client_version);
        }
    }

    /// Reads a reason at `cursor`. Tags outside the known set decode as
    /// [`DisconnectReason::Unknown`] - receiving one is not itself a
    /// protocol error.
    ///
    /// # Errors
    /// Returns a protocol error only when the payload is truncated.
    pub fn read(buf: &[u8], cursor: &mut usize) -> Result<Self, ProtocolErrorKind> {
        let tag = ser::require(ser::read_u8(buf, cursor), *cursor, buf.len())?;
        match tag {
            0 => {
                let server_version =
                    ser::require(ser::read_u32(buf, cursor), *cursor, buf.len())?;
                let client_version =
                    ser::require(ser::read_u32(buf, cursor), *cursor, buf.len())?;
                Ok(Self::IncompatibleNetworkProtocolVersion {
                    server_version,
                    client_version,
                })
            },
            1 => Ok(Self::ClientShutdown),
            2 => Ok(Self::ServerShutdown),
            tag => Ok(Self::Unknown { tag }),
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IncompatibleNetworkProtocolVersion {
                server_version,
                client_version,
            } => {
                write!(
                    f,
                    "incompatible network protocol version (client {}, server {})",
                    client_version, server_version
                )
            },
            Self::ClientShutdown => write!(f, "client shut down"),
            Self::ServerShutdown => write!(f, "server shut down"),
            Self::Unknown { tag } => write!(f, "unknown reason ({})", tag),
        }
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_four_little_endian_bytes() {
        let message = Message::new(MessageId::PlayerInput);
        assert_eq!(message.data, vec![3, 0, 0, 0]);
        assert_eq!(message.message_id(), Ok(MessageId::PlayerInput));
        assert!(message.payload().is_empty());
    }

    #[test]
    fn payload_starts_after_header() {
        let message = Message::with_payload(MessageId::Connect, &[0xAA, 0xBB]);
        assert_eq!(message.payload(), &[0xAA, 0xBB]);
        assert_eq!(message.data.len(), Message::PAYLOAD_START_POS + 2);
    }

    #[test]
    fn all_ids_roundtrip() {
        for raw in 0..7u32 {
            let id = MessageId::from_u32(raw).unwrap();
            assert_eq!(id as u32, raw);
        }
    }

    #[test]
    fn unknown_id_is_rejected() {
        assert!(matches!(
            MessageId::from_u32(7),
            Err(ProtocolErrorKind::UnknownMessageId { id: 7 })
        ));
    }

    #[test]
    fn truncated_header_is_rejected() {
        let message = Message {
            data: vec![1, 0],
        };
        assert!(matches!(
            message.message_id(),
            Err(ProtocolErrorKind::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn disconnect_reason_tags() {
        assert_eq!(
            DisconnectReason::IncompatibleNetworkProtocolVersion {
                server_version: 3,
                client_version: 2,
            }
            .tag(),
            0
        );
        assert_eq!(DisconnectReason::ClientShutdown.tag(), 1);
        assert_eq!(DisconnectReason::ServerShutdown.tag(), 2);
        assert_eq!(DisconnectReason::Unknown { tag: 9 }.tag(), 9);
    }

    #[test]
    fn version_mismatch_roundtrips_with_versions() {
        let reason = DisconnectReason::IncompatibleNetworkProtocolVersion {
            server_version: 3,
            client_version: 2,
        };
        let mut buf = Vec::new();
        reason.append(&mut buf);
        assert_eq!(buf.len(), 1 + 4 + 4);

        let mut cursor = 0;
        assert_eq!(DisconnectReason::read(&buf, &mut cursor), Ok(reason));
        assert_eq!(cursor, buf.len());
    }

    #[test]
    fn simple_reasons_roundtrip() {
        for reason in [
            DisconnectReason::ClientShutdown,
            DisconnectReason::ServerShutdown,
        ] {
            let mut buf = Vec::new();
            reason.append(&mut buf);
            assert_eq!(buf.len(), 1);
            let mut cursor = 0;
            assert_eq!(DisconnectReason::read(&buf, &mut cursor), Ok(reason));
        }
    }

    #[test]
    fn unknown_tag_decodes_as_unknown() {
        let buf = vec![42u8];
        let mut cursor = 0;
        assert_eq!(
            DisconnectReason::read(&buf, &mut cursor),
            Ok(DisconnectReason::Unknown { tag: 42 })
        );
    }

    #[test]
    fn reason_display() {
        let reason = DisconnectReason::IncompatibleNetworkProtocolVersion {
            server_version: 3,
            client_version: 2,
        };
        let display = format!("{}", reason);
        assert!(display.contains("incompatible"));
        assert!(display.contains('2'));
        assert!(display.contains('3'));
    }
}
