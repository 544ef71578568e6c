//! Connection control datagrams: handshake and server queries.
//!
//! A control datagram consists of a 4 byte control header, a single byte
//! opcode and a bincode encoded payload.

use bincode::{
    config::{BigEndian, Configuration, Limit, Varint},
    decode_from_slice, encode_into_slice,
    error::{DecodeError, EncodeError},
    Decode, Encode,
};
use thiserror::Error;

use crate::header::{DatagramHeader, HeaderError, CONTROL_HEADER_SIZE, MAX_DATAGRAM_SIZE};

const BINCODE_CONF: Configuration<BigEndian, Varint, Limit<MAX_DATAGRAM_SIZE>> =
    bincode::config::standard()
        .with_big_endian()
        .with_variable_int_encoding()
        .with_limit::<MAX_DATAGRAM_SIZE>();

/// Game identifier carried by connect and server info requests. Requests
/// with a different identifier are ignored.
pub const GAME_ID: &str = "ARENA";
/// Version of the network protocol. Hosts with a different version refuse
/// connections.
pub const PROTOCOL_VERSION: u8 = 3;

const OPCODE_OFFSET: usize = CONTROL_HEADER_SIZE;
const PAYLOAD_OFFSET: usize = OPCODE_OFFSET + 1;

const CONNECT: u8 = 0x01;
const SERVER_INFO_REQUEST: u8 = 0x02;
const PLAYER_INFO_REQUEST: u8 = 0x03;
const RULE_INFO_REQUEST: u8 = 0x04;
const ACCEPT: u8 = 0x81;
const REJECT: u8 = 0x82;
const SERVER_INFO: u8 = 0x83;
const PLAYER_INFO: u8 = 0x84;
const RULE_INFO: u8 = 0x85;

#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub(crate) struct Handshake {
    pub(crate) game: String,
    pub(crate) protocol: u8,
}

impl Handshake {
    pub(crate) fn current() -> Self {
        Self {
            game: GAME_ID.to_owned(),
            protocol: PROTOCOL_VERSION,
        }
    }

    pub(crate) fn is_same_game(&self) -> bool {
        self.game == GAME_ID
    }
}

/// Reply to a server info request.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct ServerInfo {
    /// Address to be used for connecting to the server.
    pub address: String,
    pub host_name: String,
    pub level_name: String,
    pub players: u8,
    pub max_players: u8,
    pub protocol: u8,
}

/// Reply to a player info request.
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct PlayerInfo {
    pub number: u8,
    pub name: String,
    pub colors: u32,
    pub frags: i32,
    /// Number of seconds the player has been connected.
    pub connect_secs: u32,
    pub address: String,
}

/// A single server rule (a variable name and its value).
#[derive(Clone, Debug, PartialEq, Eq, Encode, Decode)]
pub struct Rule {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ControlMessage {
    Connect(Handshake),
    ServerInfoRequest(Handshake),
    PlayerInfoRequest(u8),
    /// Requests the rule following the given one. Empty name requests the
    /// first rule.
    RuleInfoRequest(String),
    /// Connection accepted, the payload is the port of the dedicated
    /// connection socket.
    Accept(u16),
    Reject(String),
    ServerInfo(ServerInfo),
    PlayerInfo(PlayerInfo),
    /// None signals that there are no more rules.
    RuleInfo(Option<Rule>),
}

impl ControlMessage {
    /// Writes a complete control datagram to `buf` and returns its length.
    pub(crate) fn encode(&self, buf: &mut [u8]) -> Result<usize, ControlError> {
        if buf.len() <= OPCODE_OFFSET {
            return Err(ControlError::Encode(EncodeError::UnexpectedEnd));
        }

        let payload = &mut buf[PAYLOAD_OFFSET..];
        let (opcode, len) = match self {
            Self::Connect(handshake) => (CONNECT, encode_into_slice(handshake, payload, BINCODE_CONF)?),
            Self::ServerInfoRequest(handshake) => (
                SERVER_INFO_REQUEST,
                encode_into_slice(handshake, payload, BINCODE_CONF)?,
            ),
            Self::PlayerInfoRequest(number) => (
                PLAYER_INFO_REQUEST,
                encode_into_slice(number, payload, BINCODE_CONF)?,
            ),
            Self::RuleInfoRequest(previous) => (
                RULE_INFO_REQUEST,
                encode_into_slice(previous, payload, BINCODE_CONF)?,
            ),
            Self::Accept(port) => (ACCEPT, encode_into_slice(port, payload, BINCODE_CONF)?),
            Self::Reject(reason) => (REJECT, encode_into_slice(reason, payload, BINCODE_CONF)?),
            Self::ServerInfo(info) => (SERVER_INFO, encode_into_slice(info, payload, BINCODE_CONF)?),
            Self::PlayerInfo(info) => (PLAYER_INFO, encode_into_slice(info, payload, BINCODE_CONF)?),
            Self::RuleInfo(rule) => (RULE_INFO, encode_into_slice(rule, payload, BINCODE_CONF)?),
        };

        let len = PAYLOAD_OFFSET + len;
        if len > MAX_DATAGRAM_SIZE {
            return Err(ControlError::Oversized(len));
        }
        buf[OPCODE_OFFSET] = opcode;
        DatagramHeader::Control.write(buf, len);
        Ok(len)
    }

    /// Decodes a complete control datagram.
    pub(crate) fn decode(datagram: &[u8]) -> Result<Self, ControlError> {
        if DatagramHeader::read(datagram)? != DatagramHeader::Control {
            return Err(ControlError::NotControl);
        }
        if datagram.len() < PAYLOAD_OFFSET {
            return Err(ControlError::Empty);
        }

        let payload = &datagram[PAYLOAD_OFFSET..];
        let message = match datagram[OPCODE_OFFSET] {
            CONNECT => Self::Connect(decode(payload)?),
            SERVER_INFO_REQUEST => Self::ServerInfoRequest(decode(payload)?),
            PLAYER_INFO_REQUEST => Self::PlayerInfoRequest(decode(payload)?),
            RULE_INFO_REQUEST => Self::RuleInfoRequest(decode(payload)?),
            ACCEPT => Self::Accept(decode(payload)?),
            REJECT => Self::Reject(decode(payload)?),
            SERVER_INFO => Self::ServerInfo(decode(payload)?),
            PLAYER_INFO => Self::PlayerInfo(decode(payload)?),
            RULE_INFO => Self::RuleInfo(decode(payload)?),
            opcode => return Err(ControlError::UnknownOpcode(opcode)),
        };
        Ok(message)
    }
}

fn decode<T: Decode<()>>(payload: &[u8]) -> Result<T, ControlError> {
    let (value, len) = decode_from_slice(payload, BINCODE_CONF)?;
    if len != payload.len() {
        return Err(ControlError::TrailingBytes(payload.len() - len));
    }
    Ok(value)
}

#[derive(Error, Debug)]
pub(crate) enum ControlError {
    #[error("malformed header: {0}")]
    Header(#[from] HeaderError),
    #[error("not a control datagram")]
    NotControl,
    #[error("control datagram without opcode")]
    Empty,
    #[error("unknown control opcode {0:#04x}")]
    UnknownOpcode(u8),
    #[error("{0} unexpected bytes after the payload")]
    TrailingBytes(usize),
    #[error("control datagram of {0} bytes is too large")]
    Oversized(usize),
    #[error("failed to encode control message")]
    Encode(#[from] EncodeError),
    #[error("failed to decode control message")]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_connect() {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let len = ControlMessage::Connect(Handshake::current())
            .encode(&mut buf)
            .unwrap();

        assert_eq!(
            &buf[..len],
            &[128, 0, 0, 12, CONNECT, 5, b'A', b'R', b'E', b'N', b'A', 3]
        );
        assert_eq!(
            ControlMessage::decode(&buf[..len]).unwrap(),
            ControlMessage::Connect(Handshake::current())
        );
    }

    #[test]
    fn test_accept() {
        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let len = ControlMessage::Accept(26001).encode(&mut buf).unwrap();
        assert_eq!(buf[OPCODE_OFFSET], ACCEPT);
        assert_eq!(
            ControlMessage::decode(&buf[..len]).unwrap(),
            ControlMessage::Accept(26001)
        );
    }

    #[test]
    fn test_server_info() {
        let info = ServerInfo {
            address: "10.0.0.2:26000".to_owned(),
            host_name: "arena".to_owned(),
            level_name: "e1m1".to_owned(),
            players: 2,
            max_players: 8,
            protocol: PROTOCOL_VERSION,
        };

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        let len = ControlMessage::ServerInfo(info.clone())
            .encode(&mut buf)
            .unwrap();
        assert_eq!(
            ControlMessage::decode(&buf[..len]).unwrap(),
            ControlMessage::ServerInfo(info)
        );
    }

    #[test]
    fn test_oversized() {
        let mut buf = [0u8; 1024];
        let result = ControlMessage::Reject("x".repeat(600)).encode(&mut buf);
        // Header, opcode, 3 byte string length and the string.
        assert!(matches!(result, Err(ControlError::Oversized(608))));
    }

    #[test]
    fn test_invalid() {
        assert!(matches!(
            ControlMessage::decode(&[0, 2, 0, 8, 0, 0, 0, 1]),
            Err(ControlError::NotControl)
        ));
        assert!(matches!(
            ControlMessage::decode(&[128, 0, 0, 4]),
            Err(ControlError::Empty)
        ));
        assert!(matches!(
            ControlMessage::decode(&[128, 0, 0, 5, 0x42]),
            Err(ControlError::UnknownOpcode(0x42))
        ));
        assert!(matches!(
            ControlMessage::decode(&[128, 0, 0, 6, ACCEPT, 0xff]),
            Err(ControlError::Decode(_))
        ));
        assert!(matches!(
            ControlMessage::decode(&[128, 0, 0, 7, PLAYER_INFO_REQUEST, 1, 2]),
            Err(ControlError::TrailingBytes(1))
        ));
        assert!(matches!(
            ControlMessage::decode(&[128, 0, 0, 9, ACCEPT]),
            Err(ControlError::Header(HeaderError::LengthMismatch { .. }))
        ));
    }
}
