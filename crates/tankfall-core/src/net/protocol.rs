use serde::Serialize;
use serde::de::DeserializeOwned;

use super::messages::{ClientMessage, MessageType, ServerMessage};

/// Current protocol version. A `Join` carrying any other value is refused.
pub const PROTOCOL_VERSION: u8 = 1;

/// Default coordinator tick rate in Hz.
pub const DEFAULT_TICK_RATE_HZ: u32 = 30;

/// Largest encoded message, type byte included.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

#[derive(Debug)]
pub enum ProtocolError {
    Empty,
    UnknownType(u8),
    TooLarge { len: usize },
    Encode(String),
    Decode(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("message has no type byte"),
            Self::UnknownType(b) => write!(f, "unrecognized message type 0x{b:02x}"),
            Self::TooLarge { len } => {
                write!(f, "message is {len} bytes, limit is {MAX_MESSAGE_SIZE}")
            },
            Self::Encode(e) => write!(f, "encode failed: {e}"),
            Self::Decode(e) => write!(f, "decode failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Prefix the MessagePack encoding of `payload` with its type byte.
pub fn encode_message<T: Serialize>(
    msg_type: MessageType,
    payload: &T,
) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = vec![msg_type as u8];
    rmp_serde::encode::write(&mut buf, payload).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    if buf.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::TooLarge { len: buf.len() });
    }
    Ok(buf)
}

pub fn encode_client_message(msg: &ClientMessage) -> Result<Vec<u8>, ProtocolError> {
    match msg {
        ClientMessage::Join(m) => encode_message(MessageType::Join, m),
        ClientMessage::Leave(m) => encode_message(MessageType::Leave, m),
        ClientMessage::Move(m) => encode_message(MessageType::Move, m),
        ClientMessage::Turn(m) => encode_message(MessageType::Turn, m),
        ClientMessage::Fire(m) => encode_message(MessageType::Fire, m),
    }
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<Vec<u8>, ProtocolError> {
    use MessageType as T;
    match msg {
        ServerMessage::JoinResponse(m) => encode_message(T::JoinResponse, m),
        ServerMessage::ConnectionInfo(m) => encode_message(T::ConnectionInfo, m),
        ServerMessage::EntitySpawned(m) => encode_message(T::EntitySpawned, m),
        ServerMessage::RoundStarting(m) => encode_message(T::RoundStarting, m),
        ServerMessage::RoundPlaying(m) => encode_message(T::RoundPlaying, m),
        ServerMessage::RoundEnding(m) => encode_message(T::RoundEnding, m),
        ServerMessage::ShellFired(m) => encode_message(T::ShellFired, m),
        ServerMessage::ParticipantUpdate(m) => encode_message(T::ParticipantUpdate, m),
        ServerMessage::GameOver(m) => encode_message(T::GameOver, m),
    }
}

/// Peek at the type byte without decoding the payload.
pub fn decode_message_type(data: &[u8]) -> Result<MessageType, ProtocolError> {
    split_frame(data).map(|(t, _)| t)
}

fn split_frame(data: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    let (&tag, payload) = data.split_first().ok_or(ProtocolError::Empty)?;
    let msg_type = MessageType::from_byte(tag).ok_or(ProtocolError::UnknownType(tag))?;
    Ok((msg_type, payload))
}

fn payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    rmp_serde::from_slice(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

pub fn decode_client_message(data: &[u8]) -> Result<ClientMessage, ProtocolError> {
    let (msg_type, body) = split_frame(data)?;
    let msg = match msg_type {
        MessageType::Join => ClientMessage::Join(payload(body)?),
        MessageType::Leave => ClientMessage::Leave(payload(body)?),
        MessageType::Move => ClientMessage::Move(payload(body)?),
        MessageType::Turn => ClientMessage::Turn(payload(body)?),
        MessageType::Fire => ClientMessage::Fire(payload(body)?),
        other => return Err(ProtocolError::UnknownType(other as u8)),
    };
    Ok(msg)
}

pub fn decode_server_message(data: &[u8]) -> Result<ServerMessage, ProtocolError> {
    let (msg_type, body) = split_frame(data)?;
    let msg = match msg_type {
        MessageType::JoinResponse => ServerMessage::JoinResponse(payload(body)?),
        MessageType::ConnectionInfo => ServerMessage::ConnectionInfo(payload(body)?),
        MessageType::EntitySpawned => ServerMessage::EntitySpawned(payload(body)?),
        MessageType::RoundStarting => ServerMessage::RoundStarting(payload(body)?),
        MessageType::RoundPlaying => ServerMessage::RoundPlaying(payload(body)?),
        MessageType::RoundEnding => ServerMessage::RoundEnding(payload(body)?),
        MessageType::ShellFired => ServerMessage::ShellFired(payload(body)?),
        MessageType::ParticipantUpdate => ServerMessage::ParticipantUpdate(payload(body)?),
        MessageType::GameOver => ServerMessage::GameOver(payload(body)?),
        other => return Err(ProtocolError::UnknownType(other as u8)),
    };
    Ok(msg)
}
