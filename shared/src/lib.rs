use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Handshake query parameter naming the participant.
pub const USER_ID_PARAM: &str = "user_id";
/// Handshake query parameter naming the room.
pub const ROOM_ID_PARAM: &str = "room_id";
/// Optional handshake query parameter selecting the outbound codec.
pub const CODEC_PARAM: &str = "codec";

pub const DEFAULT_PORT: u16 = 3000;

pub type ParticipantId = String;
pub type RoomId = String;

/// One reported incremental movement: a direction delta plus absolute facing.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct MovementRecord {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
}

impl MovementRecord {
    pub fn new(x: f32, y: f32, rotation: f32) -> Self {
        Self { x, y, rotation }
    }
}

/// Where a participant is right now, as folded from its movement records.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Default)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub rotation: f32,
}

impl Position {
    pub const ORIGIN: Position = Position {
        x: 0.0,
        y: 0.0,
        rotation: 0.0,
    };

    /// Applies one movement scaled by `speed`. Displacement accumulates,
    /// rotation is replaced.
    pub fn advance(&mut self, record: &MovementRecord, speed: f32) {
        self.x += record.x * speed;
        self.y += record.y * speed;
        self.rotation = record.rotation;
    }
}

/// Events a client sends after the handshake.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ClientEvent {
    Move(MovementRecord),
    Shot,
}

/// Events the server fans out to room members.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined {
        user_id: ParticipantId,
    },
    UserPosition {
        user_id: ParticipantId,
        x: f32,
        y: f32,
        rotation: f32,
    },
    UserMoved {
        user_id: ParticipantId,
        x: f32,
        y: f32,
        rotation: f32,
    },
    UserShot {
        user_id: ParticipantId,
    },
    UserLeft {
        user_id: ParticipantId,
    },
}

impl ServerEvent {
    pub fn position(user_id: &str, position: Position) -> Self {
        ServerEvent::UserPosition {
            user_id: user_id.to_string(),
            x: position.x,
            y: position.y,
            rotation: position.rotation,
        }
    }

    pub fn moved(user_id: &str, record: &MovementRecord) -> Self {
        ServerEvent::UserMoved {
            user_id: user_id.to_string(),
            x: record.x,
            y: record.y,
            rotation: record.rotation,
        }
    }

    /// Wire name of the event.
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::UserJoined { .. } => "user_joined",
            ServerEvent::UserPosition { .. } => "user_position",
            ServerEvent::UserMoved { .. } => "user_moved",
            ServerEvent::UserShot { .. } => "user_shot",
            ServerEvent::UserLeft { .. } => "user_left",
        }
    }

    /// The participant the event is about.
    pub fn user_id(&self) -> &str {
        match self {
            ServerEvent::UserJoined { user_id }
            | ServerEvent::UserPosition { user_id, .. }
            | ServerEvent::UserMoved { user_id, .. }
            | ServerEvent::UserShot { user_id }
            | ServerEvent::UserLeft { user_id } => user_id,
        }
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("bincode codec: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("unknown codec `{0}` (expected `json` or `bincode`)")]
    UnknownCodec(String),
}

/// Frame encoding. JSON travels in text frames, bincode in binary frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireCodec {
    #[default]
    Json,
    Bincode,
}

impl WireCodec {
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            WireCodec::Json => Ok(serde_json::to_vec(value)?),
            WireCodec::Bincode => Ok(bincode::serialize(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            WireCodec::Json => Ok(serde_json::from_slice(bytes)?),
            WireCodec::Bincode => Ok(bincode::deserialize(bytes)?),
        }
    }
}

impl FromStr for WireCodec {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(WireCodec::Json),
            "bincode" => Ok(WireCodec::Bincode),
            _ => Err(CodecError::UnknownCodec(s.to_string())),
        }
    }
}

impl fmt::Display for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireCodec::Json => f.write_str("json"),
            WireCodec::Bincode => f.write_str("bincode"),
        }
    }
}
