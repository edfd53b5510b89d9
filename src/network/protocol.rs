//! Network protocol message types
//!
//! Length-prefixed JSON messages over TCP: a big-endian u32 byte count
//! followed by one serde_json-encoded `Message`.

use super::DeviceInfo;
use crate::game::{Player, PlayerId, SubmittedTurnResult};
use crate::multiplayer::round::{PlayerRoundStatus, RoundPhase, TurnStatus};
use crate::multiplayer::TurnProgressData;
use crate::rules::{GameSettings, ScoringRulesStore};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

/// Largest accepted frame body
pub const MAX_MESSAGE_LEN: usize = 1024 * 1024;

/// Messages sent between devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Client introduces itself after connecting (client -> host)
    Hello { device: DeviceInfo, version: String },
    /// Host accepts a device (host -> new client)
    Welcome {
        host: DeviceInfo,
        devices: Vec<DeviceInfo>,
    },
    /// Device is leaving
    Leave { device_id: String },
    /// Player control moved to a device; None means host-controlled (host -> all)
    AssignPlayer {
        player_id: PlayerId,
        device_id: Option<String>,
    },
    /// Game configuration and roster (host -> all)
    GameStarted {
        game_id: String,
        rules: ScoringRulesStore,
        settings: GameSettings,
        players: Vec<Player>,
        assignments: Vec<(PlayerId, String)>,
    },
    /// A new round and its initial statuses (host -> all)
    RoundStarted {
        round: u32,
        final_round: bool,
        statuses: Vec<PlayerRoundStatus>,
    },
    /// A device began playing a player's turn (owner -> host)
    TurnStarted { round: u32, player_id: PlayerId },
    /// Live view of an in-progress turn; never authoritative
    TurnProgress(TurnProgressData),
    /// Finalized turn (owner -> host)
    TurnSubmission {
        round: u32,
        result: SubmittedTurnResult,
    },
    /// Status change for one player in the current round (host -> all)
    RoundStatus {
        round: u32,
        player_id: PlayerId,
        status: TurnStatus,
    },
    /// Canonical player records after an accepted change (host -> all)
    StateUpdate {
        round: u32,
        phase: RoundPhase,
        players: Vec<Player>,
    },
    /// Host refused a submission (host -> submitting device)
    SubmissionRejected {
        round: u32,
        player_id: PlayerId,
        reason: String,
    },
    /// Final standings (host -> all)
    GameOver {
        players: Vec<Player>,
        winner: Option<PlayerId>,
    },
    /// Ping to check connection
    Ping,
    /// Response to ping
    Pong,
}

impl Message {
    /// Serialize message to bytes (length-prefixed JSON)
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let json = serde_json::to_vec(self).map_err(io::Error::other)?;
        if json.len() > MAX_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "message too large"));
        }
        let len = json.len() as u32;
        let mut bytes = Vec::with_capacity(4 + json.len());
        bytes.extend_from_slice(&len.to_be_bytes());
        bytes.extend_from_slice(&json);
        Ok(bytes)
    }

    /// Deserialize message from bytes (length-prefixed JSON).
    /// Returns the message and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> io::Result<(Self, usize)> {
        if bytes.len() < 4 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "need 4 bytes for length"));
        }
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
        }
        if bytes.len() < 4 + len {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "incomplete message"));
        }
        let msg = serde_json::from_slice(&bytes[4..4 + len])
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok((msg, 4 + len))
    }

    /// Write message to a stream
    pub fn write_to<W: Write>(&self, stream: &mut W) -> io::Result<()> {
        let bytes = self.to_bytes()?;
        stream.write_all(&bytes)?;
        stream.flush()
    }

    /// Read one message from a stream
    pub fn read_from<R: Read>(stream: &mut R) -> io::Result<Self> {
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf)?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > MAX_MESSAGE_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "message too large"));
        }

        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;
        serde_json::from_slice(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    /// Whether the message changes canonical state when applied by the host
    pub fn is_state_mutating(&self) -> bool {
        matches!(self, Message::TurnSubmission { .. })
    }
}
