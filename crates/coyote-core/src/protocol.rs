//! Wire protocol for Coyote device communication
//!
//! Every frame on the transport is one JSON envelope:
//!
//! ```text
//! { "type": "bind"|"msg"|"break"|"heartbeat"|"error",
//!   "clientId": "...", "targetId": "...", "message": "..." }
//! ```
//!
//! For `type = "msg"` the `message` field carries a small text sub-protocol:
//!
//! | direction | grammar |
//! |-----------|---------|
//! | device → host | `strength-<a>+<b>+<limitA>+<limitB>` |
//! | device → host | `feedback-<buttonIndex>` |
//! | host → device | `strength-<channel>+<op>+<value>` |
//! | host → device | `pulse-<A\|B>:<jsonArrayOfHexFrames>` |
//! | host → device | `clear-<1\|2>` |

use core::fmt;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{ProtocolError, ProtocolResult};
use crate::pulse::PulseFrame;
use crate::types::{Channel, FeedbackButton, StrengthInfo, StrengthOp};

// ============================================================================
// Envelope
// ============================================================================

/// Envelope frame type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Keep-alive
    Heartbeat,
    /// Handshake
    Bind,
    /// Sub-protocol payload
    Msg,
    /// Disconnect notice
    Break,
    /// Error notice
    Error,
}

/// Message heads used in bind handshakes and `msg` payloads.
pub mod head {
    /// Bind request payload (host → device)
    pub const TARGET_ID: &str = "targetId";
    /// Bind reply / heartbeat reply payload (device → host)
    pub const DG_LAB: &str = "DGLAB";
    /// Strength report or command
    pub const STRENGTH: &str = "strength";
    /// Pulse frames
    pub const PULSE: &str = "pulse";
    /// Clear queued pulses
    pub const CLEAR: &str = "clear";
    /// Button feedback
    pub const FEEDBACK: &str = "feedback";
}

/// Return codes carried in `message` of bind/break/error/heartbeat frames.
pub mod ret_code {
    /// Success
    pub const SUCCESS: &str = "200";
    /// Peer disconnected
    pub const CLIENT_DISCONNECTED: &str = "209";
    /// Invalid client id
    pub const INVALID_CLIENT_ID: &str = "210";
    /// Server did not answer in time
    pub const SERVER_DELAY: &str = "211";
    /// Id already bound
    pub const ID_ALREADY_BOUND: &str = "400";
    /// Target client not found
    pub const TARGET_CLIENT_NOT_FOUND: &str = "401";
    /// Ids are not paired with each other
    pub const INCOMPATIBLE_RELATIONSHIP: &str = "402";
    /// Payload is not JSON
    pub const NON_JSON_CONTENT: &str = "403";
    /// Recipient not found
    pub const RECIPIENT_NOT_FOUND: &str = "404";
    /// Payload too long
    pub const MESSAGE_TOO_LONG: &str = "405";
    /// Internal error
    pub const SERVER_INTERNAL_ERROR: &str = "500";
}

/// One wire frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Frame type
    #[serde(rename = "type")]
    pub kind: MessageType,
    /// Host-side session identifier
    #[serde(default)]
    pub client_id: String,
    /// Device identifier (empty until bound)
    #[serde(default)]
    pub target_id: String,
    /// Payload
    #[serde(default, deserialize_with = "string_or_number")]
    pub message: String,
}

impl Envelope {
    /// Build an envelope.
    #[must_use]
    pub fn new(
        kind: MessageType,
        client_id: impl Into<String>,
        target_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            client_id: client_id.into(),
            target_id: target_id.into(),
            message: message.into(),
        }
    }

    /// Decode a frame received from the transport.
    pub fn decode(frame: &str) -> ProtocolResult<Self> {
        Ok(serde_json::from_str(frame)?)
    }

    /// Encode as a single-line JSON frame.
    pub fn encode(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Some devices send numeric return codes; normalise them to strings.
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}

// ============================================================================
// Inbound Sub-protocol
// ============================================================================

/// Parsed payload of an inbound `msg` frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceMessage {
    /// `strength-<a>+<b>+<limitA>+<limitB>`
    Strength {
        /// Channel A state
        a: StrengthInfo,
        /// Channel B state
        b: StrengthInfo,
    },
    /// `feedback-<buttonIndex>`
    Feedback(FeedbackButton),
    /// Any other head, kept verbatim
    Other(String),
}

impl DeviceMessage {
    /// Parse a `msg` payload sent by a device.
    pub fn parse(payload: &str) -> ProtocolResult<Self> {
        let Some((kind, body)) = payload.split_once('-') else {
            return Ok(Self::Other(payload.to_string()));
        };

        match kind {
            head::STRENGTH => parse_strength_report(payload, body),
            head::FEEDBACK => {
                let index: u8 = body
                    .trim()
                    .parse()
                    .map_err(|_| malformed(head::FEEDBACK, payload))?;
                Ok(Self::Feedback(FeedbackButton::from_index(index)?))
            }
            _ => Ok(Self::Other(payload.to_string())),
        }
    }
}

fn parse_strength_report(payload: &str, body: &str) -> ProtocolResult<DeviceMessage> {
    let values = body
        .split('+')
        .map(|v| v.trim().parse::<u32>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| malformed(head::STRENGTH, payload))?;

    let [a, b, limit_a, limit_b] = values[..] else {
        return Err(malformed(head::STRENGTH, payload));
    };

    Ok(DeviceMessage::Strength {
        a: StrengthInfo::new(a, limit_a)?,
        b: StrengthInfo::new(b, limit_b)?,
    })
}

fn malformed(kind: &'static str, payload: &str) -> ProtocolError {
    ProtocolError::MalformedMessage {
        kind,
        payload: payload.to_string(),
    }
}

// ============================================================================
// Outbound Sub-protocol
// ============================================================================

/// Payload of an outbound `msg` frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `strength-<channel>+<op>+<value>`
    Strength {
        /// Target channel
        channel: Channel,
        /// Operation
        op: StrengthOp,
        /// Operand
        value: u32,
    },
    /// `pulse-<A|B>:[...]`
    Pulse {
        /// Target channel
        channel: Channel,
        /// Frames appended to the device's playback queue
        frames: Vec<PulseFrame>,
    },
    /// `clear-<1|2>`
    Clear {
        /// Channel whose queue is flushed
        channel: Channel,
    },
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Strength { channel, op, value } => write!(
                f,
                "{}-{}+{}+{}",
                head::STRENGTH,
                channel.strength_code(),
                *op as u8,
                value
            ),
            Self::Pulse { channel, frames } => {
                write!(f, "{}-{}:[", head::PULSE, channel.pulse_code())?;
                for (i, frame) in frames.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "\"{frame}\"")?;
                }
                f.write_str("]")
            }
            Self::Clear { channel } => write!(f, "{}-{}", head::CLEAR, channel.clear_code()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
