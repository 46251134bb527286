//! Core device types: output channels, strength state and feedback buttons.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, ProtocolResult};

// ============================================================================
// Channels
// ============================================================================

/// Output channel of a device.
///
/// The discriminant is the code used by `strength-` commands. `clear-` and
/// `pulse-` commands use their own channel spellings, see
/// [`Channel::clear_code`] and [`Channel::pulse_code`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Channel {
    /// Channel A (always present)
    A = 1,
    /// Channel B (optional, ratio-linked to A)
    B = 2,
}

impl Channel {
    /// Both channels in wire order.
    pub const ALL: [Channel; 2] = [Channel::A, Channel::B];

    /// Code used in `strength-<channel>+<op>+<value>`.
    #[inline]
    #[must_use]
    pub const fn strength_code(self) -> u8 {
        self as u8
    }

    /// Code used in `clear-<code>`.
    #[inline]
    #[must_use]
    pub const fn clear_code(self) -> &'static str {
        match self {
            Self::A => "1",
            Self::B => "2",
        }
    }

    /// Code used in `pulse-<code>:[...]`.
    #[inline]
    #[must_use]
    pub const fn pulse_code(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::B => "B",
        }
    }

    /// Parse a `strength-` channel code.
    pub fn from_code(code: u8) -> ProtocolResult<Self> {
        match code {
            1 => Ok(Self::A),
            2 => Ok(Self::B),
            other => Err(ProtocolError::UnknownChannel(other)),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.pulse_code())
    }
}

// ============================================================================
// Strength
// ============================================================================

/// Strength adjustment operation of a `strength-` command.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StrengthOp {
    /// Decrease by value
    Decrease = 0,
    /// Increase by value
    Increase = 1,
    /// Set to absolute value
    SetTo = 2,
}

/// Strength state of one channel as reported by the device.
///
/// `limit` is authoritative and only ever comes from a device report.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrengthInfo {
    /// Current output strength
    pub strength: u32,
    /// Hardware limit configured on the device
    pub limit: u32,
}

impl StrengthInfo {
    /// Create a strength info, rejecting `strength > limit`.
    pub fn new(strength: u32, limit: u32) -> ProtocolResult<Self> {
        if strength > limit {
            return Err(ProtocolError::StrengthAboveLimit { strength, limit });
        }
        Ok(Self { strength, limit })
    }

    /// Clamp a requested target to this channel's limit.
    #[inline]
    #[must_use]
    pub fn clamp(&self, target: u32) -> u32 {
        target.min(self.limit)
    }
}

// ============================================================================
// Feedback Buttons
// ============================================================================

/// Device-side feedback button, as sent in `feedback-<index>`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FeedbackButton {
    /// Channel A button 1
    A1 = 0,
    /// Channel A button 2
    A2 = 1,
    /// Channel A button 3
    A3 = 2,
    /// Channel A button 4
    A4 = 3,
    /// Channel A button 5
    A5 = 4,
    /// Channel B button 1
    B1 = 5,
    /// Channel B button 2
    B2 = 6,
    /// Channel B button 3
    B3 = 7,
    /// Channel B button 4
    B4 = 8,
    /// Channel B button 5
    B5 = 9,
}

impl FeedbackButton {
    /// Convert a wire index to a button.
    pub fn from_index(index: u8) -> ProtocolResult<Self> {
        Ok(match index {
            0 => Self::A1,
            1 => Self::A2,
            2 => Self::A3,
            3 => Self::A4,
            4 => Self::A5,
            5 => Self::B1,
            6 => Self::B2,
            7 => Self::B3,
            8 => Self::B4,
            9 => Self::B5,
            other => return Err(ProtocolError::UnknownButton(other)),
        })
    }

    /// Channel the button belongs to.
    #[must_use]
    pub const fn channel(self) -> Channel {
        if (self as u8) < 5 {
            Channel::A
        } else {
            Channel::B
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
