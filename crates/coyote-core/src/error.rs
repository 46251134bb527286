//! Error types for the Coyote wire protocol and pulse codec.
//!
//! Parsing never panics on bad input from a device or a waveform file; every
//! rejection carries enough context to log the offending payload.

use thiserror::Error;

// ============================================================================
// Protocol Errors
// ============================================================================

/// Errors raised while decoding or validating wire traffic.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The frame is not a valid JSON envelope
    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(#[from] serde_json::Error),

    /// The `msg` payload does not follow its sub-protocol grammar
    #[error("Malformed {kind} message: {payload:?}")]
    MalformedMessage {
        /// Message head (`strength`, `feedback`, ...)
        kind: &'static str,
        /// Raw payload as received
        payload: String,
    },

    /// Channel code outside the known set
    #[error("Unknown channel code: {0}")]
    UnknownChannel(u8),

    /// Feedback button index outside 0..=9
    #[error("Unknown feedback button: {0}")]
    UnknownButton(u8),

    /// Reported strength exceeds the reported limit
    #[error("Reported strength {strength} exceeds limit {limit}")]
    StrengthAboveLimit {
        /// Reported strength
        strength: u32,
        /// Reported limit
        limit: u32,
    },
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Pulse Codec Errors
// ============================================================================

/// Errors raised by the pulse codec and waveform script validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PulseError {
    /// Frame hex string is not exactly 16 characters
    #[error("Pulse frame must be 16 hex characters, got {0}")]
    InvalidFrameLength(usize),

    /// Frame contains a non-hex character
    #[error("Pulse frame contains invalid hex: {0:?}")]
    InvalidHex(String),

    /// Raw byte shorthand with an unsupported length
    #[error("Raw pulse data must be 4 or 8 bytes, got {0}")]
    InvalidRawLength(usize),

    /// A `[min, max]` range with min above max
    #[error("Invalid range [{min}, {max}]")]
    InvalidRange {
        /// Lower bound
        min: u32,
        /// Upper bound
        max: u32,
    },
}

/// Result type for pulse codec operations.
pub type PulseResult<T> = Result<T, PulseError>;
