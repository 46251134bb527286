//! Coyote Core - device types, wire protocol and pulse codec
//!
//! This crate holds everything about talking to a Coyote stimulation device
//! that does not need an async runtime: the JSON envelope and its `msg`
//! sub-protocol, channel and strength types, and the pulse codec that turns
//! waveform scripts into 8-byte frames.
//!
//! # Modules
//!
//! - [`types`]: Channels, strength state, feedback buttons
//! - [`error`]: Error types for the protocol and the pulse codec
//! - [`protocol`]: Wire envelope, return codes, `msg` parsing and formatting
//! - [`pulse`]: Frequency compression, frames, waveform scripts
//!
//! # Example
//!
//! ```rust
//! use coyote_core::pulse::{compress_frequency, WaveformScript};
//! use rand::SeedableRng;
//!
//! assert_eq!(compress_frequency(600), 200);
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! let batch = WaveformScript::fallback().expand(&mut rng);
//! assert_eq!(batch.duration_ms, 1000);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_possible_truncation)]

pub mod error;
pub mod protocol;
pub mod pulse;
pub mod types;

// Re-export commonly used types at crate root
pub use error::{ProtocolError, ProtocolResult, PulseError, PulseResult};
pub use protocol::{Command, DeviceMessage, Envelope, MessageType};
pub use pulse::{ExpandedPulse, PulseFrame, ScriptItem, ValueRange, WaveformScript};
pub use types::{Channel, FeedbackButton, StrengthInfo, StrengthOp};
