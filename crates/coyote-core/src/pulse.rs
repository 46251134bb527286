//! Pulse codec
//!
//! Translates declarative waveform scripts into the device's 8-byte pulse
//! frames, and real frequencies (Hz) into the device's 1-byte compressed form.
//!
//! # Frame layout
//!
//! ```text
//! ┌────────┬────────┬────────┬────────┬────────┬────────┬────────┬────────┐
//! │ freq0  │ freq1  │ freq2  │ freq3  │ int0   │ int1   │ int2   │ int3   │
//! └────────┴────────┴────────┴────────┴────────┴────────┴────────┴────────┘
//! ```
//!
//! One frame covers [`FRAME_WINDOW_MS`] of output; each byte pair describes
//! a 25 ms quarter of it.

use core::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{PulseError, PulseResult};

/// Duration of device output covered by one frame.
pub const FRAME_WINDOW_MS: u32 = 100;

/// Frequency byte used by the 4-byte intensity-only script shorthand.
pub const DEFAULT_FREQUENCY_BYTE: u8 = 10;

// ============================================================================
// Frequency Compression
// ============================================================================

/// Compress a real frequency in Hz into the device's 1-byte encoding.
///
/// Lossy and monotonic inside `[10, 1000]`. Out of range yields `0`.
#[must_use]
pub fn compress_frequency(freq: u32) -> u8 {
    match freq {
        0 => 0,
        1..=9 => 10,
        10..=100 => freq as u8,
        101..=600 => (100 + (freq - 100) / 5) as u8,
        601..=1000 => (200 + (freq - 600) / 10) as u8,
        _ => 0,
    }
}

/// Expand a compressed frequency byte back into Hz.
#[must_use]
pub fn decompress_frequency(byte: u8) -> u32 {
    let b = u32::from(byte);
    match b {
        0 => 0,
        1..=9 => 10,
        10..=100 => b,
        101..=200 => (b - 100) * 5 + 100,
        201..=240 => (b - 200) * 10 + 600,
        _ => 0,
    }
}

// ============================================================================
// Pulse Frame
// ============================================================================

/// One 100 ms unit of device output.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PulseFrame {
    /// Compressed frequency bytes
    pub freq: [u8; 4],
    /// Intensity bytes
    pub intensity: [u8; 4],
}

impl PulseFrame {
    /// The all-zero frame.
    pub const SILENCE: Self = Self {
        freq: [0; 4],
        intensity: [0; 4],
    };

    /// Parse a 16-character hex frame (either case).
    pub fn from_hex(hex: &str) -> PulseResult<Self> {
        let hex = hex.trim();
        if hex.len() != 16 {
            return Err(PulseError::InvalidFrameLength(hex.len()));
        }
        // from_str_radix alone would take a sign
        if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PulseError::InvalidHex(hex.to_string()));
        }

        let invalid = || PulseError::InvalidHex(hex.to_string());
        let mut bytes = [0u8; 8];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let pair = hex.get(i * 2..i * 2 + 2).ok_or_else(invalid)?;
            *byte = u8::from_str_radix(pair, 16).map_err(|_| invalid())?;
        }

        Ok(Self::from_bytes(bytes))
    }

    /// Build from the 8 wire bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        let mut frame = Self::SILENCE;
        frame.freq.copy_from_slice(&bytes[..4]);
        frame.intensity.copy_from_slice(&bytes[4..]);
        frame
    }

    /// The 8 wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[..4].copy_from_slice(&self.freq);
        bytes[4..].copy_from_slice(&self.intensity);
        bytes
    }

    /// Uppercase hex encoding as sent on the wire.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Build a frame from real frequencies (Hz) and intensities.
    #[must_use]
    pub fn encode(freq_hz: [u32; 4], intensity: [u8; 4]) -> Self {
        Self {
            freq: freq_hz.map(compress_frequency),
            intensity,
        }
    }

    /// Split into real frequencies (Hz) and intensities.
    #[must_use]
    pub fn decode(&self) -> ([u32; 4], [u8; 4]) {
        (self.freq.map(decompress_frequency), self.intensity)
    }

    /// Whether this frame produces no output.
    #[inline]
    #[must_use]
    pub fn is_silent(&self) -> bool {
        self.intensity == [0; 4]
    }
}

impl fmt::Display for PulseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl Serialize for PulseFrame {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PulseFrame {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Self::from_hex(&hex).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Waveform Scripts
// ============================================================================

/// A fixed value or an inclusive `[min, max]` range, sampled uniformly.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ValueRange {
    /// Lower bound (inclusive)
    pub min: u32,
    /// Upper bound (inclusive)
    pub max: u32,
}

impl ValueRange {
    /// A range that always resolves to `value`.
    #[must_use]
    pub const fn fixed(value: u32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    /// A `[min, max]` range.
    pub fn new(min: u32, max: u32) -> PulseResult<Self> {
        if min > max {
            return Err(PulseError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    /// Resolve to a concrete value.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> u32 {
        if self.min == self.max {
            self.min
        } else {
            rng.gen_range(self.min..=self.max)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawRange {
    Fixed(u32),
    Span([u32; 2]),
}

impl TryFrom<RawRange> for ValueRange {
    type Error = PulseError;

    fn try_from(raw: RawRange) -> PulseResult<Self> {
        match raw {
            RawRange::Fixed(v) => Ok(Self::fixed(v)),
            RawRange::Span([min, max]) => Self::new(min, max),
        }
    }
}

impl From<ValueRange> for RawRange {
    fn from(range: ValueRange) -> Self {
        if range.min == range.max {
            Self::Fixed(range.min)
        } else {
            Self::Span([range.min, range.max])
        }
    }
}

/// `pulse` content as written in script files.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum RawPulse {
    /// One hex frame
    Hex(String),
    /// A list of hex frames
    HexList(Vec<String>),
    /// Raw bytes: 8 = one full frame, 4 = intensities at the default frequency
    Bytes(Vec<u8>),
}

impl RawPulse {
    fn into_frames(self) -> PulseResult<Vec<PulseFrame>> {
        match self {
            RawPulse::Hex(hex) => Ok(vec![PulseFrame::from_hex(&hex)?]),
            RawPulse::HexList(list) => list.iter().map(|hex| PulseFrame::from_hex(hex)).collect(),
            RawPulse::Bytes(bytes) => match bytes.len() {
                8 => {
                    let mut all = [0u8; 8];
                    all.copy_from_slice(&bytes);
                    Ok(vec![PulseFrame::from_bytes(all)])
                }
                4 => {
                    let mut intensity = [0u8; 4];
                    intensity.copy_from_slice(&bytes);
                    Ok(vec![PulseFrame {
                        freq: [DEFAULT_FREQUENCY_BYTE; 4],
                        intensity,
                    }])
                }
                n => Err(PulseError::InvalidRawLength(n)),
            },
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RawScriptItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pulse: Option<RawPulse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wait: Option<RawRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repeat: Option<RawRange>,
}

/// One step of a waveform script.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawScriptItem", into = "RawScriptItem")]
pub struct ScriptItem {
    /// Frames emitted per repetition
    pub pulse: Vec<PulseFrame>,
    /// Silence appended per repetition, in milliseconds
    pub wait: Option<ValueRange>,
    /// Number of repetitions (defaults to 1)
    pub repeat: Option<ValueRange>,
}

impl TryFrom<RawScriptItem> for ScriptItem {
    type Error = PulseError;

    fn try_from(raw: RawScriptItem) -> PulseResult<Self> {
        Ok(Self {
            pulse: raw.pulse.map(RawPulse::into_frames).transpose()?.unwrap_or_default(),
            wait: raw.wait.map(ValueRange::try_from).transpose()?,
            repeat: raw.repeat.map(ValueRange::try_from).transpose()?,
        })
    }
}

impl From<ScriptItem> for RawScriptItem {
    fn from(item: ScriptItem) -> Self {
        Self {
            pulse: (!item.pulse.is_empty())
                .then(|| RawPulse::HexList(item.pulse.iter().map(PulseFrame::to_hex).collect())),
            wait: item.wait.map(RawRange::from),
            repeat: item.repeat.map(RawRange::from),
        }
    }
}

/// A named, immutable waveform definition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformScript {
    /// Unique identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Steps, played in order
    pub script: Vec<ScriptItem>,
}

impl WaveformScript {
    /// One second of silence, used when no waveform is available.
    #[must_use]
    pub fn fallback() -> Self {
        Self {
            id: "default".to_string(),
            name: "Default".to_string(),
            script: vec![ScriptItem {
                wait: Some(ValueRange::fixed(1000)),
                ..ScriptItem::default()
            }],
        }
    }

    /// Resolve all ranges and produce one playable batch of frames.
    pub fn expand<R: Rng>(&self, rng: &mut R) -> ExpandedPulse {
        expand(&self.script, rng)
    }
}

/// Result of expanding a script once.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExpandedPulse {
    /// Frames in playback order
    pub frames: Vec<PulseFrame>,
    /// Playback duration of `frames`
    pub duration_ms: u32,
}

/// Expand script items into frames.
///
/// Each repetition emits the item's frames followed by its wait, rounded up
/// to whole frame windows of silence. Ranges are sampled per repetition.
pub fn expand<R: Rng>(items: &[ScriptItem], rng: &mut R) -> ExpandedPulse {
    let mut frames = Vec::new();

    for item in items {
        let repeat = item.repeat.map_or(1, |r| r.sample(rng));
        for _ in 0..repeat {
            frames.extend_from_slice(&item.pulse);
            if let Some(wait) = item.wait {
                let windows = wait.sample(rng).div_ceil(FRAME_WINDOW_MS);
                frames.extend((0..windows).map(|_| PulseFrame::SILENCE));
            }
        }
    }

    let duration_ms = u32::try_from(frames.len())
        .unwrap_or(u32::MAX)
        .saturating_mul(FRAME_WINDOW_MS);
    ExpandedPulse { frames, duration_ms }
}

// ============================================================================
// Tests
// ============================================================================
