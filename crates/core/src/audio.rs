//! Audio frame types and utilities

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Telephony sample rate (narrowband PCM)
pub const TELEPHONY_SAMPLE_RATE: u32 = 8000;

/// Sample rate the backend expects for caller audio
pub const BACKEND_INPUT_SAMPLE_RATE: u32 = 16000;

/// Sample rate the backend produces when the stream does not say otherwise
pub const BACKEND_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Which side of the relay a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    /// Caller side (telephony provider socket)
    Telephony,
    /// Conversational AI side
    Backend,
}

impl Leg {
    pub fn as_str(&self) -> &'static str {
        match self {
            Leg::Telephony => "telephony",
            Leg::Backend => "backend",
        }
    }
}

impl std::fmt::Display for Leg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linear PCM layout of a byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Samples per second
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Bits per sample
    pub bit_depth: u16,
}

impl AudioFormat {
    /// 16-bit little-endian mono PCM at the given rate
    pub const fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
            bit_depth: 16,
        }
    }

    /// Narrowband telephony format (8kHz PCM16 mono)
    pub const fn telephony() -> Self {
        Self::pcm16_mono(TELEPHONY_SAMPLE_RATE)
    }

    /// Bytes occupied by one sample across all channels
    pub fn bytes_per_frame(&self) -> usize {
        (self.bit_depth as usize / 8) * self.channels as usize
    }

    /// Bytes per second of audio in this format
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    /// Playback duration of `len` bytes
    pub fn duration_of(&self, len: usize) -> Duration {
        let bps = self.bytes_per_second();
        if bps == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros((len as u64 * 1_000_000) / bps as u64)
    }

    /// Byte count for `ms` milliseconds, rounded down to whole samples
    pub fn bytes_for_millis(&self, ms: u64) -> usize {
        let raw = (self.bytes_per_second() as u64 * ms / 1000) as usize;
        let frame = self.bytes_per_frame().max(1);
        raw - raw % frame
    }

    /// True for the only layout the relay converts (16-bit mono)
    pub fn is_pcm16_mono(&self) -> bool {
        self.channels == 1 && self.bit_depth == 16
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::telephony()
    }
}

/// Immutable unit of audio moving through the relay
///
/// The payload is shared, so cloning a frame never copies audio bytes and
/// nothing can mutate a frame after it is built.
#[derive(Clone)]
pub struct AudioFrame {
    payload: Arc<[u8]>,
    format: AudioFormat,
    sequence: u64,
    origin: Leg,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("len", &self.payload.len())
            .field("sample_rate", &self.format.sample_rate)
            .field("channels", &self.format.channels)
            .field("bit_depth", &self.format.bit_depth)
            .field("sequence", &self.sequence)
            .field("origin", &self.origin)
            .finish()
    }
}

impl AudioFrame {
    /// Create a frame from raw bytes
    pub fn new(payload: impl Into<Arc<[u8]>>, format: AudioFormat, sequence: u64, origin: Leg) -> Self {
        Self {
            payload: payload.into(),
            format,
            sequence,
            origin,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    pub fn bit_depth(&self) -> u16 {
        self.format.bit_depth
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn origin(&self) -> Leg {
        self.origin
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Playback duration of this frame
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.payload.len())
    }

    /// Decode the payload as little-endian i16 samples
    ///
    /// A trailing odd byte is ignored.
    pub fn pcm16_samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_arithmetic() {
        let fmt = AudioFormat::telephony();
        assert_eq!(fmt.bytes_per_second(), 16000);
        assert_eq!(fmt.bytes_for_millis(20), 320);
        assert_eq!(fmt.duration_of(320), Duration::from_millis(20));

        let wide = AudioFormat::pcm16_mono(16000);
        assert_eq!(wide.bytes_for_millis(40), 1280);
    }

    #[test]
    fn test_bytes_for_millis_rounds_to_whole_samples() {
        let fmt = AudioFormat::pcm16_mono(11025);
        assert_eq!(fmt.bytes_for_millis(1) % 2, 0);
    }

    #[test]
    fn test_frame_clone_shares_payload() {
        let frame = AudioFrame::new(vec![1u8, 0, 2, 0], AudioFormat::telephony(), 7, Leg::Telephony);
        let copy = frame.clone();
        assert_eq!(copy.payload().as_ptr(), frame.payload().as_ptr());
        assert_eq!(copy.sequence(), 7);
        assert_eq!(frame.pcm16_samples().collect::<Vec<_>>(), vec![1, 2]);
    }
}
