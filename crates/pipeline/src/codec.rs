//! Audio frame codec
//!
//! Converts PCM16 mono between the telephony rate and the backend rates with
//! a streaming linear resampler. Each direction keeps its own resampler so
//! interpolation stays continuous across chunk boundaries within a call.

use voice_relay_core::{AudioFormat, AudioFrame, Leg};

use crate::PipelineError;

/// Streaming linear-interpolation resampler for PCM16 mono
///
/// Positions are tracked in exact integer units (`1 / to_rate` of an input
/// sample), so long calls do not drift. The last input sample of each chunk
/// is kept to interpolate across the boundary, and an odd trailing byte is
/// carried into the next call.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u32,
    to_rate: u32,
    /// Reduced input step per output sample
    step: u64,
    /// Reduced output denominator
    denom: u64,
    /// Next output position; index 0 is `last`, index k+1 is input sample k
    position: u64,
    last: i16,
    carry: Option<u8>,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let g = gcd(from_rate as u64, to_rate as u64).max(1);
        let step = from_rate as u64 / g;
        let denom = to_rate as u64 / g;
        Self {
            from_rate,
            to_rate,
            step,
            denom,
            position: denom,
            last: 0,
            carry: None,
        }
    }

    pub fn from_rate(&self) -> u32 {
        self.from_rate
    }

    pub fn to_rate(&self) -> u32 {
        self.to_rate
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Split `bytes` into whole samples, honoring and updating the carry byte
    fn whole_samples(&mut self, bytes: &[u8]) -> Vec<i16> {
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;

        if let Some(lo) = self.carry.take() {
            match rest.split_first() {
                Some((hi, tail)) => {
                    samples.push(i16::from_le_bytes([lo, *hi]));
                    rest = tail;
                }
                None => {
                    self.carry = Some(lo);
                    return samples;
                }
            }
        }

        let mut pairs = rest.chunks_exact(2);
        samples.extend(pairs.by_ref().map(|p| i16::from_le_bytes([p[0], p[1]])));
        if let [odd] = pairs.remainder() {
            self.carry = Some(*odd);
        }
        samples
    }

    /// Resample one chunk of little-endian PCM16 bytes
    pub fn process(&mut self, bytes: &[u8]) -> Vec<u8> {
        if self.is_passthrough() && self.carry.is_none() && bytes.len() % 2 == 0 {
            return bytes.to_vec();
        }

        let samples = self.whole_samples(bytes);
        if samples.is_empty() {
            return Vec::new();
        }

        if self.is_passthrough() {
            return samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        }

        let end = samples.len() as u64 * self.denom;
        let estimate = (end.saturating_sub(self.position) / self.step + 1) as usize;
        let mut out = Vec::with_capacity(estimate * 2);

        while self.position < end {
            let idx = (self.position / self.denom) as usize;
            let frac = (self.position % self.denom) as i64;
            let a = i64::from(if idx == 0 { self.last } else { samples[idx - 1] });
            let b = i64::from(samples[idx]);
            let denom = self.denom as i64;
            let value = (a * (denom - frac) + b * frac) / denom;
            out.extend_from_slice(&(value as i16).to_le_bytes());
            self.position += self.step;
        }

        self.position -= end;
        self.last = samples[samples.len() - 1];
        out
    }
}

/// One conversion direction with its own resampler and sequence counter
#[derive(Debug)]
pub struct CodecDirection {
    target: AudioFormat,
    origin: Leg,
    resampler: Option<LinearResampler>,
    sequence: u64,
}

impl CodecDirection {
    fn new(target: AudioFormat, origin: Leg) -> Self {
        Self {
            target,
            origin,
            resampler: None,
            sequence: 0,
        }
    }

    /// Output format of this direction
    pub fn target(&self) -> AudioFormat {
        self.target
    }

    /// Convert one chunk of raw PCM16 from `source` into the target format
    pub fn encode(&mut self, raw: &[u8], source: AudioFormat) -> Result<AudioFrame, PipelineError> {
        check_format(source)?;

        let current = self.resampler.as_ref().map(|r| r.from_rate());
        if current != Some(source.sample_rate) {
            if let Some(previous) = current {
                tracing::debug!(
                    from = previous,
                    to = source.sample_rate,
                    origin = %self.origin,
                    "Source sample rate changed, resetting resampler"
                );
            }
            self.resampler = None;
        }
        let target_rate = self.target.sample_rate;
        let resampler = self
            .resampler
            .get_or_insert_with(|| LinearResampler::new(source.sample_rate, target_rate));

        let converted = resampler.process(raw);
        let frame = AudioFrame::new(converted, self.target, self.sequence, self.origin);
        self.sequence += 1;
        Ok(frame)
    }
}

fn check_format(format: AudioFormat) -> Result<(), PipelineError> {
    if format.channels != 1 {
        return Err(PipelineError::UnsupportedFormat(format!(
            "{} channels (only mono is supported)",
            format.channels
        )));
    }
    if format.bit_depth != 16 {
        return Err(PipelineError::UnsupportedFormat(format!(
            "{}-bit samples (only 16-bit PCM is supported)",
            format.bit_depth
        )));
    }
    if format.sample_rate == 0 {
        return Err(PipelineError::UnsupportedFormat(
            "sample rate of 0".to_string(),
        ));
    }
    Ok(())
}

/// Per-session audio codec
///
/// Owns resampler state for both directions. Create one per session; state
/// never crosses sessions.
#[derive(Debug)]
pub struct AudioCodec {
    to_backend: CodecDirection,
    to_telephony: CodecDirection,
}

impl AudioCodec {
    /// Codec between a telephony rate and the backend input rate
    pub fn new(telephony_rate: u32, backend_input_rate: u32) -> Self {
        Self {
            to_backend: CodecDirection::new(
                AudioFormat::pcm16_mono(backend_input_rate),
                Leg::Telephony,
            ),
            to_telephony: CodecDirection::new(AudioFormat::pcm16_mono(telephony_rate), Leg::Backend),
        }
    }

    /// Format produced by [`Self::encode_for_backend`]
    pub fn backend_format(&self) -> AudioFormat {
        self.to_backend.target
    }

    /// Format produced by [`Self::encode_for_telephony`]
    pub fn telephony_format(&self) -> AudioFormat {
        self.to_telephony.target
    }

    /// Convert caller audio to the backend input format
    pub fn encode_for_backend(
        &mut self,
        raw: &[u8],
        source: AudioFormat,
    ) -> Result<AudioFrame, PipelineError> {
        self.to_backend.encode(raw, source)
    }

    /// Convert backend audio to the telephony format
    pub fn encode_for_telephony(
        &mut self,
        raw: &[u8],
        source: AudioFormat,
    ) -> Result<AudioFrame, PipelineError> {
        self.to_telephony.encode(raw, source)
    }

    /// Hand each direction to the flow that owns it
    ///
    /// Returns `(to_backend, to_telephony)`.
    pub fn split(self) -> (CodecDirection, CodecDirection) {
        (self.to_backend, self.to_telephony)
    }
}
