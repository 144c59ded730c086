//! Byte accumulator that re-chunks audio into destination-sized frames

use voice_relay_core::{AudioFormat, AudioFrame, Leg};

use crate::PipelineError;

/// Audio buffer/chunker for one direction
///
/// Bytes are appended with [`Chunker::push`]; [`Chunker::drain`] yields every
/// full frame and keeps the remainder, [`Chunker::flush`] emits the
/// remainder at turn boundaries and on close. Sequence numbers start at 0
/// and increase by one per emitted frame.
#[derive(Debug)]
pub struct Chunker {
    buffer: Vec<u8>,
    chunk_bytes: usize,
    format: AudioFormat,
    origin: Leg,
    next_sequence: u64,
}

impl Chunker {
    /// Create a chunker emitting `chunk_bytes` frames in `format`
    ///
    /// The chunk size is rounded down to whole samples.
    pub fn new(chunk_bytes: usize, format: AudioFormat, origin: Leg) -> Result<Self, PipelineError> {
        let chunk_bytes = Self::align(chunk_bytes, format)?;
        Ok(Self {
            buffer: Vec::with_capacity(chunk_bytes * 2),
            chunk_bytes,
            format,
            origin,
            next_sequence: 0,
        })
    }

    fn align(chunk_bytes: usize, format: AudioFormat) -> Result<usize, PipelineError> {
        let sample = format.bytes_per_frame().max(1);
        let aligned = chunk_bytes - chunk_bytes % sample;
        if aligned == 0 {
            return Err(PipelineError::InvalidChunkSize(chunk_bytes));
        }
        Ok(aligned)
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Bytes waiting for a full frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Sequence number the next emitted frame will carry
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Emit all full frames of the configured size
    pub fn drain(&mut self) -> Vec<AudioFrame> {
        let size = self.chunk_bytes;
        self.drain_frames(size)
    }

    /// Emit all full frames of `chunk_bytes`, overriding the configured size
    pub fn drain_with(&mut self, chunk_bytes: usize) -> Result<Vec<AudioFrame>, PipelineError> {
        let size = Self::align(chunk_bytes, self.format)?;
        Ok(self.drain_frames(size))
    }

    fn drain_frames(&mut self, size: usize) -> Vec<AudioFrame> {
        let full = self.buffer.len() / size;
        if full == 0 {
            return Vec::new();
        }

        let (format, origin, first) = (self.format, self.origin, self.next_sequence);
        let frames = self
            .buffer
            .chunks_exact(size)
            .take(full)
            .zip(first..)
            .map(|(chunk, sequence)| AudioFrame::new(chunk, format, sequence, origin))
            .collect();
        self.next_sequence += full as u64;
        self.buffer.drain(..full * size);
        frames
    }

    /// Force-emit whatever is buffered as one short frame
    ///
    /// Returns `None` when nothing is buffered; calling it repeatedly is
    /// harmless.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let frame = AudioFrame::new(
            std::mem::take(&mut self.buffer),
            self.format,
            self.next_sequence,
            self.origin,
        );
        self.next_sequence += 1;
        Some(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunker(size: usize) -> Chunker {
        Chunker::new(size, AudioFormat::telephony(), Leg::Backend).unwrap()
    }

    #[test]
    fn test_drain_emits_only_full_frames() {
        let mut c = chunker(4);
        c.push(&[1, 2, 3, 4, 5, 6]);
        let frames = c.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[1, 2, 3, 4]);
        assert_eq!(c.buffered(), 2);

        c.push(&[7, 8]);
        let frames = c.drain();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload(), &[5, 6, 7, 8]);
        assert!(c.is_empty());
    }

    #[test]
    fn test_flush_on_empty_is_none_twice() {
        let mut c = chunker(640);
        assert!(c.flush().is_none());
        assert!(c.flush().is_none());
        assert_eq!(c.next_sequence(), 0);
    }

    #[test]
    fn test_flush_emits_remainder() {
        let mut c = chunker(640);
        c.push(&[9; 100]);
        assert!(c.drain().is_empty());
        let frame = c.flush().unwrap();
        assert_eq!(frame.len(), 100);
        assert!(c.flush().is_none());
    }

    #[test]
    fn test_round_trip_reassembles_input() {
        let input: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let mut c = chunker(320);
        let mut out = Vec::new();
        for piece in input.chunks(77) {
            c.push(piece);
            for f in c.drain() {
                out.extend_from_slice(f.payload());
            }
        }
        if let Some(f) = c.flush() {
            out.extend_from_slice(f.payload());
        }
        assert_eq!(out, input);
    }

    #[test]
    fn test_sequence_is_gapless() {
        let mut c = chunker(4);
        c.push(&[0; 18]);
        let mut seqs: Vec<u64> = c.drain().iter().map(|f| f.sequence()).collect();
        seqs.extend(c.flush().map(|f| f.sequence()));
        c.push(&[0; 4]);
        seqs.extend(c.drain().iter().map(|f| f.sequence()));
        assert_eq!(seqs, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_chunk_size_aligned_to_samples() {
        let c = Chunker::new(641, AudioFormat::telephony(), Leg::Telephony).unwrap();
        assert_eq!(c.chunk_bytes(), 640);
        assert!(matches!(
            Chunker::new(1, AudioFormat::telephony(), Leg::Telephony),
            Err(PipelineError::InvalidChunkSize(1))
        ));
    }

    #[test]
    fn test_drain_with_override() {
        let mut c = chunker(640);
        c.push(&[0; 10]);
        let frames = c.drain_with(4).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(c.buffered(), 2);
    }
}
