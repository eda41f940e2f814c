//! # Audio Frames and Utterances
//!
//! The units of audio that flow through a session:
//!
//! - **AudioFrame**: one fixed-duration block of 16-bit mono PCM, stamped with its
//!   position in the stream and a per-session sequence number
//! - **Utterance**: the frames of one detected span of speech, ready for transcription
//!
//! ## Audio Format:
//! - **Bit Depth**: 16-bit signed PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding on the wire**: Little-endian signed integers

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::sync::Arc;

/// A fixed-duration block of PCM audio.
///
/// ## Immutability:
/// Samples live behind an `Arc<[i16]>`, so a frame can sit in the pre-roll buffer and
/// in an utterance at the same time without copying, and nobody can mutate it after
/// it was produced.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Arc<[i16]>,
    sample_rate: u32,
    /// Position of the first sample in the stream, in milliseconds
    pub timestamp_ms: u64,
    /// Monotonic per-stream sequence number
    pub sequence: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, timestamp_ms: u64, sequence: u64) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
            timestamp_ms,
            sequence,
        }
    }

    /// Decode a frame from raw little-endian 16-bit PCM bytes.
    ///
    /// ## Errors:
    /// Returns an error for empty payloads or an odd number of bytes.
    pub fn from_pcm_bytes(
        data: &[u8],
        sample_rate: u32,
        timestamp_ms: u64,
        sequence: u64,
    ) -> Result<Self, String> {
        if data.is_empty() {
            return Err("No audio data provided".to_string());
        }
        if data.len() % 2 != 0 {
            return Err("Audio data length must be even for 16-bit samples".to_string());
        }

        let mut cursor = Cursor::new(data);
        let mut samples = Vec::with_capacity(data.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }

        Ok(Self::new(samples, sample_rate, timestamp_ms, sequence))
    }

    /// Encode the samples as little-endian 16-bit PCM bytes for the wire.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for &sample in self.samples.iter() {
            // Writing into a Vec cannot fail
            let _ = out.write_i16::<LittleEndian>(sample);
        }
        out
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.samples.len() as u64 * 1000) / self.sample_rate as u64
    }

    /// Root-mean-square energy normalised to [0.0, 1.0].
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let sum_sq: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = s as f64 / 32768.0;
                v * v
            })
            .sum();
        (sum_sq / self.samples.len() as f64).sqrt() as f32
    }
}

/// Session-unique, monotonically increasing utterance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
pub struct UtteranceId(pub u64);

impl std::fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// The frames of one detected span of speech.
///
/// `frames` starts with the pre-roll captured before speech-start; `speech_start` is the
/// index of the first frame of the speech itself.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: UtteranceId,
    pub frames: Vec<AudioFrame>,
    pub speech_start: usize,
}

impl Utterance {
    pub fn new(id: UtteranceId, frames: Vec<AudioFrame>) -> Self {
        Self {
            id,
            frames,
            speech_start: 0,
        }
    }

    pub fn with_speech_start(mut self, speech_start: usize) -> Self {
        self.speech_start = speech_start.min(self.frames.len());
        self
    }

    /// Duration of all audio, pre-roll included.
    pub fn duration_ms(&self) -> u64 {
        self.frames.iter().map(AudioFrame::duration_ms).sum()
    }

    /// Duration from speech-start to the last speech frame.
    pub fn speech_duration_ms(&self) -> u64 {
        self.frames[self.speech_start..]
            .iter()
            .map(AudioFrame::duration_ms)
            .sum()
    }

    pub fn sample_rate(&self) -> u32 {
        self.frames.first().map(AudioFrame::sample_rate).unwrap_or(0)
    }

    /// All samples of the utterance concatenated in order.
    pub fn samples(&self) -> Vec<i16> {
        let total = self.frames.iter().map(|f| f.samples().len()).sum();
        let mut out = Vec::with_capacity(total);
        for frame in &self.frames {
            out.extend_from_slice(frame.samples());
        }
        out
    }

    /// Encode the utterance as a 16-bit mono WAV file (for upload to HTTP recognizers).
    pub fn to_wav_bytes(&self) -> Vec<u8> {
        let samples = self.samples();
        let sample_rate = self.sample_rate();
        let data_len = (samples.len() * 2) as u32;

        let mut buf = Vec::with_capacity(44 + data_len as usize);
        // Writes into a Vec are infallible, so results are discarded
        buf.extend_from_slice(b"RIFF");
        let _ = buf.write_u32::<LittleEndian>(36 + data_len);
        buf.extend_from_slice(b"WAVE");
        buf.extend_from_slice(b"fmt ");
        let _ = buf.write_u32::<LittleEndian>(16);
        let _ = buf.write_u16::<LittleEndian>(1); // PCM
        let _ = buf.write_u16::<LittleEndian>(1); // mono
        let _ = buf.write_u32::<LittleEndian>(sample_rate);
        let _ = buf.write_u32::<LittleEndian>(sample_rate * 2);
        let _ = buf.write_u16::<LittleEndian>(2);
        let _ = buf.write_u16::<LittleEndian>(16);
        buf.extend_from_slice(b"data");
        let _ = buf.write_u32::<LittleEndian>(data_len);
        for sample in samples {
            let _ = buf.write_i16::<LittleEndian>(sample);
        }
        buf
    }
}

/// Splits a PCM byte stream into fixed-size frames.
///
/// Used wherever audio arrives as an arbitrarily chunked byte stream (WebSocket messages,
/// streamed TTS responses): bytes are accumulated until a whole frame is available, and
/// the remainder is carried over.
#[derive(Debug)]
pub struct FrameChunker {
    sample_rate: u32,
    samples_per_frame: usize,
    pending: Vec<u8>,
    next_sequence: u64,
    next_timestamp_ms: u64,
}

impl FrameChunker {
    pub fn new(sample_rate: u32, frame_ms: u32) -> Self {
        let samples_per_frame = ((sample_rate as u64 * frame_ms as u64) / 1000).max(1) as usize;
        Self {
            sample_rate,
            samples_per_frame,
            pending: Vec::new(),
            next_sequence: 0,
            next_timestamp_ms: 0,
        }
    }

    /// Feed bytes, returning every complete frame now available.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<AudioFrame> {
        self.pending.extend_from_slice(bytes);
        let frame_bytes = self.samples_per_frame * 2;
        let mut frames = Vec::new();
        while self.pending.len() >= frame_bytes {
            let chunk: Vec<u8> = self.pending.drain(..frame_bytes).collect();
            frames.push(self.make_frame(&chunk));
        }
        frames
    }

    /// Emit whatever is left as a final, possibly shorter, frame.
    pub fn finish(&mut self) -> Option<AudioFrame> {
        // Drop a dangling odd byte; it cannot form a sample
        let usable = self.pending.len() - self.pending.len() % 2;
        if usable == 0 {
            self.pending.clear();
            return None;
        }
        let chunk: Vec<u8> = self.pending.drain(..usable).collect();
        self.pending.clear();
        Some(self.make_frame(&chunk))
    }

    fn make_frame(&mut self, chunk: &[u8]) -> AudioFrame {
        let mut cursor = Cursor::new(chunk);
        let mut samples = Vec::with_capacity(chunk.len() / 2);
        while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
            samples.push(sample);
        }
        let frame = AudioFrame::new(samples, self.sample_rate, self.next_timestamp_ms, self.next_sequence);
        self.next_sequence += 1;
        self.next_timestamp_ms += frame.duration_ms();
        frame
    }
}
