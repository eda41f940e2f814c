//! # Audio Module
//!
//! Everything that touches raw audio before it reaches an adapter.
//!
//! ## Key Components:
//! - **Frames**: fixed-duration PCM blocks and the utterances built from them
//! - **Frame Buffer**: rolling pre-roll plus the open utterance buffer
//! - **Segmenter**: hysteresis over VAD decisions producing utterance boundaries
//!
//! ## Audio Format Requirements:
//! - **Sample Rate**: 16kHz by default (configurable per session)
//! - **Bit Depth**: 16-bit PCM
//! - **Channels**: Mono (1 channel)
//! - **Encoding**: Little-endian signed integers

pub mod buffer;    // Pre-roll and utterance accumulation
pub mod frame;     // AudioFrame, Utterance, FrameChunker
pub mod segmenter; // Speech start/end detection
