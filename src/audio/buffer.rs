//! # Frame Buffer
//!
//! Accumulates incoming fixed-duration frames into variable-length utterance buffers.
//!
//! ## Key Features:
//! - **Pre-roll**: a short rolling window of the most recent frames, kept regardless of
//!   VAD state, so that an utterance includes the audio that led up to speech-start
//! - **Open utterance**: once the segmenter declares speech, every frame is appended
//!   until the utterance is flushed
//! - **Bounded**: an open utterance longer than `max_buffer_ms` is reported as
//!   `BufferOverflow` so the session can force an utterance end
//!
//! ## Ownership:
//! The buffer belongs to exactly one session task, so unlike a buffer shared between
//! a socket thread and a transcription thread it needs no locking.

use std::collections::VecDeque;

use crate::audio::frame::AudioFrame;
use crate::error::{VoiceError, VoiceResult};

/// Configuration for frame buffer behaviour.
#[derive(Debug, Clone)]
pub struct FrameBufferConfig {
    /// Rolling pre-roll duration in milliseconds (typically 200-500ms)
    pub pre_roll_ms: u64,

    /// Maximum duration of one open utterance in milliseconds
    pub max_buffer_ms: u64,
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            pre_roll_ms: 300,
            max_buffer_ms: 30_000,
        }
    }
}

pub struct FrameBuffer {
    config: FrameBufferConfig,

    /// Most recent frames, trimmed to `pre_roll_ms`
    pre_roll: VecDeque<AudioFrame>,
    pre_roll_duration_ms: u64,

    /// Frames of the utterance currently being captured, if any
    current: Option<Vec<AudioFrame>>,
    current_duration_ms: u64,
}

impl FrameBuffer {
    pub fn new(config: FrameBufferConfig) -> Self {
        Self {
            config,
            pre_roll: VecDeque::new(),
            pre_roll_duration_ms: 0,
            current: None,
            current_duration_ms: 0,
        }
    }

    /// Append a frame to the pre-roll and, if an utterance is open, to the utterance.
    ///
    /// ## Returns:
    /// - **Ok(())**: frame stored
    /// - **Err(BufferOverflow)**: the frame was stored but the open utterance is now
    ///   longer than `max_buffer_ms`; the caller should end the utterance
    pub fn push(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        let duration = frame.duration_ms();

        if let Some(current) = self.current.as_mut() {
            current.push(frame.clone());
            self.current_duration_ms += duration;
        }

        self.pre_roll.push_back(frame);
        self.pre_roll_duration_ms += duration;
        // Keep at least the newest frame, even if it alone exceeds the window
        while self.pre_roll.len() > 1 && self.pre_roll_duration_ms > self.config.pre_roll_ms {
            if let Some(old) = self.pre_roll.pop_front() {
                self.pre_roll_duration_ms -= old.duration_ms();
            }
        }

        if self.current.is_some() && self.current_duration_ms > self.config.max_buffer_ms {
            return Err(VoiceError::BufferOverflow {
                max_ms: self.config.max_buffer_ms,
            });
        }

        Ok(())
    }

    /// Open a new utterance seeded with the pre-roll contents.
    ///
    /// Opening while an utterance is already open is a no-op.
    pub fn open(&mut self) {
        if self.current.is_some() {
            return;
        }
        let seeded: Vec<AudioFrame> = self.pre_roll.iter().cloned().collect();
        self.current_duration_ms = seeded.iter().map(AudioFrame::duration_ms).sum();
        self.current = Some(seeded);
    }

    /// Return and clear the current utterance buffer. Empty if none is open.
    pub fn flush(&mut self) -> Vec<AudioFrame> {
        self.current_duration_ms = 0;
        self.current.take().unwrap_or_default()
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Duration of the open utterance in milliseconds (0 when none is open).
    pub fn open_duration_ms(&self) -> u64 {
        self.current_duration_ms
    }

    pub fn pre_roll_len(&self) -> usize {
        self.pre_roll.len()
    }

    /// Drop everything, including the pre-roll (used after a barge-in or on close).
    pub fn clear(&mut self) {
        self.pre_roll.clear();
        self.pre_roll_duration_ms = 0;
        self.current = None;
        self.current_duration_ms = 0;
    }

    pub fn config(&self) -> &FrameBufferConfig {
        &self.config
    }
}
