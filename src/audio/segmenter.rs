//! # Utterance Segmenter
//!
//! Turns a stream of per-frame speech/silence decisions into utterance boundaries.
//!
//! ## Hysteresis:
//! - **Attack**: `attack_frames` consecutive speech frames declare speech-start
//! - **Hangover**: `hangover_frames` consecutive silence frames declare speech-end,
//!   so brief pauses inside a sentence do not split it
//!
//! ## Barge-in:
//! When speech-start is detected while the session is synthesizing a reply (and
//! barge-in is enabled), `SpeechResumed` is emitted alongside the new `UtteranceStart`.

use tracing::debug;

use crate::audio::frame::{AudioFrame, Utterance, UtteranceId};

#[derive(Debug, Clone)]
pub struct SegmenterConfig {
    /// Consecutive speech frames required to declare speech-start (N)
    pub attack_frames: u32,
    /// Consecutive silence frames required to declare speech-end (M)
    pub hangover_frames: u32,
    /// Whether speech-start during synthesis is reported as `SpeechResumed`
    pub barge_in_enabled: bool,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            attack_frames: 3,
            hangover_frames: 10,
            barge_in_enabled: true,
        }
    }
}

/// Boundary events produced by the segmenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentEvent {
    UtteranceStart(UtteranceId),
    /// `trailing_silence` is the number of hangover frames at the end of the
    /// utterance buffer (0 when the end was forced). `speech_frames` counts the frames
    /// from the first attack frame up to the end of speech, so pre-roll is excluded.
    UtteranceEnd {
        id: UtteranceId,
        trailing_silence: usize,
        speech_frames: usize,
    },
    /// Speech started while a reply was being synthesized
    SpeechResumed,
}

pub struct UtteranceSegmenter {
    config: SegmenterConfig,
    speech_run: u32,
    silence_run: u32,
    current: Option<UtteranceId>,
    /// Frames observed since the first attack frame of the open utterance
    span_frames: usize,
    next_id: u64,
}

impl UtteranceSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            config,
            speech_run: 0,
            silence_run: 0,
            current: None,
            span_frames: 0,
            next_id: 1,
        }
    }

    /// Feed one VAD decision.
    ///
    /// ## Parameters:
    /// - **is_speech**: the VAD decision for this frame
    /// - **synthesizing**: whether the session is currently playing out a reply
    pub fn observe(&mut self, is_speech: bool, synthesizing: bool) -> Vec<SegmentEvent> {
        if is_speech {
            self.speech_run = self.speech_run.saturating_add(1);
            self.silence_run = 0;
        } else {
            self.silence_run = self.silence_run.saturating_add(1);
            self.speech_run = 0;
        }

        if self.current.is_some() {
            self.span_frames += 1;
        }

        let mut events = Vec::new();
        match self.current {
            None if self.speech_run >= self.config.attack_frames => {
                let id = UtteranceId(self.next_id);
                self.next_id += 1;
                self.current = Some(id);
                self.span_frames = self.speech_run as usize;
                debug!(utterance_id = %id, "Speech start detected");
                events.push(SegmentEvent::UtteranceStart(id));
                if synthesizing && self.config.barge_in_enabled {
                    events.push(SegmentEvent::SpeechResumed);
                }
            }
            Some(id) if self.silence_run >= self.config.hangover_frames => {
                self.current = None;
                debug!(utterance_id = %id, "Speech end detected");
                let trailing_silence = self.silence_run as usize;
                events.push(SegmentEvent::UtteranceEnd {
                    id,
                    trailing_silence,
                    speech_frames: self.span_frames.saturating_sub(trailing_silence),
                });
                self.span_frames = 0;
            }
            _ => {}
        }
        events
    }

    /// End the open utterance immediately (buffer overflow, session close).
    pub fn force_end(&mut self) -> Option<SegmentEvent> {
        let id = self.current.take()?;
        self.speech_run = 0;
        self.silence_run = 0;
        let speech_frames = std::mem::take(&mut self.span_frames);
        debug!(utterance_id = %id, speech_frames, "Utterance end forced");
        Some(SegmentEvent::UtteranceEnd {
            id,
            trailing_silence: 0,
            speech_frames,
        })
    }

    pub fn in_utterance(&self) -> bool {
        self.current.is_some()
    }

    pub fn reset(&mut self) {
        self.speech_run = 0;
        self.silence_run = 0;
        self.span_frames = 0;
        self.current = None;
    }
}

/// Build an utterance from flushed frames.
///
/// Trailing hangover silence is trimmed; the pre-roll stays in the audio. Returns `None`
/// when the speech itself (the last `speech_frames` frames after trimming) is shorter
/// than `min_utterance_ms`; such spans are noise and must not reach the transcriber.
pub fn assemble_utterance(
    id: UtteranceId,
    mut frames: Vec<AudioFrame>,
    trailing_silence: usize,
    speech_frames: usize,
    min_utterance_ms: u64,
) -> Option<Utterance> {
    let keep = frames.len().saturating_sub(trailing_silence);
    frames.truncate(keep);
    let speech_start = frames.len().saturating_sub(speech_frames);
    let utterance = Utterance::new(id, frames).with_speech_start(speech_start);
    if utterance.frames.is_empty() || utterance.speech_duration_ms() < min_utterance_ms {
        debug!(
            utterance_id = %id,
            speech_ms = utterance.speech_duration_ms(),
            min_utterance_ms,
            "Discarding utterance shorter than minimum"
        );
        return None;
    }
    Some(utterance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::{FrameBuffer, FrameBufferConfig};

    fn segmenter(attack: u32, hangover: u32) -> UtteranceSegmenter {
        UtteranceSegmenter::new(SegmenterConfig {
            attack_frames: attack,
            hangover_frames: hangover,
            barge_in_enabled: true,
        })
    }

    #[test]
    fn test_five_speech_then_fifteen_silence() {
        let mut seg = segmenter(3, 10);
        let mut buffer = FrameBuffer::new(FrameBufferConfig {
            pre_roll_ms: 300,
            max_buffer_ms: 10_000,
        });

        let pattern: Vec<bool> = std::iter::repeat(true)
            .take(5)
            .chain(std::iter::repeat(false).take(15))
            .collect();

        let mut events = Vec::new();
        let mut utterance = None;
        for (seq, &speech) in pattern.iter().enumerate() {
            buffer
                .push(AudioFrame::new(vec![0; 480], 16000, seq as u64 * 30, seq as u64))
                .unwrap();
            for event in seg.observe(speech, false) {
                match &event {
                    SegmentEvent::UtteranceStart(_) => buffer.open(),
                    SegmentEvent::UtteranceEnd { id, trailing_silence, speech_frames } => {
                        utterance = assemble_utterance(
                            *id,
                            buffer.flush(),
                            *trailing_silence,
                            *speech_frames,
                            0,
                        );
                    }
                    SegmentEvent::SpeechResumed => {}
                }
                events.push((seq, event));
            }
        }

        assert_eq!(events.len(), 2);
        assert_eq!(events[0], (2, SegmentEvent::UtteranceStart(UtteranceId(1))));
        assert_eq!(
            events[1],
            (
                14,
                SegmentEvent::UtteranceEnd {
                    id: UtteranceId(1),
                    trailing_silence: 10,
                    speech_frames: 5
                }
            )
        );

        let utterance = utterance.unwrap();
        assert_eq!(utterance.frames.len(), 5);
        assert_eq!(utterance.duration_ms(), 150);
        assert_eq!(utterance.speech_duration_ms(), 150);
    }

    /// Frames fed through a 300ms pre-roll buffer and a segmenter with N=3, M=10.
    fn run_pattern(pattern: &[bool], min_utterance_ms: u64) -> Vec<Option<Utterance>> {
        let mut seg = segmenter(3, 10);
        let mut buffer = FrameBuffer::new(FrameBufferConfig {
            pre_roll_ms: 300,
            max_buffer_ms: 10_000,
        });
        let mut utterances = Vec::new();
        for (seq, &speech) in pattern.iter().enumerate() {
            let seq = seq as u64;
            buffer
                .push(AudioFrame::new(vec![0; 480], 16000, seq * 30, seq))
                .unwrap();
            for event in seg.observe(speech, false) {
                match event {
                    SegmentEvent::UtteranceStart(_) => buffer.open(),
                    SegmentEvent::UtteranceEnd { id, trailing_silence, speech_frames } => {
                        utterances.push(assemble_utterance(
                            id,
                            buffer.flush(),
                            trailing_silence,
                            speech_frames,
                            min_utterance_ms,
                        ));
                    }
                    SegmentEvent::SpeechResumed => {}
                }
            }
        }
        utterances
    }

    fn pattern(runs: &[(bool, usize)]) -> Vec<bool> {
        runs.iter()
            .flat_map(|&(speech, count)| std::iter::repeat(speech).take(count))
            .collect()
    }

    #[test]
    fn test_leading_silence_stays_in_audio_but_not_in_speech_span() {
        let utterances = run_pattern(&pattern(&[(false, 10), (true, 5), (false, 15)]), 0);
        assert_eq!(utterances.len(), 1);
        let utterance = utterances[0].as_ref().unwrap();
        // 7 silent pre-roll frames, then the 5 speech frames
        assert_eq!(utterance.frames.len(), 12);
        assert_eq!(utterance.speech_start, 7);
        assert_eq!(utterance.speech_duration_ms(), 150);
        assert_eq!(utterance.duration_ms(), 360);
    }

    #[test]
    fn test_pre_roll_does_not_lengthen_short_bursts() {
        // A 120ms burst after silence fills the pre-roll must still count as 120ms
        let utterances = run_pattern(&pattern(&[(false, 10), (true, 4), (false, 12)]), 300);
        assert_eq!(utterances.len(), 1);
        assert!(utterances[0].is_none());

        let utterances = run_pattern(&pattern(&[(false, 10), (true, 10), (false, 12)]), 300);
        assert_eq!(utterances[0].as_ref().unwrap().speech_duration_ms(), 300);
    }

    #[test]
    fn test_short_pause_does_not_split() {
        let mut seg = segmenter(2, 4);
        let pattern = [true, true, true, false, false, false, true, true, false, false, false, false];
        let events: Vec<SegmentEvent> = pattern.iter().flat_map(|&s| seg.observe(s, false)).collect();
        assert_eq!(
            events,
            vec![
                SegmentEvent::UtteranceStart(UtteranceId(1)),
                SegmentEvent::UtteranceEnd {
                    id: UtteranceId(1),
                    trailing_silence: 4,
                    speech_frames: 8
                },
            ]
        );
    }

    #[test]
    fn test_speech_resumed_only_while_synthesizing() {
        let mut seg = segmenter(3, 10);
        let events: Vec<SegmentEvent> = (0..3).flat_map(|_| seg.observe(true, true)).collect();
        assert_eq!(
            events,
            vec![SegmentEvent::UtteranceStart(UtteranceId(1)), SegmentEvent::SpeechResumed]
        );

        let mut quiet = UtteranceSegmenter::new(SegmenterConfig {
            barge_in_enabled: false,
            ..SegmenterConfig::default()
        });
        let events: Vec<SegmentEvent> = (0..3).flat_map(|_| quiet.observe(true, true)).collect();
        assert_eq!(events, vec![SegmentEvent::UtteranceStart(UtteranceId(1))]);
    }

    #[test]
    fn test_force_end_and_monotonic_ids() {
        let mut seg = segmenter(1, 2);
        assert_eq!(seg.observe(true, false), vec![SegmentEvent::UtteranceStart(UtteranceId(1))]);
        assert_eq!(
            seg.force_end(),
            Some(SegmentEvent::UtteranceEnd {
                id: UtteranceId(1),
                trailing_silence: 0,
                speech_frames: 1
            })
        );
        assert_eq!(seg.force_end(), None);
        assert_eq!(seg.observe(true, false), vec![SegmentEvent::UtteranceStart(UtteranceId(2))]);
    }

    /// For arbitrary decision sequences, a start is never emitted before N consecutive
    /// speech frames and an end never before M consecutive silence frames.
    #[test]
    fn test_hysteresis_bounds_hold_for_arbitrary_sequences() {
        let (attack, hangover) = (3u32, 5u32);
        // Small LCG so the sequences are deterministic
        let mut state: u64 = 0x2545_F491_4F6C_DD1D;
        for _ in 0..200 {
            let mut seg = segmenter(attack, hangover);
            let mut speech_run = 0u32;
            let mut silence_run = 0u32;
            for _ in 0..120 {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let speech = (state >> 33) % 3 != 0;
                if speech {
                    speech_run += 1;
                    silence_run = 0;
                } else {
                    silence_run += 1;
                    speech_run = 0;
                }
                for event in seg.observe(speech, false) {
                    match event {
                        SegmentEvent::UtteranceStart(_) => assert!(speech_run >= attack),
                        SegmentEvent::UtteranceEnd { .. } => assert!(silence_run >= hangover),
                        SegmentEvent::SpeechResumed => unreachable!(),
                    }
                }
            }
        }
    }

    #[test]
    fn test_short_utterances_are_discarded() {
        let frames: Vec<AudioFrame> = (0..8)
            .map(|seq| AudioFrame::new(vec![0; 480], 16000, seq * 30, seq))
            .collect();
        // 8 frames minus 2 trailing = 6 frames = 180ms of speech
        assert!(assemble_utterance(UtteranceId(1), frames.clone(), 2, 6, 200).is_none());
        let kept = assemble_utterance(UtteranceId(1), frames.clone(), 2, 6, 150).unwrap();
        assert_eq!(kept.frames.len(), 6);
        // Same audio, but only the last 4 frames are speech: 120ms
        assert!(assemble_utterance(UtteranceId(1), frames, 2, 4, 150).is_none());
    }
}
