//! # Session State Machine
//!
//! The legal lifecycle of a voice session as a pure transition function. The runtime
//! feeds it triggers; anything not in the table is an internal invariant violation and
//! terminates the session.
//!
//! ```text
//! Idle ──connected──▶ ListeningForSpeech ──utterance end──▶ Transcribing
//!                          ▲    ▲    ▲                            │
//!                          │    │    └──── empty / failed ────────┤ final transcript
//!                          │    │                                 ▼
//!                          │    └──── failed, no fallback ─── AwaitingReply
//!                          │                                      │ reply ready / fallback
//!                          ├──── complete / failed ─────────── Synthesizing
//!                          │                                      │ speech resumed
//!                          └──── cancellation acked ────────── Interrupted
//!
//! any live state ──close──▶ Closing ──▶ Closed
//! ```

use std::fmt;

use serde::Serialize;

use crate::error::{VoiceError, VoiceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    ListeningForSpeech,
    Transcribing,
    AwaitingReply,
    Synthesizing,
    Interrupted,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::ListeningForSpeech => "listening_for_speech",
            SessionState::Transcribing => "transcribing",
            SessionState::AwaitingReply => "awaiting_reply",
            SessionState::Synthesizing => "synthesizing",
            SessionState::Interrupted => "interrupted",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    /// Live states accept a close request.
    pub fn is_live(&self) -> bool {
        !matches!(self, SessionState::Closing | SessionState::Closed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can move a session between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ParticipantConnected,
    UtteranceEnded,
    /// A non-empty final transcript arrived
    TranscriptReady,
    TranscriptEmpty,
    RecognitionFailed,
    ReplyReady,
    /// `fallback` is true when a fallback reply will be spoken instead
    DialogueFailed { fallback: bool },
    SynthesisComplete,
    SynthesisFailed,
    SpeechResumed,
    CancellationAcknowledged,
    CloseRequested,
    CloseCompleted,
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Trigger::ParticipantConnected => "participant_connected",
            Trigger::UtteranceEnded => "utterance_ended",
            Trigger::TranscriptReady => "transcript_ready",
            Trigger::TranscriptEmpty => "transcript_empty",
            Trigger::RecognitionFailed => "recognition_failed",
            Trigger::ReplyReady => "reply_ready",
            Trigger::DialogueFailed { fallback: true } => "dialogue_failed_with_fallback",
            Trigger::DialogueFailed { fallback: false } => "dialogue_failed",
            Trigger::SynthesisComplete => "synthesis_complete",
            Trigger::SynthesisFailed => "synthesis_failed",
            Trigger::SpeechResumed => "speech_resumed",
            Trigger::CancellationAcknowledged => "cancellation_acknowledged",
            Trigger::CloseRequested => "close_requested",
            Trigger::CloseCompleted => "close_completed",
        };
        f.write_str(name)
    }
}

/// Compute the next state, or `InvalidTransition` if the pair is not in the table.
pub fn transition(state: SessionState, trigger: Trigger) -> VoiceResult<SessionState> {
    use SessionState::*;

    let next = match (state, trigger) {
        (Idle, Trigger::ParticipantConnected) => ListeningForSpeech,

        (ListeningForSpeech, Trigger::UtteranceEnded) => Transcribing,

        (Transcribing, Trigger::TranscriptReady) => AwaitingReply,
        (Transcribing, Trigger::TranscriptEmpty | Trigger::RecognitionFailed) => ListeningForSpeech,

        (AwaitingReply, Trigger::ReplyReady) => Synthesizing,
        (AwaitingReply, Trigger::DialogueFailed { fallback: true }) => Synthesizing,
        (AwaitingReply, Trigger::DialogueFailed { fallback: false }) => ListeningForSpeech,

        (Synthesizing, Trigger::SynthesisComplete) => ListeningForSpeech,
        // A streamed reply can fail after synthesis has started
        (Synthesizing, Trigger::SynthesisFailed | Trigger::DialogueFailed { .. }) => ListeningForSpeech,
        (Synthesizing, Trigger::SpeechResumed) => Interrupted,

        (Interrupted, Trigger::CancellationAcknowledged) => ListeningForSpeech,

        (s, Trigger::CloseRequested) if s.is_live() => Closing,
        (Closing, Trigger::CloseCompleted) => Closed,

        (state, trigger) => {
            return Err(VoiceError::InvalidTransition {
                state,
                trigger: trigger.to_string(),
            })
        }
    };
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut state = SessionState::Idle;
        for trigger in [
            Trigger::ParticipantConnected,
            Trigger::UtteranceEnded,
            Trigger::TranscriptReady,
            Trigger::ReplyReady,
            Trigger::SynthesisComplete,
        ] {
            state = transition(state, trigger).unwrap();
        }
        assert_eq!(state, SessionState::ListeningForSpeech);
    }

    #[test]
    fn test_barge_in_path() {
        let state = transition(SessionState::Synthesizing, Trigger::SpeechResumed).unwrap();
        assert_eq!(state, SessionState::Interrupted);
        let state = transition(state, Trigger::CancellationAcknowledged).unwrap();
        assert_eq!(state, SessionState::ListeningForSpeech);
    }

    #[test]
    fn test_dialogue_failure_policies() {
        assert_eq!(
            transition(SessionState::AwaitingReply, Trigger::DialogueFailed { fallback: false }).unwrap(),
            SessionState::ListeningForSpeech
        );
        assert_eq!(
            transition(SessionState::AwaitingReply, Trigger::DialogueFailed { fallback: true }).unwrap(),
            SessionState::Synthesizing
        );
    }

    #[test]
    fn test_close_from_every_live_state() {
        for state in [
            SessionState::Idle,
            SessionState::ListeningForSpeech,
            SessionState::Transcribing,
            SessionState::AwaitingReply,
            SessionState::Synthesizing,
            SessionState::Interrupted,
        ] {
            assert_eq!(transition(state, Trigger::CloseRequested).unwrap(), SessionState::Closing);
        }
        assert_eq!(
            transition(SessionState::Closing, Trigger::CloseCompleted).unwrap(),
            SessionState::Closed
        );
    }

    #[test]
    fn test_invalid_pairs_are_rejected() {
        let err = transition(SessionState::ListeningForSpeech, Trigger::SpeechResumed).unwrap_err();
        assert_eq!(
            err,
            VoiceError::InvalidTransition {
                state: SessionState::ListeningForSpeech,
                trigger: "speech_resumed".to_string(),
            }
        );
        assert!(err.is_fatal());
        assert!(transition(SessionState::Closed, Trigger::CloseRequested).is_err());
        assert!(transition(SessionState::Closing, Trigger::CloseRequested).is_err());
        assert!(transition(SessionState::Interrupted, Trigger::SynthesisComplete).is_err());
    }
}
