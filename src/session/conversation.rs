//! # Conversation Context
//!
//! The append-only history a dialogue engine sees: a fixed system preamble followed by
//! completed turns in order. A turn is only recorded once both the user's words and the
//! assistant's full reply exist and the reply finished playing; interrupted or failed
//! turns leave no trace.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{VoiceError, VoiceResult};

/// One completed user/assistant exchange.
///
/// ## Timestamps:
/// - **speech_end**: the user's utterance ended
/// - **transcript_ready**: the final transcript arrived
/// - **reply_ready**: the first reply text was available
/// - **synthesis_start**: the first reply frame was sent to the participant
/// - **synthesis_end**: the last reply frame was sent
#[derive(Debug, Clone, Serialize)]
pub struct ConversationTurn {
    pub sequence: u64,
    pub user_text: String,
    pub reply_text: String,
    pub speech_end: DateTime<Utc>,
    pub transcript_ready: Option<DateTime<Utc>>,
    pub reply_ready: Option<DateTime<Utc>>,
    pub synthesis_start: Option<DateTime<Utc>>,
    pub synthesis_end: Option<DateTime<Utc>>,
}

impl ConversationTurn {
    pub fn new(sequence: u64, user_text: impl Into<String>) -> Self {
        Self {
            sequence,
            user_text: user_text.into(),
            reply_text: String::new(),
            speech_end: Utc::now(),
            transcript_ready: None,
            reply_ready: None,
            synthesis_start: None,
            synthesis_end: None,
        }
    }

    fn millis_between(from: DateTime<Utc>, to: Option<DateTime<Utc>>) -> Option<i64> {
        to.map(|to| (to - from).num_milliseconds())
    }

    /// Speech end to final transcript.
    pub fn transcription_latency_ms(&self) -> Option<i64> {
        Self::millis_between(self.speech_end, self.transcript_ready)
    }

    /// Final transcript to first reply text.
    pub fn dialogue_latency_ms(&self) -> Option<i64> {
        self.transcript_ready
            .and_then(|start| Self::millis_between(start, self.reply_ready))
    }

    /// Speech end to first audible reply frame; what the participant experiences.
    pub fn response_latency_ms(&self) -> Option<i64> {
        Self::millis_between(self.speech_end, self.synthesis_start)
    }
}

/// Preamble plus ordered turns. Cloning is how a snapshot is handed to the dialogue engine.
#[derive(Debug, Clone)]
pub struct ConversationContext {
    preamble: Arc<str>,
    turns: Vec<ConversationTurn>,
}

impl ConversationContext {
    pub fn new(preamble: impl Into<String>) -> Self {
        Self {
            preamble: Arc::from(preamble.into()),
            turns: Vec::new(),
        }
    }

    pub fn preamble(&self) -> &str {
        &self.preamble
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Sequence number the next appended turn must carry.
    pub fn next_sequence(&self) -> u64 {
        self.turns.len() as u64 + 1
    }

    /// Append a completed turn.
    ///
    /// ## Errors:
    /// `InvariantViolation` if the sequence number is not exactly `len + 1`, or if the
    /// turn is missing its user text or reply.
    pub fn append(&mut self, turn: ConversationTurn) -> VoiceResult<()> {
        let expected = self.next_sequence();
        if turn.sequence != expected {
            return Err(VoiceError::InvariantViolation(format!(
                "turn sequence {} appended where {} was expected",
                turn.sequence, expected
            )));
        }
        if turn.user_text.trim().is_empty() || turn.reply_text.trim().is_empty() {
            return Err(VoiceError::InvariantViolation(format!(
                "turn {} is missing user text or reply",
                turn.sequence
            )));
        }
        self.turns.push(turn);
        Ok(())
    }
}
