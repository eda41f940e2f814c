//! # Adapter Capability Interfaces
//!
//! The orchestrator depends on four pluggable capabilities. Each is a narrow trait with
//! a streaming + cancellation contract; concrete backends are picked at session
//! construction and shared as `Arc<dyn Trait>`.
//!
//! ## Capabilities:
//! - **VoiceActivityDetector**: per-frame speech/silence classification
//! - **Transcriber**: utterance → stream of partial/final transcripts
//! - **DialogueEngine**: conversation context + user text → stream of reply tokens
//! - **Synthesizer**: reply text or token stream → stream of outbound frames
//!
//! ## Cancellation contract:
//! Every long-running call receives a `CancellationToken`. Once it fires, the adapter
//! must stop producing output promptly and release its resources. The session runtime
//! also stops polling a cancelled stream, so stale output can never reach the transport.
//!
//! ## Sharing:
//! One adapter instance may serve many sessions (e.g. one loaded model), so
//! implementations must be stateless or internally synchronized.

pub mod echo;
pub mod energy;
pub mod openai;

#[cfg(test)]
pub mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::audio::frame::{AudioFrame, Utterance, UtteranceId};
use crate::config::{BackendsConfig, DialogueBackend, VadBackend};
use crate::error::{VoiceError, VoiceResult};
use crate::session::conversation::ConversationContext;

/// Which adapter an error or health flag refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Vad,
    Transcriber,
    DialogueEngine,
    Synthesizer,
}

impl fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AdapterKind::Vad => "vad",
            AdapterKind::Transcriber => "transcriber",
            AdapterKind::DialogueEngine => "dialogue_engine",
            AdapterKind::Synthesizer => "synthesizer",
        };
        f.write_str(name)
    }
}

/// Per-frame VAD output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub is_speech: bool,
    /// Continuous speech probability in [0.0, 1.0]
    pub probability: f32,
}

/// Classifies frames as speech or silence.
///
/// Purely advisory: must not have side effects on the rest of the system.
pub trait VoiceActivityDetector: Send + Sync {
    fn classify(&self, frame: &AudioFrame) -> VoiceResult<VadDecision>;

    fn name(&self) -> &str {
        "vad"
    }
}

/// A recognition result for one utterance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transcript {
    pub utterance_id: UtteranceId,
    pub text: String,
    pub confidence: Option<f32>,
    pub is_final: bool,
}

impl Transcript {
    pub fn final_text(utterance_id: UtteranceId, text: impl Into<String>) -> Self {
        Self {
            utterance_id,
            text: text.into(),
            confidence: None,
            is_final: true,
        }
    }

    pub fn partial(utterance_id: UtteranceId, text: impl Into<String>) -> Self {
        Self {
            utterance_id,
            text: text.into(),
            confidence: None,
            is_final: false,
        }
    }
}

pub type TranscriptStream = BoxStream<'static, VoiceResult<Transcript>>;

/// Converts a completed utterance into text.
///
/// The stream may yield partials followed by exactly one final transcript, or just the
/// final one. Errors should be reported as `RecognitionFailure`.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        utterance: Utterance,
        cancel: CancellationToken,
    ) -> VoiceResult<TranscriptStream>;
}

/// One element of a dialogue reply stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyChunk {
    Token(String),
    EndOfReply,
}

pub type ReplyStream = BoxStream<'static, VoiceResult<ReplyChunk>>;

/// Wrap a complete reply as a single-token stream.
pub fn reply_from_text(text: impl Into<String>) -> ReplyStream {
    stream::iter(vec![Ok(ReplyChunk::Token(text.into())), Ok(ReplyChunk::EndOfReply)]).boxed()
}

/// Produces assistant replies. Errors should be reported as `DialogueFailure`.
#[async_trait]
pub trait DialogueEngine: Send + Sync {
    async fn respond(
        &self,
        context: ConversationContext,
        user_text: String,
        cancel: CancellationToken,
    ) -> VoiceResult<ReplyStream>;
}

/// What the synthesizer should speak.
pub enum SynthesisInput {
    Text(String),
    /// Incremental reply tokens, in order; the stream ends with the reply
    Tokens(BoxStream<'static, String>),
}

impl fmt::Debug for SynthesisInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SynthesisInput::Text(text) => f.debug_tuple("Text").field(text).finish(),
            SynthesisInput::Tokens(_) => f.write_str("Tokens(..)"),
        }
    }
}

impl SynthesisInput {
    /// Collapse the input into plain text, waiting for a token stream to finish.
    pub async fn into_text(self) -> String {
        match self {
            SynthesisInput::Text(text) => text,
            SynthesisInput::Tokens(tokens) => tokens.collect::<Vec<String>>().await.concat(),
        }
    }
}

pub type AudioStream = BoxStream<'static, VoiceResult<AudioFrame>>;

/// Converts reply text into outbound audio. Errors should be reported as `SynthesisFailure`.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(
        &self,
        input: SynthesisInput,
        cancel: CancellationToken,
    ) -> VoiceResult<AudioStream>;
}

/// The set of backends injected into one session.
#[derive(Clone)]
pub struct AdapterSet {
    pub vad: Arc<dyn VoiceActivityDetector>,
    pub transcriber: Arc<dyn Transcriber>,
    pub dialogue: Arc<dyn DialogueEngine>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("vad", &self.vad.name())
            .finish_non_exhaustive()
    }
}

impl AdapterSet {
    /// Build the configured backends.
    ///
    /// One set is built at startup and shared by every session; the HTTP client inside
    /// the OpenAI backends is connection-pooled.
    pub fn from_config(config: &BackendsConfig, frame_ms: u32) -> VoiceResult<Self> {
        let vad: Arc<dyn VoiceActivityDetector> = match config.vad {
            VadBackend::Energy => Arc::new(energy::EnergyVad::new(config.energy_threshold)),
        };

        let client = openai::OpenAiClient::new(&config.openai)?;
        let dialogue: Arc<dyn DialogueEngine> = match config.dialogue {
            DialogueBackend::OpenAi => Arc::new(openai::OpenAiDialogue::new(client.clone())),
            DialogueBackend::Echo => Arc::new(echo::EchoDialogue::default()),
        };

        Ok(Self {
            vad,
            transcriber: Arc::new(openai::OpenAiTranscriber::new(client.clone())),
            dialogue,
            synthesizer: Arc::new(openai::OpenAiSynthesizer::new(client, frame_ms)),
        })
    }
}

/// Map any error raised inside an adapter onto the failure variant for that adapter.
pub fn as_adapter_failure(kind: AdapterKind, err: VoiceError) -> VoiceError {
    match (kind, err) {
        (_, VoiceError::Cancelled) => VoiceError::Cancelled,
        (AdapterKind::Vad, e @ VoiceError::DetectorFailure(_)) => e,
        (AdapterKind::Transcriber, e @ VoiceError::RecognitionFailure(_)) => e,
        (AdapterKind::DialogueEngine, e @ VoiceError::DialogueFailure(_)) => e,
        (AdapterKind::Synthesizer, e @ VoiceError::SynthesisFailure(_)) => e,
        (AdapterKind::Vad, e) => VoiceError::DetectorFailure(e.to_string()),
        (AdapterKind::Transcriber, e) => VoiceError::RecognitionFailure(e.to_string()),
        (AdapterKind::DialogueEngine, e) => VoiceError::DialogueFailure(e.to_string()),
        (AdapterKind::Synthesizer, e) => VoiceError::SynthesisFailure(e.to_string()),
    }
}
