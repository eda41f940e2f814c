//! Scripted adapters for tests.
//!
//! Each one records what it was asked to do and which of its calls were cancelled, so
//! tests can assert on cancellation counts and on what reached each stage.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adapters::{
    AudioStream, DialogueEngine, ReplyChunk, ReplyStream, SynthesisInput, Synthesizer, Transcriber,
    Transcript, TranscriptStream, VadDecision, VoiceActivityDetector,
};
use crate::audio::frame::{AudioFrame, Utterance};
use crate::error::{VoiceError, VoiceResult};
use crate::session::conversation::ConversationContext;
use crate::session::runtime::AudioSink;

/// Sleep for `delay` unless `cancel` fires first. Returns false when cancelled.
async fn wait(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Frame samples loud enough for the energy detector (30ms at 16kHz).
pub fn speech_frame(sequence: u64) -> AudioFrame {
    AudioFrame::new(vec![8000; 480], 16000, sequence * 30, sequence)
}

pub fn silence_frame(sequence: u64) -> AudioFrame {
    AudioFrame::new(vec![0; 480], 16000, sequence * 30, sequence)
}

pub struct FailingVad;

impl VoiceActivityDetector for FailingVad {
    fn classify(&self, _frame: &AudioFrame) -> VoiceResult<VadDecision> {
        Err(VoiceError::DetectorFailure("model not loaded".into()))
    }
}

pub struct ScriptedTranscriber {
    results: Mutex<VecDeque<VoiceResult<String>>>,
    delay: Duration,
    calls: AtomicUsize,
    received: Mutex<Vec<Utterance>>,
}

impl ScriptedTranscriber {
    /// Reply to successive calls with `texts`; an exhausted script yields empty transcripts.
    pub fn new(texts: Vec<String>) -> Self {
        Self::with_results(texts.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<VoiceResult<String>>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            delay: Duration::from_millis(5),
            calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn received_durations_ms(&self) -> Vec<u64> {
        self.received.lock().unwrap().iter().map(Utterance::duration_ms).collect()
    }
}

#[async_trait]
impl Transcriber for ScriptedTranscriber {
    async fn transcribe(
        &self,
        utterance: Utterance,
        cancel: CancellationToken,
    ) -> VoiceResult<TranscriptStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = utterance.id;
        self.received.lock().unwrap().push(utterance);
        let result = self.results.lock().unwrap().pop_front().unwrap_or(Ok(String::new()));

        if !wait(self.delay, &cancel).await {
            return Err(VoiceError::Cancelled);
        }
        let text = result?;
        let items = vec![
            Ok(Transcript::partial(id, text.clone())),
            Ok(Transcript::final_text(id, text)),
        ];
        Ok(stream::iter(items).boxed())
    }
}

enum DialogueScript {
    Reply(String),
    Fail(String),
    /// Never answers; returns only once cancelled
    Hang,
}

pub struct ScriptedDialogue {
    script: DialogueScript,
    token_delay: Duration,
    calls: AtomicUsize,
    contexts: Mutex<Vec<ConversationContext>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl ScriptedDialogue {
    fn with_script(script: DialogueScript) -> Self {
        Self {
            script,
            token_delay: Duration::from_millis(2),
            calls: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn replying(text: impl Into<String>) -> Self {
        Self::with_script(DialogueScript::Reply(text.into()))
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_script(DialogueScript::Fail(message.into()))
    }

    pub fn hanging() -> Self {
        Self::with_script(DialogueScript::Hang)
    }

    /// Pause between streamed tokens.
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancelled_calls(&self) -> usize {
        self.tokens.lock().unwrap().iter().filter(|t| t.is_cancelled()).count()
    }

    /// Number of completed turns each call saw in its context.
    pub fn context_lengths(&self) -> Vec<usize> {
        self.contexts.lock().unwrap().iter().map(ConversationContext::len).collect()
    }
}

#[async_trait]
impl DialogueEngine for ScriptedDialogue {
    async fn respond(
        &self,
        context: ConversationContext,
        _user_text: String,
        cancel: CancellationToken,
    ) -> VoiceResult<ReplyStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().unwrap().push(context);
        self.tokens.lock().unwrap().push(cancel.clone());

        let text = match &self.script {
            DialogueScript::Reply(text) => text.clone(),
            DialogueScript::Fail(message) => return Err(VoiceError::DialogueFailure(message.clone())),
            DialogueScript::Hang => {
                cancel.cancelled().await;
                return Err(VoiceError::Cancelled);
            }
        };

        let tokens: VecDeque<String> = text.split_inclusive(' ').map(String::from).collect();
        let delay = self.token_delay;
        let stream = stream::unfold((tokens, false), move |(mut pending, done)| {
            let cancel = cancel.clone();
            async move {
                if done || !wait(delay, &cancel).await {
                    return None;
                }
                match pending.pop_front() {
                    Some(token) => Some((Ok(ReplyChunk::Token(token)), (pending, false))),
                    None => Some((Ok(ReplyChunk::EndOfReply), (pending, true))),
                }
            }
        });
        Ok(stream.boxed())
    }
}

pub struct ScriptedSynthesizer {
    frames_per_reply: usize,
    frame_delay: Duration,
    honor_cancel: bool,
    fail: bool,
    calls: AtomicUsize,
    inputs: Mutex<Vec<String>>,
    tokens: Mutex<Vec<CancellationToken>>,
}

impl ScriptedSynthesizer {
    pub fn new(frames_per_reply: usize, frame_delay: Duration) -> Self {
        Self {
            frames_per_reply,
            frame_delay,
            honor_cancel: true,
            fail: false,
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Keep producing frames after cancellation, like a backend stuck in a blocking call.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honor_cancel = false;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn cancelled_calls(&self) -> usize {
        self.tokens.lock().unwrap().iter().filter(|t| t.is_cancelled()).count()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

#[async_trait]
impl Synthesizer for ScriptedSynthesizer {
    async fn synthesize(
        &self,
        input: SynthesisInput,
        cancel: CancellationToken,
    ) -> VoiceResult<AudioStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(cancel.clone());
        let text = input.into_text().await;
        self.inputs.lock().unwrap().push(text);

        if self.fail {
            return Err(VoiceError::SynthesisFailure("voice unavailable".into()));
        }

        let (delay, honor, total) = (self.frame_delay, self.honor_cancel, self.frames_per_reply);
        let stream = stream::unfold(0usize, move |i| {
            let cancel = cancel.clone();
            async move {
                if i >= total {
                    return None;
                }
                if honor {
                    if !wait(delay, &cancel).await {
                        return None;
                    }
                } else {
                    tokio::time::sleep(delay).await;
                }
                let frame = AudioFrame::new(vec![1000; 480], 16000, i as u64 * 30, i as u64);
                Some((Ok(frame), i + 1))
            }
        });
        Ok(stream.boxed())
    }
}

/// Records every frame handed to the transport, with the time it was emitted.
#[derive(Default)]
pub struct CollectingSink {
    frames: Mutex<Vec<(Instant, AudioFrame)>>,
}

impl CollectingSink {
    pub fn count(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    pub fn emitted_after(&self, instant: Instant) -> usize {
        self.frames.lock().unwrap().iter().filter(|(at, _)| *at > instant).count()
    }
}

impl AudioSink for CollectingSink {
    fn emit_frame(&self, _session_id: &str, frame: AudioFrame) -> VoiceResult<()> {
        self.frames.lock().unwrap().push((Instant::now(), frame));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_dialogue_tokens() {
        let engine = ScriptedDialogue::replying("one two");
        let chunks: Vec<ReplyChunk> = engine
            .respond(ConversationContext::new(""), "x".into(), CancellationToken::new())
            .await
            .unwrap()
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![
                ReplyChunk::Token("one ".into()),
                ReplyChunk::Token("two".into()),
                ReplyChunk::EndOfReply
            ]
        );
    }
}
