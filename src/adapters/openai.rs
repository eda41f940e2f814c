//! # OpenAI-Compatible Backends
//!
//! Transcriber, dialogue engine and synthesizer talking to any server that implements
//! the OpenAI audio and chat APIs (OpenAI itself, a local inference server, a proxy).
//!
//! ## Endpoints:
//! - **POST /audio/transcriptions**: utterance uploaded as a 16-bit mono WAV file
//! - **POST /chat/completions**: `stream: true`, reply tokens parsed from server-sent events
//! - **POST /audio/speech**: `response_format: "pcm"`, raw 16-bit PCM chunked into frames
//!
//! ## Cancellation:
//! Every request races the session's `CancellationToken`; the returned streams end as soon
//! as the token fires, which drops the underlying HTTP response and closes the connection.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::adapters::{
    AudioStream, DialogueEngine, ReplyChunk, ReplyStream, SynthesisInput, Synthesizer, Transcriber,
    Transcript, TranscriptStream,
};
use crate::audio::frame::{AudioFrame, FrameChunker, Utterance};
use crate::config::OpenAiConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::session::conversation::ConversationContext;

type ByteStream = BoxStream<'static, VoiceResult<Vec<u8>>>;

/// Shared HTTP client and endpoint settings.
///
/// `reqwest::Client` is an `Arc` internally, so cloning shares the connection pool.
#[derive(Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: &OpenAiConfig) -> VoiceResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| VoiceError::Config(format!("failed to build HTTP client: {}", e)))?;

        let api_key = config.resolved_api_key();
        if api_key.is_none() {
            warn!(base_url = %config.base_url, "No API key configured for OpenAI-compatible backends");
        }

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            config: config.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Send a request, racing it against cancellation, and fail on non-2xx statuses.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        cancel: &CancellationToken,
        failure: fn(String) -> VoiceError,
    ) -> VoiceResult<reqwest::Response> {
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            result = self.authorized(request).send() => result.map_err(|e| failure(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(failure(format!("API error {}: {}", status, body)));
        }
        Ok(response)
    }
}

// -----------------------------------------------------------------------------
// Transcription
// -----------------------------------------------------------------------------

pub struct OpenAiTranscriber {
    client: OpenAiClient,
}

impl OpenAiTranscriber {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(
        &self,
        utterance: Utterance,
        cancel: CancellationToken,
    ) -> VoiceResult<TranscriptStream> {
        let utterance_id = utterance.id;
        let wav = utterance.to_wav_bytes();
        debug!(
            utterance_id = %utterance_id,
            duration_ms = utterance.duration_ms(),
            "Uploading utterance for transcription"
        );

        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::RecognitionFailure(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.client.config.stt_model.clone());

        let request = self.client.http.post(self.client.url("audio/transcriptions")).multipart(form);
        let response = self
            .client
            .send(request, &cancel, VoiceError::RecognitionFailure)
            .await?;

        let body: serde_json::Value = tokio::select! {
            _ = cancel.cancelled() => return Err(VoiceError::Cancelled),
            result = response.json() => result.map_err(|e| VoiceError::RecognitionFailure(e.to_string()))?,
        };

        let text = body
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string();

        let transcript = Transcript::final_text(utterance_id, text);
        Ok(stream::once(future::ready(Ok(transcript))).boxed())
    }
}

// -----------------------------------------------------------------------------
// Dialogue
// -----------------------------------------------------------------------------

pub struct OpenAiDialogue {
    client: OpenAiClient,
}

impl OpenAiDialogue {
    pub fn new(client: OpenAiClient) -> Self {
        Self { client }
    }
}

/// Chat messages for a context plus the new user utterance.
pub fn chat_messages(context: &ConversationContext, user_text: &str) -> Vec<serde_json::Value> {
    let mut messages = Vec::with_capacity(context.len() * 2 + 2);
    if !context.preamble().is_empty() {
        messages.push(json!({"role": "system", "content": context.preamble()}));
    }
    for turn in context.turns() {
        messages.push(json!({"role": "user", "content": turn.user_text}));
        messages.push(json!({"role": "assistant", "content": turn.reply_text}));
    }
    messages.push(json!({"role": "user", "content": user_text}));
    messages
}

#[async_trait]
impl DialogueEngine for OpenAiDialogue {
    async fn respond(
        &self,
        context: ConversationContext,
        user_text: String,
        cancel: CancellationToken,
    ) -> VoiceResult<ReplyStream> {
        let payload = json!({
            "model": self.client.config.llm_model,
            "messages": chat_messages(&context, &user_text),
            "stream": true,
        });

        let request = self.client.http.post(self.client.url("chat/completions")).json(&payload);
        let response = self
            .client
            .send(request, &cancel, VoiceError::DialogueFailure)
            .await?;

        let bytes: ByteStream = response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| VoiceError::DialogueFailure(e.to_string()))
            })
            .boxed();

        Ok(sse_reply_stream(bytes).take_until(cancel.cancelled_owned()).boxed())
    }
}

/// Parse one server-sent-event line from a streaming chat completion.
///
/// Returns `None` for lines that carry nothing (keep-alives, empty deltas, role-only deltas).
pub fn parse_sse_line(line: &str) -> Option<VoiceResult<ReplyChunk>> {
    let data = line.trim().strip_prefix("data:")?.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(ReplyChunk::EndOfReply));
    }

    let value: serde_json::Value = match serde_json::from_str(data) {
        Ok(value) => value,
        Err(e) => return Some(Err(VoiceError::DialogueFailure(format!("malformed event: {}", e)))),
    };
    if let Some(message) = value.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()) {
        return Some(Err(VoiceError::DialogueFailure(message.to_string())));
    }

    match value["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => Some(Ok(ReplyChunk::Token(content.to_string()))),
        _ => None,
    }
}

struct SseState {
    body: ByteStream,
    pending: Vec<u8>,
    queued: VecDeque<VoiceResult<ReplyChunk>>,
    ended: bool,
    finished: bool,
}

impl SseState {
    /// Move every complete line out of `pending` into `queued`.
    fn drain_lines(&mut self) {
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.queue_line(&line);
        }
    }

    fn queue_line(&mut self, line: &[u8]) {
        if self.ended {
            return;
        }
        if let Some(item) = parse_sse_line(&String::from_utf8_lossy(line)) {
            if matches!(item, Ok(ReplyChunk::EndOfReply)) {
                self.ended = true;
            }
            self.queued.push_back(item);
        }
    }
}

/// Turn a raw SSE byte stream into reply chunks. Lines may be split across network chunks.
fn sse_reply_stream(body: ByteStream) -> ReplyStream {
    let state = SseState {
        body,
        pending: Vec::new(),
        queued: VecDeque::new(),
        ended: false,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                return Some((item, state));
            }
            if state.finished || state.ended {
                return None;
            }
            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.pending.extend_from_slice(&bytes);
                    state.drain_lines();
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.queued.push_back(Err(e));
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.pending);
                    state.queue_line(&rest);
                    // Some servers close the stream without a [DONE] marker
                    if !state.ended {
                        state.ended = true;
                        state.queued.push_back(Ok(ReplyChunk::EndOfReply));
                    }
                }
            }
        }
    })
    .boxed()
}

// -----------------------------------------------------------------------------
// Synthesis
// -----------------------------------------------------------------------------

pub struct OpenAiSynthesizer {
    client: OpenAiClient,
    frame_ms: u32,
}

impl OpenAiSynthesizer {
    pub fn new(client: OpenAiClient, frame_ms: u32) -> Self {
        Self { client, frame_ms }
    }
}

/// Split the first complete sentence off the front of `pending`.
///
/// A sentence ends at `.`, `!` or `?` followed by whitespace.
pub fn split_sentence(pending: &mut String) -> Option<String> {
    let mut chars = pending.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        if let Some(&(next, ws)) = chars.peek() {
            if ws.is_whitespace() {
                let sentence = pending[..next].trim().to_string();
                pending.drain(..next);
                return Some(sentence);
            }
        }
    }
    None
}

/// Regroup a token stream into sentences, so speech can start before the reply is complete.
fn sentence_stream(tokens: BoxStream<'static, String>) -> BoxStream<'static, String> {
    stream::unfold(
        (tokens, String::new(), false),
        |(mut tokens, mut pending, mut done)| async move {
            loop {
                if let Some(sentence) = split_sentence(&mut pending) {
                    return Some((sentence, (tokens, pending, done)));
                }
                if done {
                    let rest = std::mem::take(&mut pending).trim().to_string();
                    if rest.is_empty() {
                        return None;
                    }
                    return Some((rest, (tokens, pending, done)));
                }
                match tokens.next().await {
                    Some(token) => pending.push_str(&token),
                    None => done = true,
                }
            }
        },
    )
    .filter(|sentence| future::ready(!sentence.is_empty()))
    .boxed()
}

struct ChunkState {
    bytes: ByteStream,
    chunker: FrameChunker,
    queued: VecDeque<VoiceResult<AudioFrame>>,
    finished: bool,
}

/// Re-frame an arbitrary PCM byte stream into fixed-duration frames.
fn frames_from_pcm(bytes: ByteStream, sample_rate: u32, frame_ms: u32) -> AudioStream {
    let state = ChunkState {
        bytes,
        chunker: FrameChunker::new(sample_rate, frame_ms),
        queued: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.queued.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }
            match state.bytes.next().await {
                Some(Ok(chunk)) => {
                    state.queued.extend(state.chunker.push_bytes(&chunk).into_iter().map(Ok));
                }
                Some(Err(e)) => {
                    state.finished = true;
                    state.queued.push_back(Err(e));
                }
                None => {
                    state.finished = true;
                    if let Some(tail) = state.chunker.finish() {
                        state.queued.push_back(Ok(tail));
                    }
                }
            }
        }
    })
    .boxed()
}

impl OpenAiClient {
    /// Raw PCM bytes for one piece of text.
    async fn speech_bytes(&self, text: String, cancel: CancellationToken) -> VoiceResult<ByteStream> {
        let payload = json!({
            "model": self.config.tts_model,
            "voice": self.config.voice,
            "input": text,
            "response_format": "pcm",
        });
        let request = self.http.post(self.url("audio/speech")).json(&payload);
        let response = self.send(request, &cancel, VoiceError::SynthesisFailure).await?;
        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|b| b.to_vec())
                    .map_err(|e| VoiceError::SynthesisFailure(e.to_string()))
            })
            .boxed())
    }
}

#[async_trait]
impl Synthesizer for OpenAiSynthesizer {
    async fn synthesize(
        &self,
        input: SynthesisInput,
        cancel: CancellationToken,
    ) -> VoiceResult<AudioStream> {
        let sentences: BoxStream<'static, String> = match input {
            SynthesisInput::Text(text) => stream::once(future::ready(text)).boxed(),
            SynthesisInput::Tokens(tokens) => sentence_stream(tokens),
        };

        let client = self.client.clone();
        let request_cancel = cancel.clone();
        let bytes: ByteStream = sentences
            .filter(|text| future::ready(!text.trim().is_empty()))
            .then(move |text| {
                let client = client.clone();
                let cancel = request_cancel.clone();
                async move { client.speech_bytes(text, cancel).await }
            })
            .flat_map(|result| match result {
                Ok(bytes) => bytes,
                Err(e) => stream::once(future::ready(Err(e))).boxed(),
            })
            .boxed();

        let frames = frames_from_pcm(bytes, self.client.config.tts_sample_rate, self.frame_ms);
        Ok(frames.take_until(cancel.cancelled_owned()).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::conversation::ConversationTurn;

    #[test]
    fn test_parse_sse_lines() {
        let token = r#"data: {"choices":[{"delta":{"content":"Hi"}}]}"#;
        assert_eq!(parse_sse_line(token), Some(Ok(ReplyChunk::Token("Hi".into()))));
        assert_eq!(parse_sse_line("data: [DONE]"), Some(Ok(ReplyChunk::EndOfReply)));
        assert_eq!(parse_sse_line(": keep-alive"), None);
        assert_eq!(parse_sse_line(r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#), None);
        assert!(matches!(parse_sse_line("data: {not json"), Some(Err(VoiceError::DialogueFailure(_)))));
    }

    #[tokio::test]
    async fn test_sse_stream_handles_split_lines() {
        let chunks: Vec<VoiceResult<Vec<u8>>> = vec![
            Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"Hel".to_vec()),
            Ok(b"lo\"}}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\" there\"}}]}\n".to_vec()),
            Ok(b"data: [DONE]\n".to_vec()),
        ];
        let replies: Vec<ReplyChunk> = sse_reply_stream(stream::iter(chunks).boxed())
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(
            replies,
            vec![
                ReplyChunk::Token("Hello".into()),
                ReplyChunk::Token(" there".into()),
                ReplyChunk::EndOfReply,
            ]
        );
    }

    #[tokio::test]
    async fn test_sse_stream_without_done_marker() {
        let chunks: Vec<VoiceResult<Vec<u8>>> =
            vec![Ok(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}".to_vec())];
        let replies: Vec<ReplyChunk> = sse_reply_stream(stream::iter(chunks).boxed())
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(replies, vec![ReplyChunk::Token("ok".into()), ReplyChunk::EndOfReply]);
    }

    #[test]
    fn test_split_sentence() {
        let mut pending = "Hello there. How are".to_string();
        assert_eq!(split_sentence(&mut pending), Some("Hello there.".to_string()));
        assert_eq!(pending, " How are");
        assert_eq!(split_sentence(&mut pending), None);
        // 3.5 is not a sentence boundary
        let mut number = "It costs 3.5 dollars".to_string();
        assert_eq!(split_sentence(&mut number), None);
    }

    #[tokio::test]
    async fn test_sentence_stream_flushes_remainder() {
        let tokens = stream::iter(vec!["Hi", " there!", " Bye", " now"])
            .map(String::from)
            .boxed();
        let sentences: Vec<String> = sentence_stream(tokens).collect().await;
        assert_eq!(sentences, vec!["Hi there!".to_string(), "Bye now".to_string()]);
    }

    #[tokio::test]
    async fn test_pcm_is_reframed() {
        // 10ms at 16kHz = 320 bytes per frame
        let chunks: Vec<VoiceResult<Vec<u8>>> = vec![Ok(vec![0u8; 500]), Ok(vec![0u8; 300])];
        let frames: Vec<AudioFrame> = frames_from_pcm(stream::iter(chunks).boxed(), 16000, 10)
            .map(|f| f.unwrap())
            .collect()
            .await;
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[2].samples().len(), 80);
        let sequences: Vec<u64> = frames.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[test]
    fn test_chat_messages_include_history() {
        let mut context = ConversationContext::new("Be brief.");
        let mut turn = ConversationTurn::new(1, "What time is it?");
        turn.reply_text = "Noon.".to_string();
        context.append(turn).unwrap();

        let messages = chat_messages(&context, "Thanks");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[2]["content"], "Noon.");
        assert_eq!(messages[3]["content"], "Thanks");
    }
}
